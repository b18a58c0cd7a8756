//! Reply-chain reconstruction shared by every platform.
//!
//! Grounded on `original_source/core/conversation/base_thread_handler.py`:
//! a thread is keyed by the id of its root reply target, and nested replies
//! are flattened onto the same thread by walking one level of the existing
//! thread map rather than recursing to the true root every time.

use crate::core::cache::message_cache::MessageCache;
use crate::core::conversation::data_classes::ConversationInfo;
use crate::core::conversation::data_classes::ThreadInfo;
use crate::core::conversation::platform::PlatformAdapter;
use std::sync::Arc;

pub struct ThreadHandler {
    message_cache: Arc<MessageCache>,
}

impl ThreadHandler {
    pub fn new(message_cache: Arc<MessageCache>) -> Self {
        Self { message_cache }
    }

    /// Attach `message` to its thread, creating one if needed, and return
    /// the thread it now belongs to. Returns `None` if the message isn't a
    /// reply to anything.
    pub async fn add_thread_info<A: PlatformAdapter>(
        &self,
        adapter: &A,
        message: &A::Message,
        conversation: &mut ConversationInfo,
        now_ms: i64,
    ) -> Option<ThreadInfo> {
        let reply_to_id = adapter.extract_reply_to_id(message)?;
        let thread_id = reply_to_id.clone();

        let mut thread = match conversation.threads.get(&thread_id) {
            Some(existing) => existing.clone(),
            None => {
                let mut root_message_id = reply_to_id.clone();

                if let Some(replied) = self
                    .message_cache
                    .get_message_by_id(&conversation.conversation_id, &reply_to_id)
                    .await
                {
                    if replied.reply_to_message_id.is_some() {
                        let parent_thread_id = replied
                            .thread_id
                            .clone()
                            .or_else(|| replied.reply_to_message_id.clone());
                        if let Some(parent_thread_id) = parent_thread_id {
                            if let Some(parent_thread) = conversation.threads.get(&parent_thread_id) {
                                root_message_id = parent_thread.root_message_id.clone();
                            }
                        }
                    }
                }

                ThreadInfo::new(thread_id.clone(), root_message_id, now_ms)
            }
        };

        adapter.add_message_to_thread(&mut thread, message);
        thread.last_activity = now_ms;
        conversation.threads.insert(thread_id, thread.clone());

        Some(thread)
    }

    /// Detach `message_id` from its thread, dropping the thread entirely
    /// once it's empty.
    pub fn remove_thread_info(&self, conversation: &mut ConversationInfo, thread_id: &str, message_id: &str) {
        let Some(thread) = conversation.threads.get_mut(thread_id) else {
            return;
        };
        thread.messages.remove(message_id);

        if thread.messages.is_empty() {
            conversation.threads.remove(thread_id);
        }
    }
}
