//! `ConversationManager<A>`: the generic conversation-state machine every
//! adapter runs against, one instantiation per platform.
//!
//! Grounded on `original_source/core/conversation/base_manager.py`, following
//! its lock scope (one mutex guarding the whole `conversations` map),
//! delta-construction order, and bot-message suppression rule line for line.

use crate::core::cache::attachment_cache::AttachmentCache;
use crate::core::cache::message_cache::MessageCache;
use crate::core::conversation::data_classes::{
    ConversationDelta, ConversationInfo, DeltaMessage, DeltaSender, ReactionDelta,
};
use crate::core::conversation::message_builder::MessageBuilder;
use crate::core::conversation::platform::PlatformAdapter;
use crate::core::conversation::reaction_handler;
use crate::core::conversation::thread_handler::ThreadHandler;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct ConversationManager<A: PlatformAdapter> {
    adapter: A,
    conversations: Mutex<HashMap<String, ConversationInfo>>,
    message_cache: Arc<MessageCache>,
    attachment_cache: Arc<AttachmentCache>,
    thread_handler: ThreadHandler,
    message_builder: Mutex<MessageBuilder>,
}

impl<A: PlatformAdapter> ConversationManager<A> {
    pub fn new(adapter: A, message_cache: Arc<MessageCache>, attachment_cache: Arc<AttachmentCache>) -> Self {
        Self {
            thread_handler: ThreadHandler::new(Arc::clone(&message_cache)),
            adapter,
            conversations: Mutex::new(HashMap::new()),
            message_cache,
            attachment_cache,
            message_builder: Mutex::new(MessageBuilder::default()),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Option<ConversationInfo> {
        self.conversations.lock().await.get(conversation_id).cloned()
    }

    /// Create a conversation if needed and add the event's message to it.
    /// Returns an empty delta (`ConversationDelta::new("")`) if the event
    /// carries no message or no conversation id can be derived.
    pub async fn add_to_conversation(&self, event: &A::Event, now_ms: i64) -> ConversationDelta {
        let Some(message) = self.adapter.message_from_event(event) else {
            return ConversationDelta::default();
        };

        let mut conversations = self.conversations.lock().await;

        let Some(conversation_id) = self.adapter.conversation_id(message) else {
            return ConversationDelta::default();
        };

        if !conversations.contains_key(&conversation_id) {
            let conversation = ConversationInfo::new(
                conversation_id.clone(),
                conversation_id.clone(),
                self.adapter.conversation_type(message).unwrap_or_default(),
                self.adapter.conversation_name(message),
                now_ms,
            );
            conversations.insert(conversation_id.clone(), conversation);
        }
        let conversation = conversations.get_mut(&conversation_id).expect("just inserted");

        let user_info = self.adapter.user_info(event, conversation);
        let thread_info = self
            .thread_handler
            .add_thread_info(&self.adapter, message, conversation, now_ms)
            .await;

        let fields = {
            let mut builder = self.message_builder.lock().await;
            builder
                .reset()
                .with_basic_info(&self.adapter, message, &conversation_id)
                .with_sender_info(Some(&user_info))
                .with_thread_info(thread_info.as_ref())
                .with_content(&self.adapter, message)
                .build()
        };

        let cached_msg = self.message_cache.add_message(fields).await;
        conversation.messages.insert(cached_msg.message_id.clone());
        conversation.known_members.entry(user_info.user_id.clone()).or_insert(user_info);
        conversation.last_activity = now_ms;

        if let Some(thread) = &thread_info {
            if let Some(t) = conversation.threads.get_mut(&thread.thread_id) {
                t.messages.insert(cached_msg.message_id.clone());
            }
        }

        let attachment_fields = self.adapter.attachments(event);
        let mut attachment_dicts = Vec::new();
        for fields in attachment_fields {
            let attachment_id = fields.attachment_id.clone();
            if let Ok(attachment) = self
                .attachment_cache
                .add_attachment(fields, &conversation_id, chrono::Utc::now().to_rfc3339())
                .await
            {
                conversation.attachments.insert(attachment_id);
                attachment_dicts.push(serde_json::to_value(&attachment).unwrap_or_default());
            }
        }

        let mut delta = self.new_delta(&conversation_id, conversation);

        if delta.display_bot_messages || !cached_msg.is_from_bot {
            delta.message_id = Some(cached_msg.message_id.clone());
            delta.added_messages.push(DeltaMessage {
                message_id: cached_msg.message_id,
                conversation_id: conversation_id.clone(),
                sender: DeltaSender {
                    user_id: cached_msg.sender_id,
                    display_name: cached_msg.sender_name,
                },
                text: cached_msg.text,
                timestamp: cached_msg.timestamp,
                edit_timestamp: None,
                edited: false,
                thread_id: cached_msg.thread_id,
                is_direct_message: conversation.conversation_type == "direct",
                attachments: attachment_dicts,
                mentions: self.adapter.mentions(message),
            });
        }

        delta
    }

    /// Apply an update event (edit, reaction, pin) to the conversation it
    /// targets. Returns an empty delta if the conversation is unknown.
    pub async fn update_conversation(&self, event: &A::Event, message: &A::Message, now_ms: i64) -> ConversationDelta {
        let mut conversations = self.conversations.lock().await;

        let Some(conversation_id) = self.adapter.conversation_id_from_update(message) else {
            return ConversationDelta::default();
        };
        let Some(conversation) = conversations.get_mut(&conversation_id) else {
            return ConversationDelta::default();
        };

        let mut delta = self.new_delta(&conversation_id, conversation);
        self.adapter.process_event(event, conversation, &mut delta);
        conversation.last_activity = now_ms;
        delta
    }

    /// Handle a deletion event, dropping the deleted messages (and their
    /// thread membership) from the cache.
    pub async fn delete_from_conversation(&self, event: &A::Event) -> ConversationDelta {
        let Some(conversation_id) = self.adapter.conversation_info_to_delete_from(event) else {
            return ConversationDelta::default();
        };
        let deleted_ids = self.adapter.deleted_message_ids(event);

        let mut conversations = self.conversations.lock().await;
        let Some(conversation) = conversations.get_mut(&conversation_id) else {
            return ConversationDelta::default();
        };

        let mut delta = self.new_delta(&conversation_id, conversation);

        for message_id in deleted_ids {
            let Some(cached_msg) = self.message_cache.get_message_by_id(&conversation_id, &message_id).await else {
                continue;
            };

            if !cached_msg.is_from_bot {
                delta.deleted_message_ids.push(message_id.clone());
            }

            if let Some(thread_id) = &cached_msg.thread_id {
                self.thread_handler.remove_thread_info(conversation, thread_id, &message_id);
            }
            self.message_cache.delete_message(&conversation_id, &message_id).await;
            conversation.messages.remove(&message_id);
            conversation.pinned_messages.remove(&message_id);
        }

        delta
    }

    /// Move a message's cache entry to a different canonical conversation,
    /// for platforms where a message can change which logical conversation
    /// it belongs to (e.g. a text-file move, or a thread promoted to a
    /// standalone channel).
    pub async fn migrate_between_conversations(&self, old_conversation_id: &str, new_conversation_id: &str, message_id: &str) {
        self.message_cache
            .migrate_message(old_conversation_id, new_conversation_id, message_id)
            .await;

        let mut conversations = self.conversations.lock().await;
        if let Some(old) = conversations.get_mut(old_conversation_id) {
            old.messages.remove(message_id);
        }
        if let Some(new_conv) = conversations.get_mut(new_conversation_id) {
            new_conv.messages.insert(message_id.to_string());
        }
    }

    /// Update a conversation's display name / server metadata in place.
    pub async fn update_metadata(&self, conversation_id: &str, name: Option<String>, server_id: Option<String>, server_name: Option<String>) {
        let mut conversations = self.conversations.lock().await;
        let Some(conversation) = conversations.get_mut(conversation_id) else {
            return;
        };
        if name.is_some() {
            conversation.conversation_name = name;
        }
        if server_id.is_some() {
            conversation.server_id = server_id;
        }
        if server_name.is_some() {
            conversation.server_name = server_name;
        }
    }

    pub async fn add_reaction(&self, conversation_id: &str, message_id: &str, emoji: &str) -> Option<ReactionDelta> {
        self.message_cache
            .update_message(conversation_id, message_id, |m| reaction_handler::add_reaction(m, emoji))
            .await?;
        Some(ReactionDelta {
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            emoji: emoji.to_string(),
        })
    }

    pub async fn remove_reaction(&self, conversation_id: &str, message_id: &str, emoji: &str) -> Option<ReactionDelta> {
        self.message_cache
            .update_message(conversation_id, message_id, |m| reaction_handler::remove_reaction(m, emoji))
            .await?;
        Some(ReactionDelta {
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            emoji: emoji.to_string(),
        })
    }

    /// Pinning an id with no corresponding cached message is a no-op that
    /// still returns an (empty) delta, not an error — resolved open question.
    pub async fn pin_message(&self, conversation_id: &str, message_id: &str) -> ConversationDelta {
        let mut conversations = self.conversations.lock().await;
        let Some(conversation) = conversations.get_mut(conversation_id) else {
            return ConversationDelta::default();
        };
        let mut delta = self.new_delta(conversation_id, conversation);

        if self.message_cache.get_message_by_id(conversation_id, message_id).await.is_some() {
            conversation.pinned_messages.insert(message_id.to_string());
            delta.pinned_message_ids.push(message_id.to_string());
        }

        delta
    }

    pub async fn unpin_message(&self, conversation_id: &str, message_id: &str) -> ConversationDelta {
        let mut conversations = self.conversations.lock().await;
        let Some(conversation) = conversations.get_mut(conversation_id) else {
            return ConversationDelta::default();
        };
        let mut delta = self.new_delta(conversation_id, conversation);

        if conversation.pinned_messages.remove(message_id) {
            delta.unpinned_message_ids.push(message_id.to_string());
        }

        delta
    }

    /// Update a cached message's text directly by id, for platforms whose
    /// edit events carry only the new text and a message id rather than a
    /// full platform message object. Returns `None` if the message isn't
    /// cached (e.g. it predates this process or was never from a tracked
    /// conversation).
    pub async fn edit_message_text(&self, conversation_id: &str, message_id: &str, new_text: String, now_ms: i64) -> Option<DeltaMessage> {
        let updated = self
            .message_cache
            .update_message(conversation_id, message_id, |cached| {
                cached.text = Some(new_text);
                cached.edited = true;
                cached.edit_timestamp = Some(now_ms);
            })
            .await?;

        let mut conversations = self.conversations.lock().await;
        let conversation = conversations.get_mut(conversation_id)?;
        conversation.last_activity = now_ms;

        Some(DeltaMessage {
            message_id: updated.message_id,
            conversation_id: updated.conversation_id,
            sender: DeltaSender {
                user_id: updated.sender_id,
                display_name: updated.sender_name,
            },
            text: updated.text,
            timestamp: updated.timestamp,
            edit_timestamp: updated.edit_timestamp,
            edited: updated.edited,
            thread_id: updated.thread_id,
            is_direct_message: conversation.conversation_type == "direct",
            attachments: Vec::new(),
            mentions: Vec::new(),
        })
    }

    /// Build an empty delta for `conversation_id`, flipping `just_started`
    /// off and setting `fetch_history` the first time a conversation is
    /// touched.
    fn new_delta(&self, conversation_id: &str, conversation: &mut ConversationInfo) -> ConversationDelta {
        let mut delta = ConversationDelta::new(conversation_id);
        if conversation.just_started {
            delta.fetch_history = true;
            conversation.just_started = false;
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug)]
    struct TestMessage {
        id: String,
        conversation: String,
        text: String,
        reply_to: Option<String>,
        timestamp: i64,
    }

    enum TestEvent {
        New(TestMessage),
        Delete { conversation: String, ids: Vec<String> },
    }

    struct TestAdapter;

    impl PlatformAdapter for TestAdapter {
        type Message = TestMessage;
        type Event = TestEvent;

        fn name(&self) -> &str {
            "test"
        }

        fn conversation_id(&self, message: &Self::Message) -> Option<String> {
            Some(message.conversation.clone())
        }

        fn conversation_id_from_update(&self, message: &Self::Message) -> Option<String> {
            Some(message.conversation.clone())
        }

        fn conversation_type(&self, _message: &Self::Message) -> Option<String> {
            Some("channel".into())
        }

        fn conversation_name(&self, _message: &Self::Message) -> Option<String> {
            Some("general".into())
        }

        fn user_info(&self, _event: &Self::Event, _conversation: &ConversationInfo) -> crate::core::conversation::data_classes::UserInfo {
            crate::core::conversation::data_classes::UserInfo {
                user_id: "u1".into(),
                username: Some("alice".into()),
                first_name: None,
                last_name: None,
                email: None,
                is_bot: false,
            }
        }

        fn extract_reply_to_id(&self, message: &Self::Message) -> Option<String> {
            message.reply_to.clone()
        }

        fn basic_info(&self, message: &Self::Message, conversation_id: &str) -> crate::core::conversation::data_classes::MessageFields {
            crate::core::conversation::data_classes::MessageFields {
                message_id: message.id.clone(),
                conversation_id: conversation_id.to_string(),
                timestamp: message.timestamp,
                ..Default::default()
            }
        }

        fn content(&self, message: &Self::Message, fields: &mut crate::core::conversation::data_classes::MessageFields) {
            fields.text = Some(message.text.clone());
        }

        fn deleted_message_ids(&self, event: &Self::Event) -> Vec<String> {
            match event {
                TestEvent::Delete { ids, .. } => ids.clone(),
                _ => Vec::new(),
            }
        }

        fn conversation_info_to_delete_from(&self, event: &Self::Event) -> Option<String> {
            match event {
                TestEvent::Delete { conversation, .. } => Some(conversation.clone()),
                _ => None,
            }
        }

        fn process_event(&self, _event: &Self::Event, _conversation: &mut ConversationInfo, _delta: &mut ConversationDelta) {}

        fn message_from_event<'a>(&self, event: &'a Self::Event) -> Option<&'a Self::Message> {
            match event {
                TestEvent::New(m) => Some(m),
                _ => None,
            }
        }
    }

    fn manager() -> ConversationManager<TestAdapter> {
        let message_cache = Arc::new(MessageCache::new(100, 1000, 24, 300));
        let dir = tempfile::tempdir().unwrap();
        let attachment_cache = Arc::new(AttachmentCache::new(dir.path().to_path_buf(), 100, 72, 300));
        ConversationManager::new(TestAdapter, message_cache, attachment_cache)
    }

    #[tokio::test]
    async fn first_message_sets_fetch_history() {
        let mgr = manager();
        let event = TestEvent::New(TestMessage {
            id: "m1".into(),
            conversation: "c1".into(),
            text: "hi".into(),
            reply_to: None,
            timestamp: 1,
        });
        let delta = mgr.add_to_conversation(&event, 1).await;
        assert!(delta.fetch_history);
        assert_eq!(delta.added_messages.len(), 1);
    }

    #[tokio::test]
    async fn second_message_does_not_refetch_history() {
        let mgr = manager();
        mgr.add_to_conversation(
            &TestEvent::New(TestMessage { id: "m1".into(), conversation: "c1".into(), text: "hi".into(), reply_to: None, timestamp: 1 }),
            1,
        )
        .await;
        let delta = mgr
            .add_to_conversation(
                &TestEvent::New(TestMessage { id: "m2".into(), conversation: "c1".into(), text: "again".into(), reply_to: None, timestamp: 2 }),
                2,
            )
            .await;
        assert!(!delta.fetch_history);
    }

    #[tokio::test]
    async fn deleting_unknown_conversation_yields_empty_delta() {
        let mgr = manager();
        let delta = mgr
            .delete_from_conversation(&TestEvent::Delete { conversation: "ghost".into(), ids: vec!["m1".into()] })
            .await;
        assert_eq!(delta.conversation_id, "");
    }

    #[tokio::test]
    async fn delete_removes_message_and_thread_membership() {
        let mgr = manager();
        mgr.add_to_conversation(
            &TestEvent::New(TestMessage { id: "root".into(), conversation: "c1".into(), text: "root".into(), reply_to: None, timestamp: 1 }),
            1,
        )
        .await;
        mgr.add_to_conversation(
            &TestEvent::New(TestMessage { id: "reply".into(), conversation: "c1".into(), text: "reply".into(), reply_to: Some("root".into()), timestamp: 2 }),
            2,
        )
        .await;

        let delta = mgr
            .delete_from_conversation(&TestEvent::Delete { conversation: "c1".into(), ids: vec!["reply".into()] })
            .await;

        assert_eq!(delta.deleted_message_ids, vec!["reply".to_string()]);
        assert!(mgr.get_conversation("c1").await.unwrap().threads.is_empty());
    }

    #[tokio::test]
    async fn pinning_unknown_message_is_noop_empty_delta() {
        let mgr = manager();
        mgr.add_to_conversation(
            &TestEvent::New(TestMessage { id: "m1".into(), conversation: "c1".into(), text: "hi".into(), reply_to: None, timestamp: 1 }),
            1,
        )
        .await;

        let delta = mgr.pin_message("c1", "does-not-exist").await;
        assert!(delta.pinned_message_ids.is_empty());
    }

    #[tokio::test]
    async fn pin_then_unpin_round_trips() {
        let mgr = manager();
        mgr.add_to_conversation(
            &TestEvent::New(TestMessage { id: "m1".into(), conversation: "c1".into(), text: "hi".into(), reply_to: None, timestamp: 1 }),
            1,
        )
        .await;

        let pin_delta = mgr.pin_message("c1", "m1").await;
        assert_eq!(pin_delta.pinned_message_ids, vec!["m1".to_string()]);

        let unpin_delta = mgr.unpin_message("c1", "m1").await;
        assert_eq!(unpin_delta.unpinned_message_ids, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn migrate_between_conversations_moves_message() {
        let mgr = manager();
        mgr.add_to_conversation(
            &TestEvent::New(TestMessage { id: "m1".into(), conversation: "c1".into(), text: "hi".into(), reply_to: None, timestamp: 1 }),
            1,
        )
        .await;

        mgr.migrate_between_conversations("c1", "c2", "m1").await;

        assert!(mgr.message_cache.get_message_by_id("c1", "m1").await.is_none());
        assert!(mgr.message_cache.get_message_by_id("c2", "m1").await.is_some());
    }

    #[tokio::test]
    async fn reply_creates_thread_with_correct_root() {
        let mgr = manager();
        mgr.add_to_conversation(
            &TestEvent::New(TestMessage { id: "root".into(), conversation: "c1".into(), text: "root".into(), reply_to: None, timestamp: 1 }),
            1,
        )
        .await;
        mgr.add_to_conversation(
            &TestEvent::New(TestMessage { id: "reply".into(), conversation: "c1".into(), text: "reply".into(), reply_to: Some("root".into()), timestamp: 2 }),
            2,
        )
        .await;

        let conversation = mgr.get_conversation("c1").await.unwrap();
        let thread = conversation.threads.get("root").unwrap();
        assert_eq!(thread.root_message_id, "root");
        assert!(thread.messages.contains("reply"));
    }
}
