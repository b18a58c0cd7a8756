//! Assembles a `MessageFields` from an adapter's raw message, mirroring
//! `original_source/core/conversation/base_message_builder.py`'s
//! reset/with_*/build chain.

use crate::core::conversation::data_classes::{MessageFields, ThreadInfo, UserInfo};
use crate::core::conversation::platform::PlatformAdapter;

#[derive(Default)]
pub struct MessageBuilder {
    fields: MessageFields,
}

impl MessageBuilder {
    pub fn reset(&mut self) -> &mut Self {
        self.fields = MessageFields::default();
        self
    }

    pub fn with_basic_info<A: PlatformAdapter>(
        &mut self,
        adapter: &A,
        message: &A::Message,
        conversation_id: &str,
    ) -> &mut Self {
        self.fields = adapter.basic_info(message, conversation_id);
        self
    }

    pub fn with_sender_info(&mut self, sender: Option<&UserInfo>) -> &mut Self {
        if let Some(sender) = sender {
            self.fields.sender_id = sender.user_id.clone();
            self.fields.sender_name = sender.display_name();
            self.fields.is_from_bot = sender.is_bot;
        }
        self
    }

    pub fn with_thread_info(&mut self, thread: Option<&ThreadInfo>) -> &mut Self {
        if let Some(thread) = thread {
            self.fields.thread_id = Some(thread.thread_id.clone());
            self.fields.reply_to_message_id = Some(thread.thread_id.clone());
        }
        self
    }

    pub fn with_content<A: PlatformAdapter>(&mut self, adapter: &A, message: &A::Message) -> &mut Self {
        adapter.content(message, &mut self.fields);
        self
    }

    pub fn build(&self) -> MessageFields {
        self.fields.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_sender_info_sets_display_name() {
        let mut builder = MessageBuilder::default();
        let user = UserInfo {
            user_id: "u1".into(),
            username: Some("alice".into()),
            first_name: None,
            last_name: None,
            email: None,
            is_bot: false,
        };
        builder.with_sender_info(Some(&user));
        let built = builder.build();
        assert_eq!(built.sender_name, "alice");
        assert!(!built.is_from_bot);
    }

    #[test]
    fn with_thread_info_sets_both_thread_fields() {
        let mut builder = MessageBuilder::default();
        let thread = ThreadInfo::new("t1", "root1", 0);
        builder.with_thread_info(Some(&thread));
        let built = builder.build();
        assert_eq!(built.thread_id.as_deref(), Some("t1"));
        assert_eq!(built.reply_to_message_id.as_deref(), Some("t1"));
    }

    #[test]
    fn reset_clears_prior_state() {
        let mut builder = MessageBuilder::default();
        builder.fields.sender_name = "stale".into();
        builder.reset();
        assert_eq!(builder.build().sender_name, "");
    }
}
