//! Shapes a `ConversationDelta` into the canonical wire events broadcast on
//! the event bus.
//!
//! Grounded on `original_source/core/event_processors/base_incoming_event_processor.py`:
//! one builder method per canonical event type, `adapter_name`/`adapter_type`
//! carried once at construction rather than threaded through every call.

use crate::core::conversation::data_classes::{ConversationDelta, DeltaMessage, ReactionDelta};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize)]
pub struct CanonicalEvent {
    pub adapter_type: String,
    pub event_type: String,
    pub data: Value,
}

pub struct IncomingEventBuilder {
    adapter_name: String,
    adapter_type: String,
}

impl IncomingEventBuilder {
    pub fn new(adapter_name: impl Into<String>, adapter_type: impl Into<String>) -> Self {
        Self {
            adapter_name: adapter_name.into(),
            adapter_type: adapter_type.into(),
        }
    }

    pub fn conversation_started(&self, conversation_id: &str, history: Vec<Value>) -> CanonicalEvent {
        CanonicalEvent {
            adapter_type: self.adapter_type.clone(),
            event_type: "conversation_started".into(),
            data: json!({ "conversation_id": conversation_id, "history": history }),
        }
    }

    pub fn new_message(&self, message: &DeltaMessage, history_fetching_in_progress: bool) -> CanonicalEvent {
        CanonicalEvent {
            adapter_type: self.adapter_type.clone(),
            event_type: "message_received".into(),
            data: json!({
                "adapter_name": self.adapter_name,
                "message_id": message.message_id,
                "conversation_id": message.conversation_id,
                "sender": { "user_id": message.sender.user_id, "display_name": message.sender.display_name },
                "text": message.text.clone().unwrap_or_default(),
                "thread_id": message.thread_id,
                "attachments": message.attachments,
                "timestamp": message.timestamp,
                // omitted entirely during history replay, to avoid re-triggering on it.
                "mentions": if history_fetching_in_progress { Vec::new() } else { message.mentions.clone() },
            }),
        }
    }

    pub fn edited_message(&self, message: &DeltaMessage) -> CanonicalEvent {
        CanonicalEvent {
            adapter_type: self.adapter_type.clone(),
            event_type: "message_updated".into(),
            data: json!({
                "adapter_name": self.adapter_name,
                "message_id": message.message_id,
                "conversation_id": message.conversation_id,
                "new_text": message.text.clone().unwrap_or_default(),
                "timestamp": message.timestamp,
                "attachments": message.attachments,
            }),
        }
    }

    pub fn deleted_message(&self, message_id: &str, conversation_id: &str) -> CanonicalEvent {
        CanonicalEvent {
            adapter_type: self.adapter_type.clone(),
            event_type: "message_deleted".into(),
            data: json!({ "message_id": message_id, "conversation_id": conversation_id }),
        }
    }

    pub fn reaction_update(&self, event_type: &str, reaction: &ReactionDelta) -> CanonicalEvent {
        CanonicalEvent {
            adapter_type: self.adapter_type.clone(),
            event_type: event_type.into(),
            data: json!({
                "message_id": reaction.message_id,
                "conversation_id": reaction.conversation_id,
                "emoji": reaction.emoji,
            }),
        }
    }

    pub fn pinned_status_change(&self, event_type: &str, message_id: &str, conversation_id: &str) -> CanonicalEvent {
        CanonicalEvent {
            adapter_type: self.adapter_type.clone(),
            event_type: event_type.into(),
            data: json!({ "message_id": message_id, "conversation_id": conversation_id }),
        }
    }

    /// Expand a delta into the full ordered list of canonical events it
    /// implies: `conversation_started` (if history was just fetched) before
    /// any `message_received`, then updates/deletes/reactions/pins.
    pub fn events_for_delta(&self, delta: &ConversationDelta, fetched_history: Option<Vec<Value>>) -> Vec<CanonicalEvent> {
        let mut events = Vec::new();

        if let Some(history) = fetched_history {
            events.push(self.conversation_started(&delta.conversation_id, history));
        }

        for message in &delta.added_messages {
            events.push(self.new_message(message, delta.history_fetching_in_progress));
        }
        for message in &delta.updated_messages {
            events.push(self.edited_message(message));
        }
        for message_id in &delta.deleted_message_ids {
            events.push(self.deleted_message(message_id, &delta.conversation_id));
        }
        for reaction in &delta.added_reactions {
            events.push(self.reaction_update("reaction_added", reaction));
        }
        for reaction in &delta.removed_reactions {
            events.push(self.reaction_update("reaction_removed", reaction));
        }
        for message_id in &delta.pinned_message_ids {
            events.push(self.pinned_status_change("message_pinned", message_id, &delta.conversation_id));
        }
        for message_id in &delta.unpinned_message_ids {
            events.push(self.pinned_status_change("message_unpinned", message_id, &delta.conversation_id));
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conversation::data_classes::DeltaSender;

    fn builder() -> IncomingEventBuilder {
        IncomingEventBuilder::new("bot1", "discord")
    }

    fn message() -> DeltaMessage {
        DeltaMessage {
            message_id: "m1".into(),
            conversation_id: "c1".into(),
            sender: DeltaSender { user_id: "u1".into(), display_name: "Alice".into() },
            text: Some("hi".into()),
            timestamp: 1,
            edit_timestamp: None,
            edited: false,
            thread_id: None,
            is_direct_message: false,
            attachments: Vec::new(),
            mentions: vec!["u2".into()],
        }
    }

    #[test]
    fn new_message_event_has_canonical_shape() {
        let event = builder().new_message(&message(), false);
        assert_eq!(event.event_type, "message_received");
        assert_eq!(event.data["sender"]["display_name"], "Alice");
    }

    #[test]
    fn mentions_omitted_during_history_replay() {
        let event = builder().new_message(&message(), true);
        assert_eq!(event.data["mentions"], json!([]));
    }

    #[test]
    fn conversation_started_precedes_message_received() {
        let mut delta = ConversationDelta::new("c1");
        delta.added_messages.push(message());

        let events = builder().events_for_delta(&delta, Some(Vec::new()));
        assert_eq!(events[0].event_type, "conversation_started");
        assert_eq!(events[1].event_type, "message_received");
    }
}
