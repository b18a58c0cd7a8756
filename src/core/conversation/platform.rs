//! The trait every platform adapter implements to plug into
//! `ConversationManager`.
//!
//! Reconciles `original_source/core/conversation/base_manager.py`'s nine
//! abstract methods (`_get_conversation_id`, `_get_conversation_id_from_update`,
//! `_get_conversation_type`, `_get_conversation_name`, `_create_conversation_info`,
//! `_get_user_info`, `_get_deleted_message_ids`,
//! `_get_conversation_info_to_delete_from`, `_process_event`) plus
//! `base_thread_handler.py`'s and `base_message_builder.py`'s abstract hooks
//! into a single trait with two associated types, the way `Messaging`
//! (`src/messaging/traits.rs`) groups adapter behavior behind one seam at the
//! process level. `_create_conversation_info` is not part of the trait:
//! `ConversationManager` builds a generic `ConversationInfo` directly, since
//! every platform in this crate shares its shape.

use crate::core::conversation::data_classes::{ConversationDelta, ConversationInfo, MessageFields, ThreadInfo, UserInfo};
use crate::core::conversation::data_classes::AttachmentFields;

/// Platform-specific behavior `ConversationManager<A>` delegates to.
///
/// `Message` is the adapter's raw inbound message/update representation;
/// `Event` is the adapter's raw inbound event envelope (message + optional
/// attachments/user/context), the Rust analogue of the Python event dict.
pub trait PlatformAdapter: Send + Sync + 'static {
    type Message: Send + Sync;
    type Event: Send + Sync;

    /// Adapter name used as the canonical conversation id prefix (`discord`,
    /// `slack`, ...).
    fn name(&self) -> &str;

    /// Derive the canonical conversation id a new message belongs to.
    fn conversation_id(&self, message: &Self::Message) -> Option<String>;

    /// Derive the canonical conversation id an update/delete event targets.
    fn conversation_id_from_update(&self, message: &Self::Message) -> Option<String>;

    /// `"direct"`, `"group"`, `"channel"`, etc.
    fn conversation_type(&self, message: &Self::Message) -> Option<String>;

    fn conversation_name(&self, message: &Self::Message) -> Option<String>;

    /// Resolve the sending user for an event, given the conversation it
    /// landed in (some platforms need the conversation's known-members map
    /// to enrich a bare user id).
    fn user_info(&self, event: &Self::Event, conversation: &ConversationInfo) -> UserInfo;

    /// The id of the message this one replies to, if any.
    fn extract_reply_to_id(&self, message: &Self::Message) -> Option<String>;

    /// Record platform-specific bookkeeping on a thread as `message` joins
    /// it (e.g. a running title). Most adapters need nothing here.
    fn add_message_to_thread(&self, _thread: &mut ThreadInfo, _message: &Self::Message) {}

    /// Build the base fields for a new cached message (id, conversation,
    /// timestamp) before sender/thread info is layered in.
    fn basic_info(&self, message: &Self::Message, conversation_id: &str) -> MessageFields;

    /// Fill in the textual content (and anything content-derived) for a
    /// message under construction.
    fn content(&self, message: &Self::Message, fields: &mut MessageFields);

    /// User ids mentioned in a message, for adapters that track mentions
    /// separately from body text.
    fn mentions(&self, _message: &Self::Message) -> Vec<String> {
        Vec::new()
    }

    /// Attachments carried by an event, if any.
    fn attachments(&self, _event: &Self::Event) -> Vec<AttachmentFields> {
        Vec::new()
    }

    fn deleted_message_ids(&self, event: &Self::Event) -> Vec<String>;

    /// Resolve which conversation a deletion event targets.
    fn conversation_info_to_delete_from(&self, event: &Self::Event) -> Option<String>;

    /// Apply an update event (edit, reaction, pin, ...) to `conversation`,
    /// recording the effect on `delta`. Dispatch on event type is entirely
    /// the adapter's responsibility, mirroring `_process_event`'s per-adapter
    /// `match`/`if` chain in the source.
    fn process_event(&self, event: &Self::Event, conversation: &mut ConversationInfo, delta: &mut ConversationDelta);

    /// Extract the message payload and any attachments from an inbound
    /// event, for `add_to_conversation`.
    fn message_from_event<'a>(&self, event: &'a Self::Event) -> Option<&'a Self::Message>;
}
