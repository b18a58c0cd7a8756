//! Dispatches wire requests from the event bus onto platform actions.
//!
//! Grounded on `original_source/core/event_processors/base_outgoing_event_processor.py`:
//! field validation, rate limiting, and the sentence-boundary message
//! splitter are shared here; the actual platform call (`_send_message`,
//! `_edit_message`, ...) is delegated to `OutgoingActions`, the outgoing
//! analogue of `PlatformAdapter`.

use crate::core::attachment_uploader::AttachmentUploader;
use crate::core::conversation::data_classes::AttachmentFields;
use crate::core::rate_limiter::{RateLimitKind, RateLimiter};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingEventType {
    SendMessage,
    EditMessage,
    DeleteMessage,
    AddReaction,
    RemoveReaction,
    FetchHistory,
}

impl OutgoingEventType {
    pub fn from_wire(name: &str) -> Option<Self> {
        Some(match name {
            "send_message" => Self::SendMessage,
            "edit_message" => Self::EditMessage,
            "delete_message" => Self::DeleteMessage,
            "add_reaction" => Self::AddReaction,
            "remove_reaction" => Self::RemoveReaction,
            "fetch_history" => Self::FetchHistory,
            _ => return None,
        })
    }

    fn rate_limit_kind(self) -> RateLimitKind {
        match self {
            Self::SendMessage => RateLimitKind::Message,
            Self::EditMessage => RateLimitKind::EditMessage,
            Self::DeleteMessage => RateLimitKind::DeleteMessage,
            Self::AddReaction => RateLimitKind::AddReaction,
            Self::RemoveReaction => RateLimitKind::RemoveReaction,
            Self::FetchHistory => RateLimitKind::FetchHistory,
        }
    }

    fn required_fields(self) -> &'static [&'static str] {
        match self {
            Self::SendMessage => &["conversation_id", "text"],
            Self::EditMessage => &["conversation_id", "message_id", "text"],
            Self::DeleteMessage => &["conversation_id", "message_id"],
            Self::AddReaction | Self::RemoveReaction => &["conversation_id", "message_id", "emoji"],
            Self::FetchHistory => &["conversation_id"],
        }
    }
}

/// Platform-specific outgoing actions. Each method performs the actual
/// platform API call and returns the wire-ready result payload.
pub trait OutgoingActions: Send + Sync {
    fn send_message(&self, data: &Value) -> impl std::future::Future<Output = crate::error::Result<Value>> + Send;
    fn edit_message(&self, data: &Value) -> impl std::future::Future<Output = crate::error::Result<Value>> + Send;
    fn delete_message(&self, data: &Value) -> impl std::future::Future<Output = crate::error::Result<Value>> + Send;
    fn add_reaction(&self, data: &Value) -> impl std::future::Future<Output = crate::error::Result<Value>> + Send;
    fn remove_reaction(&self, data: &Value) -> impl std::future::Future<Output = crate::error::Result<Value>> + Send;
    fn fetch_history(&self, data: &Value) -> impl std::future::Future<Output = crate::error::Result<Value>> + Send;

    /// Hand a staged attachment's bytes to the platform API. Called once per
    /// attachment after a successful `send_message`, before the file is
    /// relocated into the canonical attachment directory. Adapters with no
    /// platform upload wiring inherit this no-op default.
    fn upload_attachment(
        &self,
        conversation_id: &str,
        staged_path: &std::path::Path,
    ) -> impl std::future::Future<Output = crate::error::Result<()>> + Send {
        let conversation_id = conversation_id.to_string();
        let staged_path = staged_path.to_path_buf();
        async move {
            tracing::debug!(conversation_id, path = %staged_path.display(), "no platform upload wired for this adapter, skipping");
            Ok(())
        }
    }
}

pub struct OutgoingEventProcessor<A: OutgoingActions> {
    actions: A,
    rate_limiter: Arc<RateLimiter>,
    max_message_length: usize,
    attachment_uploader: Option<Arc<AttachmentUploader>>,
}

impl<A: OutgoingActions> OutgoingEventProcessor<A> {
    pub fn new(actions: A, rate_limiter: Arc<RateLimiter>, max_message_length: usize) -> Self {
        Self {
            actions,
            rate_limiter,
            max_message_length,
            attachment_uploader: None,
        }
    }

    pub fn with_attachment_uploader(mut self, uploader: Arc<AttachmentUploader>) -> Self {
        self.attachment_uploader = Some(uploader);
        self
    }

    /// Validate required fields, rate-limit, dispatch, and catch action
    /// errors into `{"request_completed": false}` rather than propagating —
    /// matching the source's blanket try/except around every handler.
    pub async fn process_event(&self, event_type: OutgoingEventType, data: Value) -> Value {
        let missing: Vec<&str> = event_type
            .required_fields()
            .iter()
            .filter(|f| data.get(**f).and_then(Value::as_str).map(|s| s.is_empty()).unwrap_or(true))
            .copied()
            .collect();

        if !missing.is_empty() {
            tracing::error!(?missing, ?event_type, "missing required fields for outgoing event");
            return json!({ "request_completed": false });
        }

        let conversation_id = data.get("conversation_id").and_then(Value::as_str).map(str::to_string);
        self.rate_limiter
            .limit_request(event_type.rate_limit_kind(), conversation_id.as_deref())
            .await;

        let result = match event_type {
            OutgoingEventType::SendMessage => self.handle_send_message(&data).await,
            OutgoingEventType::EditMessage => self.actions.edit_message(&data).await,
            OutgoingEventType::DeleteMessage => self.actions.delete_message(&data).await,
            OutgoingEventType::AddReaction => self.actions.add_reaction(&data).await,
            OutgoingEventType::RemoveReaction => self.actions.remove_reaction(&data).await,
            OutgoingEventType::FetchHistory => self.actions.fetch_history(&data).await,
        };

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(%err, ?event_type, "outgoing event handler failed");
                return json!({ "request_completed": false });
            }
        };

        if event_type == OutgoingEventType::SendMessage {
            if let Some(conversation_id) = conversation_id.as_deref() {
                self.upload_attachments(conversation_id, &data).await;
            }
        }

        value
    }

    /// Upload every staged attachment in `data["attachments"]`, logging (not
    /// propagating) failures per attachment, matching the source's blanket
    /// try/except around each upload.
    async fn upload_attachments(&self, conversation_id: &str, data: &Value) {
        let Some(uploader) = &self.attachment_uploader else {
            return;
        };
        let Some(attachments) = data.get("attachments").and_then(Value::as_array) else {
            return;
        };

        for attachment in attachments {
            let Some(staged_path) = attachment.get("staged_path").and_then(Value::as_str) else {
                continue;
            };
            let Some(attachment_id) = attachment.get("attachment_id").and_then(Value::as_str) else {
                continue;
            };
            let attachment_type = attachment
                .get("attachment_type")
                .and_then(Value::as_str)
                .unwrap_or("file")
                .to_string();
            let file_extension = attachment
                .get("file_extension")
                .and_then(Value::as_str)
                .map(str::to_string);
            let size = attachment.get("size").and_then(Value::as_u64).unwrap_or(0);
            let staged_path = PathBuf::from(staged_path);

            if let Err(err) = self.actions.upload_attachment(conversation_id, &staged_path).await {
                tracing::warn!(%err, attachment_id, "platform attachment upload failed");
                continue;
            }

            let fields = AttachmentFields {
                attachment_id: attachment_id.to_string(),
                attachment_type,
                file_extension,
                size,
            };
            let created_at = chrono::Utc::now().to_rfc3339();
            if let Err(err) = uploader.relocate(fields, conversation_id, &staged_path, created_at).await {
                tracing::warn!(%err, attachment_id, "failed to relocate uploaded attachment into the attachment directory");
            }
        }
    }

    async fn handle_send_message(&self, data: &Value) -> crate::error::Result<Value> {
        let Some(text) = data.get("text").and_then(Value::as_str) else {
            return Ok(json!({ "request_completed": false }));
        };
        if split_long_message(text, self.max_message_length).len() <= 1 {
            return self.actions.send_message(data).await;
        }

        let mut last = json!({ "request_completed": false });
        for part in split_long_message(text, self.max_message_length) {
            let mut part_data = data.clone();
            part_data["text"] = json!(part);
            last = self.actions.send_message(&part_data).await?;
        }
        Ok(last)
    }
}

/// Split `text` at sentence boundaries so every part is at most
/// `max_length` characters, preferring `.`/`!`/`?` (optionally followed by
/// whitespace) near the end of the window, then a newline, then a space, and
/// finally a hard cut. Joining the returned parts recovers `text` exactly.
pub fn split_long_message(text: &str, max_length: usize) -> Vec<String> {
    if max_length == 0 || text.chars().count() <= max_length {
        return vec![text.to_string()];
    }

    let chars: Vec<char> = text.chars().collect();
    let sentence_endings = ['.', '!', '?'];
    let mut parts = Vec::new();
    let mut start = 0;

    while chars.len() - start > max_length {
        let window_end = start + max_length;
        let search_floor = start + max_length.saturating_sub(200).max(1);

        let mut cut_point = None;
        'search: for i in (search_floor..window_end).rev() {
            if sentence_endings.contains(&chars[i]) {
                let mut end = i + 1;
                if end < chars.len() && chars[end].is_whitespace() {
                    end += 1;
                }
                if end - start <= max_length {
                    cut_point = Some(end);
                    break 'search;
                }
            }
        }

        let cut_point = cut_point.unwrap_or_else(|| {
            if let Some(rel) = chars[start..window_end].iter().rposition(|c| *c == '\n') {
                let abs = start + rel + 1;
                if abs - start > max_length / 2 {
                    return abs;
                }
            }
            if let Some(rel) = chars[start + max_length / 2..window_end].iter().rposition(|c| *c == ' ') {
                return start + max_length / 2 + rel + 1;
            }
            window_end
        });

        parts.push(chars[start..cut_point].iter().collect());
        start = cut_point;
    }

    if start < chars.len() {
        parts.push(chars[start..].iter().collect());
    }

    parts
}

/// Lets `SocketIoServer` drive any `OutgoingEventProcessor<A>` directly:
/// unknown wire event types become `{"request_completed": false}` rather
/// than a panic, matching the source's catch-all dispatch.
impl<A: OutgoingActions> crate::core::socket_io::server::OutgoingDispatch for OutgoingEventProcessor<A> {
    async fn process_outgoing_event(&self, event_type: &str, data: Value) -> Value {
        match OutgoingEventType::from_wire(event_type) {
            Some(kind) => self.process_event(kind, data).await,
            None => {
                tracing::warn!(event_type, "unknown outgoing event type");
                json!({ "request_completed": false })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_not_split() {
        assert_eq!(split_long_message("hello", 20), vec!["hello".to_string()]);
    }

    #[test]
    fn splits_prefer_sentence_boundaries_and_round_trip() {
        let text = "Hi there. This is a longer sentence. End.";
        let parts = split_long_message(text, 20);

        assert!(parts.iter().all(|p| p.chars().count() <= 20));
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn falls_back_to_space_when_no_sentence_boundary_fits() {
        let text = "a".repeat(30) + " " + &"b".repeat(30);
        let parts = split_long_message(&text, 20);
        assert!(parts.iter().all(|p| p.chars().count() <= 20));
        assert_eq!(parts.concat(), text);
    }
}
