//! Wire schema for the SocketIOServer's event bus (spec.md §6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `request_queued` / `request_success` / `request_failed` payload.
#[derive(Debug, Clone, Serialize, Default)]
pub struct RequestEvent {
    pub adapter_type: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Inbound `bot_response` payload: a canonical outgoing command.
#[derive(Debug, Clone, Deserialize)]
pub struct BotResponse {
    pub event_type: String,
    pub data: Value,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Inbound `cancel_request` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CancelRequest {
    pub request_id: String,
}

/// An outgoing event queued by a connected client, carried through the FIFO
/// processor. `socket_id` identifies which connection to reply to.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub event_type: String,
    pub data: Value,
    pub socket_id: String,
    pub request_id: String,
    pub queued_at_ms: i64,
}
