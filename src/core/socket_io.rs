//! The outbound/inbound WebSocket event bus consumed by the upstream
//! LLM-driven bot host.

pub mod protocol;
pub mod server;

pub use protocol::{BotResponse, CancelRequest, QueuedEvent, RequestEvent};
pub use server::{OutgoingDispatch, SocketIoServer};
