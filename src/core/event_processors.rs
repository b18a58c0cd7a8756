//! Shapes canonical events onto the wire (incoming) and dispatches wire
//! requests onto platform actions (outgoing).

pub mod incoming;
pub mod outgoing;

pub use incoming::IncomingEventBuilder;
pub use outgoing::{OutgoingActions, OutgoingEventProcessor, OutgoingEventType};
