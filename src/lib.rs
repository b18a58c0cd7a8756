//! chatbridge: platform adapters (Discord, Slack, Telegram, Zulip, a local
//! text file, an interactive shell) that normalize heterogeneous chat events
//! onto one canonical event bus for an upstream LLM-driven bot host.

pub mod config;
pub mod core;
pub mod daemon;
pub mod error;
pub mod messaging;

pub use error::{Error, Result};
