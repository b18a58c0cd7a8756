//! The seam every platform adapter plugs into at the process level: own
//! connection lifecycle, own conversation manager / history fetcher /
//! outgoing processor / socket bus, run until asked to shut down.
//!
//! Distinct from `core::conversation::PlatformAdapter`, which is the data-shape
//! trait `ConversationManager` delegates to. `Messaging` is the outer seam
//! `main.rs` dispatches on to run whichever adapter the config selects. It
//! carries no response/broadcast/status methods, since every adapter here
//! talks to the bot host exclusively through the canonical event bus rather
//! than direct method calls.

/// One running platform adapter: owns its SDK client, its conversation state,
/// and its socket event bus. `run` resolves once `shutdown` fires or the
/// adapter's connection is lost unrecoverably.
pub trait Messaging: Send + Sync + 'static {
    /// Adapter name (`discord`, `slack`, `telegram`, `zulip`, `text_file`, `shell`).
    fn name(&self) -> &str;

    /// Bind the HTTP+WebSocket event bus, connect to the platform, and process
    /// events until `shutdown` is set.
    fn run(&self, shutdown: tokio::sync::watch::Receiver<bool>) -> impl std::future::Future<Output = crate::error::Result<()>> + Send;
}
