//! Top-level error types for chatbridge.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {section}.{key}")]
    MissingKey { section: String, key: String },

    #[error("unknown config section: {0}")]
    UnknownSection(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Conversation-state errors.
///
/// Most conversation/cache misses are modeled as `Option::None` rather than an
/// error (spec: cache misses are no-ops), so this enum stays small.
#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("conversation {0} not found")]
    NotFound(String),

    #[error("attachment store unwritable at {path}: {source}")]
    StorageUnwritable {
        path: String,
        source: std::io::Error,
    },
}

/// Rate limiter errors. The zero-RPM misconfiguration is deliberately *not* an
/// error (it falls back to a 1 second wait per spec) so this enum is reserved
/// for genuine programmer errors.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("unknown rate limit kind: {0}")]
    UnknownKind(String),
}

/// Socket.IO-shaped server errors.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("failed to bind socket server to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("unknown request id: {0}")]
    UnknownRequest(String),

    #[error("malformed client event: {0}")]
    MalformedEvent(String),
}

/// Platform-adapter errors, one variant per adapter wrapping its own failure mode.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("discord error: {0}")]
    Discord(String),

    #[error("slack error: {0}")]
    Slack(String),

    #[error("telegram error: {0}")]
    Telegram(String),

    #[error("zulip error: {0}")]
    Zulip(String),

    #[error("text-file adapter error: {0}")]
    TextFile(String),

    #[error("shell adapter error: {0}")]
    Shell(String),

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
