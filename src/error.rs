// =============================================================================
// Error taxonomy for the market-data distribution layer
// =============================================================================
//
// Process-level code (config persistence, REST client, main) uses `anyhow`.
// Everything that crosses the hub / cache / client seams returns one of the
// typed errors below so callers can choose a policy per kind (fail open,
// retry forever, surface to the application).
// =============================================================================

use thiserror::Error;

use crate::hub::ConnectionId;

/// Errors raised by the backing cache engine.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The store could not be reached or refused the operation.
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be encoded or decoded.
    #[error("cache codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors raised by the feed, hub and client layers.
#[derive(Debug, Error)]
pub enum FeedError {
    /// An inbound frame did not match the expected envelope shape.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A channel key failed validation.
    #[error("invalid channel '{key}': {reason}")]
    InvalidChannel { key: String, reason: String },

    /// The exchange push stream dropped.
    #[error("upstream stream '{stream}' disconnected: {reason}")]
    UpstreamDisconnected { stream: String, reason: String },

    /// A downstream client socket went away.
    #[error("downstream connection {0} disconnected")]
    DownstreamDisconnected(ConnectionId),

    /// A threshold override was negative or not finite.
    #[error("invalid threshold: {0}")]
    InvalidThreshold(String),

    /// The hub has no record of the connection.
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    /// The cache layer failed; callers decide whether to fail open.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(#[from] CacheError),

    /// The client connection manager spent its reconnect budget.
    #[error("reconnect attempts exhausted after {attempts} failures")]
    ReconnectExhausted { attempts: u32 },

    /// Transport-level failure (connect, read, write).
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::MalformedMessage(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::Transport(e.to_string())
    }
}

/// Result alias for the hub / feed / client layers.
pub type Result<T> = std::result::Result<T, FeedError>;
