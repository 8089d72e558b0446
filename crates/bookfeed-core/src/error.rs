//! Typed error definitions shared across the workspace.
//!
//! Provides [`BookfeedError`] for failures that are more informative than
//! plain `anyhow::Error` strings. All variants implement `std::error::Error`
//! via `thiserror`, so they integrate seamlessly with `anyhow::Result`.

use thiserror::Error;

/// Domain-specific errors for the snapshot daemon.
#[derive(Debug, Error)]
pub enum BookfeedError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// WebSocket connection, handshake, or communication error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Exchange payload parsing error.
    #[error("parse error: {0}")]
    Parse(String),

    /// Malformed or invalid control channel message.
    #[error("protocol error: {0}")]
    Protocol(String),
}
