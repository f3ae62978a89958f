//! Error types for salty-relay.

use std::path::PathBuf;

/// Main error type for salty-relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// The listen address could not be bound. Fatal at startup.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Configured listen address.
        address: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A permanent key file is unusable.
    #[error("permanent key {path}: {reason}")]
    Key {
        /// Key file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// WebSocket upgrade or transport failure of one connection.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Worker pool error.
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Worker pool errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// All workers busy and the queue is full (`drop` policy).
    #[error("worker pool saturated")]
    Saturated,

    /// The pool was shut down.
    #[error("worker pool closed")]
    Closed,

    /// The job panicked.
    #[error("job panicked")]
    Panicked,
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
