//! Unified error types for the trade dashboard.
//!
//! Wire-message parse failures are deliberately absent: adapters recover them
//! locally by dropping the frame. Connection failures are consumed by the
//! connector's reconnect policy. Only [`Error::InvalidArgument`] is expected
//! to reach metrics callers — it signals a caller bug, not an environmental
//! condition.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("store query timed out")]
    QueryTimeout,

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;
