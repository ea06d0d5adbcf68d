//! Client error types.

use std::time::Duration;

/// Errors raised by the broker connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Transport task has stopped")]
    Closed,

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Send failed: {0}")]
    Send(String),
}

/// Errors returned to a command caller.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Must join a channel before sending commands")]
    NotJoined,

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Connection to broker lost")]
    ConnectionLost,

    #[error("Command {command} ({id}) timed out after {elapsed:?}")]
    Timeout {
        id: String,
        command: String,
        elapsed: Duration,
    },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Response channel dropped")]
    ResponseDropped,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
