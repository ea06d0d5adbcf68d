//! Broker error types.

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Config(#[from] switchboard_core::Error),

    #[error("Invalid listen address {addr}: {source}")]
    InvalidAddr {
        addr: String,
        source: std::net::AddrParseError,
    },

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
