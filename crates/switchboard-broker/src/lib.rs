//! Switchboard Broker Library
//!
//! WebSocket broker that groups connections into named channels:
//! - Channel registry with one-channel-per-connection membership
//! - Frame handling for join, message and progress traffic
//! - axum server with `/ws` upgrade and `/status` endpoint
//! - Connection and traffic counters

pub mod broker;
pub mod error;
pub mod registry;
pub mod server;
pub mod stats;

pub use broker::{ChannelBroker, StatusReport};
pub use error::{BrokerError, Result};
pub use server::{build_router, serve};
