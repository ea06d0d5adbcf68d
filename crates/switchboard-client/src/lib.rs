//! Switchboard Client Library
//!
//! Driver-side half of the relay:
//! - Reconnecting WebSocket transport with a two-phase reconnect schedule
//! - Pending-command table with per-command deadline extension
//! - Response matcher cascade for loosely correlated responses
//! - Progress relay that keeps long-running commands alive
//! - Command dispatcher tying the pieces together

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod matcher;
pub mod pending;
pub mod progress;
pub mod reconnect;
pub mod transport;

pub use config::{DispatcherConfig, ReconnectPolicy, TransportConfig};
pub use dispatcher::{ClientTasks, Dispatcher};
pub use error::{DispatchError, TransportError};
pub use progress::{ProgressEvent, ProgressUpdate};
pub use transport::{ConnectionState, Transport, TransportEvent, TransportHandle};
