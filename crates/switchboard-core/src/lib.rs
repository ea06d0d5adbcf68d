//! `Switchboard` Core Library
//!
//! Shared functionality for `Switchboard` components:
//! - Wire envelope types for the channel protocol
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod envelope;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use envelope::{Envelope, FrameType};
pub use error::{Error, Result};
