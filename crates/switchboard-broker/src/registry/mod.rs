//! In-memory channel membership.

mod channels;

pub use channels::ChannelRegistry;
