//! Channel name → member connections, with the reverse index.
//!
//! A connection is a member of at most one channel; joining another channel
//! moves it. Channels exist only while they have members.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

/// Registry of channels and their member connection ids.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, BTreeSet<String>>,
    membership: HashMap<String, String>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn_id` to `channel`, creating the channel on first join.
    ///
    /// Returns the channel the connection was moved out of, if it differs
    /// from `channel`.
    pub fn join(&mut self, channel: &str, conn_id: &str) -> Option<String> {
        let previous = self
            .membership
            .insert(conn_id.to_string(), channel.to_string())
            .filter(|prev| prev != channel);

        if let Some(prev) = &previous {
            self.remove_member(prev, conn_id);
        }

        let created = !self.channels.contains_key(channel);
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(conn_id.to_string());
        if created {
            debug!(channel, "Channel created");
        }
        previous
    }

    /// Remove `conn_id` from whatever channel it is in.
    pub fn leave(&mut self, conn_id: &str) -> Option<String> {
        let channel = self.membership.remove(conn_id)?;
        self.remove_member(&channel, conn_id);
        Some(channel)
    }

    fn remove_member(&mut self, channel: &str, conn_id: &str) {
        if let Some(members) = self.channels.get_mut(channel) {
            members.remove(conn_id);
            if members.is_empty() {
                self.channels.remove(channel);
                debug!(channel, "Channel pruned");
            }
        }
    }

    /// Member ids of `channel`, in a stable order.
    pub fn members(&self, channel: &str) -> Vec<String> {
        self.channels
            .get(channel)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, channel: &str, conn_id: &str) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|m| m.contains(conn_id))
    }

    /// The channel `conn_id` currently belongs to.
    pub fn channel_of(&self, conn_id: &str) -> Option<&str> {
        self.membership.get(conn_id).map(String::as_str)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    #[cfg(test)]
    pub fn member_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, BTreeSet::len)
    }
}
