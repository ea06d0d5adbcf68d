//! Channel broker: per-connection frame handling and channel fan-out.
//!
//! The broker is transport-agnostic. The WebSocket server hands it an
//! outbound queue per socket and feeds it raw text frames; tests do the same
//! with bare channels.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use switchboard_core::{Envelope, FrameType};

use crate::registry::ChannelRegistry;
use crate::stats::{ConnectionStats, StatsSnapshot};

pub const JOIN_PROMPT: &str = "Please join a channel to start chatting";
pub const USER_JOINED: &str = "A new user has joined the channel";
pub const USER_LEFT: &str = "A user has left the channel";
pub const NOT_A_MEMBER: &str = "You must join the channel before sending messages";

/// One accepted socket, as seen by the broker.
#[derive(Debug)]
struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    opened_at: Instant,
}

#[derive(Debug, Default)]
struct BrokerState {
    registry: ChannelRegistry,
    connections: HashMap<String, Connection>,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    /// Whole seconds since the broker started.
    pub uptime: u64,
    pub stats: StatsSnapshot,
}

/// Groups connections into channels and relays frames between them.
pub struct ChannelBroker {
    state: Mutex<BrokerState>,
    stats: ConnectionStats,
    started_at: Instant,
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            stats: ConnectionStats::new(),
            started_at: Instant::now(),
        }
    }

    /// Register a new connection and prompt it to join a channel.
    pub async fn on_connection_open(&self, outbound: mpsc::UnboundedSender<String>) -> String {
        let conn_id = Uuid::new_v4().to_string();
        let conn = Connection {
            outbound,
            opened_at: Instant::now(),
        };
        self.stats.connection_opened();
        self.deliver(&conn, &Envelope::system(JOIN_PROMPT));
        self.state.lock().await.connections.insert(conn_id.clone(), conn);
        info!(conn_id = %conn_id, "Connection opened");
        conn_id
    }

    /// Handle one raw inbound frame from `conn_id`.
    pub async fn on_frame(&self, conn_id: &str, raw: &str) {
        self.stats.message_received();
        let mut state = self.state.lock().await;
        if !state.connections.contains_key(conn_id) {
            debug!(conn_id, "Frame from unknown connection dropped");
            return;
        }

        let envelope = match Envelope::from_text(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(conn_id, error = %e, "Malformed frame");
                self.reject(&state, conn_id, format!("Invalid message format: {e}"));
                return;
            }
        };

        match envelope.frame_type {
            FrameType::Join => self.handle_join(&mut state, conn_id, &envelope),
            FrameType::Message => self.handle_message(&state, conn_id, envelope),
            FrameType::Progress => self.handle_progress(&state, conn_id, &envelope, raw),
            other => {
                self.reject(&state, conn_id, format!("Unsupported frame type: {other}"));
            }
        }
    }

    /// Drop `conn_id`, leaving its channel and telling the remaining members.
    pub async fn on_connection_close(&self, conn_id: &str) {
        let mut state = self.state.lock().await;
        let Some(conn) = state.connections.remove(conn_id) else {
            return;
        };
        self.stats.connection_closed();

        if let Some(channel) = state.registry.leave(conn_id) {
            let notice = Envelope::system(USER_LEFT).with_channel(&channel);
            self.fan_out(&state, &channel, Some(conn_id), &notice);
        }
        info!(
            conn_id,
            lifetime_ms = u64::try_from(conn.opened_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Connection closed"
        );
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            status: "running",
            uptime: self.started_at.elapsed().as_secs(),
            stats: self.stats.snapshot(),
        }
    }

    /// Channel `conn_id` currently belongs to.
    pub async fn channel_of(&self, conn_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .registry
            .channel_of(conn_id)
            .map(ToString::to_string)
    }

    pub async fn channel_count(&self) -> usize {
        self.state.lock().await.registry.channel_count()
    }

    fn handle_join(&self, state: &mut BrokerState, conn_id: &str, envelope: &Envelope) {
        let Some(channel) = envelope.channel_name() else {
            self.reject(state, conn_id, "Channel name is required");
            return;
        };

        if let Some(previous) = state.registry.join(channel, conn_id) {
            let notice = Envelope::system(USER_LEFT).with_channel(&previous);
            self.fan_out(state, &previous, Some(conn_id), &notice);
        }
        info!(conn_id, channel, "Joined channel");

        let result = format!("Connected to channel: {channel}");
        let payload = match &envelope.id {
            Some(id) => json!({ "id": id, "result": result }),
            None => json!({ "result": result }),
        };
        let confirmation = Envelope::system(payload)
            .with_channel(channel)
            .with_id(envelope.id.clone());
        self.send_to(state, conn_id, &confirmation);

        let notice = Envelope::system(USER_JOINED).with_channel(channel);
        self.fan_out(state, channel, Some(conn_id), &notice);
    }

    fn handle_message(&self, state: &BrokerState, conn_id: &str, envelope: Envelope) {
        let channel = envelope
            .channel_name()
            .or_else(|| state.registry.channel_of(conn_id))
            .map(ToString::to_string);
        let Some(channel) = channel else {
            self.reject(state, conn_id, NOT_A_MEMBER);
            return;
        };
        if !state.registry.is_member(&channel, conn_id) {
            warn!(conn_id, channel = %channel, "Message to channel without membership");
            self.reject(state, conn_id, NOT_A_MEMBER);
            return;
        }

        let broadcast = Envelope::broadcast(
            envelope.id,
            &channel,
            conn_id,
            envelope.message.unwrap_or(Value::Null),
        );
        let delivered = self.fan_out(state, &channel, Some(conn_id), &broadcast);
        debug!(conn_id, channel = %channel, delivered, "Message broadcast");
    }

    fn handle_progress(&self, state: &BrokerState, conn_id: &str, envelope: &Envelope, raw: &str) {
        let Some(channel) = envelope
            .channel_name()
            .or_else(|| state.registry.channel_of(conn_id))
        else {
            self.reject(state, conn_id, "Progress frames require a channel");
            return;
        };

        let mut delivered = 0;
        for member in state.registry.members(channel) {
            if let Some(conn) = state.connections.get(&member) {
                if self.deliver_raw(conn, raw) {
                    delivered += 1;
                }
            }
        }
        debug!(conn_id, channel, delivered, "Progress forwarded");
    }

    /// Send `envelope` to every member of `channel` except `skip`.
    fn fan_out(
        &self,
        state: &BrokerState,
        channel: &str,
        skip: Option<&str>,
        envelope: &Envelope,
    ) -> usize {
        let Ok(text) = envelope.to_text() else {
            return 0;
        };
        state
            .registry
            .members(channel)
            .iter()
            .filter(|member| Some(member.as_str()) != skip)
            .filter_map(|member| state.connections.get(member))
            .filter(|conn| self.deliver_raw(conn, &text))
            .count()
    }

    fn send_to(&self, state: &BrokerState, conn_id: &str, envelope: &Envelope) {
        if let Some(conn) = state.connections.get(conn_id) {
            self.deliver(conn, envelope);
        }
    }

    /// Answer a protocol violation to the offending connection only.
    fn reject(&self, state: &BrokerState, conn_id: &str, reason: impl Into<String>) {
        self.stats.error();
        self.send_to(state, conn_id, &Envelope::error(reason));
    }

    fn deliver(&self, conn: &Connection, envelope: &Envelope) -> bool {
        match envelope.to_text() {
            Ok(text) => self.deliver_raw(conn, &text),
            Err(e) => {
                warn!(error = %e, "Failed to encode envelope");
                false
            }
        }
    }

    /// Best effort: a closed writer just means the socket is going away.
    fn deliver_raw(&self, conn: &Connection, text: &str) -> bool {
        let ok = conn.outbound.send(text.to_string()).is_ok();
        if ok {
            self.stats.message_sent();
        }
        ok
    }
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Peer {
        id: String,
        rx: mpsc::UnboundedReceiver<String>,
    }

    impl Peer {
        fn next(&mut self) -> Value {
            let text = self.rx.try_recv().unwrap();
            serde_json::from_str(&text).unwrap()
        }

        fn drain(&mut self) -> Vec<Value> {
            let mut frames = Vec::new();
            while let Ok(text) = self.rx.try_recv() {
                frames.push(serde_json::from_str(&text).unwrap());
            }
            frames
        }

        fn is_quiet(&mut self) -> bool {
            self.rx.try_recv().is_err()
        }
    }

    async fn connect(broker: &ChannelBroker) -> Peer {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = broker.on_connection_open(tx).await;
        let mut peer = Peer { id, rx };
        let prompt = peer.next();
        assert_eq!(prompt["type"], "system");
        assert_eq!(prompt["message"], JOIN_PROMPT);
        peer
    }

    async fn join(broker: &ChannelBroker, peer: &mut Peer, channel: &str) {
        let frame = json!({ "type": "join", "channel": channel }).to_string();
        broker.on_frame(&peer.id, &frame).await;
        let reply = peer.next();
        assert_eq!(reply["type"], "system");
        assert_eq!(reply["channel"], channel);
    }

    #[tokio::test]
    async fn open_does_not_join_any_channel() {
        let broker = ChannelBroker::new();
        let peer = connect(&broker).await;
        assert_eq!(broker.channel_of(&peer.id).await, None);
        assert_eq!(broker.status().stats.active_connections, 1);
    }

    #[tokio::test]
    async fn join_confirms_with_correlation_id() {
        let broker = ChannelBroker::new();
        let mut peer = connect(&broker).await;

        let frame = json!({ "type": "join", "channel": "room", "id": "join-1" }).to_string();
        broker.on_frame(&peer.id, &frame).await;

        let reply = peer.next();
        assert_eq!(reply["type"], "system");
        assert_eq!(reply["id"], "join-1");
        assert_eq!(reply["message"]["id"], "join-1");
        assert_eq!(reply["message"]["result"], "Connected to channel: room");
        assert_eq!(broker.channel_of(&peer.id).await.as_deref(), Some("room"));
    }

    #[tokio::test]
    async fn join_notifies_existing_members() {
        let broker = ChannelBroker::new();
        let mut first = connect(&broker).await;
        let mut second = connect(&broker).await;
        join(&broker, &mut first, "room").await;
        join(&broker, &mut second, "room").await;

        let notice = first.next();
        assert_eq!(notice["message"], USER_JOINED);
        assert!(second.is_quiet());
    }

    #[tokio::test]
    async fn join_without_channel_is_rejected() {
        let broker = ChannelBroker::new();
        let mut peer = connect(&broker).await;

        broker.on_frame(&peer.id, r#"{"type":"join","channel":""}"#).await;

        let reply = peer.next();
        assert_eq!(reply["type"], "error");
        assert_eq!(broker.status().stats.errors, 1);
        assert_eq!(broker.channel_count().await, 0);
    }

    #[tokio::test]
    async fn message_reaches_other_members_only() {
        let broker = ChannelBroker::new();
        let mut driver = connect(&broker).await;
        let mut target = connect(&broker).await;
        join(&broker, &mut driver, "room").await;
        join(&broker, &mut target, "room").await;
        driver.drain();

        let frame = json!({
            "id": "cmd-1", "type": "message", "channel": "room",
            "message": { "id": "cmd-1", "command": "get_selection", "params": {} }
        })
        .to_string();
        broker.on_frame(&driver.id, &frame).await;

        let broadcast = target.next();
        assert_eq!(broadcast["type"], "broadcast");
        assert_eq!(broadcast["sender"], driver.id.as_str());
        assert_eq!(broadcast["channel"], "room");
        assert_eq!(broadcast["message"]["command"], "get_selection");
        assert!(driver.is_quiet());
    }

    #[tokio::test]
    async fn channel_isolation() {
        let broker = ChannelBroker::new();
        let mut a1 = connect(&broker).await;
        let mut a2 = connect(&broker).await;
        let mut b1 = connect(&broker).await;
        join(&broker, &mut a1, "a").await;
        join(&broker, &mut a2, "a").await;
        join(&broker, &mut b1, "b").await;
        a1.drain();

        let frame = json!({ "type": "message", "channel": "a", "message": { "text": "hi" } });
        broker.on_frame(&a1.id, &frame.to_string()).await;

        assert_eq!(a2.next()["message"]["text"], "hi");
        assert!(b1.is_quiet());
    }

    #[tokio::test]
    async fn message_uses_current_channel_when_omitted() {
        let broker = ChannelBroker::new();
        let mut a = connect(&broker).await;
        let mut b = connect(&broker).await;
        join(&broker, &mut a, "room").await;
        join(&broker, &mut b, "room").await;
        a.drain();

        broker
            .on_frame(&a.id, r#"{"type":"message","message":{"x":1}}"#)
            .await;
        assert_eq!(b.next()["channel"], "room");
    }

    #[tokio::test]
    async fn message_to_foreign_channel_is_rejected() {
        let broker = ChannelBroker::new();
        let mut a = connect(&broker).await;
        let mut b = connect(&broker).await;
        join(&broker, &mut a, "a").await;
        join(&broker, &mut b, "b").await;

        let frame = json!({ "type": "message", "channel": "b", "message": {} });
        broker.on_frame(&a.id, &frame.to_string()).await;

        let reply = a.next();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["message"], NOT_A_MEMBER);
        assert!(b.is_quiet());
    }

    #[tokio::test]
    async fn message_before_join_is_rejected() {
        let broker = ChannelBroker::new();
        let mut a = connect(&broker).await;
        broker.on_frame(&a.id, r#"{"type":"message","message":{}}"#).await;
        assert_eq!(a.next()["type"], "error");
    }

    #[tokio::test]
    async fn progress_is_forwarded_verbatim_to_all_members() {
        let broker = ChannelBroker::new();
        let mut driver = connect(&broker).await;
        let mut target = connect(&broker).await;
        join(&broker, &mut driver, "room").await;
        join(&broker, &mut target, "room").await;
        driver.drain();

        let raw = r#"{"type":"progress","id":"cmd-1","channel":"room","message":{"data":{"progress":50}}}"#;
        broker.on_frame(&target.id, raw).await;

        assert_eq!(driver.rx.try_recv().unwrap(), raw);
        assert_eq!(target.rx.try_recv().unwrap(), raw);
    }

    #[tokio::test]
    async fn progress_without_channel_is_rejected() {
        let broker = ChannelBroker::new();
        let mut peer = connect(&broker).await;
        broker.on_frame(&peer.id, r#"{"type":"progress","id":"x"}"#).await;
        assert_eq!(peer.next()["type"], "error");
    }

    #[tokio::test]
    async fn malformed_json_answers_error_and_keeps_connection() {
        let broker = ChannelBroker::new();
        let mut a = connect(&broker).await;
        let mut b = connect(&broker).await;
        join(&broker, &mut a, "room").await;
        join(&broker, &mut b, "room").await;
        a.drain();

        broker.on_frame(&a.id, "{not json").await;
        let reply = a.next();
        assert_eq!(reply["type"], "error");
        assert!(reply["message"].as_str().unwrap().starts_with("Invalid message format"));
        assert!(b.is_quiet());

        broker
            .on_frame(&a.id, r#"{"type":"message","message":{"ok":true}}"#)
            .await;
        assert_eq!(b.next()["message"]["ok"], true);
    }

    #[tokio::test]
    async fn unsupported_type_is_rejected() {
        let broker = ChannelBroker::new();
        let mut a = connect(&broker).await;
        broker.on_frame(&a.id, r#"{"type":"broadcast"}"#).await;
        assert_eq!(a.next()["type"], "error");
    }

    #[tokio::test]
    async fn close_leaves_channel_and_notifies_members() {
        let broker = ChannelBroker::new();
        let mut a = connect(&broker).await;
        let mut b = connect(&broker).await;
        join(&broker, &mut a, "room").await;
        join(&broker, &mut b, "room").await;
        a.drain();

        broker.on_connection_close(&b.id).await;

        assert_eq!(a.next()["message"], USER_LEFT);
        assert_eq!(broker.channel_of(&b.id).await, None);
        let stats = broker.status().stats;
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 1);

        broker.on_connection_close(&a.id).await;
        assert_eq!(broker.channel_count().await, 0);
    }

    #[tokio::test]
    async fn switching_channels_notifies_old_channel() {
        let broker = ChannelBroker::new();
        let mut a = connect(&broker).await;
        let mut b = connect(&broker).await;
        join(&broker, &mut a, "one").await;
        join(&broker, &mut b, "one").await;
        a.drain();

        join(&broker, &mut b, "two").await;

        assert_eq!(a.next()["message"], USER_LEFT);
        assert_eq!(broker.channel_of(&b.id).await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn counters_track_traffic() {
        let broker = ChannelBroker::new();
        let mut a = connect(&broker).await;
        join(&broker, &mut a, "room").await;

        let stats = broker.status().stats;
        assert_eq!(stats.messages_received, 1);
        // join prompt + join confirmation
        assert_eq!(stats.messages_sent, 2);
    }

    #[tokio::test]
    async fn status_report_shape() {
        let broker = ChannelBroker::new();
        let value = serde_json::to_value(broker.status()).unwrap();
        assert_eq!(value["status"], "running");
        assert!(value["uptime"].is_u64());
        assert!(value["stats"]["totalConnections"].is_u64());
    }
}
