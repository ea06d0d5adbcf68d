//! Command dispatcher.
//!
//! Issues commands with unique correlation ids, keeps them in the pending
//! table and resolves them from inbound frames. Transport events are
//! processed on a single event-loop task, see [`Dispatcher::spawn_event_loop`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};
use uuid::Uuid;

use switchboard_core::Envelope;
use switchboard_core::config::ClientConfig;

use crate::config::{DispatcherConfig, TransportConfig};
use crate::error::DispatchError;
use crate::matcher::{self, ResponseOutcome};
use crate::pending::{DeadlineCheck, Outcome, PendingTable};
use crate::progress::{ProgressEvent, ProgressRelay, RelayOutcome};
use crate::transport::{Transport, TransportEvent, TransportHandle};

pub const JOIN_COMMAND: &str = "join";

const PROGRESS_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct ChannelState {
    /// Channel confirmed by the broker on the current connection.
    current: Option<String>,
    /// Last confirmed channel, kept across reconnects for re-joining.
    remembered: Option<String>,
}

/// Background tasks started by [`Dispatcher::start`].
pub struct ClientTasks {
    pub transport: JoinHandle<()>,
    pub events: JoinHandle<()>,
}

/// Sends commands to the target and awaits their responses.
#[derive(Clone)]
pub struct Dispatcher {
    transport: TransportHandle,
    pending: Arc<Mutex<PendingTable>>,
    channel: Arc<RwLock<ChannelState>>,
    relay: Arc<ProgressRelay>,
    progress_tx: broadcast::Sender<ProgressEvent>,
    config: Arc<DispatcherConfig>,
}

impl Dispatcher {
    pub fn new(transport: TransportHandle, config: DispatcherConfig) -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self {
            transport,
            pending: Arc::new(Mutex::new(PendingTable::new(config.extension_factor))),
            channel: Arc::new(RwLock::new(ChannelState::default())),
            relay: Arc::new(ProgressRelay::new(config.progress_window)),
            progress_tx,
            config: Arc::new(config),
        }
    }

    /// Spawn the transport and the event loop for `config`.
    ///
    /// The connection is opened lazily by the first command.
    pub fn start(config: &ClientConfig) -> (Self, ClientTasks) {
        let (transport, events, transport_task) = Transport::spawn(TransportConfig::from(config));
        let dispatcher = Self::new(transport, DispatcherConfig::from(config));
        let events_task = dispatcher.spawn_event_loop(events);
        (
            dispatcher,
            ClientTasks {
                transport: transport_task,
                events: events_task,
            },
        )
    }

    /// Send `command` and wait for its response.
    ///
    /// `timeout` overrides the configured command timeout.
    pub async fn send(
        &self,
        command: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, DispatchError> {
        if command == JOIN_COMMAND {
            let channel = params
                .get("channel")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .ok_or_else(|| DispatchError::InvalidParams("join requires a channel".into()))?;
            return self.join_with_timeout(channel, timeout).await;
        }

        let channel = self.current_channel().await.ok_or(DispatchError::NotJoined)?;
        self.ensure_connected().await?;
        self.dispatch(command, &channel, params, timeout).await
    }

    /// Join `channel`. The current channel changes once the broker confirms.
    pub async fn join(&self, channel: &str) -> Result<Value, DispatchError> {
        self.join_with_timeout(channel, None).await
    }

    async fn join_with_timeout(
        &self,
        channel: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, DispatchError> {
        self.ensure_connected().await?;
        let params = json!({ "channel": channel });
        let result = self.dispatch(JOIN_COMMAND, channel, params, timeout).await?;

        let mut state = self.channel.write().await;
        state.current = Some(channel.to_string());
        state.remembered = Some(channel.to_string());
        info!(channel, "Joined channel");
        Ok(result)
    }

    pub async fn current_channel(&self) -> Option<String> {
        self.channel.read().await.current.clone()
    }

    /// Progress updates for commands that are still pending.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// Stop the transport; pending commands are rejected as the socket closes.
    pub fn shutdown(&self) {
        self.transport.shutdown();
    }

    /// Open the transport if needed, waiting up to the connect timeout.
    async fn ensure_connected(&self) -> Result<(), DispatchError> {
        if self.transport.is_open() {
            return Ok(());
        }
        debug!("Transport not open, connecting");
        self.transport.connect();
        if self.transport.wait_open(self.config.connect_timeout).await {
            Ok(())
        } else {
            Err(DispatchError::NotConnected)
        }
    }

    async fn dispatch(
        &self,
        command: &str,
        channel: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, DispatchError> {
        let id = format!("{command}-{}", Uuid::new_v4());
        let envelope = if command == JOIN_COMMAND {
            Envelope::join(&id, channel)
        } else {
            Envelope::command(&id, channel, command, params)
        };
        let text = envelope.to_text()?;
        let timeout = timeout.unwrap_or(self.config.command_timeout);

        let rx = self.pending.lock().await.register(
            &id,
            command,
            timeout,
            self.config.max_extensions,
            Instant::now(),
        );

        if let Err(e) = self.transport.send(text).await {
            self.pending.lock().await.remove(&id);
            warn!(request_id = %id, command, error = %e, "Failed to send command");
            return Err(e.into());
        }
        debug!(request_id = %id, command, channel, "Command sent");

        self.await_response(&id, rx).await
    }

    /// Sleep until the entry's current deadline and let the table decide.
    async fn await_response(
        &self,
        id: &str,
        mut rx: oneshot::Receiver<Outcome>,
    ) -> Result<Value, DispatchError> {
        loop {
            let deadline = self.pending.lock().await.deadline(id);
            let Some(deadline) = deadline else {
                break;
            };
            tokio::select! {
                outcome = &mut rx => {
                    return outcome.map_err(|_| DispatchError::ResponseDropped)?;
                }
                () = sleep_until(deadline) => {
                    let check = self.pending.lock().await.on_deadline(id, Instant::now());
                    if matches!(check, DeadlineCheck::Expired { .. } | DeadlineCheck::Gone) {
                        break;
                    }
                }
            }
        }
        rx.await.map_err(|_| DispatchError::ResponseDropped)?
    }

    /// React to one transport event.
    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.on_opened().await,
            TransportEvent::Closed { reason } => self.on_closed(&reason).await,
            TransportEvent::Frame(frame) => self.on_frame(&frame).await,
        }
    }

    /// Process transport events until the transport goes away.
    pub fn spawn_event_loop(
        &self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                dispatcher.handle_event(event).await;
            }
            debug!("Transport event stream ended");
        })
    }

    async fn on_opened(&self) {
        let rejoin = {
            let mut state = self.channel.write().await;
            state.current = None;
            state.remembered.clone()
        };
        let Some(channel) = rejoin else {
            return;
        };

        info!(channel = %channel, "Re-joining channel after reconnect");
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.join(&channel).await {
                warn!(channel = %channel, error = %e, "Re-join failed");
            }
        });
    }

    async fn on_closed(&self, reason: &str) {
        self.channel.write().await.current = None;
        let rejected = self
            .pending
            .lock()
            .await
            .reject_all(|| DispatchError::ConnectionLost);
        if rejected > 0 {
            warn!(reason, rejected, "Connection lost with commands in flight");
        }
    }

    async fn on_frame(&self, frame: &Value) {
        let mut pending = self.pending.lock().await;

        match self.relay.handle(&mut pending, frame, Instant::now()) {
            RelayOutcome::Touched(event) => {
                let _ = self.progress_tx.send(event);
                return;
            }
            RelayOutcome::Ignored => return,
            RelayOutcome::NotProgress => {}
        }

        let Some(found) = matcher::match_response(&pending, frame) else {
            if frame.get("type").and_then(Value::as_str) == Some("error") {
                warn!(message = %frame["message"], "Broker reported an error");
            } else {
                debug!(frame_type = ?frame.get("type"), "Unmatched frame ignored");
            }
            return;
        };

        debug!(request_id = %found.id, strategy = found.strategy, "Response matched");
        let outcome = match found.outcome {
            ResponseOutcome::Result(value) => Ok(value),
            ResponseOutcome::Error(message) => Err(DispatchError::Remote(message)),
        };
        pending.complete(&found.id, outcome);
    }
}
