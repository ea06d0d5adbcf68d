//! Reconnecting WebSocket transport to the broker.
//!
//! One background task owns the socket. Callers talk to it through a
//! [`TransportHandle`]; lifecycle changes and inbound frames come back as
//! [`TransportEvent`]s on an unbounded channel.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::reconnect::{ReconnectSchedule, SchedulePhase};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Observable lifecycle of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Raised by the transport task.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Closed { reason: String },
    Frame(Value),
}

#[derive(Debug)]
pub(crate) enum TransportCommand {
    Connect,
    Send {
        text: String,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Shutdown,
}

/// Cloneable handle to the transport task.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    cmd_tx: mpsc::UnboundedSender<TransportCommand>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl TransportHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Ask the task to connect now. No-op while open or connecting.
    pub fn connect(&self) {
        if matches!(self.state(), ConnectionState::Open | ConnectionState::Connecting) {
            return;
        }
        let _ = self.cmd_tx.send(TransportCommand::Connect);
    }

    /// Write one text frame. Fails with `NotConnected` unless open.
    pub async fn send(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(TransportCommand::Send { text, reply })
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Wait until the connection is open, up to `timeout`.
    pub async fn wait_open(&self, timeout: Duration) -> bool {
        let mut state_rx = self.state_rx.clone();
        matches!(
            tokio::time::timeout(
                timeout,
                state_rx.wait_for(|s| *s == ConnectionState::Open)
            )
            .await,
            Ok(Ok(_))
        )
    }

    /// Close the socket and stop the task.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(TransportCommand::Shutdown);
    }

    /// Handle with no task behind it; the caller plays the transport.
    #[cfg(test)]
    pub(crate) fn detached(
        initial: ConnectionState,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<TransportCommand>,
        watch::Sender<ConnectionState>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(initial);
        (Self { cmd_tx, state_rx }, cmd_rx, state_tx)
    }
}

/// How a connected session ended.
enum SessionEnd {
    Closed(String),
    Shutdown,
}

/// The task side of the transport.
pub struct Transport {
    config: TransportConfig,
    schedule: ReconnectSchedule,
    cmd_rx: mpsc::UnboundedReceiver<TransportCommand>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl Transport {
    /// Start the transport task in the `Idle` state.
    ///
    /// Nothing is dialled until the first [`TransportHandle::connect`].
    pub fn spawn(
        config: TransportConfig,
    ) -> (
        TransportHandle,
        mpsc::UnboundedReceiver<TransportEvent>,
        JoinHandle<()>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let transport = Self {
            schedule: ReconnectSchedule::new(config.reconnect.clone()),
            config,
            cmd_rx,
            state_tx,
            events_tx,
        };
        let task = tokio::spawn(transport.run());
        (TransportHandle { cmd_tx, state_rx }, events_rx, task)
    }

    async fn run(mut self) {
        if !self.wait_for_first_connect().await {
            return;
        }

        loop {
            self.set_state(ConnectionState::Connecting);
            let end = match self.open().await {
                Ok(ws) => {
                    info!(url = %self.config.url, "Connected to broker");
                    self.schedule.reset();
                    self.set_state(ConnectionState::Open);
                    self.emit(TransportEvent::Opened);
                    self.drive(ws).await
                }
                Err(e) if self.discard_stale_connects() => SessionEnd::Closed(e.to_string()),
                Err(_) => SessionEnd::Shutdown,
            };

            let reason = match end {
                SessionEnd::Shutdown => {
                    self.set_state(ConnectionState::Closed);
                    self.emit(TransportEvent::Closed {
                        reason: "transport shut down".to_string(),
                    });
                    info!("Transport shut down");
                    return;
                }
                SessionEnd::Closed(reason) => reason,
            };

            self.set_state(ConnectionState::Closed);
            self.emit(TransportEvent::Closed {
                reason: reason.clone(),
            });

            let attempt = match self.schedule.phase() {
                SchedulePhase::Backoff { attempt } => Some(attempt),
                SchedulePhase::Persistent => None,
            };
            let delay = self.schedule.next_delay();
            warn!(
                reason = %reason,
                attempt = ?attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Broker connection closed, reconnecting"
            );

            if !self.wait_retry(delay).await {
                info!("Transport shut down during reconnect wait");
                return;
            }
        }
    }

    /// Idle until asked to connect. Returns `false` on shutdown.
    async fn wait_for_first_connect(&mut self) -> bool {
        loop {
            match self.cmd_rx.recv().await {
                Some(TransportCommand::Connect) => return true,
                Some(TransportCommand::Send { reply, .. }) => {
                    let _ = reply.send(Err(TransportError::NotConnected));
                }
                Some(TransportCommand::Shutdown) | None => return false,
            }
        }
    }

    /// Drop connect requests that raced the failed attempt so they cannot
    /// skip the retry delay. Returns `false` if shutdown was queued.
    fn discard_stale_connects(&mut self) -> bool {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                TransportCommand::Connect => debug!("Dropping connect queued during attempt"),
                TransportCommand::Send { reply, .. } => {
                    let _ = reply.send(Err(TransportError::NotConnected));
                }
                TransportCommand::Shutdown => return false,
            }
        }
        true
    }

    /// Sleep `delay` unless a connect request cuts it short. Returns `false`
    /// on shutdown.
    async fn wait_retry(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                () = sleep_until(deadline) => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(TransportCommand::Connect) => {
                        debug!("Reconnect wait cut short");
                        return true;
                    }
                    Some(TransportCommand::Send { reply, .. }) => {
                        let _ = reply.send(Err(TransportError::NotConnected));
                    }
                    Some(TransportCommand::Shutdown) | None => return false,
                },
            }
        }
    }

    async fn open(&self) -> Result<WsStream, TransportError> {
        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, connect_async(self.config.url.as_str())).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(TransportError::Connect(e.to_string())),
            Err(_) => Err(TransportError::ConnectTimeout(timeout)),
        }
    }

    /// Pump one open socket until it closes or shutdown is requested.
    async fn drive(&mut self, ws: WsStream) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.on_text(text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => {
                        self.on_text(&String::from_utf8_lossy(&bytes));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(
                            || "closed by broker".to_string(),
                            |f| format!("closed by broker ({}): {}", f.code, f.reason.as_str()),
                        );
                        return SessionEnd::Closed(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Closed(e.to_string()),
                    None => return SessionEnd::Closed("stream ended".to_string()),
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(TransportCommand::Send { text, reply }) => {
                        let result = sink
                            .send(Message::text(text))
                            .await
                            .map_err(|e| TransportError::Send(e.to_string()));
                        let failed = result.as_ref().err().map(ToString::to_string);
                        let _ = reply.send(result);
                        if let Some(reason) = failed {
                            return SessionEnd::Closed(reason);
                        }
                    }
                    Some(TransportCommand::Connect) => {}
                    Some(TransportCommand::Shutdown) | None => {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                },
            }
        }
    }

    fn on_text(&self, text: &str) {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => self.emit(TransportEvent::Frame(value)),
            Err(e) => debug!(error = %e, "Dropping unparseable frame"),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }
}
