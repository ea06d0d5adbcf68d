//! Per-socket reader/writer pair bridging axum WebSockets to the broker.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::ChannelBroker;

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(broker): State<Arc<ChannelBroker>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, broker))
}

async fn handle_socket(socket: WebSocket, broker: Arc<ChannelBroker>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let conn_id = broker.on_connection_open(out_tx).await;

    // Ends when the broker drops the sender or the peer stops reading.
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => broker.on_frame(&conn_id, text.as_str()).await,
            Ok(Message::Binary(bytes)) => {
                let text = String::from_utf8_lossy(&bytes);
                broker.on_frame(&conn_id, &text).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "WebSocket read error");
                break;
            }
        }
    }

    broker.on_connection_close(&conn_id).await;
    if let Err(e) = writer.await {
        debug!(conn_id = %conn_id, error = %e, "Writer task ended abnormally");
    }
}
