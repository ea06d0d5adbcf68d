//! HTTP surface of the broker: WebSocket upgrade and status endpoint.

pub mod status;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::info;

use crate::broker::ChannelBroker;
use crate::error::Result;

pub use status::status_handler;
pub use ws::ws_handler;

/// Build the axum router with all broker routes.
pub fn build_router(broker: Arc<ChannelBroker>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/status", get(status_handler))
        .with_state(broker)
}

/// Serve the broker on an already-bound listener until the server stops.
pub async fn serve(listener: TcpListener, broker: Arc<ChannelBroker>) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Broker listening");
    axum::serve(listener, build_router(broker)).await?;
    Ok(())
}
