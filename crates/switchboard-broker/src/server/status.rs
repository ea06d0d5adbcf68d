use std::sync::Arc;

use axum::Json;
use axum::extract::State;

use crate::broker::{ChannelBroker, StatusReport};

/// `GET /status`
pub async fn status_handler(State(broker): State<Arc<ChannelBroker>>) -> Json<StatusReport> {
    Json(broker.status())
}
