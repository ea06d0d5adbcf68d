//! Progress frames for long-running commands.
//!
//! A progress frame never resolves a command. It only proves the target is
//! still working, so the matching pending entry gets a fresh deadline.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use switchboard_core::FrameType;

use crate::pending::PendingTable;

/// Status reported by the target for one command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Percentage, 0 to 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressUpdate {
    /// Parse from `message.data`, falling back to `message` itself.
    pub fn from_frame(frame: &Value) -> Self {
        let Some(message) = frame.get("message") else {
            return Self::default();
        };
        let source = message.get("data").unwrap_or(message);
        serde_json::from_value(source.clone()).unwrap_or_default()
    }

    pub fn is_complete(&self) -> bool {
        self.status.as_deref() == Some("completed") || self.progress.is_some_and(|p| p >= 100.0)
    }
}

/// Progress for a known pending command.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub id: String,
    pub update: ProgressUpdate,
}

/// What the relay did with a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    /// Not a progress frame; hand it to the matcher.
    NotProgress,
    /// Progress for an id that is not pending (or has no id).
    Ignored,
    /// Deadline extended for a pending command.
    Touched(ProgressEvent),
}

#[derive(Debug, Clone)]
pub struct ProgressRelay {
    window: Duration,
}

impl ProgressRelay {
    pub const fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn handle(&self, table: &mut PendingTable, frame: &Value, now: Instant) -> RelayOutcome {
        if !is_progress_frame(frame) {
            return RelayOutcome::NotProgress;
        }

        let Some(id) = correlation_id(frame) else {
            debug!("Progress frame without id ignored");
            return RelayOutcome::Ignored;
        };
        if !table.touch(id, self.window, now) {
            debug!(request_id = id, "Progress for unknown request ignored");
            return RelayOutcome::Ignored;
        }

        let update = ProgressUpdate::from_frame(frame);
        if update.is_complete() {
            info!(request_id = id, "Target reports completion, awaiting result");
        } else {
            debug!(request_id = id, progress = ?update.progress, status = ?update.status, "Progress");
        }
        RelayOutcome::Touched(ProgressEvent {
            id: id.to_string(),
            update,
        })
    }
}

fn is_progress_frame(frame: &Value) -> bool {
    frame
        .get("type")
        .cloned()
        .and_then(|t| serde_json::from_value::<FrameType>(t).ok())
        == Some(FrameType::Progress)
}

fn correlation_id(frame: &Value) -> Option<&str> {
    let top = frame.get("id").and_then(Value::as_str);
    let nested = || frame.get("message")?.get("id")?.as_str();
    top.or_else(nested).filter(|id| !id.is_empty())
}
