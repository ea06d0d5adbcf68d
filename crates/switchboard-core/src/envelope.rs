//! Wire envelope for the channel protocol.
//!
//! Every frame on the socket is one JSON object:
//!
//! ```text
//! { "id": string?, "type": "join"|"message"|"progress"|"system"|"broadcast"|"error",
//!   "channel": string?, "sender": string?, "message": object | string? }
//! ```
//!
//! The nested `message` is kept as a raw [`Value`] because responses from the
//! target do not agree on where they put `id`, `result` and `error`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Kind of frame carried by an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Join,
    Message,
    #[serde(alias = "progress_update")]
    Progress,
    System,
    Broadcast,
    Error,
    #[serde(other)]
    Unknown,
}

impl FrameType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Message => "message",
            Self::Progress => "progress",
            Self::System => "system",
            Self::Broadcast => "broadcast",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire unit exchanged between broker and clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation identifier, when the frame belongs to a command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Connection id of the originator, set by the broker on broadcasts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

/// Nested command payload: `{ id, command, params }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub params: Value,
}

impl Envelope {
    const fn bare(frame_type: FrameType) -> Self {
        Self {
            id: None,
            frame_type,
            channel: None,
            sender: None,
            message: None,
        }
    }

    /// `{type:"system", message}` notice.
    pub fn system(message: impl Into<Value>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::bare(FrameType::System)
        }
    }

    /// `{type:"error", message}` sent to a connection that broke protocol.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(Value::String(message.into())),
            ..Self::bare(FrameType::Error)
        }
    }

    /// Join request. The payload repeats the id so the broker's confirmation
    /// can be correlated like any other command response.
    pub fn join(id: &str, channel: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            channel: Some(channel.to_string()),
            message: Some(json!({
                "id": id,
                "command": "join",
                "params": { "channel": channel },
            })),
            ..Self::bare(FrameType::Join)
        }
    }

    /// Command invocation with the id at both envelope and payload level.
    pub fn command(id: &str, channel: &str, command: &str, params: Value) -> Self {
        let payload = CommandPayload {
            id: id.to_string(),
            command: command.to_string(),
            params,
        };
        Self {
            id: Some(id.to_string()),
            channel: Some(channel.to_string()),
            // Serializing a struct of strings and a Value cannot fail.
            message: serde_json::to_value(payload).ok(),
            ..Self::bare(FrameType::Message)
        }
    }

    /// Broadcast of `message` from `sender` to the rest of `channel`.
    pub fn broadcast(id: Option<String>, channel: &str, sender: &str, message: Value) -> Self {
        Self {
            id,
            channel: Some(channel.to_string()),
            sender: Some(sender.to_string()),
            message: Some(message),
            ..Self::bare(FrameType::Broadcast)
        }
    }

    pub fn with_channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }

    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    /// Channel name when present and non-empty.
    pub fn channel_name(&self) -> Option<&str> {
        self.channel.as_deref().filter(|c| !c.is_empty())
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
