//! JSON frames carried over the data channels.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::chunk::ChunkError;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed {channel} frame: {source}")]
    Malformed {
        channel: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected binary frame on {0}")]
    UnexpectedBinary(&'static str),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

/// Parses one JSON text frame received on `channel`.
pub fn decode_text<T: DeserializeOwned>(channel: &'static str, text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|source| ProtocolError::Malformed { channel, source })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub user_name: String,
    pub message: String,
    /// Unix epoch milliseconds at the sender.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    Ping {
        id: u64,
        sent_at: i64,
    },
    Pong {
        id: u64,
    },
    HandRaise {
        raised: bool,
    },
    ToggleVideo {
        enabled: bool,
    },
    ToggleAudio {
        enabled: bool,
    },
    UserInfo {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WhiteboardAction {
    Draw,
    Erase,
    Clear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhiteboardEvent {
    #[serde(rename = "type")]
    pub action: WhiteboardAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl WhiteboardEvent {
    pub fn draw(object_id: impl Into<String>, payload: Value) -> Self {
        Self {
            action: WhiteboardAction::Draw,
            object_id: Some(object_id.into()),
            payload: Some(payload),
        }
    }

    pub fn erase(object_id: impl Into<String>) -> Self {
        Self {
            action: WhiteboardAction::Erase,
            object_id: Some(object_id.into()),
            payload: None,
        }
    }

    pub fn clear() -> Self {
        Self {
            action: WhiteboardAction::Clear,
            object_id: None,
            payload: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub total_chunks: u32,
}

/// Text frames of the file-transfer handshake. Binary chunk frames travel
/// on the same channel, see [`crate::chunk`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum FileControl {
    FileOffer { metadata: FileMetadata },
    FileAccept { id: String },
    FileReject { id: String },
    FileProgress { id: String, progress: u8 },
}

impl FileControl {
    pub fn transfer_id(&self) -> &str {
        match self {
            FileControl::FileOffer { metadata } => &metadata.id,
            FileControl::FileAccept { id }
            | FileControl::FileReject { id }
            | FileControl::FileProgress { id, .. } => id,
        }
    }
}
