use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Opaque identity of one browsing context / process inside a room.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The lexicographically smaller identity of a pair is the polite one.
    /// Both sides evaluate this with the arguments swapped and agree.
    pub fn is_polite_towards(&self, remote: &PeerId) -> bool {
        self.0 < remote.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Settings of the local post-processing background filter, forwarded
/// verbatim to the other participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundSettings {
    pub enabled: bool,
    pub mode: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub display_name: String,
}

/// Messages sent from a participant to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join {
        room_id: String,
        peer_id: PeerId,
        display_name: String,
        /// Logical participant; a second device with the same value
        /// supersedes the first.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
    },
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_peer_id: Option<PeerId>,
        description: SessionDescription,
        handshake_id: String,
        message_id: String,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_peer_id: Option<PeerId>,
        description: SessionDescription,
        handshake_id: String,
        message_id: String,
    },
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_peer_id: Option<PeerId>,
        candidate: IceCandidate,
        handshake_id: String,
        message_id: String,
    },
    BackgroundSettings {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_peer_id: Option<PeerId>,
        settings: BackgroundSettings,
    },
    Leave {
        room_id: String,
        peer_id: PeerId,
    },
    Ping,
}

/// Messages pushed from the relay to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Joined {
        room_id: String,
        peer_id: PeerId,
        peers: Vec<PeerSummary>,
    },
    JoinError {
        reason: String,
    },
    PeerJoined {
        peer_id: PeerId,
        display_name: String,
        should_initiate: bool,
    },
    PeerLeft {
        peer_id: PeerId,
    },
    PeerReplaced {
        old_peer_id: PeerId,
        new_peer_id: PeerId,
    },
    Superseded {
        by_peer_id: PeerId,
    },
    Offer {
        from_peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_peer_id: Option<PeerId>,
        description: SessionDescription,
        handshake_id: String,
        message_id: String,
    },
    Answer {
        from_peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_peer_id: Option<PeerId>,
        description: SessionDescription,
        handshake_id: String,
        message_id: String,
    },
    IceCandidate {
        from_peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_peer_id: Option<PeerId>,
        candidate: IceCandidate,
        handshake_id: String,
        message_id: String,
    },
    BackgroundSettings {
        from_peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_peer_id: Option<PeerId>,
        settings: BackgroundSettings,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ClientMessage {
    /// Converts a peer-to-peer message into the form the relay fans out,
    /// stamping the sender. Returns `None` for messages the relay handles
    /// itself (join, leave, ping).
    pub fn into_relayed(self, from_peer_id: PeerId) -> Option<ServerMessage> {
        match self {
            ClientMessage::Offer {
                to_peer_id,
                description,
                handshake_id,
                message_id,
            } => Some(ServerMessage::Offer {
                from_peer_id,
                to_peer_id,
                description,
                handshake_id,
                message_id,
            }),
            ClientMessage::Answer {
                to_peer_id,
                description,
                handshake_id,
                message_id,
            } => Some(ServerMessage::Answer {
                from_peer_id,
                to_peer_id,
                description,
                handshake_id,
                message_id,
            }),
            ClientMessage::IceCandidate {
                to_peer_id,
                candidate,
                handshake_id,
                message_id,
            } => Some(ServerMessage::IceCandidate {
                from_peer_id,
                to_peer_id,
                candidate,
                handshake_id,
                message_id,
            }),
            ClientMessage::BackgroundSettings {
                to_peer_id,
                settings,
            } => Some(ServerMessage::BackgroundSettings {
                from_peer_id,
                to_peer_id,
                settings,
            }),
            ClientMessage::Join { .. } | ClientMessage::Leave { .. } | ClientMessage::Ping => None,
        }
    }
}

impl ServerMessage {
    /// Unicast target of a relayed message, if any.
    pub fn to_peer_id(&self) -> Option<&PeerId> {
        match self {
            ServerMessage::Offer { to_peer_id, .. }
            | ServerMessage::Answer { to_peer_id, .. }
            | ServerMessage::IceCandidate { to_peer_id, .. }
            | ServerMessage::BackgroundSettings { to_peer_id, .. } => to_peer_id.as_ref(),
            _ => None,
        }
    }
}
