//! Wire definitions and rendezvous rules shared by the session layer and
//! the relay. Kept free of runtime dependencies so the relay can link it
//! without pulling in the WebRTC stack.

pub mod chunk;
pub mod rooms;
pub mod signaling;
pub mod wire;

pub use chunk::{ChunkError, ChunkFrame};
pub use signaling::{
    BackgroundSettings, ClientMessage, IceCandidate, PeerId, PeerSummary, SdpKind, ServerMessage,
    SessionDescription,
};
pub use wire::{
    ChatMessage, ControlMessage, FileControl, FileMetadata, ProtocolError, WhiteboardAction,
    WhiteboardEvent, decode_text,
};
