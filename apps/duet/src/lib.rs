//! Peer-to-peer lesson sessions: signaling, perfect negotiation, data
//! channels with bounded queues, connection recovery and chunked file
//! transfer between exactly two participants.

pub mod channels;
pub mod config;
pub mod identity;
pub mod negotiation;
pub mod recovery;
pub mod session;
pub mod telemetry;
pub mod transfer;
pub mod transport;

pub use config::SessionConfig;
pub use session::{Participant, SessionContext, SessionDeps, SessionError, SessionEvent, SessionStatus};
