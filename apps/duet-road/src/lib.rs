//! Signaling relay for two-person lesson rooms.

pub mod config;
pub mod websocket;

pub use config::RelayConfig;
pub use websocket::{router, RelayState};
