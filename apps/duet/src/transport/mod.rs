//! Seams between the session logic and the network.
//!
//! The session runner only talks to these traits; `webrtc` and `signaling`
//! implement them over webrtc-rs and a WebSocket relay, `mock` implements
//! them in memory for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use duet_proto::{ClientMessage, IceCandidate, ServerMessage, SessionDescription};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

pub mod mock;
pub mod signaling;
pub mod webrtc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("transport timed out")]
    Timeout,
    #[error("invalid signaling state: {0}")]
    InvalidState(String),
    #[error("signaling failed: {0}")]
    Signaling(String),
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Close,
    Message(ChannelPayload),
}

/// Everything a peer connection reports back to the runner. Channel
/// handlers are wired by the implementation as soon as a channel exists,
/// so no message can slip past before the runner learns about it.
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    IceState(IceConnectionState),
    /// A channel opened by the remote side.
    RemoteChannel(Arc<dyn DataChannel>),
    Channel {
        label: String,
        instance: ChannelInstance,
        event: ChannelEvent,
    },
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            PeerEvent::ConnectionState(state) => {
                f.debug_tuple("ConnectionState").field(state).finish()
            }
            PeerEvent::IceState(state) => f.debug_tuple("IceState").field(state).finish(),
            PeerEvent::RemoteChannel(channel) => f
                .debug_tuple("RemoteChannel")
                .field(&channel.label())
                .finish(),
            PeerEvent::Channel {
                label,
                instance,
                event,
            } => f
                .debug_struct("Channel")
                .field("label", label)
                .field("instance", instance)
                .field("event", event)
                .finish(),
        }
    }
}

pub type PeerEventSink = mpsc::UnboundedSender<PeerEvent>;

/// Process-unique identity of one data channel object. Two channels can
/// share a label across recreations; events are matched by instance.
pub type ChannelInstance = u64;

static NEXT_CHANNEL_INSTANCE: AtomicU64 = AtomicU64::new(1);

pub fn next_channel_instance() -> ChannelInstance {
    NEXT_CHANNEL_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackPlan {
    Send,
    ReceiveOnly,
}

/// Which media directions to negotiate. Missing devices degrade to
/// receive-only transceivers so negotiation still completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaPlan {
    pub audio: TrackPlan,
    pub video: TrackPlan,
}

impl MediaPlan {
    pub fn send_both() -> Self {
        Self {
            audio: TrackPlan::Send,
            video: TrackPlan::Send,
        }
    }

    pub fn receive_only() -> Self {
        Self {
            audio: TrackPlan::ReceiveOnly,
            video: TrackPlan::ReceiveOnly,
        }
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self) -> Result<MediaPlan, TransportError>;
}

/// Devices that always grant both tracks.
pub struct PlaceholderMedia;

#[async_trait]
impl MediaDevices for PlaceholderMedia {
    async fn acquire(&self) -> Result<MediaPlan, TransportError> {
        Ok(MediaPlan::send_both())
    }
}

/// No camera or microphone present.
pub struct NoMediaDevices;

#[async_trait]
impl MediaDevices for NoMediaDevices {
    async fn acquire(&self) -> Result<MediaPlan, TransportError> {
        Err(TransportError::MediaUnavailable(
            "no capture devices".into(),
        ))
    }
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn instance(&self) -> ChannelInstance;
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;
    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError>;
    async fn buffered_amount(&self) -> usize;
    /// Signalled when the buffered amount falls below the low threshold,
    /// if the implementation exposes such an event.
    fn buffer_drained(&self) -> Option<Arc<Notify>> {
        None
    }
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Creates an offer and installs it as the local description.
    async fn offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError>;
    /// Creates an answer to the current remote offer and installs it.
    async fn answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    /// Returns the signaling state to `stable`, discarding a local offer.
    async fn rollback(&self) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataChannel>, TransportError>;
    async fn add_media(&self, plan: MediaPlan) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink)
    -> Result<Arc<dyn PeerConnection>, TransportError>;
}

/// Aborts the owned tasks when dropped.
#[derive(Default)]
pub struct TaskSet {
    tasks: Vec<JoinHandle<()>>,
}

impl TaskSet {
    /// Adds `handle`, forgetting tasks that already finished.
    pub fn push(&mut self, handle: JoinHandle<()>) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(handle);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// One live connection to the relay. Dropping it closes the connection.
/// `inbound` yields `None` once the relay link is gone.
pub struct SignalingLink {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
    pub tasks: TaskSet,
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self) -> Result<SignalingLink, TransportError>;
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn finished_tasks_are_forgotten() {
        let mut set = TaskSet::default();
        for _ in 0..3 {
            let done = tokio::spawn(async {});
            while !done.is_finished() {
                tokio::task::yield_now().await;
            }
            set.push(done);
        }
        assert_eq!(set.len(), 1);

        set.push(tokio::spawn(std::future::pending()));
        assert_eq!(set.len(), 1);
        set.push(tokio::spawn(std::future::pending()));
        assert_eq!(set.len(), 2);
    }
}
