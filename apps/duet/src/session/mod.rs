//! One lesson call: the context the application holds and the event loop
//! behind it.
//!
//! A [`SessionContext`] owns a single loop task. Every public operation
//! posts a request to that loop; negotiation, recovery, channel and
//! transfer state are only ever touched from inside it.

mod runner;
mod timers;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use duet_proto::{
    BackgroundSettings, ChatMessage, ControlMessage, FileMetadata, PeerId, WhiteboardEvent,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channels::ChannelKind;
use crate::config::SessionConfig;
use crate::identity::{self, IdentityError, IdentityStore};
use crate::recovery::Phase;
use crate::transfer::{ReceivedFile, TransferError, TransferSnapshot};
use crate::transport::{MediaDevices, PeerConnectionFactory, SignalingConnector};

pub use timers::{Fired, Timers};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not started")]
    NotStarted,
    #[error("session already stopped")]
    Stopped,
    #[error("session loop is gone")]
    LoopGone,
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Who joins which room.
#[derive(Debug, Clone)]
pub struct Participant {
    pub room_id: String,
    pub display_name: String,
    /// Logical participant for device replacement; defaults to the display
    /// name at the relay.
    pub participant_id: Option<String>,
}

/// Capabilities the session runs on.
#[derive(Clone)]
pub struct SessionDeps {
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub signaling: Arc<dyn SignalingConnector>,
    pub media: Arc<dyn MediaDevices>,
    pub identity: Arc<dyn IdentityStore>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Joined {
        room_id: String,
        peer_id: PeerId,
    },
    JoinRejected {
        reason: String,
    },
    SignalingConnected(bool),
    PeerJoined {
        peer_id: PeerId,
        display_name: String,
    },
    RemoteBound {
        peer_id: PeerId,
        polite: bool,
    },
    PeerLeft {
        peer_id: PeerId,
    },
    PeerReplaced {
        old: PeerId,
        new: PeerId,
    },
    /// Another device took this participant's place; the session is over.
    Superseded {
        by: PeerId,
    },
    Phase(Phase),
    Chat(ChatMessage),
    Control(ControlMessage),
    Whiteboard(WhiteboardEvent),
    BackgroundSettings(BackgroundSettings),
    RoundTrip(Duration),
    QueueOverflow {
        channel: ChannelKind,
        dropped: usize,
    },
    FileOffered(FileMetadata),
    Transfer(TransferSnapshot),
    FileReceived(ReceivedFile),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub peer_id: PeerId,
    pub remote: Option<PeerId>,
    pub phase: Phase,
    pub signaling_connected: bool,
    pub open_channels: Vec<ChannelKind>,
    pub queued: Vec<(ChannelKind, usize)>,
}

pub(crate) enum Request {
    Chat(String),
    Whiteboard(WhiteboardEvent),
    Control(ControlMessage),
    SendFile {
        name: String,
        mime_type: String,
        data: Bytes,
        reply: oneshot::Sender<Result<FileMetadata, TransferError>>,
    },
    AcceptFile {
        id: String,
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
    RejectFile {
        id: String,
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
    RetryTransfer {
        id: String,
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
    Transfers(oneshot::Sender<Vec<TransferSnapshot>>),
    Status(oneshot::Sender<SessionStatus>),
    RetryConnection,
    Visibility(bool),
    Background(BackgroundSettings),
    Stop(oneshot::Sender<()>),
}

enum Lifecycle {
    Idle(SessionDeps),
    Running {
        peer_id: PeerId,
        requests: mpsc::UnboundedSender<Request>,
        task: JoinHandle<()>,
    },
    Stopped,
}

pub struct SessionContext {
    config: SessionConfig,
    participant: Participant,
    lifecycle: Mutex<Lifecycle>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl SessionContext {
    pub fn new(config: SessionConfig, participant: Participant, deps: SessionDeps) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            participant,
            lifecycle: Mutex::new(Lifecycle::Idle(deps)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// The event stream. Handed out once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    /// Resolves the peer identity and starts the session loop. Calling it
    /// again while running returns the same identity; a stopped context
    /// cannot be restarted.
    pub fn start(&self) -> Result<PeerId, SessionError> {
        let mut lifecycle = self.lifecycle.lock();
        let deps = match &*lifecycle {
            Lifecycle::Running { peer_id, .. } => return Ok(peer_id.clone()),
            Lifecycle::Stopped => return Err(SessionError::Stopped),
            Lifecycle::Idle(deps) => deps.clone(),
        };
        let peer_id = identity::resolve(deps.identity.as_ref(), &self.participant.room_id)?;
        let (requests, inbox) = mpsc::unbounded_channel();
        let runner = runner::Runner::new(
            self.config.clone(),
            self.participant.clone(),
            peer_id.clone(),
            deps,
            self.events_tx.clone(),
        );
        tracing::info!(
            room = %self.participant.room_id,
            peer = %peer_id,
            "starting session"
        );
        let task = tokio::spawn(runner.run(inbox));
        *lifecycle = Lifecycle::Running {
            peer_id: peer_id.clone(),
            requests,
            task,
        };
        Ok(peer_id)
    }

    /// Leaves the room and releases every resource. Safe to call more than
    /// once.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        let Lifecycle::Running {
            requests, mut task, ..
        } = previous
        else {
            return;
        };
        let (reply, done) = oneshot::channel();
        if requests.send(Request::Stop(reply)).is_ok() {
            let _ = tokio::time::timeout(STOP_TIMEOUT, done).await;
        }
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            tracing::warn!("session loop did not stop in time, aborting");
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.lifecycle.lock(), Lifecycle::Running { .. })
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running { peer_id, .. } => Some(peer_id.clone()),
            _ => None,
        }
    }

    pub fn send_chat(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.post(Request::Chat(text.into()))
    }

    pub fn send_whiteboard(&self, event: WhiteboardEvent) -> Result<(), SessionError> {
        self.post(Request::Whiteboard(event))
    }

    pub fn send_control(&self, message: ControlMessage) -> Result<(), SessionError> {
        self.post(Request::Control(message))
    }

    /// Offers a file to the remote and returns its metadata. Streaming
    /// starts once the remote accepts.
    pub async fn send_file(
        &self,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Bytes,
    ) -> Result<FileMetadata, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.post(Request::SendFile {
            name: name.into(),
            mime_type: mime_type.into(),
            data,
            reply,
        })?;
        Ok(rx.await.map_err(|_| SessionError::LoopGone)??)
    }

    pub async fn accept_file(&self, id: impl Into<String>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.post(Request::AcceptFile {
            id: id.into(),
            reply,
        })?;
        Ok(rx.await.map_err(|_| SessionError::LoopGone)??)
    }

    pub async fn reject_file(&self, id: impl Into<String>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.post(Request::RejectFile {
            id: id.into(),
            reply,
        })?;
        Ok(rx.await.map_err(|_| SessionError::LoopGone)??)
    }

    /// Re-offers a failed or rejected outgoing transfer under the same id.
    pub async fn retry_transfer(&self, id: impl Into<String>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.post(Request::RetryTransfer {
            id: id.into(),
            reply,
        })?;
        Ok(rx.await.map_err(|_| SessionError::LoopGone)??)
    }

    pub async fn transfers(&self) -> Result<Vec<TransferSnapshot>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.post(Request::Transfers(reply))?;
        rx.await.map_err(|_| SessionError::LoopGone)
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.post(Request::Status(reply))?;
        rx.await.map_err(|_| SessionError::LoopGone)
    }

    /// Starts over after recovery gave up.
    pub fn retry_connection(&self) -> Result<(), SessionError> {
        self.post(Request::RetryConnection)
    }

    /// Reports the application going to the background or coming back.
    pub fn set_visibility(&self, visible: bool) -> Result<(), SessionError> {
        self.post(Request::Visibility(visible))
    }

    /// Shares background settings now and again after every reconnect.
    pub fn set_background(&self, settings: BackgroundSettings) -> Result<(), SessionError> {
        self.post(Request::Background(settings))
    }

    fn post(&self, request: Request) -> Result<(), SessionError> {
        match &*self.lifecycle.lock() {
            Lifecycle::Idle(_) => Err(SessionError::NotStarted),
            Lifecycle::Stopped => Err(SessionError::Stopped),
            Lifecycle::Running { requests, .. } => {
                requests.send(request).map_err(|_| SessionError::LoopGone)
            }
        }
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        if let Lifecycle::Running { task, .. } = &*self.lifecycle.lock() {
            task.abort();
        }
    }
}
