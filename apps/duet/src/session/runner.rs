use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use duet_proto::{
    BackgroundSettings, ChatMessage, ChunkFrame, ClientMessage, ControlMessage, FileControl,
    FileMetadata, PeerId, ProtocolError, ServerMessage, decode_text,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use super::timers::{Fired, Timers};
use super::{Participant, Request, SessionDeps, SessionEvent, SessionStatus};
use crate::channels::{ChannelKind, ChannelManager, SendOutcome};
use crate::config::SessionConfig;
use crate::negotiation::{self, Epoch, NegotiationTimer, NegotiationTimings, Negotiator, Notice};
use crate::recovery::{self, Heartbeat, Phase, RecoveryLadder, RecoveryPolicy, RecoveryTimer, Tick};
use crate::transfer::{self, ChunkOutcome, StreamReport, TransferBook, TransferError};
use crate::transport::{
    ChannelEvent, ChannelPayload, MediaPlan, PeerConnection, PeerEvent, SignalingLink, TaskSet,
};

/// Signaling messages kept while the relay link is down.
const OUTBOX_LIMIT: usize = 256;
/// Time given to the writer task to put `leave` on the wire.
const LEAVE_FLUSH: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKey {
    Negotiation(NegotiationTimer),
    Recovery(RecoveryTimer),
}

enum Wake {
    Peer { epoch: Epoch, event: PeerEvent },
    Relay { generation: u64, message: ServerMessage },
    RelayClosed { generation: u64 },
}

enum Step {
    Negotiate(negotiation::Input),
    Recover(recovery::Input),
}

struct Link {
    epoch: Epoch,
    pc: Arc<dyn PeerConnection>,
    /// This side created the data channels and recreates them when they
    /// close.
    opener: bool,
    described: bool,
    _tasks: TaskSet,
}

struct Relay {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    _tasks: TaskSet,
}

struct Inbox {
    fired: mpsc::UnboundedReceiver<Fired<TimerKey>>,
    wakes: mpsc::UnboundedReceiver<Wake>,
    reports: mpsc::UnboundedReceiver<StreamReport>,
}

pub(crate) struct Runner {
    config: SessionConfig,
    participant: Participant,
    local: PeerId,
    deps: SessionDeps,
    events: mpsc::UnboundedSender<SessionEvent>,
    negotiator: Negotiator,
    ladder: RecoveryLadder,
    heartbeat: Heartbeat,
    channels: ChannelManager,
    transfers: TransferBook,
    timers: Timers<TimerKey>,
    wake_tx: mpsc::UnboundedSender<Wake>,
    reports_tx: mpsc::UnboundedSender<StreamReport>,
    inbox: Option<Inbox>,
    link: Option<Link>,
    relay: Option<Relay>,
    relay_generation: u64,
    outbox: VecDeque<ClientMessage>,
    streams: TaskSet,
    background: Option<BackgroundSettings>,
    hidden_since: Option<Instant>,
    superseded: bool,
}

impl Runner {
    pub(crate) fn new(
        config: SessionConfig,
        participant: Participant,
        local: PeerId,
        deps: SessionDeps,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (timers, fired) = Timers::new();
        let (wake_tx, wakes) = mpsc::unbounded_channel();
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let timings = NegotiationTimings {
            peer_left_grace: config.peer_left_grace,
            offer_wait: config.offer_wait,
        };
        Self {
            negotiator: Negotiator::new(local.clone(), timings, config.seen_message_window),
            ladder: RecoveryLadder::new(RecoveryPolicy::from_config(&config)),
            heartbeat: Heartbeat::new(config.heartbeat_interval, config.pong_timeout),
            channels: ChannelManager::new(config.channel_queue_capacity)
                .with_queue_capacity(ChannelKind::Whiteboard, config.whiteboard_queue_capacity),
            transfers: TransferBook::new(config.chunk_bytes),
            timers,
            wake_tx,
            reports_tx,
            inbox: Some(Inbox {
                fired,
                wakes,
                reports,
            }),
            link: None,
            relay: None,
            relay_generation: 0,
            outbox: VecDeque::new(),
            streams: TaskSet::default(),
            background: None,
            hidden_since: None,
            superseded: false,
            config,
            participant,
            local,
            deps,
            events,
        }
    }

    pub(crate) async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        let Some(mut inbox) = self.inbox.take() else {
            return;
        };
        let first = self.connect_relay().await;
        self.drive(first).await;

        let mut ticker = tokio::time::interval(self.heartbeat.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Stop(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.on_request(request).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(wake) = inbox.wakes.recv() => self.on_wake(wake).await,
                Some(report) = inbox.reports.recv() => self.on_stream_report(report),
                Some(firing) = inbox.fired.recv() => {
                    if let Some(key) = self.timers.accept(firing) {
                        self.on_timer(key).await;
                    }
                }
                _ = ticker.tick() => self.on_tick().await,
            }
            if self.superseded {
                self.shutdown().await;
                break;
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Feeds `first` to its state machine and executes the resulting
    /// commands, feeding results back in until nothing is left to do.
    async fn drive(&mut self, first: Step) {
        let mut work = VecDeque::from([first]);
        while let Some(step) = work.pop_front() {
            match step {
                Step::Negotiate(input) => {
                    for command in self.negotiator.handle(input) {
                        self.negotiation_command(command, &mut work).await;
                    }
                }
                Step::Recover(input) => {
                    for command in self.ladder.handle(input) {
                        self.recovery_command(command, &mut work).await;
                    }
                }
            }
        }
    }

    async fn negotiation_command(&mut self, command: negotiation::Command, work: &mut VecDeque<Step>) {
        use negotiation::{Command, Input, Stage};

        match command {
            Command::CreateConnection { epoch, initiator } => {
                self.create_connection(epoch, initiator, work).await;
            }
            Command::MakeOffer { epoch, ice_restart } => {
                let Some(pc) = self.pc(epoch) else {
                    return;
                };
                match pc.offer(ice_restart).await {
                    Ok(description) => {
                        work.push_back(Step::Negotiate(Input::LocalOffer { epoch, description }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "duet::negotiation", epoch, ice_restart, error = %err, "creating offer failed");
                        work.push_back(Step::Negotiate(Input::Failed {
                            epoch,
                            stage: Stage::Offer,
                        }));
                    }
                }
            }
            Command::Rollback { epoch } => {
                let Some(pc) = self.pc(epoch) else {
                    return;
                };
                if let Err(err) = pc.rollback().await {
                    tracing::warn!(target = "duet::negotiation", epoch, error = %err, "rollback failed");
                }
                self.yield_channels(epoch).await;
            }
            Command::ApplyOffer { epoch, description } => {
                let Some(pc) = self.pc(epoch) else {
                    return;
                };
                match pc.set_remote_description(description).await {
                    Ok(()) => {
                        self.mark_described(epoch);
                        work.push_back(Step::Negotiate(Input::OfferApplied { epoch }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "duet::negotiation", epoch, error = %err, "applying remote offer failed");
                        work.push_back(Step::Negotiate(Input::Failed {
                            epoch,
                            stage: Stage::ApplyOffer,
                        }));
                    }
                }
            }
            Command::CreateAnswer { epoch } => {
                let Some(pc) = self.pc(epoch) else {
                    return;
                };
                match pc.answer().await {
                    Ok(description) => {
                        work.push_back(Step::Negotiate(Input::LocalAnswer { epoch, description }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "duet::negotiation", epoch, error = %err, "creating answer failed");
                        work.push_back(Step::Negotiate(Input::Failed {
                            epoch,
                            stage: Stage::Answer,
                        }));
                    }
                }
            }
            Command::ApplyAnswer { epoch, description } => {
                let Some(pc) = self.pc(epoch) else {
                    return;
                };
                match pc.set_remote_description(description).await {
                    Ok(()) => {
                        self.mark_described(epoch);
                        work.push_back(Step::Negotiate(Input::AnswerApplied { epoch }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "duet::negotiation", epoch, error = %err, "applying remote answer failed");
                        work.push_back(Step::Negotiate(Input::Failed {
                            epoch,
                            stage: Stage::ApplyAnswer,
                        }));
                    }
                }
            }
            Command::AddCandidates { epoch, candidates } => {
                let Some(pc) = self.pc(epoch) else {
                    return;
                };
                for candidate in candidates {
                    if let Err(err) = pc.add_ice_candidate(candidate).await {
                        tracing::debug!(target = "duet::negotiation", epoch, error = %err, "remote candidate rejected");
                    }
                }
            }
            Command::Signal(message) => self.signal(message),
            Command::TearDown { epoch } => {
                if self.link.as_ref().is_some_and(|link| link.epoch == epoch) {
                    if let Some(link) = self.link.take() {
                        self.close_link(link).await;
                    }
                }
            }
            Command::Arm(timer, delay) => self.timers.arm(TimerKey::Negotiation(timer), delay),
            Command::Cancel(timer) => self.timers.cancel(TimerKey::Negotiation(timer)),
            Command::Notify(Notice::RemoteBound { peer, polite }) => {
                self.emit(SessionEvent::RemoteBound {
                    peer_id: peer,
                    polite,
                });
            }
            Command::Notify(Notice::PeerLeft { peer }) => {
                self.emit(SessionEvent::PeerLeft { peer_id: peer });
                work.push_back(Step::Recover(recovery::Input::PeerGone));
            }
            Command::Notify(Notice::PeerReplaced { old, new }) => {
                self.emit(SessionEvent::PeerReplaced { old, new });
            }
        }
    }

    async fn recovery_command(&mut self, command: recovery::Command, work: &mut VecDeque<Step>) {
        use recovery::Command;

        match command {
            Command::Arm(timer, delay) => self.timers.arm(TimerKey::Recovery(timer), delay),
            Command::Cancel(timer) => self.timers.cancel(TimerKey::Recovery(timer)),
            Command::RestartIce { attempt } => {
                tracing::info!(target = "duet::recovery", attempt, "restarting ice");
                work.push_back(Step::Negotiate(negotiation::Input::RestartIce));
            }
            Command::FullReconnect { attempt } => {
                tracing::info!(target = "duet::recovery", attempt, "replacing peer connection");
                work.push_back(Step::Negotiate(negotiation::Input::Reconnect));
            }
            Command::ReconnectSignaling { attempt } => {
                tracing::debug!(target = "duet::signaling", attempt, "reconnecting to relay");
                let step = self.connect_relay().await;
                work.push_back(step);
            }
            Command::StartHeartbeat => self.heartbeat.start(Instant::now()),
            Command::StopHeartbeat => self.heartbeat.stop(),
            Command::ProbeLiveness => {
                let open = self.channels.is_open(ChannelKind::Control);
                match self.heartbeat.tick(Instant::now(), open) {
                    Tick::SendPing { id } => self.send_ping(id).await,
                    Tick::TimedOut => work.push_back(Step::Recover(recovery::Input::PongTimeout)),
                    Tick::Idle => {}
                }
            }
            Command::BroadcastSettings => self.broadcast_background(),
            Command::PhaseChanged(phase) => {
                self.emit(SessionEvent::Phase(phase));
                if let Some(epoch) = self.negotiator.epoch() {
                    work.push_back(Step::Negotiate(negotiation::Input::Established {
                        epoch,
                        established: phase == Phase::Connected,
                    }));
                }
                if phase == Phase::Connected {
                    self.restore_channels().await;
                }
            }
        }
    }

    fn pc(&self, epoch: Epoch) -> Option<Arc<dyn PeerConnection>> {
        self.link
            .as_ref()
            .filter(|link| link.epoch == epoch)
            .map(|link| Arc::clone(&link.pc))
    }

    fn mark_described(&mut self, epoch: Epoch) {
        if let Some(link) = self.link.as_mut().filter(|link| link.epoch == epoch) {
            link.described = true;
        }
    }

    async fn create_connection(&mut self, epoch: Epoch, initiator: bool, work: &mut VecDeque<Step>) {
        work.push_back(Step::Recover(recovery::Input::NegotiationStarted));
        if let Some(previous) = self.link.take() {
            self.close_link(previous).await;
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let pc = match self.deps.peers.create(events_tx).await {
            Ok(pc) => pc,
            Err(err) => {
                tracing::error!(target = "duet::webrtc", epoch, error = %err, "failed to create peer connection");
                work.push_back(Step::Recover(recovery::Input::NegotiationFailed));
                return;
            }
        };

        let mut tasks = TaskSet::default();
        let wake = self.wake_tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if wake.send(Wake::Peer { epoch, event }).is_err() {
                    break;
                }
            }
        }));

        let plan = match self.deps.media.acquire().await {
            Ok(plan) => plan,
            Err(err) => {
                tracing::warn!(target = "duet::webrtc", error = %err, "media unavailable, continuing receive-only");
                MediaPlan::receive_only()
            }
        };
        if let Err(err) = pc.add_media(plan).await {
            tracing::warn!(target = "duet::webrtc", error = %err, "failed to add media transceivers");
        }

        if initiator {
            for kind in ChannelKind::ALL {
                self.open_channel(&pc, kind).await;
            }
        }
        tracing::debug!(target = "duet::webrtc", epoch, initiator, "peer connection created");
        self.link = Some(Link {
            epoch,
            pc,
            opener: initiator,
            described: false,
            _tasks: tasks,
        });
    }

    async fn open_channel(&mut self, pc: &Arc<dyn PeerConnection>, kind: ChannelKind) {
        match pc.create_data_channel(kind.label(), kind.ordered()).await {
            Ok(channel) => {
                if let Some(old) = self.channels.attach(kind, channel).await {
                    let _ = old.close().await;
                }
            }
            Err(err) => {
                tracing::warn!(target = "duet::channels", channel = %kind, error = %err, "failed to create data channel");
            }
        }
    }

    /// A polite side that rolls back its first offer adopts the remote's
    /// channels instead of its own.
    async fn yield_channels(&mut self, epoch: Epoch) {
        let Some(link) = self.link.as_mut().filter(|link| link.epoch == epoch) else {
            return;
        };
        if link.described || !link.opener {
            return;
        }
        link.opener = false;
        tracing::debug!(target = "duet::channels", epoch, "offer rolled back, adopting remote channels");
        for channel in self.channels.detach_all() {
            let _ = channel.close().await;
        }
    }

    async fn restore_channels(&mut self) {
        let Some(link) = self.link.as_ref().filter(|link| link.opener) else {
            return;
        };
        let pc = Arc::clone(&link.pc);
        for kind in self.channels.missing() {
            tracing::info!(target = "duet::channels", channel = %kind, "recreating data channel");
            self.open_channel(&pc, kind).await;
        }
    }

    async fn close_link(&mut self, link: Link) {
        tracing::debug!(target = "duet::webrtc", epoch = link.epoch, "closing peer connection");
        for channel in self.channels.detach_all() {
            let _ = channel.close().await;
        }
        self.streams = TaskSet::default();
        for snapshot in self.transfers.fail_active() {
            self.emit(SessionEvent::Transfer(snapshot));
        }
        self.heartbeat.stop();
        if let Err(err) = link.pc.close().await {
            tracing::debug!(target = "duet::webrtc", error = %err, "peer connection close failed");
        }
    }

    fn signal(&mut self, message: ClientMessage) {
        let message = match &self.relay {
            Some(relay) => match relay.outbound.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };
        if self.outbox.len() >= OUTBOX_LIMIT {
            self.outbox.pop_front();
        }
        self.outbox.push_back(message);
    }

    async fn connect_relay(&mut self) -> Step {
        self.relay = None;
        match self.deps.signaling.connect().await {
            Ok(link) => {
                self.relay_generation += 1;
                let generation = self.relay_generation;
                let SignalingLink {
                    outbound,
                    mut inbound,
                    mut tasks,
                } = link;
                let wake = self.wake_tx.clone();
                tasks.push(tokio::spawn(async move {
                    while let Some(message) = inbound.recv().await {
                        if wake.send(Wake::Relay { generation, message }).is_err() {
                            return;
                        }
                    }
                    let _ = wake.send(Wake::RelayClosed { generation });
                }));

                let join = ClientMessage::Join {
                    room_id: self.participant.room_id.clone(),
                    peer_id: self.local.clone(),
                    display_name: self.participant.display_name.clone(),
                    participant_id: self.participant.participant_id.clone(),
                };
                let _ = outbound.send(join);
                let flushed = self.outbox.len();
                for message in self.outbox.drain(..) {
                    let _ = outbound.send(message);
                }
                tracing::info!(target = "duet::signaling", generation, flushed, "joined relay");
                self.relay = Some(Relay {
                    outbound,
                    _tasks: tasks,
                });
                self.emit(SessionEvent::SignalingConnected(true));
                Step::Recover(recovery::Input::SignalingRestored)
            }
            Err(err) => {
                tracing::warn!(target = "duet::signaling", error = %err, "relay unreachable");
                Step::Recover(recovery::Input::SignalingLost)
            }
        }
    }

    async fn on_wake(&mut self, wake: Wake) {
        match wake {
            Wake::Peer { epoch, event } => {
                if self.link.as_ref().is_some_and(|link| link.epoch == epoch) {
                    self.on_peer_event(epoch, event).await;
                }
            }
            Wake::Relay {
                generation,
                message,
            } => {
                if generation == self.relay_generation {
                    self.on_relay(message).await;
                }
            }
            Wake::RelayClosed { generation } => {
                if generation == self.relay_generation && self.relay.take().is_some() {
                    tracing::warn!(target = "duet::signaling", generation, "relay link lost");
                    self.emit(SessionEvent::SignalingConnected(false));
                    if !self.superseded {
                        self.drive(Step::Recover(recovery::Input::SignalingLost)).await;
                    }
                }
            }
        }
    }

    async fn on_relay(&mut self, message: ServerMessage) {
        use negotiation::Input;

        if message.to_peer_id().is_some_and(|to| *to != self.local) {
            return;
        }
        let input = match message {
            ServerMessage::Joined { room_id, peer_id, peers } => {
                tracing::info!(target = "duet::signaling", room = %room_id, present = peers.len(), "joined room");
                self.emit(SessionEvent::Joined { room_id, peer_id });
                return;
            }
            ServerMessage::JoinError { reason } => {
                tracing::warn!(target = "duet::signaling", %reason, "join rejected");
                self.emit(SessionEvent::JoinRejected { reason });
                return;
            }
            ServerMessage::PeerJoined {
                peer_id,
                display_name,
                should_initiate,
            } => {
                self.emit(SessionEvent::PeerJoined {
                    peer_id: peer_id.clone(),
                    display_name,
                });
                Input::PeerJoined {
                    peer: peer_id,
                    should_initiate,
                }
            }
            ServerMessage::PeerLeft { peer_id } => Input::PeerLeft { peer: peer_id },
            ServerMessage::PeerReplaced {
                old_peer_id,
                new_peer_id,
            } => Input::PeerReplaced {
                old: old_peer_id,
                new: new_peer_id,
            },
            ServerMessage::Superseded { by_peer_id } => {
                tracing::warn!(target = "duet::signaling", by = %by_peer_id, "superseded by another device");
                if let Err(err) = self.deps.identity.clear(&self.participant.room_id) {
                    tracing::warn!(error = %err, "failed to clear stored identity");
                }
                self.emit(SessionEvent::Superseded { by: by_peer_id });
                self.superseded = true;
                return;
            }
            ServerMessage::Offer {
                from_peer_id,
                description,
                handshake_id,
                message_id,
                ..
            } => Input::RemoteOffer {
                from: from_peer_id,
                description,
                handshake_id,
                message_id,
            },
            ServerMessage::Answer {
                from_peer_id,
                description,
                handshake_id,
                message_id,
                ..
            } => Input::RemoteAnswer {
                from: from_peer_id,
                description,
                handshake_id,
                message_id,
            },
            ServerMessage::IceCandidate {
                from_peer_id,
                candidate,
                handshake_id,
                message_id,
                ..
            } => Input::RemoteCandidate {
                from: from_peer_id,
                candidate,
                handshake_id,
                message_id,
            },
            ServerMessage::BackgroundSettings { settings, .. } => {
                self.emit(SessionEvent::BackgroundSettings(settings));
                return;
            }
            ServerMessage::Pong => {
                tracing::trace!(target = "duet::signaling", "relay pong");
                return;
            }
            ServerMessage::Error { message } => {
                tracing::warn!(target = "duet::signaling", %message, "relay error");
                return;
            }
        };
        self.drive(Step::Negotiate(input)).await;
    }

    async fn on_peer_event(&mut self, epoch: Epoch, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.drive(Step::Negotiate(negotiation::Input::LocalCandidate {
                    epoch,
                    candidate,
                }))
                .await;
            }
            PeerEvent::ConnectionState(state) => {
                tracing::debug!(target = "duet::webrtc", epoch, ?state, "peer connection state");
                self.drive(Step::Recover(recovery::Input::PeerConnection(state)))
                    .await;
            }
            PeerEvent::IceState(state) => {
                tracing::debug!(target = "duet::webrtc", epoch, ?state, "ice connection state");
                self.drive(Step::Recover(recovery::Input::Ice(state))).await;
            }
            PeerEvent::RemoteChannel(channel) => match ChannelKind::from_label(channel.label()) {
                Some(kind) => {
                    tracing::debug!(target = "duet::channels", channel = %kind, "remote opened channel");
                    if let Some(old) = self.channels.attach(kind, channel).await {
                        let _ = old.close().await;
                    }
                }
                None => {
                    tracing::warn!(target = "duet::channels", label = channel.label(), "closing unknown channel");
                    let _ = channel.close().await;
                }
            },
            PeerEvent::Channel {
                label,
                instance,
                event,
            } => {
                let Some(kind) = ChannelKind::from_label(&label) else {
                    return;
                };
                match event {
                    ChannelEvent::Open => {
                        let flushed = self.channels.on_open(kind, instance).await;
                        tracing::debug!(target = "duet::channels", channel = %kind, flushed, "channel open");
                    }
                    ChannelEvent::Close => {
                        if self.channels.on_close(kind, instance)
                            && self.ladder.phase() == Phase::Connected
                        {
                            self.restore_channels().await;
                        }
                    }
                    ChannelEvent::Message(payload) => self.on_channel_message(kind, payload).await,
                }
            }
        }
    }

    async fn on_channel_message(&mut self, kind: ChannelKind, payload: ChannelPayload) {
        let result = match payload {
            ChannelPayload::Binary(data) if kind == ChannelKind::File => {
                self.on_chunk(data);
                Ok(())
            }
            ChannelPayload::Binary(_) => Err(ProtocolError::UnexpectedBinary(kind.label())),
            ChannelPayload::Text(text) => self.on_text(kind, &text).await,
        };
        if let Err(err) = result {
            tracing::warn!(target = "duet::channels", channel = %kind, error = %err, "dropping frame");
        }
    }

    async fn on_text(&mut self, kind: ChannelKind, text: &str) -> Result<(), ProtocolError> {
        match kind {
            ChannelKind::Control => {
                let message: ControlMessage = decode_text(kind.label(), text)?;
                self.on_control(message).await;
            }
            ChannelKind::Chat => {
                let message: ChatMessage = decode_text(kind.label(), text)?;
                self.emit(SessionEvent::Chat(message));
            }
            ChannelKind::Whiteboard => {
                self.emit(SessionEvent::Whiteboard(decode_text(kind.label(), text)?));
            }
            ChannelKind::File => {
                let control: FileControl = decode_text(kind.label(), text)?;
                self.on_file_control(control).await;
            }
        }
        Ok(())
    }

    async fn on_control(&mut self, message: ControlMessage) {
        match message {
            // Answered even while our own heartbeat is paused.
            ControlMessage::Ping { id, .. } => {
                self.send_json(ChannelKind::Control, &ControlMessage::Pong { id })
                    .await;
            }
            ControlMessage::Pong { id } => {
                if let Some(rtt) = self.heartbeat.on_pong(id, Instant::now()) {
                    tracing::trace!(target = "duet::recovery", id, rtt_ms = rtt.as_millis() as u64, "pong");
                    self.emit(SessionEvent::RoundTrip(rtt));
                    self.drive(Step::Recover(recovery::Input::PongReceived)).await;
                }
            }
            other => self.emit(SessionEvent::Control(other)),
        }
    }

    async fn on_file_control(&mut self, control: FileControl) {
        match control {
            FileControl::FileOffer { metadata } => {
                match self.transfers.incoming_offer(metadata.clone()) {
                    Ok(()) => {
                        self.emit_transfer(&metadata.id);
                        self.emit(SessionEvent::FileOffered(metadata));
                    }
                    Err(err) => {
                        tracing::warn!(target = "duet::transfer", id = %metadata.id, error = %err, "refusing file offer");
                    }
                }
            }
            FileControl::FileAccept { id } => self.start_stream(&id),
            FileControl::FileReject { id } => match self.transfers.on_reject(&id) {
                Ok(snapshot) => self.emit(SessionEvent::Transfer(snapshot)),
                Err(err) => {
                    tracing::debug!(target = "duet::transfer", %id, error = %err, "ignoring reject");
                }
            },
            FileControl::FileProgress { id, progress } => {
                if let Some(snapshot) = self.transfers.on_remote_progress(&id, progress) {
                    self.emit(SessionEvent::Transfer(snapshot));
                }
            }
        }
    }

    fn start_stream(&mut self, id: &str) {
        let job = match self.transfers.on_accept(id) {
            Ok(job) => job,
            Err(err) => {
                tracing::debug!(target = "duet::transfer", %id, error = %err, "ignoring accept");
                return;
            }
        };
        self.emit_transfer(id);
        let Some(channel) = self.channels.current(ChannelKind::File).cloned() else {
            tracing::warn!(target = "duet::transfer", %id, "no file channel to stream on");
            if let Some(snapshot) = self.transfers.on_send_failed(id) {
                self.emit(SessionEvent::Transfer(snapshot));
            }
            return;
        };
        self.streams.push(tokio::spawn(transfer::stream_file(
            channel,
            job,
            self.config.high_water_mark,
            self.config.capacity_wait,
            self.reports_tx.clone(),
        )));
    }

    fn on_chunk(&mut self, data: Bytes) {
        let frame = match ChunkFrame::decode(&data, self.transfers.chunk_bytes()) {
            Ok(frame) => frame,
            Err(err) => {
                let err = ProtocolError::from(err);
                tracing::warn!(target = "duet::transfer", error = %err, "dropping chunk");
                return;
            }
        };
        match self.transfers.on_chunk(frame) {
            Ok(ChunkOutcome::Progress { id, .. }) => self.emit_transfer(&id),
            Ok(ChunkOutcome::Completed(file)) => {
                self.emit_transfer(&file.metadata.id);
                self.emit(SessionEvent::FileReceived(file));
            }
            Ok(ChunkOutcome::Duplicate | ChunkOutcome::Ignored) => {}
            Err(err) => {
                tracing::warn!(target = "duet::transfer", error = %err, "chunk rejected");
            }
        }
    }

    fn on_stream_report(&mut self, report: StreamReport) {
        let snapshot = match report {
            StreamReport::Progress { id, progress } => self.transfers.on_sent_progress(&id, progress),
            StreamReport::Finished { id } => self.transfers.on_sent(&id),
            StreamReport::Failed { id, reason } => {
                tracing::warn!(target = "duet::transfer", %id, %reason, "outgoing transfer failed");
                self.transfers.on_send_failed(&id)
            }
        };
        if let Some(snapshot) = snapshot {
            self.emit(SessionEvent::Transfer(snapshot));
        }
    }

    fn emit_transfer(&self, id: &str) {
        if let Some(snapshot) = self.transfers.get(id) {
            self.emit(SessionEvent::Transfer(snapshot));
        }
    }

    async fn send_json<T: Serialize>(&mut self, kind: ChannelKind, value: &T) {
        let text = match serde_json::to_string(value) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(target = "duet::channels", channel = %kind, error = %err, "failed to encode frame");
                return;
            }
        };
        if self.channels.send(kind, ChannelPayload::Text(text)).await
            == SendOutcome::QueuedDroppedOldest
        {
            self.emit(SessionEvent::QueueOverflow {
                channel: kind,
                dropped: self.channels.dropped(kind),
            });
        }
    }

    async fn send_ping(&mut self, id: u64) {
        let ping = ControlMessage::Ping {
            id,
            sent_at: unix_millis(),
        };
        self.send_json(ChannelKind::Control, &ping).await;
    }

    fn broadcast_background(&mut self) {
        let (Some(settings), Some(remote)) = (self.background.clone(), self.negotiator.remote().cloned())
        else {
            return;
        };
        self.signal(ClientMessage::BackgroundSettings {
            to_peer_id: Some(remote),
            settings,
        });
    }

    async fn on_timer(&mut self, key: TimerKey) {
        let step = match key {
            TimerKey::Negotiation(timer) => Step::Negotiate(negotiation::Input::TimerFired(timer)),
            TimerKey::Recovery(timer) => Step::Recover(recovery::Input::TimerFired(timer)),
        };
        self.drive(step).await;
    }

    async fn on_tick(&mut self) {
        let open = self.channels.is_open(ChannelKind::Control);
        match self.heartbeat.tick(Instant::now(), open) {
            Tick::SendPing { id } => self.send_ping(id).await,
            Tick::TimedOut => self.drive(Step::Recover(recovery::Input::PongTimeout)).await,
            Tick::Idle => {}
        }
    }

    async fn on_visibility(&mut self, visible: bool) {
        let now = Instant::now();
        if !visible {
            if self.hidden_since.is_none() {
                tracing::debug!("session hidden, pausing heartbeat");
                self.hidden_since = Some(now);
                self.heartbeat.pause();
            }
            return;
        }
        let Some(since) = self.hidden_since.take() else {
            return;
        };
        let hidden_for = now.saturating_duration_since(since);
        let likely_slept =
            hidden_for >= self.config.sleep_threshold || self.heartbeat.is_stale(now);
        self.heartbeat.resume(now);
        tracing::info!(
            hidden_ms = hidden_for.as_millis() as u64,
            likely_slept,
            "session back in foreground"
        );
        let was_connected = self.ladder.phase() == Phase::Connected;
        self.drive(Step::Recover(recovery::Input::Foreground { likely_slept }))
            .await;
        if was_connected && !likely_slept {
            let open = self.channels.is_open(ChannelKind::Control);
            if let Tick::SendPing { id } = self.heartbeat.tick(now, open) {
                self.send_ping(id).await;
            }
        }
    }

    async fn on_request(&mut self, request: Request) {
        match request {
            Request::Chat(text) => {
                let message = ChatMessage {
                    user_name: self.participant.display_name.clone(),
                    message: text,
                    timestamp: unix_millis(),
                };
                self.send_json(ChannelKind::Chat, &message).await;
            }
            Request::Whiteboard(event) => self.send_json(ChannelKind::Whiteboard, &event).await,
            Request::Control(message) => self.send_json(ChannelKind::Control, &message).await,
            Request::SendFile {
                name,
                mime_type,
                data,
                reply,
            } => {
                let result = self.offer_file(name, mime_type, data).await;
                let _ = reply.send(result);
            }
            Request::AcceptFile { id, reply } => {
                let result = self.accept_file(&id).await;
                let _ = reply.send(result);
            }
            Request::RejectFile { id, reply } => {
                let result = self.reject_file(&id).await;
                let _ = reply.send(result);
            }
            Request::RetryTransfer { id, reply } => {
                let result = self.retry_transfer(&id).await;
                let _ = reply.send(result);
            }
            Request::Transfers(reply) => {
                let _ = reply.send(self.transfers.list());
            }
            Request::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Request::RetryConnection => {
                self.drive(Step::Recover(recovery::Input::ManualRetry)).await;
            }
            Request::Visibility(visible) => self.on_visibility(visible).await,
            Request::Background(settings) => {
                self.background = Some(settings);
                self.broadcast_background();
            }
            // Handled by the loop itself.
            Request::Stop(_) => {}
        }
    }

    async fn offer_file(
        &mut self,
        name: String,
        mime_type: String,
        data: Bytes,
    ) -> Result<FileMetadata, TransferError> {
        let metadata = self.transfers.offer(name, mime_type, data)?;
        let offer = FileControl::FileOffer {
            metadata: metadata.clone(),
        };
        self.send_json(ChannelKind::File, &offer).await;
        self.emit_transfer(&metadata.id);
        Ok(metadata)
    }

    async fn accept_file(&mut self, id: &str) -> Result<(), TransferError> {
        let received = self.transfers.accept(id)?;
        let accept = FileControl::FileAccept { id: id.to_string() };
        self.send_json(ChannelKind::File, &accept).await;
        self.emit_transfer(id);
        if let Some(file) = received {
            self.emit(SessionEvent::FileReceived(file));
        }
        Ok(())
    }

    async fn reject_file(&mut self, id: &str) -> Result<(), TransferError> {
        let snapshot = self.transfers.reject(id)?;
        let reject = FileControl::FileReject { id: id.to_string() };
        self.send_json(ChannelKind::File, &reject).await;
        self.emit(SessionEvent::Transfer(snapshot));
        Ok(())
    }

    async fn retry_transfer(&mut self, id: &str) -> Result<(), TransferError> {
        let metadata = self.transfers.retry(id)?;
        self.send_json(ChannelKind::File, &FileControl::FileOffer { metadata })
            .await;
        self.emit_transfer(id);
        Ok(())
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            peer_id: self.local.clone(),
            remote: self.negotiator.remote().cloned(),
            phase: self.ladder.phase(),
            signaling_connected: self.relay.is_some(),
            open_channels: ChannelKind::ALL
                .into_iter()
                .filter(|kind| self.channels.is_open(*kind))
                .collect(),
            queued: ChannelKind::ALL
                .into_iter()
                .map(|kind| (kind, self.channels.queued(kind)))
                .collect(),
        }
    }

    async fn shutdown(&mut self) {
        if !self.superseded {
            if let Some(relay) = &self.relay {
                let leave = ClientMessage::Leave {
                    room_id: self.participant.room_id.clone(),
                    peer_id: self.local.clone(),
                };
                if relay.outbound.send(leave).is_ok() {
                    tokio::time::sleep(LEAVE_FLUSH).await;
                }
            }
        }
        if let Some(link) = self.link.take() {
            self.close_link(link).await;
        }
        self.drive(Step::Recover(recovery::Input::Close)).await;
        self.timers.cancel_all();
        self.relay = None;
        tracing::info!(room = %self.participant.room_id, peer = %self.local, "session closed");
    }
}

fn unix_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
