//! Perfect negotiation as a pure state machine.
//!
//! [`Negotiator::handle`] consumes one [`Input`] and returns the side
//! effects to perform as [`Command`]s. Results of asynchronous work (an
//! offer being created, a description being applied) come back as further
//! inputs tagged with the connection epoch, so late results from a torn
//! down connection are ignored.

mod dedup;

use std::time::Duration;

use duet_proto::{ClientMessage, IceCandidate, PeerId, SessionDescription};
use uuid::Uuid;

pub use dedup::SeenMessages;

/// Remote candidates held while their description is not applied yet.
const PENDING_CANDIDATE_LIMIT: usize = 256;

/// Generation of the peer connection a result belongs to.
pub type Epoch = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingPhase {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationTimer {
    PeerLeftGrace,
    OfferWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Offer,
    ApplyOffer,
    Answer,
    ApplyAnswer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    RemoteBound { peer: PeerId, polite: bool },
    PeerLeft { peer: PeerId },
    PeerReplaced { old: PeerId, new: PeerId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    PeerJoined { peer: PeerId, should_initiate: bool },
    PeerLeft { peer: PeerId },
    PeerReplaced { old: PeerId, new: PeerId },
    RemoteOffer {
        from: PeerId,
        description: SessionDescription,
        handshake_id: String,
        message_id: String,
    },
    RemoteAnswer {
        from: PeerId,
        description: SessionDescription,
        handshake_id: String,
        message_id: String,
    },
    RemoteCandidate {
        from: PeerId,
        candidate: IceCandidate,
        handshake_id: String,
        message_id: String,
    },
    LocalOffer { epoch: Epoch, description: SessionDescription },
    OfferApplied { epoch: Epoch },
    LocalAnswer { epoch: Epoch, description: SessionDescription },
    AnswerApplied { epoch: Epoch },
    Failed { epoch: Epoch, stage: Stage },
    LocalCandidate { epoch: Epoch, candidate: IceCandidate },
    Established { epoch: Epoch, established: bool },
    TimerFired(NegotiationTimer),
    RestartIce,
    /// Full reconnect: replace the connection and offer afresh to the
    /// bound remote, if any.
    Reconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateConnection { epoch: Epoch, initiator: bool },
    MakeOffer { epoch: Epoch, ice_restart: bool },
    Rollback { epoch: Epoch },
    ApplyOffer { epoch: Epoch, description: SessionDescription },
    CreateAnswer { epoch: Epoch },
    ApplyAnswer { epoch: Epoch, description: SessionDescription },
    AddCandidates { epoch: Epoch, candidates: Vec<IceCandidate> },
    Signal(ClientMessage),
    TearDown { epoch: Epoch },
    Arm(NegotiationTimer, Duration),
    Cancel(NegotiationTimer),
    Notify(Notice),
}

#[derive(Debug, Clone, Copy)]
pub struct NegotiationTimings {
    pub peer_left_grace: Duration,
    pub offer_wait: Duration,
}

#[derive(Debug, Clone)]
struct Remote {
    peer: PeerId,
    polite: bool,
}

#[derive(Debug)]
struct Connection {
    epoch: Epoch,
    local_handshake: String,
    remote_handshake: Option<String>,
    phase: SignalingPhase,
    making_offer: bool,
    remote_description_set: bool,
    established: bool,
}

#[derive(Debug)]
struct PendingCandidate {
    handshake_id: String,
    candidate: IceCandidate,
}

pub struct Negotiator {
    local: PeerId,
    timings: NegotiationTimings,
    remote: Option<Remote>,
    connection: Option<Connection>,
    pending: Vec<PendingCandidate>,
    seen: SeenMessages,
    next_epoch: Epoch,
}

impl Negotiator {
    pub fn new(local: PeerId, timings: NegotiationTimings, seen_window: usize) -> Self {
        Self {
            local,
            timings,
            remote: None,
            connection: None,
            pending: Vec::new(),
            seen: SeenMessages::new(seen_window),
            next_epoch: 1,
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn remote(&self) -> Option<&PeerId> {
        self.remote.as_ref().map(|r| &r.peer)
    }

    pub fn is_polite(&self) -> Option<bool> {
        self.remote.as_ref().map(|r| r.polite)
    }

    pub fn epoch(&self) -> Option<Epoch> {
        self.connection.as_ref().map(|c| c.epoch)
    }

    pub fn signaling_phase(&self) -> Option<SignalingPhase> {
        self.connection.as_ref().map(|c| c.phase)
    }

    pub fn is_established(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.established)
    }

    pub fn local_handshake(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.local_handshake.as_str())
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn handle(&mut self, input: Input) -> Vec<Command> {
        match input {
            Input::PeerJoined {
                peer,
                should_initiate,
            } => self.on_peer_joined(peer, should_initiate),
            Input::PeerLeft { peer } => self.on_peer_left(peer),
            Input::PeerReplaced { old, new } => self.on_peer_replaced(old, new),
            Input::RemoteOffer {
                from,
                description,
                handshake_id,
                message_id,
            } => self.on_remote_offer(from, description, handshake_id, message_id),
            Input::RemoteAnswer {
                from,
                description,
                handshake_id,
                message_id,
            } => self.on_remote_answer(from, description, handshake_id, message_id),
            Input::RemoteCandidate {
                from,
                candidate,
                handshake_id,
                message_id,
            } => self.on_remote_candidate(from, candidate, handshake_id, message_id),
            Input::LocalOffer { epoch, description } => self.on_local_offer(epoch, description),
            Input::OfferApplied { epoch } => self.on_offer_applied(epoch),
            Input::LocalAnswer { epoch, description } => self.on_local_answer(epoch, description),
            Input::AnswerApplied { epoch } => self.on_answer_applied(epoch),
            Input::Failed { epoch, stage } => self.on_failed(epoch, stage),
            Input::LocalCandidate { epoch, candidate } => self.on_local_candidate(epoch, candidate),
            Input::Established { epoch, established } => {
                if let Some(conn) = self.current_mut(epoch) {
                    conn.established = established;
                }
                Vec::new()
            }
            Input::TimerFired(NegotiationTimer::PeerLeftGrace) => self.on_grace_expired(),
            Input::TimerFired(NegotiationTimer::OfferWait) => self.on_offer_wait_expired(),
            Input::RestartIce => self.on_restart_ice(),
            Input::Reconnect => {
                let mut out = vec![Command::Cancel(NegotiationTimer::OfferWait)];
                out.extend(self.tear_down());
                if self.remote.is_some() {
                    out.extend(self.initiate());
                }
                out
            }
        }
    }

    fn on_peer_joined(&mut self, peer: PeerId, should_initiate: bool) -> Vec<Command> {
        if peer == self.local {
            return Vec::new();
        }
        let mut out = vec![Command::Cancel(NegotiationTimer::PeerLeftGrace)];
        match self.remote.as_ref().map(|r| r.peer.clone()) {
            Some(current) if current == peer => {
                if self.is_established() {
                    tracing::debug!(target = "duet::negotiation", %peer, "peer re-announced, connection intact");
                    return out;
                }
            }
            Some(current) => {
                tracing::info!(target = "duet::negotiation", old = %current, new = %peer, "remote identity changed");
                out.extend(self.tear_down());
                out.extend(self.bind(peer));
            }
            None => out.extend(self.bind(peer)),
        }

        if should_initiate {
            out.push(Command::Cancel(NegotiationTimer::OfferWait));
            out.extend(self.initiate());
        } else {
            out.push(Command::Arm(
                NegotiationTimer::OfferWait,
                self.timings.offer_wait,
            ));
        }
        out
    }

    fn on_peer_left(&mut self, peer: PeerId) -> Vec<Command> {
        if self.remote().is_some_and(|r| *r == peer) {
            tracing::debug!(target = "duet::negotiation", %peer, "peer left relay, starting grace window");
            vec![Command::Arm(
                NegotiationTimer::PeerLeftGrace,
                self.timings.peer_left_grace,
            )]
        } else {
            Vec::new()
        }
    }

    fn on_grace_expired(&mut self) -> Vec<Command> {
        let Some(remote) = self.remote.clone() else {
            return Vec::new();
        };
        if self.is_established() {
            tracing::info!(target = "duet::negotiation", peer = %remote.peer, "peer gone from relay but connection alive");
            return Vec::new();
        }
        let mut out = vec![Command::Cancel(NegotiationTimer::OfferWait)];
        out.extend(self.tear_down());
        self.remote = None;
        out.push(Command::Notify(Notice::PeerLeft { peer: remote.peer }));
        out
    }

    fn on_peer_replaced(&mut self, old: PeerId, new: PeerId) -> Vec<Command> {
        match self.remote() {
            Some(current) if *current != old && *current != new => {
                tracing::warn!(target = "duet::negotiation", %old, %new, current = %current, "ignoring replacement of unknown peer");
                return Vec::new();
            }
            Some(current) if *current == new => return Vec::new(),
            _ => {}
        }
        let mut out = vec![Command::Cancel(NegotiationTimer::PeerLeftGrace)];
        out.extend(self.tear_down());
        out.extend(self.bind(new.clone()));
        out.push(Command::Notify(Notice::PeerReplaced { old, new }));
        out.push(Command::Arm(
            NegotiationTimer::OfferWait,
            self.timings.offer_wait,
        ));
        out
    }

    fn on_offer_wait_expired(&mut self) -> Vec<Command> {
        if self.remote.is_none() {
            return Vec::new();
        }
        let idle = match &self.connection {
            None => true,
            Some(conn) => {
                !conn.established
                    && !conn.remote_description_set
                    && !conn.making_offer
                    && conn.phase == SignalingPhase::Stable
            }
        };
        if !idle {
            return Vec::new();
        }
        tracing::info!(target = "duet::negotiation", "no offer received, offering ourselves");
        self.initiate()
    }

    fn on_remote_offer(
        &mut self,
        from: PeerId,
        description: SessionDescription,
        handshake_id: String,
        message_id: String,
    ) -> Vec<Command> {
        if !self.seen.insert(&message_id) {
            tracing::debug!(target = "duet::negotiation", %message_id, "duplicate offer dropped");
            return Vec::new();
        }
        if from == self.local {
            return Vec::new();
        }
        let mut out = vec![Command::Cancel(NegotiationTimer::OfferWait)];
        match self.remote.as_ref().map(|r| r.peer.clone()) {
            None => out.extend(self.bind(from.clone())),
            Some(current) if current != from => {
                out.extend(self.tear_down());
                out.extend(self.bind(from.clone()));
                out.push(Command::Notify(Notice::PeerReplaced {
                    old: current,
                    new: from.clone(),
                }));
            }
            Some(_) => {}
        }

        let stale = self
            .connection
            .as_ref()
            .and_then(|c| c.remote_handshake.as_deref())
            .is_some_and(|bound| bound != handshake_id);
        if stale {
            tracing::info!(target = "duet::negotiation", peer = %from, "remote restarted its connection, replacing ours");
            out.extend(self.tear_down());
        }
        if self.connection.is_none() {
            out.push(self.create_connection());
        }

        let polite = self.remote.as_ref().is_some_and(|r| r.polite);
        let Some(conn) = self.connection.as_mut() else {
            return out;
        };
        let collision = conn.making_offer || conn.phase != SignalingPhase::Stable;
        if collision && !polite {
            tracing::debug!(target = "duet::negotiation", peer = %from, "offer collision, impolite side keeps its offer");
            return out;
        }
        if collision {
            tracing::debug!(target = "duet::negotiation", peer = %from, "offer collision, rolling back");
            conn.making_offer = false;
            conn.phase = SignalingPhase::Stable;
            out.push(Command::Rollback { epoch: conn.epoch });
        }
        conn.phase = SignalingPhase::HaveRemoteOffer;
        conn.remote_handshake = Some(handshake_id);
        out.push(Command::ApplyOffer {
            epoch: conn.epoch,
            description,
        });
        out
    }

    fn on_remote_answer(
        &mut self,
        from: PeerId,
        description: SessionDescription,
        handshake_id: String,
        message_id: String,
    ) -> Vec<Command> {
        if !self.seen.insert(&message_id) {
            tracing::debug!(target = "duet::negotiation", %message_id, "duplicate answer dropped");
            return Vec::new();
        }
        if self.remote() != Some(&from) {
            tracing::debug!(target = "duet::negotiation", peer = %from, "answer from unbound peer dropped");
            return Vec::new();
        }
        let Some(conn) = self.connection.as_mut() else {
            return Vec::new();
        };
        if conn.phase != SignalingPhase::HaveLocalOffer {
            tracing::debug!(target = "duet::negotiation", phase = ?conn.phase, "unexpected answer dropped");
            return Vec::new();
        }
        if conn
            .remote_handshake
            .as_deref()
            .is_some_and(|bound| bound != handshake_id)
        {
            tracing::debug!(target = "duet::negotiation", "answer for stale handshake dropped");
            return Vec::new();
        }
        conn.remote_handshake = Some(handshake_id);
        vec![Command::ApplyAnswer {
            epoch: conn.epoch,
            description,
        }]
    }

    fn on_remote_candidate(
        &mut self,
        from: PeerId,
        candidate: IceCandidate,
        handshake_id: String,
        message_id: String,
    ) -> Vec<Command> {
        if !self.seen.insert(&message_id) {
            return Vec::new();
        }
        if self.remote().is_some_and(|r| *r != from) {
            return Vec::new();
        }
        if let Some(conn) = self.connection.as_ref() {
            if conn.remote_description_set {
                match conn.remote_handshake.as_deref() {
                    Some(bound) if bound == handshake_id => {
                        return vec![Command::AddCandidates {
                            epoch: conn.epoch,
                            candidates: vec![candidate],
                        }];
                    }
                    // Held until that handshake's offer or answer binds.
                    Some(_) => {
                        tracing::debug!(target = "duet::negotiation", %handshake_id, "candidate for unbound handshake held");
                    }
                    None => {}
                }
            }
        }
        if self.pending.len() >= PENDING_CANDIDATE_LIMIT {
            self.pending.remove(0);
        }
        tracing::trace!(target = "duet::negotiation", queued = self.pending.len() + 1, "queueing remote candidate");
        self.pending.push(PendingCandidate {
            handshake_id,
            candidate,
        });
        Vec::new()
    }

    fn on_local_offer(&mut self, epoch: Epoch, description: SessionDescription) -> Vec<Command> {
        let to_peer_id = self.remote().cloned();
        let Some(conn) = self.current_mut(epoch) else {
            return Vec::new();
        };
        conn.making_offer = false;
        conn.phase = SignalingPhase::HaveLocalOffer;
        let handshake_id = conn.local_handshake.clone();
        match to_peer_id {
            Some(to_peer_id) => vec![Command::Signal(ClientMessage::Offer {
                to_peer_id: Some(to_peer_id),
                description,
                handshake_id,
                message_id: next_message_id(),
            })],
            None => Vec::new(),
        }
    }

    fn on_offer_applied(&mut self, epoch: Epoch) -> Vec<Command> {
        let Some(conn) = self.current_mut(epoch) else {
            return Vec::new();
        };
        conn.remote_description_set = true;
        let mut out = self.flush_candidates();
        out.push(Command::CreateAnswer { epoch });
        out
    }

    fn on_local_answer(&mut self, epoch: Epoch, description: SessionDescription) -> Vec<Command> {
        let to_peer_id = self.remote().cloned();
        let Some(conn) = self.current_mut(epoch) else {
            return Vec::new();
        };
        conn.phase = SignalingPhase::Stable;
        let handshake_id = conn.local_handshake.clone();
        match to_peer_id {
            Some(to_peer_id) => vec![Command::Signal(ClientMessage::Answer {
                to_peer_id: Some(to_peer_id),
                description,
                handshake_id,
                message_id: next_message_id(),
            })],
            None => Vec::new(),
        }
    }

    fn on_answer_applied(&mut self, epoch: Epoch) -> Vec<Command> {
        let Some(conn) = self.current_mut(epoch) else {
            return Vec::new();
        };
        conn.phase = SignalingPhase::Stable;
        conn.remote_description_set = true;
        self.flush_candidates()
    }

    fn on_failed(&mut self, epoch: Epoch, stage: Stage) -> Vec<Command> {
        let Some(conn) = self.current_mut(epoch) else {
            return Vec::new();
        };
        tracing::warn!(target = "duet::negotiation", ?stage, epoch, "negotiation step failed");
        match stage {
            Stage::Offer => conn.making_offer = false,
            Stage::ApplyOffer | Stage::Answer => conn.phase = SignalingPhase::Stable,
            Stage::ApplyAnswer => {}
        }
        Vec::new()
    }

    fn on_local_candidate(&mut self, epoch: Epoch, candidate: IceCandidate) -> Vec<Command> {
        let to_peer_id = self.remote().cloned();
        let Some(conn) = self.current_mut(epoch) else {
            return Vec::new();
        };
        let handshake_id = conn.local_handshake.clone();
        match to_peer_id {
            Some(to_peer_id) => vec![Command::Signal(ClientMessage::IceCandidate {
                to_peer_id: Some(to_peer_id),
                candidate,
                handshake_id,
                message_id: next_message_id(),
            })],
            None => Vec::new(),
        }
    }

    fn on_restart_ice(&mut self) -> Vec<Command> {
        if self.remote.is_none() {
            return Vec::new();
        }
        let Some(conn) = self.connection.as_mut() else {
            return Vec::new();
        };
        if conn.phase != SignalingPhase::Stable || conn.making_offer || !conn.remote_description_set
        {
            tracing::debug!(target = "duet::negotiation", phase = ?conn.phase, "negotiation in flight, skipping ice restart");
            return Vec::new();
        }
        conn.making_offer = true;
        vec![Command::MakeOffer {
            epoch: conn.epoch,
            ice_restart: true,
        }]
    }

    fn initiate(&mut self) -> Vec<Command> {
        let mut out = Vec::new();
        if self.connection.is_none() {
            out.push(self.create_connection_as(true));
        }
        if let Some(conn) = self.connection.as_mut() {
            if conn.phase == SignalingPhase::Stable && !conn.making_offer {
                conn.making_offer = true;
                out.push(Command::MakeOffer {
                    epoch: conn.epoch,
                    ice_restart: false,
                });
            }
        }
        out
    }

    fn create_connection(&mut self) -> Command {
        self.create_connection_as(false)
    }

    fn create_connection_as(&mut self, initiator: bool) -> Command {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.connection = Some(Connection {
            epoch,
            local_handshake: Uuid::new_v4().to_string(),
            remote_handshake: None,
            phase: SignalingPhase::Stable,
            making_offer: false,
            remote_description_set: false,
            established: false,
        });
        Command::CreateConnection { epoch, initiator }
    }

    fn bind(&mut self, peer: PeerId) -> Vec<Command> {
        let polite = self.local.is_polite_towards(&peer);
        tracing::debug!(target = "duet::negotiation", %peer, polite, "bound remote peer");
        self.remote = Some(Remote {
            peer: peer.clone(),
            polite,
        });
        vec![Command::Notify(Notice::RemoteBound { peer, polite })]
    }

    fn tear_down(&mut self) -> Vec<Command> {
        match self.connection.take() {
            Some(conn) => {
                if let Some(bound) = conn.remote_handshake.as_deref() {
                    self.pending.retain(|p| p.handshake_id != bound);
                }
                vec![Command::TearDown { epoch: conn.epoch }]
            }
            None => Vec::new(),
        }
    }

    /// Applies queued candidates of the bound handshake in receipt order.
    /// Candidates of other handshakes stay queued until theirs binds or
    /// its connection is torn down.
    fn flush_candidates(&mut self) -> Vec<Command> {
        let Some(conn) = self.connection.as_ref() else {
            return Vec::new();
        };
        let Some(bound) = conn.remote_handshake.clone() else {
            return Vec::new();
        };
        let (matching, rest): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|p| p.handshake_id == bound);
        self.pending = rest;
        if matching.is_empty() {
            return Vec::new();
        }
        vec![Command::AddCandidates {
            epoch: conn.epoch,
            candidates: matching.into_iter().map(|p| p.candidate).collect(),
        }]
    }

    fn current_mut(&mut self, epoch: Epoch) -> Option<&mut Connection> {
        self.connection.as_mut().filter(|c| c.epoch == epoch)
    }
}

fn next_message_id() -> String {
    Uuid::new_v4().to_string()
}
