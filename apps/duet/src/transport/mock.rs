//! In-memory peer connections and relay for tests.
//!
//! `MockNetwork` pairs fake peer connections through their session
//! descriptions and enforces the signaling state rules a real stack does:
//! an offer cannot be applied on top of a local offer without a rollback,
//! and candidates cannot be added before the remote description. Faults can
//! be injected to drive the recovery paths. `MockRelay` runs the relay's
//! room rules over channels instead of sockets.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use duet_proto::rooms::{Delivery, RoomRegistry};
use duet_proto::{ClientMessage, IceCandidate, PeerId, SdpKind, ServerMessage, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    ChannelEvent, ChannelInstance, ChannelPayload, ConnectionState, DataChannel,
    IceConnectionState, MediaPlan, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventSink, SignalingConnector, SignalingLink, TaskSet, TransportError,
    next_channel_instance,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signaling {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

struct PcState {
    events: PeerEventSink,
    signaling: Signaling,
    local_sdp: Option<String>,
    remote: Option<u64>,
    remote_set: bool,
    ufrag: u32,
    connected: bool,
    closed: bool,
    channels: Vec<ChannelInstance>,
    candidates_applied: usize,
    media: Option<MediaPlan>,
}

struct ChanState {
    pc: u64,
    label: String,
    open: bool,
    closed: bool,
    peer: Option<ChannelInstance>,
}

#[derive(Default)]
struct NetState {
    this: Weak<Mutex<NetState>>,
    pcs: HashMap<u64, PcState>,
    channels: HashMap<ChannelInstance, ChanState>,
    held: Vec<(ChannelInstance, ChannelPayload)>,
    next_pc: u64,
    blocked: bool,
    link_down: bool,
}

impl NetState {
    fn emit(&self, pc: u64, event: PeerEvent) {
        if let Some(state) = self.pcs.get(&pc) {
            if !state.closed {
                let _ = state.events.send(event);
            }
        }
    }

    fn emit_link(&self, pc: u64, ice: IceConnectionState, connection: ConnectionState) {
        self.emit(pc, PeerEvent::IceState(ice));
        self.emit(pc, PeerEvent::ConnectionState(connection));
    }

    fn ready(&self, id: u64) -> Option<u64> {
        let pc = self.pcs.get(&id)?;
        if pc.closed || pc.signaling != Signaling::Stable || !pc.remote_set || pc.local_sdp.is_none()
        {
            return None;
        }
        let peer_id = pc.remote?;
        let peer = self.pcs.get(&peer_id)?;
        let paired = !peer.closed
            && peer.signaling == Signaling::Stable
            && peer.remote == Some(id)
            && peer.remote_set
            && peer.local_sdp.is_some();
        paired.then_some(peer_id)
    }

    fn try_connect(&mut self, id: u64) {
        if self.blocked || self.link_down {
            return;
        }
        let Some(peer) = self.ready(id) else {
            return;
        };
        for side in [id, peer] {
            let newly = self
                .pcs
                .get_mut(&side)
                .map(|pc| !std::mem::replace(&mut pc.connected, true))
                .unwrap_or(false);
            if newly {
                self.emit_link(side, IceConnectionState::Connected, ConnectionState::Connected);
            }
        }
        self.pair_channels(id, peer);
        self.pair_channels(peer, id);
    }

    /// Announces every unpaired channel of `from` on `to` and opens both ends.
    fn pair_channels(&mut self, from: u64, to: u64) {
        let unpaired: Vec<ChannelInstance> = self
            .pcs
            .get(&from)
            .map(|pc| pc.channels.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|c| {
                self.channels
                    .get(c)
                    .is_some_and(|s| !s.closed && s.peer.is_none())
            })
            .collect();
        for local in unpaired {
            let label = match self.channels.get(&local) {
                Some(state) => state.label.clone(),
                None => continue,
            };
            let remote = next_channel_instance();
            self.channels.insert(
                remote,
                ChanState {
                    pc: to,
                    label: label.clone(),
                    open: true,
                    closed: false,
                    peer: Some(local),
                },
            );
            if let Some(pc) = self.pcs.get_mut(&to) {
                pc.channels.push(remote);
            }
            if let Some(state) = self.channels.get_mut(&local) {
                state.open = true;
                state.peer = Some(remote);
            }
            self.emit(
                to,
                PeerEvent::RemoteChannel(Arc::new(MockDataChannel {
                    net: self.this.clone(),
                    instance: remote,
                    label: label.clone(),
                })),
            );
            self.emit(
                from,
                PeerEvent::Channel {
                    label: label.clone(),
                    instance: local,
                    event: ChannelEvent::Open,
                },
            );
            self.emit(
                to,
                PeerEvent::Channel {
                    label,
                    instance: remote,
                    event: ChannelEvent::Open,
                },
            );
        }
    }

    fn close_channel(&mut self, instance: ChannelInstance) {
        let Some(state) = self.channels.get_mut(&instance) else {
            return;
        };
        if state.closed {
            return;
        }
        state.closed = true;
        state.open = false;
        let peer = state.peer.take();
        let (pc, label) = (state.pc, state.label.clone());
        self.emit(
            pc,
            PeerEvent::Channel {
                label,
                instance,
                event: ChannelEvent::Close,
            },
        );
        if let Some(peer) = peer {
            if let Some(peer_state) = self.channels.get_mut(&peer) {
                peer_state.open = false;
                peer_state.closed = true;
                peer_state.peer = None;
                let (peer_pc, peer_label) = (peer_state.pc, peer_state.label.clone());
                self.emit(
                    peer_pc,
                    PeerEvent::Channel {
                        label: peer_label,
                        instance: peer,
                        event: ChannelEvent::Close,
                    },
                );
            }
        }
    }

    fn deliver(&self, from: ChannelInstance, payload: ChannelPayload) {
        let Some(peer) = self.channels.get(&from).and_then(|s| s.peer) else {
            return;
        };
        if let Some(target) = self.channels.get(&peer) {
            self.emit(
                target.pc,
                PeerEvent::Channel {
                    label: target.label.clone(),
                    instance: peer,
                    event: ChannelEvent::Message(payload),
                },
            );
        }
    }
}

/// Shared fake network. Cloning shares the same state.
#[derive(Clone)]
pub struct MockNetwork {
    state: Arc<Mutex<NetState>>,
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNetwork {
    pub fn new() -> Self {
        let state = Arc::new_cyclic(|this| {
            Mutex::new(NetState {
                this: this.clone(),
                ..NetState::default()
            })
        });
        Self { state }
    }

    pub fn factory(&self) -> Arc<MockFactory> {
        Arc::new(MockFactory { net: self.clone() })
    }

    /// Peer connections created so far, closed ones included.
    pub fn connections_created(&self) -> usize {
        self.state.lock().pcs.len()
    }

    pub fn open_connections(&self) -> usize {
        self.state
            .lock()
            .pcs
            .values()
            .filter(|pc| pc.connected && !pc.closed)
            .count()
    }

    pub fn candidates_applied(&self) -> usize {
        self.state
            .lock()
            .pcs
            .values()
            .map(|pc| pc.candidates_applied)
            .sum()
    }

    pub fn media_plans(&self) -> Vec<MediaPlan> {
        self.state
            .lock()
            .pcs
            .values()
            .filter_map(|pc| pc.media)
            .collect()
    }

    /// Network blip: every live link reports `disconnected`; channel data
    /// is held until [`MockNetwork::heal`].
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.link_down = true;
        let live: Vec<u64> = state
            .pcs
            .iter()
            .filter(|(_, pc)| pc.connected && !pc.closed)
            .map(|(id, _)| *id)
            .collect();
        for id in live {
            if let Some(pc) = state.pcs.get_mut(&id) {
                pc.connected = false;
            }
            state.emit_link(id, IceConnectionState::Disconnected, ConnectionState::Disconnected);
        }
    }

    /// ICE gives up on every live link and no new link can form until
    /// [`MockNetwork::heal`].
    pub fn fail_ice(&self) {
        let mut state = self.state.lock();
        state.link_down = true;
        state.blocked = true;
        let live: Vec<u64> = state
            .pcs
            .iter()
            .filter(|(_, pc)| !pc.closed && pc.remote.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in live {
            if let Some(pc) = state.pcs.get_mut(&id) {
                pc.connected = false;
            }
            state.emit(id, PeerEvent::IceState(IceConnectionState::Failed));
        }
    }

    /// Keeps new links from forming without disturbing live ones.
    pub fn block(&self) {
        self.state.lock().blocked = true;
    }

    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.blocked = false;
        state.link_down = false;
        let ids: Vec<u64> = state.pcs.keys().copied().collect();
        for id in ids {
            state.try_connect(id);
        }
        for (from, payload) in std::mem::take(&mut state.held) {
            state.deliver(from, payload);
        }
    }

    fn register(&self, events: PeerEventSink) -> u64 {
        let mut state = self.state.lock();
        state.next_pc += 1;
        let id = state.next_pc;
        state.pcs.insert(
            id,
            PcState {
                events,
                signaling: Signaling::Stable,
                local_sdp: None,
                remote: None,
                remote_set: false,
                ufrag: 0,
                connected: false,
                closed: false,
                channels: Vec::new(),
                candidates_applied: 0,
                media: None,
            },
        );
        id
    }

    fn with_pc<T>(
        &self,
        id: u64,
        f: impl FnOnce(&mut NetState, u64) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut state = self.state.lock();
        let closed = state.pcs.get(&id).map_or(true, |pc| pc.closed);
        if closed {
            return Err(TransportError::InvalidState("peer connection closed".into()));
        }
        f(&mut state, id)
    }

    fn channel(&self, instance: ChannelInstance, label: String) -> Arc<MockDataChannel> {
        Arc::new(MockDataChannel {
            net: Arc::downgrade(&self.state),
            instance,
            label,
        })
    }
}

fn sdp_for(id: u64, ufrag: u32) -> String {
    format!("mock-pc={id};ufrag={ufrag}")
}

fn parse_sdp(sdp: &str) -> Result<u64, TransportError> {
    sdp.split(';')
        .find_map(|part| part.strip_prefix("mock-pc="))
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| TransportError::InvalidState(format!("unrecognised sdp {sdp}")))
}

fn local_candidate(id: u64, ufrag: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:mock {id} {ufrag}"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: Some(format!("u{ufrag}")),
    }
}

pub struct MockFactory {
    net: MockNetwork,
}

#[async_trait]
impl PeerConnectionFactory for MockFactory {
    async fn create(
        &self,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let id = self.net.register(events);
        Ok(Arc::new(MockPeerConnection {
            net: self.net.clone(),
            id,
        }))
    }
}

pub struct MockPeerConnection {
    net: MockNetwork,
    id: u64,
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        self.net.with_pc(self.id, |state, id| {
            let pc = state.pcs.get_mut(&id).ok_or(TransportError::ChannelClosed)?;
            if pc.signaling != Signaling::Stable {
                return Err(TransportError::InvalidState(
                    "offer requires stable signaling state".into(),
                ));
            }
            if ice_restart {
                pc.ufrag += 1;
            }
            let sdp = sdp_for(id, pc.ufrag);
            pc.signaling = Signaling::HaveLocalOffer;
            pc.local_sdp = Some(sdp.clone());
            let candidate = local_candidate(id, pc.ufrag);
            state.emit(id, PeerEvent::LocalCandidate(candidate));
            Ok(SessionDescription::offer(sdp))
        })
    }

    async fn answer(&self) -> Result<SessionDescription, TransportError> {
        self.net.with_pc(self.id, |state, id| {
            let pc = state.pcs.get_mut(&id).ok_or(TransportError::ChannelClosed)?;
            if pc.signaling != Signaling::HaveRemoteOffer {
                return Err(TransportError::InvalidState(
                    "answer requires a remote offer".into(),
                ));
            }
            let sdp = sdp_for(id, pc.ufrag);
            pc.signaling = Signaling::Stable;
            pc.local_sdp = Some(sdp.clone());
            let candidate = local_candidate(id, pc.ufrag);
            state.emit(id, PeerEvent::LocalCandidate(candidate));
            state.try_connect(id);
            Ok(SessionDescription::answer(sdp))
        })
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let remote = parse_sdp(&description.sdp)?;
        self.net.with_pc(self.id, |state, id| {
            let pc = state.pcs.get_mut(&id).ok_or(TransportError::ChannelClosed)?;
            match (description.kind, pc.signaling) {
                (SdpKind::Offer, Signaling::Stable) => pc.signaling = Signaling::HaveRemoteOffer,
                (SdpKind::Answer, Signaling::HaveLocalOffer) => pc.signaling = Signaling::Stable,
                (kind, current) => {
                    return Err(TransportError::InvalidState(format!(
                        "cannot apply remote {kind:?} in {current:?}"
                    )));
                }
            }
            if pc.remote.is_some_and(|r| r != remote) {
                pc.connected = false;
            }
            pc.remote = Some(remote);
            pc.remote_set = true;
            state.try_connect(id);
            Ok(())
        })
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        self.net.with_pc(self.id, |state, id| {
            let pc = state.pcs.get_mut(&id).ok_or(TransportError::ChannelClosed)?;
            if pc.signaling != Signaling::HaveLocalOffer {
                return Err(TransportError::InvalidState("nothing to roll back".into()));
            }
            pc.signaling = Signaling::Stable;
            if !pc.remote_set {
                pc.local_sdp = None;
            }
            Ok(())
        })
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        self.net.with_pc(self.id, |state, id| {
            let pc = state.pcs.get_mut(&id).ok_or(TransportError::ChannelClosed)?;
            if !pc.remote_set {
                return Err(TransportError::InvalidState(
                    "remote description not set".into(),
                ));
            }
            pc.candidates_applied += 1;
            Ok(())
        })
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _ordered: bool,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let instance = next_channel_instance();
        self.net.with_pc(self.id, |state, id| {
            state.channels.insert(
                instance,
                ChanState {
                    pc: id,
                    label: label.to_string(),
                    open: false,
                    closed: false,
                    peer: None,
                },
            );
            if let Some(pc) = state.pcs.get_mut(&id) {
                pc.channels.push(instance);
            }
            if state.pcs.get(&id).is_some_and(|pc| pc.connected) {
                state.try_connect(id);
            }
            Ok(())
        })?;
        Ok(self.net.channel(instance, label.to_string()))
    }

    async fn add_media(&self, plan: MediaPlan) -> Result<(), TransportError> {
        self.net.with_pc(self.id, |state, id| {
            if let Some(pc) = state.pcs.get_mut(&id) {
                pc.media = Some(plan);
            }
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.net.state.lock();
        let Some(pc) = state.pcs.get(&self.id) else {
            return Ok(());
        };
        if pc.closed {
            return Ok(());
        }
        let channels = pc.channels.clone();
        let peer = pc.remote;
        let was_connected = pc.connected;
        for channel in channels {
            state.close_channel(channel);
        }
        if let Some(pc) = state.pcs.get_mut(&self.id) {
            pc.closed = true;
            pc.connected = false;
        }
        if let Some(peer) = peer {
            let peer_paired = state
                .pcs
                .get(&peer)
                .is_some_and(|p| p.remote == Some(self.id) && p.connected);
            if was_connected && peer_paired {
                if let Some(p) = state.pcs.get_mut(&peer) {
                    p.connected = false;
                }
                state.emit_link(peer, IceConnectionState::Disconnected, ConnectionState::Disconnected);
            }
        }
        Ok(())
    }
}

pub struct MockDataChannel {
    net: Weak<Mutex<NetState>>,
    instance: ChannelInstance,
    label: String,
}

impl MockDataChannel {
    fn state(&self) -> Result<Arc<Mutex<NetState>>, TransportError> {
        self.net.upgrade().ok_or(TransportError::ChannelClosed)
    }

    fn send(&self, payload: ChannelPayload) -> Result<(), TransportError> {
        let state = self.state()?;
        let mut state = state.lock();
        let open = state
            .channels
            .get(&self.instance)
            .is_some_and(|c| c.open && c.peer.is_some());
        if !open {
            return Err(TransportError::ChannelClosed);
        }
        if state.link_down {
            state.held.push((self.instance, payload));
        } else {
            state.deliver(self.instance, payload);
        }
        Ok(())
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn instance(&self) -> ChannelInstance {
        self.instance
    }

    fn is_open(&self) -> bool {
        self.state()
            .map(|state| {
                state
                    .lock()
                    .channels
                    .get(&self.instance)
                    .is_some_and(|c| c.open)
            })
            .unwrap_or(false)
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.send(ChannelPayload::Text(text.to_string()))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.send(ChannelPayload::Binary(data))
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Ok(state) = self.state() {
            state.lock().close_channel(self.instance);
        }
        Ok(())
    }
}

#[derive(Default)]
struct RelayState {
    registry: RoomRegistry<u64>,
    links: HashMap<u64, mpsc::UnboundedSender<ServerMessage>>,
    peers: HashMap<u64, PeerId>,
    next_conn: u64,
    refuse: bool,
    duplicate: bool,
}

impl RelayState {
    fn apply(&mut self, deliveries: Vec<Delivery<u64>>) {
        for delivery in deliveries {
            match delivery {
                Delivery::Send { conn, message } => {
                    if let Some(link) = self.links.get(&conn) {
                        if self.duplicate {
                            let _ = link.send(message.clone());
                        }
                        let _ = link.send(message);
                    }
                }
                Delivery::Close { conn } => {
                    self.links.remove(&conn);
                    self.peers.remove(&conn);
                }
            }
        }
    }

    fn handle(&mut self, conn: u64, message: ClientMessage) {
        let deliveries = match message {
            ClientMessage::Join {
                room_id,
                peer_id,
                display_name,
                participant_id,
            } => {
                self.peers.insert(conn, peer_id.clone());
                self.registry
                    .join(&room_id, peer_id, display_name, participant_id, conn)
            }
            ClientMessage::Leave { room_id, peer_id } => {
                self.registry.leave(conn, &room_id, &peer_id)
            }
            other => self.registry.relay(conn, other),
        };
        self.apply(deliveries);
    }

    fn disconnect(&mut self, conn: u64) {
        self.links.remove(&conn);
        self.peers.remove(&conn);
        let deliveries = self.registry.disconnect(conn);
        self.apply(deliveries);
    }
}

/// The relay's room rules behind in-process links.
#[derive(Clone, Default)]
pub struct MockRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MockRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<MockConnector> {
        Arc::new(MockConnector {
            relay: self.clone(),
        })
    }

    /// Severs the link of `peer` as if its socket died.
    pub fn drop_peer(&self, peer: &PeerId) {
        let mut state = self.state.lock();
        let conns: Vec<u64> = state
            .peers
            .iter()
            .filter(|(_, p)| *p == peer)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in conns {
            state.disconnect(conn);
        }
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// Delivers every relayed message twice.
    pub fn duplicate_delivery(&self, duplicate: bool) {
        self.state.lock().duplicate = duplicate;
    }

    pub fn live_links(&self) -> usize {
        self.state.lock().links.len()
    }
}

pub struct MockConnector {
    relay: MockRelay,
}

#[async_trait]
impl SignalingConnector for MockConnector {
    async fn connect(&self) -> Result<SignalingLink, TransportError> {
        let (outbound, mut from_client) = mpsc::unbounded_channel::<ClientMessage>();
        let (to_client, inbound) = mpsc::unbounded_channel::<ServerMessage>();
        let conn = {
            let mut state = self.relay.state.lock();
            if state.refuse {
                return Err(TransportError::Signaling("relay unreachable".into()));
            }
            state.next_conn += 1;
            let conn = state.next_conn;
            state.links.insert(conn, to_client);
            conn
        };

        let relay = self.relay.clone();
        tokio::spawn(async move {
            while let Some(message) = from_client.recv().await {
                let mut state = relay.state.lock();
                if !state.links.contains_key(&conn) {
                    break;
                }
                state.handle(conn, message);
            }
            relay.state.lock().disconnect(conn);
        });

        Ok(SignalingLink {
            outbound,
            inbound,
            tasks: TaskSet::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pc(net: &MockNetwork) -> (Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pc = net.factory().create(tx).await.expect("pc");
        (pc, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<PeerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_answer_connects_and_pairs_channels() {
        let net = MockNetwork::new();
        let (a, mut a_rx) = pc(&net).await;
        let (b, mut b_rx) = pc(&net).await;
        let chat = a.create_data_channel("chat", true).await.expect("channel");

        let offer = a.offer(false).await.expect("offer");
        b.set_remote_description(offer).await.expect("remote offer");
        let answer = b.answer().await.expect("answer");
        a.set_remote_description(answer).await.expect("remote answer");

        assert_eq!(net.open_connections(), 2);
        assert!(chat.is_open());
        let b_events = drain(&mut b_rx);
        let remote = b_events
            .iter()
            .find_map(|e| match e {
                PeerEvent::RemoteChannel(channel) => Some(Arc::clone(channel)),
                _ => None,
            })
            .expect("remote channel");
        assert_eq!(remote.label(), "chat");

        chat.send_text("hello").await.expect("send");
        let a_events = drain(&mut a_rx);
        assert!(a_events.iter().any(|e| matches!(e, PeerEvent::ConnectionState(ConnectionState::Connected))));
        let b_events = drain(&mut b_rx);
        assert!(b_events.iter().any(|e| matches!(
            e,
            PeerEvent::Channel { event: ChannelEvent::Message(ChannelPayload::Text(t)), .. } if t == "hello"
        )));
    }

    #[test_timeout::tokio_timeout_test]
    async fn glare_requires_rollback() {
        let net = MockNetwork::new();
        let (a, _a_rx) = pc(&net).await;
        let (b, _b_rx) = pc(&net).await;
        a.offer(false).await.expect("offer a");
        let offer_b = b.offer(false).await.expect("offer b");
        assert!(a.set_remote_description(offer_b.clone()).await.is_err());
        a.rollback().await.expect("rollback");
        a.set_remote_description(offer_b).await.expect("offer after rollback");
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_need_remote_description() {
        let net = MockNetwork::new();
        let (a, _rx) = pc(&net).await;
        let candidate = local_candidate(9, 0);
        assert!(a.add_ice_candidate(candidate).await.is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn relay_announces_peers() {
        let relay = MockRelay::new();
        let mut a = relay.connector().connect().await.expect("a");
        let mut b = relay.connector().connect().await.expect("b");
        a.outbound
            .send(ClientMessage::Join {
                room_id: "r".into(),
                peer_id: PeerId::from("a"),
                display_name: "Ana".into(),
                participant_id: None,
            })
            .expect("join a");
        assert!(matches!(a.inbound.recv().await, Some(ServerMessage::Joined { .. })));
        b.outbound
            .send(ClientMessage::Join {
                room_id: "r".into(),
                peer_id: PeerId::from("b"),
                display_name: "Ben".into(),
                participant_id: None,
            })
            .expect("join b");
        assert!(matches!(
            a.inbound.recv().await,
            Some(ServerMessage::PeerJoined { should_initiate: false, .. })
        ));

        relay.drop_peer(&PeerId::from("b"));
        assert!(matches!(a.inbound.recv().await, Some(ServerMessage::PeerLeft { .. })));
        // Queued messages drain, then the severed link reports closure.
        while b.inbound.recv().await.is_some() {}
    }
}
