use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use duet_proto::{PeerId, WhiteboardAction, WhiteboardEvent};
use duet_session::identity::{IdentityStore, MemoryIdentityStore};
use duet_session::recovery::Phase;
use duet_session::transfer::{Direction, TransferStatus};
use duet_session::transport::mock::{MockNetwork, MockRelay};
use duet_session::transport::{NoMediaDevices, PlaceholderMedia};
use duet_session::{
    Participant, SessionConfig, SessionContext, SessionDeps, SessionError, SessionEvent,
};
use tokio::sync::mpsc::UnboundedReceiver;

const ROOM: &str = "lesson-42";

struct Peer {
    session: SessionContext,
    events: UnboundedReceiver<SessionEvent>,
    id: PeerId,
}

fn test_config() -> SessionConfig {
    SessionConfig {
        ice_servers: Vec::new(),
        ..SessionConfig::default()
    }
}

fn deps(net: &MockNetwork, relay: &MockRelay) -> SessionDeps {
    SessionDeps {
        peers: net.factory(),
        signaling: relay.connector(),
        media: Arc::new(PlaceholderMedia),
        identity: Arc::new(MemoryIdentityStore::new()),
    }
}

fn participant(name: &str) -> Participant {
    Participant {
        room_id: ROOM.to_string(),
        display_name: name.to_string(),
        participant_id: None,
    }
}

async fn join_with(name: &str, config: SessionConfig, deps: SessionDeps) -> Peer {
    let session = SessionContext::new(config, participant(name), deps);
    let mut events = session.events().expect("events");
    let id = session.start().expect("start");
    until(&mut events, |event| {
        matches!(event, SessionEvent::Joined { .. }).then_some(())
    })
    .await;
    Peer {
        session,
        events,
        id,
    }
}

async fn join(name: &str, net: &MockNetwork, relay: &MockRelay) -> Peer {
    join_with(name, test_config(), deps(net, relay)).await
}

/// Waits for the first event `pick` accepts, discarding the rest.
async fn until<T>(
    events: &mut UnboundedReceiver<SessionEvent>,
    mut pick: impl FnMut(&SessionEvent) -> Option<T>,
) -> T {
    let wait = async {
        loop {
            let event = events.recv().await.expect("session event stream ended");
            if let Some(found) = pick(&event) {
                return found;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(300), wait)
        .await
        .expect("event never arrived")
}

async fn until_phase(peer: &mut Peer, phase: Phase) {
    until(&mut peer.events, |event| {
        (*event == SessionEvent::Phase(phase)).then_some(())
    })
    .await;
}

async fn connected_pair(net: &MockNetwork, relay: &MockRelay) -> (Peer, Peer) {
    let mut alice = join("alice", net, relay).await;
    let mut bob = join("bob", net, relay).await;
    until_phase(&mut alice, Phase::Connected).await;
    until_phase(&mut bob, Phase::Connected).await;
    (alice, bob)
}

#[test_timeout::tokio_timeout_test(paused)]
async fn two_peers_connect_and_chat() {
    let net = MockNetwork::new();
    let relay = MockRelay::new();
    let (mut alice, mut bob) = connected_pair(&net, &relay).await;

    alice.session.send_chat("hello bob").expect("chat");
    let chat = until(&mut bob.events, |event| match event {
        SessionEvent::Chat(message) => Some(message.clone()),
        _ => None,
    })
    .await;
    assert_eq!(chat.user_name, "alice");
    assert_eq!(chat.message, "hello bob");

    bob.session.send_chat("hi alice").expect("chat");
    let reply = until(&mut alice.events, |event| match event {
        SessionEvent::Chat(message) => Some(message.message.clone()),
        _ => None,
    })
    .await;
    assert_eq!(reply, "hi alice");

    let status = alice.session.status().await.expect("status");
    assert_eq!(status.phase, Phase::Connected);
    assert_eq!(status.remote, Some(bob.id.clone()));
    assert!(status.signaling_connected);
    assert_eq!(net.connections_created(), 2);

    alice.session.stop().await;
    bob.session.stop().await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn whiteboard_events_queued_before_connect_arrive_in_order() {
    let net = MockNetwork::new();
    let relay = MockRelay::new();
    let alice = join("alice", &net, &relay).await;
    for n in 0..200 {
        alice
            .session
            .send_whiteboard(WhiteboardEvent {
                action: WhiteboardAction::Draw,
                object_id: Some(n.to_string()),
                payload: None,
            })
            .expect("whiteboard");
    }

    let mut bob = join("bob", &net, &relay).await;
    let mut seen = Vec::new();
    while seen.len() < 200 {
        let id = until(&mut bob.events, |event| match event {
            SessionEvent::Whiteboard(event) => event.object_id.clone(),
            _ => None,
        })
        .await;
        seen.push(id);
    }
    let expected: Vec<String> = (0..200).map(|n: i32| n.to_string()).collect();
    assert_eq!(seen, expected);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn full_queue_drops_oldest_messages() {
    let net = MockNetwork::new();
    let relay = MockRelay::new();
    let mut alice = join("alice", &net, &relay).await;
    for n in 0..105 {
        alice.session.send_chat(n.to_string()).expect("chat");
    }
    let dropped = until(&mut alice.events, |event| match event {
        SessionEvent::QueueOverflow { dropped, .. } => Some(*dropped),
        _ => None,
    })
    .await;
    assert_eq!(dropped, 1);
    let status = alice.session.status().await.expect("status");
    assert!(status.queued.contains(&(duet_session::channels::ChannelKind::Chat, 100)));

    let mut bob = join("bob", &net, &relay).await;
    let first = until(&mut bob.events, |event| match event {
        SessionEvent::Chat(message) => Some(message.message.clone()),
        _ => None,
    })
    .await;
    assert_eq!(first, "5");
}

#[test_timeout::tokio_timeout_test(paused)]
async fn short_signaling_outage_keeps_the_call() {
    let net = MockNetwork::new();
    let relay = MockRelay::new();
    let (mut alice, mut bob) = connected_pair(&net, &relay).await;

    relay.refuse_connections(true);
    relay.drop_peer(&alice.id);
    until(&mut alice.events, |event| {
        (*event == SessionEvent::SignalingConnected(false)).then_some(())
    })
    .await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    relay.refuse_connections(false);
    until(&mut alice.events, |event| {
        (*event == SessionEvent::SignalingConnected(true)).then_some(())
    })
    .await;

    alice.session.send_chat("still here").expect("chat");
    let chat = until(&mut bob.events, |event| match event {
        SessionEvent::Chat(message) => Some(message.message.clone()),
        _ => None,
    })
    .await;
    assert_eq!(chat, "still here");
    assert_eq!(net.connections_created(), 2);
    let status = bob.session.status().await.expect("status");
    assert_eq!(status.phase, Phase::Connected);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn file_arrives_byte_identical() {
    let net = MockNetwork::new();
    let relay = MockRelay::new();
    let (mut alice, mut bob) = connected_pair(&net, &relay).await;

    let payload: Vec<u8> = (0..200_000u32).map(|n| (n % 251) as u8).collect();
    let metadata = alice
        .session
        .send_file("scales.pdf", "application/pdf", Bytes::from(payload.clone()))
        .await
        .expect("offer");
    assert_eq!(metadata.total_chunks, 4);

    let offered = until(&mut bob.events, |event| match event {
        SessionEvent::FileOffered(metadata) => Some(metadata.clone()),
        _ => None,
    })
    .await;
    assert_eq!(offered, metadata);
    bob.session.accept_file(&offered.id).await.expect("accept");

    let received = until(&mut bob.events, |event| match event {
        SessionEvent::FileReceived(file) => Some(file.clone()),
        _ => None,
    })
    .await;
    assert_eq!(received.data.as_ref(), payload.as_slice());
    assert_eq!(received.metadata.name, "scales.pdf");

    until(&mut alice.events, |event| match event {
        SessionEvent::Transfer(snapshot)
            if snapshot.direction == Direction::Outgoing
                && snapshot.status == TransferStatus::Completed =>
        {
            Some(())
        }
        _ => None,
    })
    .await;
    let transfers = bob.session.transfers().await.expect("transfers");
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].progress, 100);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn empty_file_completes_on_accept() {
    let net = MockNetwork::new();
    let relay = MockRelay::new();
    let (mut alice, mut bob) = connected_pair(&net, &relay).await;

    alice
        .session
        .send_file("empty.txt", "text/plain", Bytes::new())
        .await
        .expect("offer");
    let id = until(&mut bob.events, |event| match event {
        SessionEvent::FileOffered(metadata) => Some(metadata.id.clone()),
        _ => None,
    })
    .await;
    bob.session.accept_file(&id).await.expect("accept");
    let received = until(&mut bob.events, |event| match event {
        SessionEvent::FileReceived(file) => Some(file.clone()),
        _ => None,
    })
    .await;
    assert!(received.data.is_empty());

    until(&mut alice.events, |event| match event {
        SessionEvent::Transfer(snapshot) if snapshot.status == TransferStatus::Completed => {
            Some(())
        }
        _ => None,
    })
    .await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn rejected_offer_is_terminal_and_retryable() {
    let net = MockNetwork::new();
    let relay = MockRelay::new();
    let (mut alice, mut bob) = connected_pair(&net, &relay).await;

    let metadata = alice
        .session
        .send_file("draft.txt", "text/plain", Bytes::from_static(b"draft"))
        .await
        .expect("offer");
    let id = until(&mut bob.events, |event| match event {
        SessionEvent::FileOffered(metadata) => Some(metadata.id.clone()),
        _ => None,
    })
    .await;
    bob.session.reject_file(&id).await.expect("reject");

    until(&mut alice.events, |event| match event {
        SessionEvent::Transfer(snapshot)
            if snapshot.metadata.id == metadata.id
                && snapshot.status == TransferStatus::Rejected =>
        {
            Some(())
        }
        _ => None,
    })
    .await;

    alice
        .session
        .retry_transfer(&metadata.id)
        .await
        .expect("retry");
    let again = until(&mut bob.events, |event| match event {
        SessionEvent::FileOffered(metadata) => Some(metadata.id.clone()),
        _ => None,
    })
    .await;
    assert_eq!(again, metadata.id);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn unknown_transfer_is_an_error() {
    let net = MockNetwork::new();
    let relay = MockRelay::new();
    let alice = join("alice", &net, &relay).await;
    let err = alice
        .session
        .accept_file("no-such-transfer")
        .await
        .expect_err("unknown id");
    assert!(matches!(err, SessionError::Transfer(_)));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn ice_failure_recovers_once_the_network_heals() {
    let net = MockNetwork::new();
    let relay = MockRelay::new();
    let (mut alice, _bob) = connected_pair(&net, &relay).await;

    net.fail_ice();
    until_phase(&mut alice, Phase::Recovering).await;
    net.heal();
    until_phase(&mut alice, Phase::Connected).await;

    alice.session.send_chat("back").expect("chat");
}

#[test_timeout::tokio_timeout_test(paused)]
async fn duplicated_signaling_is_harmless() {
    let net = MockNetwork::new();
    let relay = MockRelay::new();
    relay.duplicate_delivery(true);
    let (mut alice, mut bob) = connected_pair(&net, &relay).await;

    alice.session.send_chat("once").expect("chat");
    until(&mut bob.events, |event| match event {
        SessionEvent::Chat(message) => Some(message.message.clone()),
        _ => None,
    })
    .await;
    assert_eq!(net.connections_created(), 2);
    assert_eq!(alice.session.status().await.expect("status").phase, Phase::Connected);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn missing_media_still_connects_receive_only() {
    let net = MockNetwork::new();
    let relay = MockRelay::new();
    let no_media = SessionDeps {
        media: Arc::new(NoMediaDevices),
        ..deps(&net, &relay)
    };
    let mut alice = join_with("alice", test_config(), no_media).await;
    let mut bob = join("bob", &net, &relay).await;
    until_phase(&mut alice, Phase::Connected).await;
    until_phase(&mut bob, Phase::Connected).await;
    assert_eq!(net.media_plans().len(), 2);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn start_and_stop_are_idempotent() {
    let net = MockNetwork::new();
    let relay = MockRelay::new();
    let session = SessionContext::new(test_config(), participant("alice"), deps(&net, &relay));
    assert!(matches!(session.send_chat("early"), Err(SessionError::NotStarted)));

    let first = session.start().expect("start");
    let second = session.start().expect("start again");
    assert_eq!(first, second);
    assert!(session.is_running());

    session.stop().await;
    session.stop().await;
    assert!(!session.is_running());
    assert!(matches!(session.start(), Err(SessionError::Stopped)));
    assert!(matches!(session.send_chat("late"), Err(SessionError::Stopped)));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn leaving_tells_the_other_side() {
    let net = MockNetwork::new();
    let relay = MockRelay::new();
    let (alice, mut bob) = connected_pair(&net, &relay).await;

    alice.session.stop().await;
    let left = until(&mut bob.events, |event| match event {
        SessionEvent::PeerLeft { peer_id } => Some(peer_id.clone()),
        _ => None,
    })
    .await;
    assert_eq!(left, alice.id);
    assert_eq!(relay.live_links(), 1);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn second_device_supersedes_the_first() {
    let net = MockNetwork::new();
    let relay = MockRelay::new();
    let identity = Arc::new(MemoryIdentityStore::new());
    let (mut alice, mut bob) = connected_pair(&net, &relay).await;

    let tablet_deps = SessionDeps {
        identity: identity.clone(),
        ..deps(&net, &relay)
    };
    let tablet = join_with("alice", test_config(), tablet_deps).await;

    let by = until(&mut alice.events, |event| match event {
        SessionEvent::Superseded { by } => Some(by.clone()),
        _ => None,
    })
    .await;
    assert_eq!(by, tablet.id);
    assert_eq!(Some(by), identity.load(ROOM).expect("load"));

    let (old, new) = until(&mut bob.events, |event| match event {
        SessionEvent::PeerReplaced { old, new } => Some((old.clone(), new.clone())),
        _ => None,
    })
    .await;
    assert_eq!(old, alice.id);
    assert_eq!(new, tablet.id);

    until_phase(&mut bob, Phase::Connected).await;
    let status = bob.session.status().await.expect("status");
    assert_eq!(status.remote, Some(tablet.id.clone()));
    assert_eq!(status.phase, Phase::Connected);
}
