use std::time::Duration;

use duet_proto::{ClientMessage, PeerId, ServerMessage, SessionDescription};
use duet_road::{router, RelayConfig, RelayState};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay() -> String {
    let state = RelayState::new(&RelayConfig::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.expect("serve");
    });
    format!("ws://{addr}")
}

async fn connect(base: &str, room: &str) -> Client {
    let (client, _) = connect_async(format!("{base}/ws/{room}"))
        .await
        .expect("connect");
    client
}

async fn send(client: &mut Client, message: &ClientMessage) {
    let json = serde_json::to_string(message).expect("encode");
    client.send(Message::Text(json)).await.expect("send");
}

async fn recv(client: &mut Client) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("relay went quiet")
            .expect("socket ended")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("decode");
        }
    }
}

async fn join(client: &mut Client, room: &str, peer: &str, name: &str) {
    send(
        client,
        &ClientMessage::Join {
            room_id: room.into(),
            peer_id: PeerId::from(peer),
            display_name: name.into(),
            participant_id: None,
        },
    )
    .await;
}

#[test_timeout::tokio_timeout_test]
async fn second_joiner_is_told_to_initiate() {
    let base = spawn_relay().await;
    let mut alice = connect(&base, "piano").await;
    join(&mut alice, "piano", "a", "alice").await;
    assert!(matches!(recv(&mut alice).await, ServerMessage::Joined { .. }));

    let mut bob = connect(&base, "piano").await;
    join(&mut bob, "piano", "b", "bob").await;

    let mut saw_initiate = false;
    for _ in 0..2 {
        match recv(&mut bob).await {
            ServerMessage::Joined { peers, .. } => assert_eq!(peers.len(), 1),
            ServerMessage::PeerJoined {
                peer_id,
                should_initiate,
                ..
            } => {
                assert_eq!(peer_id, PeerId::from("a"));
                saw_initiate = should_initiate;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(saw_initiate);

    match recv(&mut alice).await {
        ServerMessage::PeerJoined {
            peer_id,
            display_name,
            should_initiate,
        } => {
            assert_eq!(peer_id, PeerId::from("b"));
            assert_eq!(display_name, "bob");
            assert!(!should_initiate);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn offers_are_stamped_and_forwarded() {
    let base = spawn_relay().await;
    let mut alice = connect(&base, "violin").await;
    join(&mut alice, "violin", "a", "alice").await;
    recv(&mut alice).await;
    let mut bob = connect(&base, "violin").await;
    join(&mut bob, "violin", "b", "bob").await;
    recv(&mut bob).await;
    recv(&mut bob).await;
    recv(&mut alice).await;

    send(
        &mut bob,
        &ClientMessage::Offer {
            to_peer_id: Some(PeerId::from("a")),
            description: SessionDescription::offer("v=0"),
            handshake_id: "h1".into(),
            message_id: "m1".into(),
        },
    )
    .await;
    match recv(&mut alice).await {
        ServerMessage::Offer {
            from_peer_id,
            handshake_id,
            message_id,
            ..
        } => {
            assert_eq!(from_peer_id, PeerId::from("b"));
            assert_eq!(handshake_id, "h1");
            assert_eq!(message_id, "m1");
        }
        other => panic!("unexpected {other:?}"),
    }

    send(&mut alice, &ClientMessage::Ping).await;
    assert_eq!(recv(&mut alice).await, ServerMessage::Pong);
}

#[test_timeout::tokio_timeout_test]
async fn third_participant_is_turned_away() {
    let base = spawn_relay().await;
    for (peer, name) in [("a", "alice"), ("b", "bob")] {
        let mut client = connect(&base, "cello").await;
        join(&mut client, "cello", peer, name).await;
        recv(&mut client).await;
        // Keep the socket open for the rest of the test.
        tokio::spawn(async move { while client.next().await.is_some() {} });
    }
    let mut carol = connect(&base, "cello").await;
    join(&mut carol, "cello", "c", "carol").await;
    assert!(matches!(recv(&mut carol).await, ServerMessage::JoinError { .. }));
}

#[test_timeout::tokio_timeout_test]
async fn closing_a_socket_announces_peer_left() {
    let base = spawn_relay().await;
    let mut alice = connect(&base, "flute").await;
    join(&mut alice, "flute", "a", "alice").await;
    recv(&mut alice).await;
    let mut bob = connect(&base, "flute").await;
    join(&mut bob, "flute", "b", "bob").await;
    recv(&mut alice).await;

    bob.close(None).await.expect("close");
    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::PeerLeft {
            peer_id: PeerId::from("b")
        }
    );
}

#[test_timeout::tokio_timeout_test]
async fn join_for_another_room_is_rejected() {
    let base = spawn_relay().await;
    let mut client = connect(&base, "harp").await;
    join(&mut client, "drums", "a", "alice").await;
    assert!(matches!(recv(&mut client).await, ServerMessage::JoinError { .. }));
}

#[test_timeout::tokio_timeout_test]
async fn garbage_frames_get_an_error_reply() {
    let base = spawn_relay().await;
    let mut client = connect(&base, "oboe").await;
    client
        .send(Message::Text("{\"type\":\"nope\"}".into()))
        .await
        .expect("send");
    assert!(matches!(recv(&mut client).await, ServerMessage::Error { .. }));
}
