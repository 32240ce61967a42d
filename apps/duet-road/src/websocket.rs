use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use duet_proto::rooms::{Delivery, RoomRegistry};
use duet_proto::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;

pub type ConnId = u64;

enum Outbound {
    Message(ServerMessage),
    Close,
}

struct Conn {
    tx: mpsc::UnboundedSender<Outbound>,
    last_seen: Instant,
}

struct Inner {
    registry: Mutex<RoomRegistry<ConnId>>,
    conns: DashMap<ConnId, Conn>,
    next_conn: AtomicU64,
    stale_timeout: Duration,
}

/// Shared relay state: the room rules plus one outbound queue per socket.
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<Inner>,
}

impl RelayState {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(RoomRegistry::new()),
                conns: DashMap::new(),
                next_conn: AtomicU64::new(1),
                stale_timeout: config.stale_timeout,
            }),
        }
    }

    /// Periodically closes sockets that stopped talking.
    pub fn spawn_reaper(&self, every: Duration) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let reaped = state.reap_stale().await;
                if reaped > 0 {
                    info!(reaped, "closed stale sockets");
                }
            }
        })
    }

    pub fn connection_count(&self) -> usize {
        self.inner.conns.len()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.registry.lock().await.room_count()
    }

    fn register(&self, tx: mpsc::UnboundedSender<Outbound>) -> ConnId {
        let conn = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
        self.inner.conns.insert(
            conn,
            Conn {
                tx,
                last_seen: Instant::now(),
            },
        );
        conn
    }

    fn touch(&self, conn: ConnId) {
        if let Some(mut entry) = self.inner.conns.get_mut(&conn) {
            entry.last_seen = Instant::now();
        }
    }

    fn send(&self, conn: ConnId, message: ServerMessage) {
        if let Some(entry) = self.inner.conns.get(&conn) {
            let _ = entry.tx.send(Outbound::Message(message));
        }
    }

    fn apply(&self, deliveries: Vec<Delivery<ConnId>>) {
        for delivery in deliveries {
            match delivery {
                Delivery::Send { conn, message } => self.send(conn, message),
                Delivery::Close { conn } => {
                    if let Some((_, entry)) = self.inner.conns.remove(&conn) {
                        let _ = entry.tx.send(Outbound::Close);
                    }
                }
            }
        }
    }

    async fn handle(&self, conn: ConnId, room_id: &str, message: ClientMessage) {
        let mut registry = self.inner.registry.lock().await;
        let deliveries = match message {
            ClientMessage::Join {
                room_id: requested,
                peer_id,
                display_name,
                participant_id,
            } => {
                if requested != room_id {
                    warn!(conn, %requested, room = room_id, "join for a different room");
                    vec![Delivery::Send {
                        conn,
                        message: ServerMessage::JoinError {
                            reason: "room does not match the socket path".into(),
                        },
                    }]
                } else {
                    debug!(conn, room = room_id, peer = %peer_id, "join");
                    registry.join(room_id, peer_id, display_name, participant_id, conn)
                }
            }
            ClientMessage::Leave {
                room_id: requested,
                peer_id,
            } => {
                debug!(conn, room = %requested, peer = %peer_id, "leave");
                registry.leave(conn, &requested, &peer_id)
            }
            other => registry.relay(conn, other),
        };
        self.apply(deliveries);
    }

    async fn disconnect(&self, conn: ConnId) {
        self.inner.conns.remove(&conn);
        let deliveries = self.inner.registry.lock().await.disconnect(conn);
        self.apply(deliveries);
    }

    async fn reap_stale(&self) -> usize {
        let stale: Vec<ConnId> = self
            .inner
            .conns
            .iter()
            .filter(|entry| entry.last_seen.elapsed() > self.inner.stale_timeout)
            .map(|entry| *entry.key())
            .collect();
        for conn in &stale {
            if let Some((_, entry)) = self.inner.conns.remove(conn) {
                let _ = entry.tx.send(Outbound::Close);
            }
            self.disconnect(*conn).await;
        }
        stale.len()
    }
}

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
    connections: usize,
    rooms: usize,
}

async fn health(State(state): State<RelayState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        connections: state.connection_count(),
        rooms: state.room_count().await,
    })
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/:room_id", get(websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, state))
}

async fn handle_socket(socket: WebSocket, room_id: String, state: RelayState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let conn = state.register(tx);
    debug!(conn, room = %room_id, "socket connected");

    tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Message(message) => {
                    let Ok(json) = serde_json::to_string(&message) else {
                        continue;
                    };
                    if sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(conn, error = %err, "socket error");
                break;
            }
        };
        state.touch(conn);
        match frame {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => state.handle(conn, &room_id, message).await,
                Err(err) => {
                    warn!(conn, error = %err, "unparseable client message");
                    state.send(
                        conn,
                        ServerMessage::Error {
                            message: format!("invalid message: {err}"),
                        },
                    );
                }
            },
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    debug!(conn, room = %room_id, "socket closed");
    state.disconnect(conn).await;
}
