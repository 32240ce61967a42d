use std::time::Duration;

use async_trait::async_trait;
use duet_proto::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use super::{SignalingConnector, SignalingLink, TaskSet, TransportError};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to the relay over a WebSocket, one socket per `connect` call.
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(signaling_url: &str, room_id: &str) -> Result<Self, TransportError> {
        Ok(Self {
            url: derive_websocket_url(signaling_url, room_id)?,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self) -> Result<SignalingLink, TransportError> {
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|err| TransportError::Signaling(format!("websocket connect failed: {err}")))?;
        tracing::debug!(
            target = "duet::signaling",
            url = %self.url,
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let mut tasks = TaskSet::default();

        tasks.push(tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "duet::signaling", error = %err, "failed to encode signaling message");
                    }
                }
            }
            let _ = ws_write.close().await;
        }));

        tasks.push(tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target = "duet::signaling",
                                    "signaling websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target = "duet::signaling",
                                    "signaling websocket error: {err}"
                                );
                            }
                        }
                        break;
                    }
                };
                tracing::trace!(
                    target = "duet::signaling",
                    event = "ws_in",
                    len = text.len()
                );
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "duet::signaling", error = %err, "ignoring malformed relay message");
                    }
                }
            }
        }));

        let keepalive_tx = send_tx.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if keepalive_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        }));

        Ok(SignalingLink {
            outbound: send_tx,
            inbound: inbound_rx,
            tasks,
        })
    }
}

/// Accepts `http(s)://`, `ws(s)://` or a bare `host:port` and produces the
/// relay's room endpoint `.../ws/<room>`.
pub fn derive_websocket_url(signaling_url: &str, room_id: &str) -> Result<Url, TransportError> {
    let with_scheme = if signaling_url.contains("://") {
        signaling_url.to_string()
    } else {
        format!("ws://{signaling_url}")
    };
    let mut url = Url::parse(&with_scheme)
        .map_err(|err| TransportError::Setup(format!("invalid signaling url: {err}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::Setup(format!(
                "unsupported signaling scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Setup("failed to set websocket scheme".into()))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| TransportError::Setup("signaling url cannot be a base".into()))?;
        segments.pop_if_empty().push("ws").push(room_id);
    }
    Ok(url)
}
