//! Realtime sessions: WebSocket framing, subscribe protocol and lifecycle
//!
//! Every frame in either direction is a JSON text message
//! `{"event": "<name>", "data": "<string>"}`. Clients send `subscribe` and
//! `unsubscribe` with a project slug; the server answers with `message`
//! frames (join/leave acknowledgements, then raw log lines) and `error`
//! frames for anything it can't parse.

use crate::error::{full_body, ProxyBody};
use crate::rooms::RoomRegistry;
use crate::topic::LOG_TOPIC_PREFIX;
use futures::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub const EVENT_SUBSCRIBE: &str = "subscribe";
pub const EVENT_UNSUBSCRIBE: &str = "unsubscribe";
pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_ERROR: &str = "error";

/// Longest room name a client may subscribe to
const MAX_ROOM_LEN: usize = 128;

/// One realtime frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: String,
}

impl Frame {
    pub fn new(event: &str, data: impl Into<String>) -> Self {
        Self {
            event: event.to_string(),
            data: data.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"event":"{}","data":""}}"#, self.event)
        })
    }
}

/// Encode a `message` frame, as sent for acks and log lines
pub fn message_frame(data: &str) -> String {
    Frame::new(EVENT_MESSAGE, data).to_json()
}

/// Encode an `error` frame
pub fn error_frame(reason: &str) -> String {
    Frame::new(EVENT_ERROR, reason).to_json()
}

/// A request from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Subscribe(String),
    Unsubscribe(String),
}

/// Parse a client text frame into an event
pub fn parse_client_frame(text: &str) -> Result<ClientEvent, String> {
    let frame: Frame =
        serde_json::from_str(text).map_err(|e| format!("invalid frame: {}", e))?;
    let room = normalize_room(&frame.data)
        .ok_or_else(|| format!("invalid room name '{}'", frame.data))?;

    match frame.event.as_str() {
        EVENT_SUBSCRIBE => Ok(ClientEvent::Subscribe(room)),
        EVENT_UNSUBSCRIBE => Ok(ClientEvent::Unsubscribe(room)),
        other => Err(format!("unknown event '{}'", other)),
    }
}

/// Normalize a requested room name.
///
/// Clients may pass either the slug or its topic (`logs:{slug}`); both name
/// the same room.
pub fn normalize_room(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let room = trimmed.strip_prefix(LOG_TOPIC_PREFIX).unwrap_or(trimmed);

    if room.is_empty() || room.len() > MAX_ROOM_LEN || room.chars().any(char::is_control) {
        return None;
    }
    Some(room.to_string())
}

/// Per-session timing and buffering
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Outbound frames buffered before new ones are dropped
    pub buffer: usize,
    /// Interval between server pings
    pub ping_interval: Duration,
    /// A session that sends nothing (including pongs) for this long is closed
    pub idle_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            buffer: 256,
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Check if a request is a WebSocket upgrade request
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let upgrades_to_websocket = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    has_upgrade_connection && upgrades_to_websocket
}

/// Accept a WebSocket upgrade and run the session in the background.
///
/// Returns the `101 Switching Protocols` response, or `400` if the handshake
/// headers are incomplete.
pub fn accept_upgrade(
    req: Request<Incoming>,
    rooms: Arc<RoomRegistry>,
    settings: SessionSettings,
) -> Response<ProxyBody> {
    let key = req.headers().get(header::SEC_WEBSOCKET_KEY).cloned();
    let version_ok = req
        .headers()
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(|v| v.as_bytes() == b"13")
        .unwrap_or(false);

    let key = match key {
        Some(key) if *req.method() == Method::GET && version_ok => key,
        _ => return bad_handshake(),
    };

    let accept = derive_accept_key(key.as_bytes());
    let accept = match HeaderValue::from_str(&accept) {
        Ok(value) => value,
        Err(_) => return bad_handshake(),
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                    .await;
                run_session(ws, rooms, settings).await;
            }
            Err(e) => {
                error!(error = %e, "Failed to upgrade realtime connection");
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(full_body(""))
        .expect("valid response with StatusCode enum and static headers")
}

fn bad_handshake() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(full_body("Invalid WebSocket handshake"))
        .expect("valid response with StatusCode enum and static headers")
}

/// Run a session from upgrade to disconnect.
///
/// A writer task drains the session's outbox and sends pings; this task
/// reads client frames. Whichever finishes first ends the session, after
/// which it is removed from every room.
pub async fn run_session<S>(ws: WebSocketStream<S>, rooms: Arc<RoomRegistry>, settings: SessionSettings)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (outbox, mut send_rx) = mpsc::channel::<Arc<String>>(settings.buffer.max(1));
    let session = rooms.register(outbox.clone());
    info!(session = %session, "Realtime session connected");

    let ping_interval = settings.ping_interval;
    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        // Skip the immediate first tick
        ping.tick().await;

        loop {
            tokio::select! {
                frame = send_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_tx.send(Message::text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader = async {
        loop {
            let next = match tokio::time::timeout(settings.idle_timeout, ws_rx.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(
                        session = %session,
                        idle_secs = settings.idle_timeout.as_secs(),
                        "Realtime session idle, disconnecting"
                    );
                    break;
                }
            };

            let text = match next {
                Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => text.to_string(),
                    Err(_) => {
                        send_frame(&outbox, error_frame("binary frames must be UTF-8 JSON")).await;
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                // Pings are answered by the protocol layer; any frame counts as activity
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(session = %session, error = %e, "Realtime read error");
                    break;
                }
            };

            match parse_client_frame(&text) {
                Ok(ClientEvent::Subscribe(room)) => {
                    let ack = message_frame(&format!("Joined {}", room));
                    if rooms.join_with_ack(session, &room, &ack) {
                        info!(session = %session, room, "Session joined room");
                    }
                }
                Ok(ClientEvent::Unsubscribe(room)) => {
                    if rooms.leave(session, &room) {
                        info!(session = %session, room, "Session left room");
                    }
                    send_frame(&outbox, message_frame(&format!("Left {}", room))).await;
                }
                Err(reason) => {
                    debug!(session = %session, reason, "Rejected realtime frame");
                    send_frame(&outbox, error_frame(&reason)).await;
                }
            }
        }
    };

    tokio::select! {
        _ = reader => {}
        _ = &mut writer => {}
    }

    rooms.disconnect(session);
    writer.abort();
    info!(session = %session, "Realtime session closed");
}

async fn send_frame(outbox: &mpsc::Sender<Arc<String>>, frame: String) {
    // Only fails once the writer is gone, and the reader stops right after
    let _ = outbox.send(Arc::new(frame)).await;
}
