//! Gateway server: project submission API plus realtime log sessions
//!
//! Routes:
//! - `POST /project` queues a build and returns its slug and public URL
//! - any WebSocket upgrade starts a realtime session
//! - `GET /health`, `GET /version`
//!
//! Every plain HTTP response carries permissive CORS headers so browser
//! front-ends on other origins can call the API.

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::error::{full_body, ProxyBody};
use crate::realtime::{accept_upgrade, is_websocket_upgrade, SessionSettings};
use crate::relay::RelayStats;
use crate::rooms::RoomRegistry;
use http_body_util::{BodyExt, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Shared state behind every gateway connection
pub struct GatewayState {
    pub dispatcher: Dispatcher,
    pub rooms: Arc<RoomRegistry>,
    pub relay_stats: Arc<RelayStats>,
    pub session: SessionSettings,
    pub max_body_bytes: usize,
}

pub struct GatewayServer {
    bind_addr: SocketAddr,
    state: Arc<GatewayState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(bind_addr: SocketAddr, state: GatewayState, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state: Arc::new(state),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(
            addr = %self.bind_addr,
            scheduler = self.state.dispatcher.scheduler_name(),
            "Gateway listening"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_gateway_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Gateway connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept gateway connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_gateway_connection(stream: TcpStream, state: Arc<GatewayState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_gateway_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Gateway connection error: {}", e))?;

    Ok(())
}

async fn handle_gateway_request(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Gateway request");

    if is_websocket_upgrade(&req) {
        return Ok(accept_upgrade(req, Arc::clone(&state.rooms), state.session.clone()));
    }

    let mut response = match (&method, path.as_str()) {
        (&Method::OPTIONS, _) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(full_body(""))
            .expect("valid response with StatusCode enum"),

        (&Method::GET, "/health") => {
            let rooms = state.rooms.stats();
            let relay = &state.relay_stats;
            let body = serde_json::json!({
                "health": "ok",
                "sessions": rooms.sessions,
                "rooms": rooms.rooms,
                "droppedFrames": rooms.dropped_frames,
                "relay": {
                    "connected": relay.is_connected(),
                    "messages": relay.get_messages(),
                    "delivered": relay.get_delivered(),
                    "reconnects": relay.get_reconnects(),
                },
                "scheduler": state.dispatcher.scheduler_name(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::GET, "/version") => {
            let body = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::POST, "/project") => submit_project(req, &state).await,

        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    };

    apply_cors(response.headers_mut());
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct ProjectRequest {
    #[serde(rename = "gitURL")]
    git_url: Option<String>,
    slug: Option<String>,
}

async fn submit_project(req: Request<Incoming>, state: &GatewayState) -> Response<ProxyBody> {
    let body = match read_body(req, state.max_body_bytes).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let request: ProjectRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Rejected project submission body");
            return error_response(StatusCode::BAD_REQUEST, "body must be JSON like {\"gitURL\": \"...\"}");
        }
    };

    let git_url = request.git_url.unwrap_or_default();
    match state.dispatcher.submit(&git_url, request.slug.as_deref()).await {
        Ok(submission) => {
            let body = serde_json::json!({
                "status": "queued",
                "data": submission,
            });
            json_response(StatusCode::OK, body.to_string())
        }
        Err(e) if e.is_client_error() => {
            warn!(error = %e, "Invalid project submission");
            error_response(StatusCode::BAD_REQUEST, &e.to_string())
        }
        Err(e @ DispatchError::Scheduler(_)) => error_response(StatusCode::BAD_GATEWAY, &e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// Collect a request body, refusing anything over `limit` bytes
async fn read_body(req: Request<Incoming>, limit: usize) -> Result<Bytes, Response<ProxyBody>> {
    match Limited::new(req.into_body(), limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => {
            if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                Err(error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"))
            } else {
                debug!(error = %e, "Failed to read request body");
                Err(error_response(StatusCode::BAD_REQUEST, "failed to read request body"))
            }
        }
    }
}

fn apply_cors(headers: &mut hyper::HeaderMap) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = serde_json::json!({
        "status": "error",
        "error": message,
    });
    json_response(status, body.to_string())
}
