//! Subdomain router: serves every tenant's static artifacts from one listener
//!
//! Each request is mapped to `artifact_base/{slug}/{path}` by [`RouteRules`]
//! and forwarded through the shared [`OriginClient`]. Forward failures are
//! turned into structured JSON errors; a bad request never affects the next.

use crate::config::RouterConfig;
use crate::error::{full_body, json_error_response, ProxyBody, ProxyErrorCode};
use crate::routing::{resolve_host, RouteRules, X_FORWARDED_HOST};
use crate::upstream::{ForwardError, ForwardStats, OriginClient, OriginRequest, PoolConfig};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Client-facing Host as received, before any rewriting
const X_ORIGINAL_HOST: &str = "x-original-host";

const HEALTH_PATH: &str = "/health";
const VERSION_PATH: &str = "/version";

/// Everything a request handler needs, shared across connections
struct RouterState {
    rules: RouteRules,
    client: OriginClient,
    request_timeout: Duration,
    force_https: bool,
}

/// The subdomain router server
pub struct RouterServer {
    bind_addr: SocketAddr,
    state: Arc<RouterState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RouterServer {
    pub fn new(
        bind_addr: SocketAddr,
        config: &RouterConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let client = OriginClient::new(PoolConfig {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: config.pool_idle_timeout(),
            connect_timeout: config.request_timeout(),
            request_timeout: config.request_timeout(),
        })?;

        Ok(Self {
            bind_addr,
            state: Arc::new(RouterState {
                rules: RouteRules::from_config(config),
                client,
                request_timeout: config.request_timeout(),
                force_https: config.force_https,
            }),
            shutdown_rx,
        })
    }

    /// Forward statistics (shared with the health endpoint)
    pub fn stats(&self) -> Arc<ForwardStats> {
        self.state.client.stats()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(
            addr = %self.bind_addr,
            artifact_base = %self.state.rules.artifact_base,
            "Router listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Router shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RouterState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    // Dropping the connection drops any in-flight handler future, which in
    // turn abandons its origin request
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<RouterState>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let started = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let proto = forwarded_proto(req.headers());
    let host = resolve_host(req.headers(), &uri, &state.rules.default_host);

    let response = if uri.path() == HEALTH_PATH {
        health_response(&state, req.headers())
    } else if uri.path() == VERSION_PATH {
        version_response()
    } else if state.force_https && needs_https_redirect(req.headers()) {
        build_https_redirect(&host, &uri)
    } else {
        proxy_request(req, &state, client_addr).await?
    };

    info!(
        method = %method,
        uri = %uri,
        host,
        proto,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request served"
    );

    Ok(response)
}

async fn proxy_request(
    req: Request<Incoming>,
    state: &RouterState,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let route = state.rules.route(&parts.headers, &parts.uri);

    // Generate or propagate request ID
    let request_id = parts
        .headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut headers = parts.headers;
    set_forwarded_headers(&mut headers, &route.host, client_addr, &request_id);

    debug!(
        host = %route.host,
        slug = %route.slug,
        target = %route.target,
        request_id,
        "Forwarding request"
    );

    let body = body.collect().await?.to_bytes();
    let origin_req = OriginRequest {
        method: parts.method,
        target: route.target.clone(),
        headers,
        body,
    };

    // The client deadline covers connect, headers and the streamed body
    let mut response = match state.client.forward(origin_req).await {
        Ok(response) => match origin_status_error(response.status()) {
            Some(code) => {
                warn!(
                    slug = %route.slug,
                    target = %route.target,
                    status = response.status().as_u16(),
                    "Origin returned an error status"
                );
                let message = match code {
                    ProxyErrorCode::ArtifactNotFound => {
                        format!("No artifact found for '{}'", route.slug)
                    }
                    _ => "Origin returned an error".to_string(),
                };
                json_error_response(code, message)
            }
            None => response,
        },
        Err(ForwardError::Timeout(_)) => {
            warn!(
                slug = %route.slug,
                target = %route.target,
                timeout_secs = state.request_timeout.as_secs(),
                "Request timed out"
            );
            json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    state.request_timeout.as_secs()
                ),
            )
        }
        Err(e) => {
            // Log detailed error internally, return generic message externally
            error!(slug = %route.slug, target = %route.target, error = %e, "Failed to forward request");
            forward_error_response(&e)
        }
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }

    Ok(response)
}

/// Set proxy headers on the outbound request.
///
/// `X-Forwarded-*` values are overwritten rather than appended so clients
/// can't spoof them; this router is assumed to be the first trusted hop
/// except for the scheme, which a TLS-terminating balancer may set.
fn set_forwarded_headers(
    headers: &mut HeaderMap,
    resolved_host: &str,
    client_addr: SocketAddr,
    request_id: &str,
) {
    let proto = forwarded_proto(headers);

    if let Some(original) = headers.get(header::HOST).cloned() {
        headers.insert(X_ORIGINAL_HOST, original);
    }

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Ok(value) = HeaderValue::from_str(resolved_host) {
        headers.insert(X_FORWARDED_HOST, value);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
}

/// Scheme the client used, as reported by a fronting balancer; defaults to http
fn forwarded_proto(headers: &HeaderMap) -> &'static str {
    match headers
        .get(X_FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or("").trim().to_ascii_lowercase())
    {
        Some(ref p) if p == "https" => "https",
        _ => "http",
    }
}

/// A request needs redirecting only when a balancer says it arrived over plain HTTP
fn needs_https_redirect(headers: &HeaderMap) -> bool {
    headers.contains_key(X_FORWARDED_PROTO) && forwarded_proto(headers) != "https"
}

/// Build an HTTPS redirect response (301 Moved Permanently)
fn build_https_redirect(host: &str, uri: &Uri) -> Response<ProxyBody> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let location = format!("https://{}{}", host, path);

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(header::LOCATION, location)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(full_body("Redirecting to HTTPS"))
        .expect("valid response with StatusCode enum and static headers")
}

/// Origin statuses that are reported as router errors instead of passed through
fn origin_status_error(status: StatusCode) -> Option<ProxyErrorCode> {
    match status {
        StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Some(ProxyErrorCode::ArtifactNotFound),
        s if s.is_server_error() => Some(ProxyErrorCode::OriginError),
        _ => None,
    }
}

fn forward_error_response(err: &ForwardError) -> Response<ProxyBody> {
    match err {
        ForwardError::Connect(_) => json_error_response(
            ProxyErrorCode::OriginUnreachable,
            "Failed to connect to artifact origin",
        ),
        ForwardError::InvalidTarget(_) => json_error_response(
            ProxyErrorCode::InvalidTarget,
            "Could not build origin URL for this host",
        ),
        ForwardError::Timeout(_) => json_error_response(
            ProxyErrorCode::RequestTimeout,
            "Artifact origin did not respond in time",
        ),
        ForwardError::Request(_) => json_error_response(
            ProxyErrorCode::OriginUnreachable,
            "Artifact origin connection failed",
        ),
    }
}

fn health_response(state: &RouterState, headers: &HeaderMap) -> Response<ProxyBody> {
    let stats = state.client.stats();
    let forwarded = headers.get(X_FORWARDED_PROTO).and_then(|v| v.to_str().ok());

    let body = serde_json::json!({
        "health": "ok",
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "basePath": state.rules.artifact_base,
        "protocol": forwarded_proto(headers),
        "forwardedProto": forwarded,
        "forwards": {
            "total": stats.get_total_forwards(),
            "failed": stats.get_failed_forwards(),
        },
    });

    json_response(StatusCode::OK, body.to_string())
}

fn version_response() -> Response<ProxyBody> {
    let body = serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    });
    json_response(StatusCode::OK, body.to_string())
}

fn json_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_forwarded_proto_defaults_to_http() {
        assert_eq!(forwarded_proto(&HeaderMap::new()), "http");
        assert_eq!(forwarded_proto(&headers(&[("x-forwarded-proto", "HTTPS")])), "https");
        assert_eq!(forwarded_proto(&headers(&[("x-forwarded-proto", "https, http")])), "https");
        assert_eq!(forwarded_proto(&headers(&[("x-forwarded-proto", "gopher")])), "http");
    }

    #[test]
    fn test_needs_https_redirect() {
        assert!(!needs_https_redirect(&HeaderMap::new()));
        assert!(needs_https_redirect(&headers(&[("x-forwarded-proto", "http")])));
        assert!(!needs_https_redirect(&headers(&[("x-forwarded-proto", "https")])));
    }

    #[test]
    fn test_build_https_redirect() {
        let uri: Uri = "/docs/page?x=1".parse().unwrap();
        let response = build_https_redirect("demo.platform.test", &uri);

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://demo.platform.test/docs/page?x=1"
        );
    }

    #[test]
    fn test_set_forwarded_headers_overwrites_client_values() {
        let mut h = headers(&[
            ("host", "demo.platform.test:8000"),
            ("x-forwarded-for", "6.6.6.6"),
            ("x-forwarded-host", "evil.example.com"),
        ]);
        let addr: SocketAddr = "10.0.0.7:51234".parse().unwrap();

        set_forwarded_headers(&mut h, "demo.platform.test", addr, "req-1");

        assert_eq!(h.get(X_FORWARDED_FOR).unwrap(), "10.0.0.7");
        assert_eq!(h.get(X_FORWARDED_HOST).unwrap(), "demo.platform.test");
        assert_eq!(h.get(X_FORWARDED_PROTO).unwrap(), "http");
        assert_eq!(h.get(X_ORIGINAL_HOST).unwrap(), "demo.platform.test:8000");
        assert_eq!(h.get(X_REQUEST_ID).unwrap(), "req-1");
    }

    #[test]
    fn test_set_forwarded_headers_keeps_balancer_scheme() {
        let mut h = headers(&[("x-forwarded-proto", "https")]);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        set_forwarded_headers(&mut h, "localhost", addr, "req-2");
        assert_eq!(h.get(X_FORWARDED_PROTO).unwrap(), "https");
    }

    #[test]
    fn test_origin_status_error_mapping() {
        assert_eq!(
            origin_status_error(StatusCode::NOT_FOUND),
            Some(ProxyErrorCode::ArtifactNotFound)
        );
        assert_eq!(
            origin_status_error(StatusCode::FORBIDDEN),
            Some(ProxyErrorCode::ArtifactNotFound)
        );
        assert_eq!(
            origin_status_error(StatusCode::SERVICE_UNAVAILABLE),
            Some(ProxyErrorCode::OriginError)
        );
        assert_eq!(origin_status_error(StatusCode::OK), None);
        assert_eq!(origin_status_error(StatusCode::NOT_MODIFIED), None);
    }

    #[test]
    fn test_forward_error_response_invalid_target() {
        let response = forward_error_response(&ForwardError::InvalidTarget("bad".to_string()));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "INVALID_TARGET");
    }

    #[tokio::test]
    async fn test_health_response_body() {
        let config = RouterConfig {
            artifact_base: "https://bucket.example.com/__outputs".to_string(),
            ..Default::default()
        };
        let (_tx, rx) = watch::channel(false);
        let server = RouterServer::new("127.0.0.1:0".parse().unwrap(), &config, rx).unwrap();

        let response = health_response(&server.state, &headers(&[("x-forwarded-proto", "https")]));
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["health"], "ok");
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["basePath"], "https://bucket.example.com/__outputs");
        assert_eq!(json["protocol"], "https");
        assert_eq!(json["forwardedProto"], "https");
        assert!(json["timestamp"].is_string());
    }
}
