//! Pooled HTTP client for forwarding requests to the artifact origin
//!
//! The origin is usually an object store behind HTTPS, so forwards go through
//! a single shared `reqwest` client that keeps idle connections per host.

use crate::error::{BoxError, ProxyBody};
use futures::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{self, HeaderMap, HeaderName};
use hyper::{Method, Response};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Headers that describe a single hop and must not be forwarded
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Error type for origin forwards
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// The origin could not be reached
    #[error("origin unreachable: {0}")]
    Connect(#[source] reqwest::Error),
    /// The origin did not finish (connect, headers and body) within the request timeout
    #[error("origin timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    /// The origin connection failed mid-request
    #[error("origin request failed: {0}")]
    Request(#[source] reqwest::Error),
    /// The target URL was rejected before sending
    #[error("invalid target '{0}'")]
    InvalidTarget(String),
}

impl From<reqwest::Error> for ForwardError {
    fn from(err: reqwest::Error) -> Self {
        // A connect timeout is also `is_connect`; report it as a timeout
        if err.is_timeout() {
            ForwardError::Timeout(err)
        } else if err.is_connect() {
            ForwardError::Connect(err)
        } else if err.is_builder() {
            ForwardError::InvalidTarget(err.to_string())
        } else {
            ForwardError::Request(err)
        }
    }
}

/// Statistics for origin forwards
#[derive(Debug, Default)]
pub struct ForwardStats {
    /// Total number of forwards attempted
    pub total_forwards: AtomicU64,
    /// Forwards that produced no origin response
    pub failed_forwards: AtomicU64,
}

impl ForwardStats {
    pub fn record_forward(&self) {
        self.total_forwards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_forwards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_forwards(&self) -> u64 {
        self.total_forwards.load(Ordering::Relaxed)
    }

    pub fn get_failed_forwards(&self) -> u64 {
        self.failed_forwards.load(Ordering::Relaxed)
    }
}

/// Configuration for the origin connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Connect timeout for new origin connections
    pub connect_timeout: Duration,
    /// Deadline for a whole forward, including reading the response body
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// A request ready to be sent to the origin
#[derive(Debug)]
pub struct OriginRequest {
    pub method: Method,
    /// Absolute origin URL
    pub target: String,
    /// Headers as received from the client, plus proxy headers
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Shared client for forwarding to the artifact origin
pub struct OriginClient {
    client: reqwest::Client,
    stats: Arc<ForwardStats>,
    config: PoolConfig,
}

impl OriginClient {
    pub fn new(config: PoolConfig) -> anyhow::Result<Self> {
        // Redirects are followed so bucket-level redirects stay invisible to clients
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build origin client: {}", e))?;

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Origin client initialized"
        );

        Ok(Self {
            client,
            stats: Arc::new(ForwardStats::default()),
            config,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to the origin and stream its response back.
    ///
    /// The outbound Host header is left to the client so it always matches
    /// the target, not the client-facing host.
    pub async fn forward(&self, req: OriginRequest) -> Result<Response<ProxyBody>, ForwardError> {
        self.stats.record_forward();

        let mut headers = req.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let result = self
            .client
            .request(req.method, &req.target)
            .headers(headers)
            .body(req.body)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let status = response.status();
        let mut response_headers = response.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let stream = response
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as BoxError);
        let body = StreamBody::new(stream).boxed_unsync();

        let mut proxied = Response::new(body);
        *proxied.status_mut() = status;
        *proxied.headers_mut() = response_headers;
        Ok(proxied)
    }
}

/// Remove hop-by-hop headers, including any named in the Connection header
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}
