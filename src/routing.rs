//! Request-to-origin mapping for the subdomain router
//!
//! Everything here is a pure function of request metadata so the routing
//! rules can be tested without a network stack:
//! - the host is resolved from `X-Forwarded-Host`, then `Host`, then the URI
//!   authority, then a configured default
//! - the tenant slug is the first DNS label of that host
//! - extensionless paths fall back to the site's index document
//! - the origin URL is `artifact_base/slug/path`

use crate::config::RouterConfig;
use hyper::header::HOST;
use hyper::{HeaderMap, Uri};

/// Header carrying the client-facing host when behind another proxy
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// Normalize a raw host value: strip the port, lowercase, and reject anything
/// that is not a plain DNS name.
fn normalize_host(raw: &str) -> Option<String> {
    let hostname = raw.trim().split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen, and dot only; keeps header junk out of slugs and logs
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

/// Resolve the client-facing hostname of a request.
///
/// Candidates are tried in priority order and the first usable one wins; a
/// missing, empty or malformed candidate falls through to the next.
pub fn resolve_host(headers: &HeaderMap, uri: &Uri, default_host: &str) -> String {
    let forwarded = headers
        .get(X_FORWARDED_HOST)
        .and_then(|v| v.to_str().ok())
        // A proxy chain appends; the first entry is the original client host
        .and_then(|v| v.split(',').next());
    let host = headers.get(HOST).and_then(|v| v.to_str().ok());
    let authority = uri.host();

    [forwarded, host, authority]
        .into_iter()
        .flatten()
        .find_map(normalize_host)
        .unwrap_or_else(|| default_host.to_string())
}

/// Derive the tenant slug from a hostname: everything before the first dot.
///
/// A host without a dot is its own slug; an empty label yields `default_slug`.
pub fn derive_slug(host: &str, default_slug: &str) -> String {
    match host.split('.').next() {
        Some(label) if !label.is_empty() => label.to_string(),
        _ => default_slug.to_string(),
    }
}

/// Collapse `.`/`..` segments (including percent-encoded dots) so a request
/// can never climb out of its slug's prefix
fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/').skip(1) {
        match segment.to_ascii_lowercase().as_str() {
            "." | "%2e" => {}
            ".." | "%2e%2e" | ".%2e" | "%2e." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Compute the path forwarded to the origin.
///
/// `/` and any path whose final segment has no `.` are rewritten to the index
/// document so client-side routes resolve to the same entry point.
pub fn forward_path(path: &str, index_document: &str) -> String {
    let path = if path.is_empty() { "/" } else { path };
    let path = normalize_path(path);
    let last_segment = path.rsplit('/').next().unwrap_or("");

    if path == "/" || !last_segment.contains('.') {
        format!("/{}", index_document.trim_start_matches('/'))
    } else {
        path
    }
}

/// Artifact prefix for a slug: `artifact_base + "/" + slug`
pub fn artifact_prefix(artifact_base: &str, slug: &str) -> String {
    format!("{}/{}", artifact_base.trim_end_matches('/'), slug)
}

/// A fully resolved route for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Resolved client-facing hostname
    pub host: String,
    /// Tenant slug derived from the host
    pub slug: String,
    /// Path forwarded to the origin (after index fallback)
    pub path: String,
    /// Absolute origin URL including query string
    pub target: String,
}

/// Routing rules taken from the router configuration
#[derive(Debug, Clone)]
pub struct RouteRules {
    pub artifact_base: String,
    pub default_host: String,
    pub default_slug: String,
    pub index_document: String,
}

impl RouteRules {
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            artifact_base: config.artifact_base.clone(),
            default_host: config.default_host.clone(),
            default_slug: config.default_slug.clone(),
            index_document: config.index_document.clone(),
        }
    }

    /// Map request metadata to its origin target
    pub fn route(&self, headers: &HeaderMap, uri: &Uri) -> Route {
        let host = resolve_host(headers, uri, &self.default_host);
        let slug = derive_slug(&host, &self.default_slug);
        let path = forward_path(uri.path(), &self.index_document);

        let mut target = format!("{}{}", artifact_prefix(&self.artifact_base, &slug), path);
        if let Some(query) = uri.query() {
            target.push('?');
            target.push_str(query);
        }

        Route {
            host,
            slug,
            path,
            target,
        }
    }
}
