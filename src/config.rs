use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration shared by the router and gateway processes
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Subdomain router settings
    #[serde(default)]
    pub router: RouterConfig,

    /// Realtime gateway and submission API settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Log bus connection settings
    #[serde(default)]
    pub bus: BusConfig,

    /// External build scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    /// Listening port (default: 8000)
    #[serde(default = "default_router_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Base URL of the artifact store, e.g. `https://bucket.s3.region.amazonaws.com/__outputs`
    #[serde(default)]
    pub artifact_base: String,

    /// Host used when a request carries no usable host information
    #[serde(default = "default_host")]
    pub default_host: String,

    /// Slug used when the resolved host yields an empty label
    #[serde(default = "default_slug")]
    pub default_slug: String,

    /// Document served for `/` and extensionless paths
    #[serde(default = "default_index_document")]
    pub index_document: String,

    /// Upper bound on a single origin forward, in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle origin connections per host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle origin connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Redirect requests whose X-Forwarded-Proto is not https (default: false)
    #[serde(default)]
    pub force_https: bool,
}

impl RouterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.artifact_base.is_empty() {
            errors.push("router: 'artifact_base' is required (or set BASE_PATH)".to_string());
        } else if !is_http_url(&self.artifact_base) {
            errors.push(format!(
                "router: 'artifact_base' must be an http(s) URL, got '{}'",
                self.artifact_base
            ));
        }
        if self.default_slug.is_empty() {
            errors.push("router: 'default_slug' must not be empty".to_string());
        }
        if self.request_timeout_secs == 0 {
            errors.push("router: 'request_timeout_secs' must be greater than 0".to_string());
        }
        into_result(errors)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            port: default_router_port(),
            bind: default_bind_address(),
            artifact_base: String::new(),
            default_host: default_host(),
            default_slug: default_slug(),
            index_document: default_index_document(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            force_https: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Listening port (default: 9000)
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Base domain deployments are served under; project URLs are `{slug}.{platform_domain}`
    #[serde(default = "default_platform_domain")]
    pub platform_domain: String,

    /// Scheme used in returned project URLs (default: http)
    #[serde(default = "default_url_scheme")]
    pub url_scheme: String,

    /// URL pinged periodically to keep the deployment warm (optional)
    pub keepalive_url: Option<String>,

    /// Interval between keepalive pings in seconds (default: 840)
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Outbound frame buffer per realtime session (default: 256)
    #[serde(default = "default_session_buffer")]
    pub session_buffer: usize,

    /// Interval between server pings on realtime sessions in seconds (default: 30)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Sessions silent for this long are disconnected, in seconds (default: 90)
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,

    /// Largest accepted submission body in bytes (default: 64 KiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl GatewayConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.platform_domain.is_empty() {
            errors.push("gateway: 'platform_domain' must not be empty".to_string());
        }
        if let Some(ref url) = self.keepalive_url {
            if !is_http_url(url) {
                errors.push(format!("gateway: 'keepalive_url' must be an http(s) URL, got '{}'", url));
            }
        }
        if self.session_buffer == 0 {
            errors.push("gateway: 'session_buffer' must be greater than 0".to_string());
        }
        if self.ping_interval_secs == 0 || self.session_idle_timeout_secs < self.ping_interval_secs {
            errors.push(
                "gateway: 'session_idle_timeout_secs' must be at least 'ping_interval_secs' (> 0)"
                    .to_string(),
            );
        }
        into_result(errors)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_bind_address(),
            platform_domain: default_platform_domain(),
            url_scheme: default_url_scheme(),
            keepalive_url: None,
            keepalive_interval_secs: default_keepalive_interval(),
            session_buffer: default_session_buffer(),
            ping_interval_secs: default_ping_interval(),
            session_idle_timeout_secs: default_session_idle_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BusConfig {
    /// Bus connection URI (default: redis://127.0.0.1:6379)
    #[serde(default = "default_bus_uri")]
    pub uri: String,

    /// Wildcard pattern covering every project topic (default: logs:*)
    #[serde(default = "default_bus_pattern")]
    pub pattern: String,

    /// First reconnect delay in milliseconds (default: 500)
    #[serde(default = "default_reconnect_min")]
    pub reconnect_min_ms: u64,

    /// Reconnect delay ceiling in milliseconds (default: 30000)
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,
}

impl BusConfig {
    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.uri.is_empty() {
            errors.push("bus: 'uri' must not be empty (or set REDIS_URI)".to_string());
        }
        if self.pattern.is_empty() {
            errors.push("bus: 'pattern' must not be empty".to_string());
        }
        if self.reconnect_min_ms == 0 || self.reconnect_max_ms < self.reconnect_min_ms {
            errors.push(
                "bus: 'reconnect_max_ms' must be at least 'reconnect_min_ms' (> 0)".to_string(),
            );
        }
        into_result(errors)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            uri: default_bus_uri(),
            pattern: default_bus_pattern(),
            reconnect_min_ms: default_reconnect_min(),
            reconnect_max_ms: default_reconnect_max(),
        }
    }
}

/// Placement, sizing and credentials for ECS build tasks
///
/// # Security Warning
///
/// `access_key`, `secret_key` and `session_token` grant the ability to launch
/// tasks in the configured cluster. Prefer the environment variables (or the
/// standard AWS credential chain, used when no static key is configured) over
/// committing them to a config file.
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Region of the cluster, e.g. "ap-south-1"
    pub region: Option<String>,

    /// Cluster ARN or name
    pub cluster: Option<String>,

    /// Task definition ARN or family
    pub task_definition: Option<String>,

    /// Launch type (default: FARGATE)
    #[serde(default = "default_launch_type")]
    pub launch_type: String,

    /// Subnets the task is placed in
    #[serde(default)]
    pub subnets: Vec<String>,

    /// Security groups attached to the task
    #[serde(default)]
    pub security_groups: Vec<String>,

    /// Give the task a public IP (default: true)
    #[serde(default = "default_true")]
    pub assign_public_ip: bool,

    /// Static API credentials; both keys or neither
    pub access_key: Option<String>,
    pub secret_key: Option<String>,

    /// Session token for temporary credentials
    pub session_token: Option<String>,

    /// Override for the ECS endpoint URL, e.g. a local emulator
    pub endpoint: Option<String>,

    /// Submission timeout in seconds (default: 15)
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout_secs: u64,

    /// Name of the builder container inside the task (default: builder-image)
    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// Task CPU units override, e.g. "1024"
    pub cpu: Option<String>,

    /// Task memory override in MiB, e.g. "2048"
    pub memory: Option<String>,

    /// Extra environment passed to every build task
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl SchedulerConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let missing: Vec<String> = [
            ("region", self.region.is_none()),
            ("cluster", self.cluster.is_none()),
            ("task_definition", self.task_definition.is_none()),
        ]
        .into_iter()
        .filter(|(_, absent)| *absent)
        .map(|(field, _)| format!("'{}'", field))
        .collect();
        if !missing.is_empty() {
            errors.push(format!("scheduler: requires {}", missing.join(", ")));
        }

        if self.subnets.is_empty() {
            errors.push("scheduler: requires at least one subnet".to_string());
        }
        if self.access_key.is_some() != self.secret_key.is_some() {
            errors.push("scheduler: 'access_key' and 'secret_key' must be set together".to_string());
        }
        if self.session_token.is_some() && self.access_key.is_none() {
            errors.push("scheduler: 'session_token' needs 'access_key' and 'secret_key'".to_string());
        }
        if let Some(ref endpoint) = self.endpoint {
            if !is_http_url(endpoint) {
                errors.push(format!("scheduler: 'endpoint' must be an http(s) URL, got '{}'", endpoint));
            }
        }
        if self.submit_timeout_secs == 0 {
            errors.push("scheduler: 'submit_timeout_secs' must be greater than 0".to_string());
        }

        into_result(errors)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            region: None,
            cluster: None,
            task_definition: None,
            launch_type: default_launch_type(),
            subnets: Vec::new(),
            security_groups: Vec::new(),
            assign_public_ip: true,
            access_key: None,
            secret_key: None,
            session_token: None,
            endpoint: None,
            submit_timeout_secs: default_submit_timeout(),
            container_name: default_container_name(),
            cpu: None,
            memory: None,
            env: HashMap::new(),
        }
    }
}

// Default value functions
fn default_router_port() -> u16 {
    8000
}

fn default_gateway_port() -> u16 {
    9000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_slug() -> String {
    "localhost".to_string()
}

fn default_index_document() -> String {
    "index.html".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_platform_domain() -> String {
    "localhost:8000".to_string()
}

fn default_url_scheme() -> String {
    "http".to_string()
}

fn default_keepalive_interval() -> u64 {
    14 * 60
}

fn default_session_buffer() -> usize {
    256
}

fn default_ping_interval() -> u64 {
    30
}

fn default_session_idle_timeout() -> u64 {
    90
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_bus_uri() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_bus_pattern() -> String {
    "logs:*".to_string()
}

fn default_reconnect_min() -> u64 {
    500
}

fn default_reconnect_max() -> u64 {
    30_000
}

fn default_launch_type() -> String {
    "FARGATE".to_string()
}

fn default_container_name() -> String {
    "builder-image".to_string()
}

fn default_submit_timeout() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn into_result(errors: Vec<String>) -> Result<(), Vec<String>> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Split a comma separated environment value, dropping blanks
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment overrides using the deployment's variable names
    ///
    /// The lookup is injected so tests don't have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.router.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid port number, got '{}'", port))?;
        }
        if let Some(port) = lookup("GATEWAY_PORT") {
            self.gateway.port = port.parse().map_err(|_| {
                anyhow::anyhow!("GATEWAY_PORT must be a valid port number, got '{}'", port)
            })?;
        }
        if let Some(base) = lookup("BASE_PATH") {
            self.router.artifact_base = base;
        }
        if let Some(domain) = lookup("PLATFORM_DOMAIN") {
            self.gateway.platform_domain = domain;
        }
        if let Some(url) = lookup("KEEPALIVE_URL") {
            self.gateway.keepalive_url = Some(url);
        }
        if let Some(uri) = lookup("REDIS_URI") {
            self.bus.uri = uri;
        }
        if let Some(region) = lookup("BUCKET_REGION") {
            self.scheduler.region = Some(region);
        }
        if let Some(key) = lookup("ACCESS_KEY") {
            self.scheduler.access_key = Some(key);
        }
        if let Some(secret) = lookup("SECRET_KEY") {
            self.scheduler.secret_key = Some(secret);
        }
        if let Some(token) = lookup("SESSION_TOKEN").or_else(|| lookup("AWS_SESSION_TOKEN")) {
            self.scheduler.session_token = Some(token);
        }
        if let Some(cluster) = lookup("CLUSTER_ARM") {
            self.scheduler.cluster = Some(cluster);
        }
        if let Some(task) = lookup("TASK_ARM") {
            self.scheduler.task_definition = Some(task);
        }
        if let Some(groups) = lookup("SECURITY_GROUP") {
            self.scheduler.security_groups = split_list(&groups);
        }
        if let Some(subnets) = lookup("SUBNETS") {
            self.scheduler.subnets = split_list(&subnets);
        }
        Ok(())
    }

    /// Validate what the router process needs
    pub fn validate_router(&self) -> anyhow::Result<()> {
        self.router
            .validate()
            .map_err(|errors| anyhow::anyhow!("Configuration errors:\n  - {}", errors.join("\n  - ")))
    }

    /// Validate what the gateway process needs, reporting every problem at once
    pub fn validate_gateway(&self) -> anyhow::Result<()> {
        let errors: Vec<String> = [
            self.gateway.validate(),
            self.bus.validate(),
            self.scheduler.validate(),
        ]
        .into_iter()
        .filter_map(Result::err)
        .flatten()
        .collect();

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
