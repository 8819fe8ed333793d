use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tenantgate::bus::{LogBus, RedisBus};
use tenantgate::config::Config;
use tenantgate::dispatcher::{Dispatcher, PublicUrl};
use tenantgate::gateway::{GatewayServer, GatewayState, PKG_NAME, VERSION};
use tenantgate::keepalive::Keepalive;
use tenantgate::realtime::SessionSettings;
use tenantgate::relay::{Backoff, LogRelay};
use tenantgate::rooms::RoomRegistry;
use tenantgate::router::RouterServer;
use tenantgate::scheduler;
use tenantgate::topic::TopicPattern;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

const USAGE: &str = "usage: tenantgate <router|gateway> [config.toml]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Router,
    Gateway,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tenantgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let role = match args.next().as_deref() {
        Some("router") => Role::Router,
        Some("gateway") => Role::Gateway,
        Some("--version") | Some("-V") => {
            println!("{} {}", PKG_NAME, VERSION);
            return Ok(());
        }
        _ => anyhow::bail!(USAGE),
    };

    let config = load_config(args.next().map(PathBuf::from))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handles = match role {
        Role::Router => start_router(&config, shutdown_rx)?,
        Role::Gateway => start_gateway(&config, shutdown_rx).await?,
    };

    wait_for_signal().await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Load the file (if any), apply environment overrides
fn load_config(explicit: Option<PathBuf>) -> anyhow::Result<Config> {
    let mut config = match explicit {
        Some(path) => {
            let config = Config::load(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None if std::path::Path::new(DEFAULT_CONFIG_PATH).exists() => {
            let config = Config::load(DEFAULT_CONFIG_PATH)?;
            info!(path = DEFAULT_CONFIG_PATH, "Configuration loaded");
            config
        }
        None => {
            info!("No configuration file, using defaults and environment");
            Config::default()
        }
    };

    config.apply_env(|name| std::env::var(name).ok())?;
    Ok(config)
}

fn bind_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address '{}:{}': {}", bind, port, e)
    })
}

fn start_router(config: &Config, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<Vec<JoinHandle<()>>> {
    config.validate_router()?;

    let router_config = &config.router;
    let addr = bind_addr(&router_config.bind, router_config.port)?;
    let server = RouterServer::new(addr, router_config, shutdown_rx)?;

    info!(
        artifact_base = %router_config.artifact_base,
        default_slug = %router_config.default_slug,
        request_timeout_secs = router_config.request_timeout_secs,
        force_https = router_config.force_https,
        "Router configured"
    );

    let handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Router server error");
        }
    });

    Ok(vec![handle])
}

async fn start_gateway(
    config: &Config,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    config.validate_gateway()?;

    let gateway_config = &config.gateway;
    let addr = bind_addr(&gateway_config.bind, gateway_config.port)?;
    let mut handles = Vec::new();

    // Bus and relay
    let bus: Arc<dyn LogBus> = Arc::new(RedisBus::new(&config.bus.uri)?);
    let rooms = Arc::new(RoomRegistry::new());
    let relay = LogRelay::new(
        bus,
        Arc::clone(&rooms),
        TopicPattern::new(config.bus.pattern.clone()),
        Backoff::new(config.bus.reconnect_min(), config.bus.reconnect_max()),
        shutdown_rx.clone(),
    );
    let relay_stats = relay.stats();
    handles.push(tokio::spawn(relay.run()));

    // Scheduler and dispatcher
    let scheduler = scheduler::from_config(&config.scheduler).await?;
    info!(scheduler = scheduler.name(), "Build scheduler configured");
    let dispatcher = Dispatcher::new(
        scheduler,
        PublicUrl {
            scheme: gateway_config.url_scheme.clone(),
            platform_domain: gateway_config.platform_domain.clone(),
        },
    );

    // Keepalive
    if let Some(ref url) = gateway_config.keepalive_url {
        let keepalive = Keepalive::new(
            url.clone(),
            gateway_config.keepalive_interval(),
            shutdown_rx.clone(),
        )?;
        handles.push(tokio::spawn(keepalive.run()));
    }

    let server = GatewayServer::new(
        addr,
        GatewayState {
            dispatcher,
            rooms,
            relay_stats,
            session: SessionSettings {
                buffer: gateway_config.session_buffer,
                ping_interval: gateway_config.ping_interval(),
                idle_timeout: gateway_config.session_idle_timeout(),
            },
            max_body_bytes: gateway_config.max_body_bytes,
        },
        shutdown_rx,
    );

    handles.push(tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    }));

    Ok(handles)
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}
