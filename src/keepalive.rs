//! Periodic keepalive ping
//!
//! Some hosting platforms idle a service that receives no external traffic.
//! The gateway can ping its own public health URL on an interval to stay warm.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Timeout for a single ping
const PING_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Keepalive {
    client: reqwest::Client,
    url: String,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl Keepalive {
    pub fn new(url: String, interval: Duration, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PING_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build keepalive client: {}", e))?;

        Ok(Self {
            client,
            url,
            interval,
            shutdown_rx,
        })
    }

    /// Ping once per interval until shutdown. The first ping waits one interval.
    pub async fn run(mut self) {
        info!(
            url = %self.url,
            interval_secs = self.interval.as_secs(),
            "Keepalive started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.ping().await {
                        Ok(status) if status.is_success() => {
                            debug!(url = %self.url, status = status.as_u16(), "Keepalive ping ok");
                        }
                        Ok(status) => {
                            warn!(url = %self.url, status = status.as_u16(), "Keepalive ping returned an error status");
                        }
                        Err(e) => {
                            warn!(url = %self.url, error = %e, "Keepalive ping failed");
                        }
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Keepalive stopping");
                        break;
                    }
                }
            }
        }
    }

    pub async fn ping(&self) -> Result<reqwest::StatusCode, reqwest::Error> {
        let response = self.client.get(&self.url).send().await?;
        Ok(response.status())
    }
}
