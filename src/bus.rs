//! Log bus transports
//!
//! The relay only needs one thing from a bus: a pattern subscription that
//! yields `(topic, payload)` pairs in publish order. [`LogBus`] captures that,
//! with a Redis implementation for production and an in-process one for tests
//! and single-node setups.

use crate::topic::TopicPattern;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// A message received from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

/// Stream of bus messages; ends when the underlying connection is lost
pub type BusStream = BoxStream<'static, BusMessage>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connect(String),
    #[error("subscription to '{pattern}' failed: {reason}")]
    Subscribe { pattern: String, reason: String },
}

/// A publish/subscribe transport with pattern subscriptions
#[async_trait]
pub trait LogBus: Send + Sync {
    /// Open a fresh subscription. Each call uses its own connection so a
    /// reconnect after a dropped stream starts clean.
    async fn subscribe(&self, pattern: &TopicPattern) -> Result<BusStream, BusError>;

    /// Short description for logs, without credentials
    fn describe(&self) -> String;
}

/// Redis pub/sub via `PSUBSCRIBE`
pub struct RedisBus {
    client: redis::Client,
    display: String,
}

impl RedisBus {
    pub fn new(uri: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(uri).map_err(|e| BusError::Connect(e.to_string()))?;
        let display = format!("redis {}", redact_uri(uri));
        Ok(Self { client, display })
    }
}

/// Drop any `user:password@` part of a connection URI
fn redact_uri(uri: &str) -> &str {
    let rest = uri.split_once("://").map(|(_, rest)| rest).unwrap_or(uri);
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => &rest[at + 1..],
        None => rest,
    }
}

#[async_trait]
impl LogBus for RedisBus {
    async fn subscribe(&self, pattern: &TopicPattern) -> Result<BusStream, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        pubsub
            .psubscribe(pattern.as_str())
            .await
            .map_err(|e| BusError::Subscribe {
                pattern: pattern.as_str().to_string(),
                reason: e.to_string(),
            })?;

        debug!(bus = %self.display, pattern = pattern.as_str(), "Pattern subscription established");

        let messages = pubsub.into_on_message().filter_map(|msg| async move {
            let topic = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(BusMessage { topic, payload }),
                Err(e) => {
                    warn!(topic, error = %e, "Dropping non-text bus payload");
                    None
                }
            }
        });

        Ok(messages.boxed())
    }

    fn describe(&self) -> String {
        self.display.clone()
    }
}

/// In-process bus backed by a tokio broadcast channel
pub struct MemoryBus {
    sender: Mutex<broadcast::Sender<BusMessage>>,
    capacity: usize,
    failing_subscribes: AtomicUsize,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Mutex::new(sender),
            capacity,
            failing_subscribes: AtomicUsize::new(0),
        }
    }

    /// Publish a message; returns how many subscriptions received it
    pub fn publish(&self, topic: &str, payload: &str) -> usize {
        let message = BusMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        };
        self.sender.lock().send(message).unwrap_or(0)
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.sender.lock().receiver_count()
    }

    /// End every open subscription stream, as a dropped connection would
    pub fn drop_connections(&self) {
        let (sender, _) = broadcast::channel(self.capacity);
        *self.sender.lock() = sender;
    }

    /// Make the next `n` subscribe calls fail
    pub fn fail_next_subscribes(&self, n: usize) {
        self.failing_subscribes.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl LogBus for MemoryBus {
    async fn subscribe(&self, pattern: &TopicPattern) -> Result<BusStream, BusError> {
        let fail = self
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(BusError::Connect("memory bus unavailable".to_string()));
        }

        let receiver = self.sender.lock().subscribe();
        let pattern = pattern.clone();

        let messages = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |message| std::future::ready(pattern.matches(&message.topic)));

        Ok(messages.boxed())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
