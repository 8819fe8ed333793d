//! Log relay: one bus subscription per process, fanned out to rooms
//!
//! The relay holds a single wildcard subscription for the life of the
//! process. Each message is routed to the room named by its topic and
//! forwarded as-is. When the bus connection drops the relay reconnects with
//! exponential backoff; messages published during the outage are lost.

use crate::bus::{BusMessage, LogBus};
use crate::realtime::message_frame;
use crate::rooms::RoomRegistry;
use crate::topic::TopicPattern;
use futures::StreamExt;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Exponential reconnect delay between `min` and `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Delay before the next attempt; doubles each call up to `max`
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Add up to 10% random jitter so instances don't reconnect in lockstep
fn jittered(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Counters exposed on the gateway health endpoint
#[derive(Debug, Default)]
pub struct RelayStats {
    pub messages: AtomicU64,
    pub delivered: AtomicU64,
    pub reconnects: AtomicU64,
    pub connected: AtomicBool,
}

impl RelayStats {
    pub fn get_messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn get_delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn get_reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

pub struct LogRelay {
    bus: Arc<dyn LogBus>,
    rooms: Arc<RoomRegistry>,
    pattern: TopicPattern,
    backoff: Backoff,
    stats: Arc<RelayStats>,
    shutdown_rx: watch::Receiver<bool>,
}

impl LogRelay {
    pub fn new(
        bus: Arc<dyn LogBus>,
        rooms: Arc<RoomRegistry>,
        pattern: TopicPattern,
        backoff: Backoff,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bus,
            rooms,
            pattern,
            backoff,
            stats: Arc::new(RelayStats::default()),
            shutdown_rx,
        }
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Run until shutdown. Bus failures are logged and retried, never returned.
    pub async fn run(mut self) {
        info!(bus = %self.bus.describe(), pattern = self.pattern.as_str(), "Log relay started");
        let mut attempt: u64 = 0;
        let mut stopping = false;

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            if attempt > 0 {
                self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            }
            attempt += 1;

            match self.bus.subscribe(&self.pattern).await {
                Ok(mut stream) => {
                    info!(bus = %self.bus.describe(), "Log bus subscription active");
                    self.stats.connected.store(true, Ordering::Relaxed);
                    self.backoff.reset();

                    loop {
                        tokio::select! {
                            message = stream.next() => {
                                match message {
                                    Some(message) => self.dispatch(message),
                                    None => break,
                                }
                            }
                            changed = self.shutdown_rx.changed() => {
                                if changed.is_err() || *self.shutdown_rx.borrow() {
                                    stopping = true;
                                    break;
                                }
                            }
                        }
                    }

                    self.stats.connected.store(false, Ordering::Relaxed);
                    if stopping {
                        break;
                    }
                    warn!(bus = %self.bus.describe(), "Log bus connection lost");
                }
                Err(e) => {
                    warn!(bus = %self.bus.describe(), error = %e, "Log bus subscription failed");
                }
            }

            let delay = jittered(self.backoff.next_delay());
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to log bus");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.shutdown_rx.changed() => {
                    // A dropped sender counts as shutdown
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Log relay shutting down");
    }

    fn dispatch(&self, message: BusMessage) {
        self.stats.messages.fetch_add(1, Ordering::Relaxed);

        let Some(slug) = self.pattern.slug_of(&message.topic) else {
            debug!(topic = %message.topic, "Ignoring message outside the log pattern");
            return;
        };

        let delivered = self.rooms.broadcast(slug, &message_frame(&message.payload));
        self.stats
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        debug!(slug, delivered, "Relayed log line");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::realtime::Frame;
    use tokio::sync::mpsc;

    fn frame_data(raw: &str) -> String {
        serde_json::from_str::<Frame>(raw).unwrap().data
    }

    async fn wait_for_subscribers(bus: &MemoryBus, n: usize) {
        for _ in 0..200 {
            if bus.subscriber_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("bus never reached {} subscribers", n);
    }

    fn relay(
        bus: Arc<MemoryBus>,
        rooms: Arc<RoomRegistry>,
    ) -> (LogRelay, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let relay = LogRelay::new(
            bus,
            rooms,
            TopicPattern::default(),
            Backoff::new(Duration::from_millis(10), Duration::from_millis(40)),
            rx,
        );
        (relay, tx)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2000));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let d = jittered(Duration::from_millis(1000));
            assert!(d >= Duration::from_millis(1000) && d <= Duration::from_millis(1100));
        }
    }

    #[tokio::test]
    async fn test_relay_routes_by_slug() {
        let bus = Arc::new(MemoryBus::new(64));
        let rooms = Arc::new(RoomRegistry::new());
        let (foo_tx, mut foo_rx) = mpsc::channel(8);
        let (bar_tx, mut bar_rx) = mpsc::channel(8);
        let foo = rooms.register(foo_tx);
        let bar = rooms.register(bar_tx);
        rooms.join(foo, "foo");
        rooms.join(bar, "bar");

        let (relay, shutdown) = relay(Arc::clone(&bus), Arc::clone(&rooms));
        let stats = relay.stats();
        let handle = tokio::spawn(relay.run());
        wait_for_subscribers(&bus, 1).await;

        bus.publish("logs:foo", "build started");

        let frame = tokio::time::timeout(Duration::from_secs(2), foo_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame_data(&frame), "build started");
        assert!(bar_rx.try_recv().is_err());
        assert_eq!(stats.get_messages(), 1);
        assert_eq!(stats.get_delivered(), 1);

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_survives_bus_outage() {
        let bus = Arc::new(MemoryBus::new(64));
        let rooms = Arc::new(RoomRegistry::new());
        let (tx, mut rx) = mpsc::channel(8);
        let id = rooms.register(tx);
        rooms.join(id, "foo");

        bus.fail_next_subscribes(2);
        let (relay, shutdown) = relay(Arc::clone(&bus), Arc::clone(&rooms));
        let stats = relay.stats();
        let handle = tokio::spawn(relay.run());
        wait_for_subscribers(&bus, 1).await;

        bus.drop_connections();
        wait_for_subscribers(&bus, 1).await;
        assert!(stats.get_reconnects() >= 3);

        bus.publish("logs:foo", "after reconnect");
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame_data(&frame), "after reconnect");

        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_relay_stops_when_shutdown_sender_dropped() {
        let bus = Arc::new(MemoryBus::new(64));
        let rooms = Arc::new(RoomRegistry::new());

        // While subscribed
        let (relay_a, shutdown_a) = relay(Arc::clone(&bus), Arc::clone(&rooms));
        let handle = tokio::spawn(relay_a.run());
        wait_for_subscribers(&bus, 1).await;
        drop(shutdown_a);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("relay should stop once its shutdown sender is gone")
            .unwrap();

        // While backing off between failed subscribes
        bus.fail_next_subscribes(usize::MAX);
        let (relay_b, shutdown_b) = relay(Arc::clone(&bus), Arc::clone(&rooms));
        let stats = relay_b.stats();
        let handle = tokio::spawn(relay_b.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(shutdown_b);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("relay should stop during backoff")
            .unwrap();
        assert!(stats.get_reconnects() < 50, "reconnects: {}", stats.get_reconnects());
    }

    #[tokio::test]
    async fn test_payload_is_forwarded_verbatim() {
        let bus = Arc::new(MemoryBus::new(64));
        let rooms = Arc::new(RoomRegistry::new());
        let (tx, mut rx) = mpsc::channel(8);
        let id = rooms.register(tx);
        rooms.join(id, "foo");

        let (relay, shutdown) = relay(Arc::clone(&bus), Arc::clone(&rooms));
        let handle = tokio::spawn(relay.run());
        wait_for_subscribers(&bus, 1).await;

        let line = "{\"step\":\"npm install\"}\t\u{1b}[32mok\u{1b}[0m";
        bus.publish("logs:foo", line);
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame_data(&frame), line);

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }
}
