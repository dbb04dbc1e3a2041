//! Orchex Bus - Named-Topic Pub/Sub for Domain Events
//!
//! A single logical broker shared by every Orchex component:
//!
//! - **Publish with dedup**: duplicate `event_id`s inside a configured
//!   window are suppressed server-side, so producer retries never fan out
//!   twice.
//! - **Durable queue groups**: at-least-once, load-balanced delivery across
//!   group members with explicit acks and ack-timeout redelivery. Used by
//!   the planner, orchestrator, and coordinator workers.
//! - **Ephemeral subscriptions**: best-effort live taps with no redelivery,
//!   used by the realtime gateway.
//!
//! The bus does NOT order events globally. Per-correlation ordering is the
//! producers' job (sequence assignment) and the coordinator's (monotonic
//! projection).
//!
//! # Example
//!
//! ```ignore
//! use orchex_bus::{EventBus, BusConfig};
//!
//! let bus = EventBus::new(BusConfig::default());
//! let sub = bus.subscribe_queue("plan.*", "orchestrator.workers")?;
//!
//! bus.publish(envelope)?;
//! let delivery = sub.recv().await.unwrap();
//! sub.ack(&delivery.event_id);
//! ```

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

pub use orchex_types::{CorrelationId, EventEnvelope, EventId, Topic, TopicPattern};

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Window inside which a repeated `event_id` is suppressed.
    pub dedup_window: Duration,
    /// How long a queue-group delivery may stay unacked before redelivery.
    pub ack_timeout: Duration,
    /// Interval between redelivery sweeps.
    pub sweep_interval: Duration,
    /// Capacity of the live broadcast channel.
    pub live_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(120),
            ack_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(500),
            live_capacity: 4096,
        }
    }
}

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("invalid subscription pattern: {0}")]
    InvalidPattern(String),
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Outcome of a publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted and fanned out.
    Ack,
    /// Same `event_id` seen inside the dedup window; dropped.
    DuplicateSuppressed,
}

struct Inflight {
    envelope: EventEnvelope,
    delivered_at: Instant,
    deliveries: u32,
}

struct QueueGroup {
    pattern: TopicPattern,
    name: String,
    members: RwLock<Vec<flume::Sender<EventEnvelope>>>,
    next: AtomicUsize,
    inflight: DashMap<EventId, Inflight>,
    /// Envelopes that arrived while the group had no live members.
    backlog: Mutex<VecDeque<EventEnvelope>>,
}

impl QueueGroup {
    /// Hand an envelope to the next live member, dropping dead channels.
    /// Returns false when no member could take it.
    fn dispatch(&self, envelope: EventEnvelope) -> bool {
        loop {
            let tx = {
                let members = self.members.read();
                if members.is_empty() {
                    return false;
                }
                let idx = self.next.fetch_add(1, Ordering::Relaxed) % members.len();
                members[idx].clone()
            };
            match tx.send(envelope.clone()) {
                Ok(()) => return true,
                Err(_) => {
                    // Member receiver dropped; forget dead channels and retry.
                    self.members.write().retain(|m| !m.is_disconnected());
                }
            }
        }
    }

    fn deliver(&self, envelope: EventEnvelope) {
        let event_id = envelope.event_id;
        if self.dispatch(envelope.clone()) {
            self.inflight.insert(
                event_id,
                Inflight {
                    envelope,
                    delivered_at: Instant::now(),
                    deliveries: 1,
                },
            );
        } else {
            self.backlog.lock().push_back(envelope);
        }
    }
}

/// At-least-once subscription held by one member of a queue group.
///
/// Every received envelope must be acked (or nacked for immediate
/// redelivery); unacked envelopes are redelivered after the ack timeout.
pub struct QueueSubscription {
    group: Arc<QueueGroup>,
    rx: flume::Receiver<EventEnvelope>,
}

impl QueueSubscription {
    /// Receive the next envelope. Returns `None` when the bus is gone.
    pub async fn recv(&self) -> Option<EventEnvelope> {
        self.rx.recv_async().await.ok()
    }

    /// Non-blocking receive for drain loops.
    pub fn try_recv(&self) -> Option<EventEnvelope> {
        self.rx.try_recv().ok()
    }

    /// Acknowledge successful processing.
    pub fn ack(&self, event_id: &EventId) {
        self.group.inflight.remove(event_id);
    }

    /// Negative-acknowledge: redeliver to the group immediately.
    pub fn nack(&self, event_id: &EventId) {
        if let Some((_, mut inflight)) = self.group.inflight.remove(event_id) {
            inflight.deliveries += 1;
            inflight.delivered_at = Instant::now();
            let envelope = inflight.envelope.clone();
            let id = inflight.envelope.event_id;
            if self.group.dispatch(envelope) {
                self.group.inflight.insert(id, inflight);
            } else {
                self.group.backlog.lock().push_back(inflight.envelope);
            }
        }
    }

    pub fn group_name(&self) -> &str {
        &self.group.name
    }
}

/// Best-effort live tap. No redelivery; lagging subscribers lose events.
pub struct EphemeralSubscription {
    rx: broadcast::Receiver<EventEnvelope>,
    pattern: TopicPattern,
    /// Skip events at or below this last-seen position.
    from: Option<(CorrelationId, u64)>,
}

impl EphemeralSubscription {
    fn wants(&self, envelope: &EventEnvelope) -> bool {
        if !self.pattern.matches(&envelope.topic) {
            return false;
        }
        if let Some((correlation, last_seen)) = &self.from {
            if &envelope.correlation_id == correlation {
                if let Some(seq) = envelope.sequence {
                    return seq > *last_seen;
                }
            }
        }
        true
    }

    /// Receive the next matching envelope, skipping lag gaps.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if self.wants(&envelope) => return Some(envelope),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "ephemeral subscriber lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Adapt into a stream for `while let Some(...)` tailing.
    pub fn into_stream(mut self) -> Pin<Box<dyn Stream<Item = EventEnvelope> + Send>> {
        Box::pin(async_stream::stream! {
            while let Some(envelope) = self.recv().await {
                yield envelope;
            }
        })
    }
}

/// The in-process broker.
pub struct EventBus {
    config: BusConfig,
    dedup: DashMap<EventId, Instant>,
    groups: RwLock<Vec<Arc<QueueGroup>>>,
    live_tx: broadcast::Sender<EventEnvelope>,
    /// Scripted publish failures for tests: (pattern, remaining count).
    fail_scripts: Mutex<Vec<(TopicPattern, u32)>>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let (live_tx, _) = broadcast::channel(config.live_capacity);
        Self {
            config,
            dedup: DashMap::new(),
            groups: RwLock::new(Vec::new()),
            live_tx,
            fail_scripts: Mutex::new(Vec::new()),
        }
    }

    /// Publish an envelope. Duplicate `event_id`s inside the dedup window
    /// are suppressed before any fan-out.
    pub fn publish(&self, envelope: EventEnvelope) -> BusResult<PublishOutcome> {
        if self.should_fail(&envelope.topic) {
            return Err(BusError::PublishFailed(format!(
                "injected failure for {}",
                envelope.topic
            )));
        }

        let now = Instant::now();
        if let Some(seen_at) = self.dedup.get(&envelope.event_id) {
            if now.duration_since(*seen_at) < self.config.dedup_window {
                debug!(event_id = %envelope.event_id, topic = %envelope.topic, "duplicate suppressed");
                return Ok(PublishOutcome::DuplicateSuppressed);
            }
        }
        self.dedup.insert(envelope.event_id, now);
        if self.dedup.len() > 16_384 {
            let window = self.config.dedup_window;
            self.dedup.retain(|_, at| now.duration_since(*at) < window);
        }

        for group in self.groups.read().iter() {
            if group.pattern.matches(&envelope.topic) {
                group.deliver(envelope.clone());
            }
        }

        // Live tap is best effort; no subscribers is fine.
        let _ = self.live_tx.send(envelope);
        Ok(PublishOutcome::Ack)
    }

    /// Join (or create) a durable queue group on a pattern.
    pub fn subscribe_queue(&self, pattern: &str, group_name: &str) -> BusResult<QueueSubscription> {
        let pattern =
            TopicPattern::parse(pattern).map_err(|e| BusError::InvalidPattern(e.to_string()))?;
        let (tx, rx) = flume::unbounded();

        let mut groups = self.groups.write();
        let group = groups
            .iter()
            .find(|g| g.pattern == pattern && g.name == group_name)
            .cloned();
        let group = match group {
            Some(g) => g,
            None => {
                let g = Arc::new(QueueGroup {
                    pattern,
                    name: group_name.to_string(),
                    members: RwLock::new(Vec::new()),
                    next: AtomicUsize::new(0),
                    inflight: DashMap::new(),
                    backlog: Mutex::new(VecDeque::new()),
                });
                groups.push(g.clone());
                g
            }
        };
        group.members.write().push(tx);
        drop(groups);

        // A new member can drain anything that arrived while the group was empty.
        let backlog: Vec<EventEnvelope> = group.backlog.lock().drain(..).collect();
        for envelope in backlog {
            group.deliver(envelope);
        }

        Ok(QueueSubscription { group, rx })
    }

    /// Open a best-effort live tap. `from` is a last-seen
    /// `(correlation_id, sequence)` position; events at or below it for that
    /// correlation are filtered out.
    pub fn subscribe_ephemeral(
        &self,
        pattern: &str,
        from: Option<(CorrelationId, u64)>,
    ) -> BusResult<EphemeralSubscription> {
        let pattern =
            TopicPattern::parse(pattern).map_err(|e| BusError::InvalidPattern(e.to_string()))?;
        Ok(EphemeralSubscription {
            rx: self.live_tx.subscribe(),
            pattern,
            from,
        })
    }

    /// One redelivery pass: every queue-group delivery older than the ack
    /// timeout goes back to the group. Called periodically by the sweeper.
    pub fn redelivery_pass(&self) {
        let timeout = self.config.ack_timeout;
        let groups: Vec<Arc<QueueGroup>> = self.groups.read().iter().cloned().collect();
        for group in groups {
            let expired: Vec<EventId> = group
                .inflight
                .iter()
                .filter(|entry| entry.delivered_at.elapsed() >= timeout)
                .map(|entry| *entry.key())
                .collect();
            for event_id in expired {
                if let Some((_, mut inflight)) = group.inflight.remove(&event_id) {
                    inflight.deliveries += 1;
                    inflight.delivered_at = Instant::now();
                    debug!(
                        event_id = %event_id,
                        group = %group.name,
                        deliveries = inflight.deliveries,
                        "ack timeout, redelivering"
                    );
                    let envelope = inflight.envelope.clone();
                    if group.dispatch(envelope) {
                        group.inflight.insert(event_id, inflight);
                    } else {
                        group.backlog.lock().push_back(inflight.envelope);
                    }
                }
            }
        }
    }

    /// Spawn the periodic redelivery sweeper; exits on shutdown signal.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(self);
        let interval = bus.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => bus.redelivery_pass(),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Script the next `times` publishes matching `pattern` to fail.
    /// Test hook for producer retry paths.
    pub fn inject_publish_failure(&self, pattern: TopicPattern, times: u32) {
        self.fail_scripts.lock().push((pattern, times));
    }

    fn should_fail(&self, topic: &Topic) -> bool {
        let mut scripts = self.fail_scripts.lock();
        for entry in scripts.iter_mut() {
            if entry.1 > 0 && entry.0.matches(topic) {
                entry.1 -= 1;
                return true;
            }
        }
        scripts.retain(|(_, remaining)| *remaining > 0);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchex_types::{
        Asset, Constraints, EventPayload, ExecutionStyle, Intent, IntentType,
    };
    use rust_decimal_macros::dec;

    fn test_envelope(seq: u64) -> EventEnvelope {
        let intent_id = EventId::new();
        let intent = Intent {
            intent_id,
            intent_type: IntentType::Acquire,
            assets: [
                Asset::new("WETH", 1, "0xc02a", 18),
                Asset::new("USDC", 1, "0xa0b8", 6),
            ],
            amount_in: dec!(1000),
            constraints: Constraints {
                max_slippage: dec!(0.01),
                time_window_ms: 300_000,
                execution_style: ExecutionStyle::Adaptive,
                allowed_venues: None,
            },
        };
        EventEnvelope::make(
            Topic::IntentSubmitted,
            EventPayload::IntentSubmitted(intent),
            CorrelationId::for_intent(&intent_id),
            None,
            Some(seq),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_publish_and_queue_receive() {
        let bus = EventBus::new(BusConfig::default());
        let sub = bus.subscribe_queue("intent.*", "workers").unwrap();

        let envelope = test_envelope(1);
        assert_eq!(bus.publish(envelope.clone()).unwrap(), PublishOutcome::Ack);

        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.event_id, envelope.event_id);
        sub.ack(&delivery.event_id);
        assert!(sub.group.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_suppressed() {
        let bus = EventBus::new(BusConfig::default());
        let sub = bus.subscribe_queue("intent.*", "workers").unwrap();

        let envelope = test_envelope(1);
        assert_eq!(bus.publish(envelope.clone()).unwrap(), PublishOutcome::Ack);
        assert_eq!(
            bus.publish(envelope.clone()).unwrap(),
            PublishOutcome::DuplicateSuppressed
        );

        let first = sub.recv().await.unwrap();
        sub.ack(&first.event_id);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_queue_group_load_balancing() {
        let bus = EventBus::new(BusConfig::default());
        let a = bus.subscribe_queue("intent.*", "workers").unwrap();
        let b = bus.subscribe_queue("intent.*", "workers").unwrap();

        for i in 0..4 {
            bus.publish(test_envelope(i + 1)).unwrap();
        }

        let mut a_count = 0;
        let mut b_count = 0;
        for _ in 0..4 {
            if let Some(e) = a.try_recv() {
                a.ack(&e.event_id);
                a_count += 1;
            }
            if let Some(e) = b.try_recv() {
                b.ack(&e.event_id);
                b_count += 1;
            }
        }
        assert_eq!(a_count + b_count, 4);
        assert_eq!(a_count, 2);
        assert_eq!(b_count, 2);
    }

    #[tokio::test]
    async fn test_redelivery_after_ack_timeout() {
        let config = BusConfig {
            ack_timeout: Duration::from_millis(0),
            ..Default::default()
        };
        let bus = EventBus::new(config);
        let sub = bus.subscribe_queue("intent.*", "workers").unwrap();

        let envelope = test_envelope(1);
        bus.publish(envelope.clone()).unwrap();

        // First delivery consumed but never acked.
        let first = sub.recv().await.unwrap();
        assert_eq!(first.event_id, envelope.event_id);

        bus.redelivery_pass();
        let second = sub.recv().await.unwrap();
        assert_eq!(second.event_id, envelope.event_id);
        sub.ack(&second.event_id);

        bus.redelivery_pass();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_nack_redelivers_immediately() {
        let bus = EventBus::new(BusConfig::default());
        let sub = bus.subscribe_queue("intent.*", "workers").unwrap();

        let envelope = test_envelope(1);
        bus.publish(envelope.clone()).unwrap();

        let first = sub.recv().await.unwrap();
        sub.nack(&first.event_id);

        let second = sub.recv().await.unwrap();
        assert_eq!(second.event_id, envelope.event_id);
        sub.ack(&second.event_id);
    }

    #[tokio::test]
    async fn test_ephemeral_tap_filters_pattern() {
        let bus = EventBus::new(BusConfig::default());
        let mut tap = bus.subscribe_ephemeral("intent.*", None).unwrap();

        bus.publish(test_envelope(1)).unwrap();
        let seen = tap.recv().await.unwrap();
        assert_eq!(seen.topic, Topic::IntentSubmitted);
    }

    #[tokio::test]
    async fn test_ephemeral_from_position_filter() {
        let bus = EventBus::new(BusConfig::default());
        let e1 = test_envelope(1);
        let correlation = e1.correlation_id.clone();

        let mut tap = bus
            .subscribe_ephemeral("intent.*", Some((correlation.clone(), 1)))
            .unwrap();

        // seq 1 for the tracked correlation is filtered; an unrelated
        // correlation passes through.
        bus.publish(e1).unwrap();
        let other = test_envelope(1);
        bus.publish(other.clone()).unwrap();

        let seen = tap.recv().await.unwrap();
        assert_eq!(seen.event_id, other.event_id);
    }

    #[tokio::test]
    async fn test_injected_publish_failure() {
        let bus = EventBus::new(BusConfig::default());
        bus.inject_publish_failure(TopicPattern::parse("intent.*").unwrap(), 1);

        let envelope = test_envelope(1);
        assert!(bus.publish(envelope.clone()).is_err());
        // Script exhausted; a fresh envelope goes through.
        assert_eq!(bus.publish(test_envelope(1)).unwrap(), PublishOutcome::Ack);
    }

    #[tokio::test]
    async fn test_backlog_drained_on_subscribe() {
        let bus = EventBus::new(BusConfig::default());
        // Create the group, then drop its only member.
        let sub = bus.subscribe_queue("intent.*", "workers").unwrap();
        drop(sub);

        let envelope = test_envelope(1);
        bus.publish(envelope.clone()).unwrap();

        let sub = bus.subscribe_queue("intent.*", "workers").unwrap();
        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.event_id, envelope.event_id);
        sub.ack(&delivery.event_id);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let bus = EventBus::new(BusConfig::default());
        assert!(bus.subscribe_queue("intent.**", "workers").is_err());
        assert!(bus.subscribe_ephemeral("bogus.topic", None).is_err());
    }
}
