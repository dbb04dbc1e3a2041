//! Orchex Gateway - Realtime Fan-Out to Live Clients
//!
//! The gateway exposes the subscription and resume contract that the outer
//! WebSocket surface translates onto the wire. Per connection it keeps the
//! subscription set, a `correlation → last seen sequence` map, and a
//! bounded outbound queue.
//!
//! # Protocol
//!
//! ## Subscribe
//! ```json
//! {
//!     "action": "subscribe",
//!     "topics": ["intent.*", "exec.*"],
//!     "correlationId": "intent-01HX...",
//!     "resumeFrom": 3
//! }
//! ```
//!
//! ## Server messages
//!
//! Event envelopes in their wire form, plus control frames:
//! ```json
//! {"control": "resume_complete"}
//! ```
//!
//! With `resumeFrom`, the gateway first replays the missing envelopes from
//! the durable log, signals `resume_complete`, then live-tails the bus.
//!
//! # Backpressure
//!
//! The outbound queue is bounded. Droppable topic classes (market data)
//! shed oldest-first; domain lifecycle topics are never dropped — a full
//! queue disconnects the client instead.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use orchex_bus::EventBus;
use orchex_coordinator::{CoordinatorError, ReadApi};
use orchex_types::{CorrelationId, EventEnvelope, Topic, TopicPattern};

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("resumeFrom requires a correlationId")]
    ResumeWithoutCorrelation,

    #[error("client disconnected")]
    Disconnected,

    #[error(transparent)]
    Read(#[from] CoordinatorError),
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Per-connection outbound queue depth.
    pub queue_depth: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { queue_depth: 1024 }
    }
}

/// Client → gateway messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        topics: Vec<String>,
        #[serde(rename = "correlationId", default)]
        correlation_id: Option<CorrelationId>,
        #[serde(rename = "resumeFrom", default)]
        resume_from: Option<u64>,
    },
}

/// Control frames interleaved with envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    ResumeComplete,
}

/// Gateway → client messages.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(EventEnvelope),
    Control { control: ControlKind },
}

/// Drop class of a topic under backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicClass {
    /// Lifecycle topics; never dropped.
    Critical,
    /// Market-data class; oldest dropped first.
    Droppable,
}

pub fn topic_class(topic: &Topic) -> TopicClass {
    if topic.is_registered() {
        TopicClass::Critical
    } else {
        TopicClass::Droppable
    }
}

struct OutboundQueue {
    messages: Mutex<VecDeque<ServerMessage>>,
    notify: Notify,
    capacity: usize,
    disconnected: AtomicBool,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            disconnected: AtomicBool::new(false),
        }
    }

    /// Enqueue respecting the drop policy. Returns false once the
    /// connection is gone.
    fn push(&self, message: ServerMessage, class: TopicClass) -> bool {
        if self.disconnected.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut messages = self.messages.lock();
            if messages.len() >= self.capacity {
                match class {
                    TopicClass::Droppable => {
                        messages.pop_front();
                    }
                    TopicClass::Critical => {
                        // Never drop lifecycle events; cut the client loose.
                        drop(messages);
                        self.disconnected.store(true, Ordering::Release);
                        self.notify.notify_waiters();
                        return false;
                    }
                }
            }
            messages.push_back(message);
        }
        self.notify.notify_waiters();
        true
    }

    async fn next(&self) -> Option<ServerMessage> {
        loop {
            if let Some(message) = self.messages.lock().pop_front() {
                return Some(message);
            }
            if self.disconnected.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

/// One live client connection.
pub struct Connection {
    bus: Arc<EventBus>,
    read: ReadApi,
    queue: Arc<OutboundQueue>,
    subscriptions: Mutex<HashSet<String>>,
    last_seen: Arc<DashMap<CorrelationId, u64>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Connection {
    /// Handle a subscribe request: validate, replay when resuming, then
    /// live-tail.
    pub async fn subscribe(&self, message: ClientMessage) -> GatewayResult<()> {
        let ClientMessage::Subscribe {
            topics,
            correlation_id,
            resume_from,
        } = message;

        if resume_from.is_some() && correlation_id.is_none() {
            return Err(GatewayError::ResumeWithoutCorrelation);
        }

        // Validate every pattern against the registry before touching state.
        let mut patterns = Vec::with_capacity(topics.len());
        for topic in &topics {
            let pattern = TopicPattern::parse(topic)
                .map_err(|_| GatewayError::InvalidPattern(topic.clone()))?;
            patterns.push(pattern);
        }

        // Open the live taps before replaying so nothing falls in between;
        // the last-seen filter squashes the overlap.
        let mut taps = Vec::with_capacity(patterns.len());
        for topic in &topics {
            let from = correlation_id
                .as_ref()
                .zip(resume_from)
                .map(|(c, s)| (c.clone(), s));
            let tap = self
                .bus
                .subscribe_ephemeral(topic, from)
                .map_err(|e| GatewayError::InvalidPattern(e.to_string()))?;
            taps.push(tap);
        }

        if let (Some(correlation), Some(from)) = (&correlation_id, resume_from) {
            let history = self.read.get_events(correlation, from + 1).await?;
            for envelope in history {
                if patterns.iter().any(|p| p.matches(&envelope.topic)) {
                    self.deliver(envelope);
                }
            }
            if !self.queue.push(
                ServerMessage::Control {
                    control: ControlKind::ResumeComplete,
                },
                TopicClass::Critical,
            ) {
                return Err(GatewayError::Disconnected);
            }
        }

        {
            let mut subscriptions = self.subscriptions.lock();
            for topic in &topics {
                subscriptions.insert(topic.clone());
            }
        }

        let mut tasks = self.tasks.lock();
        for mut tap in taps {
            let queue = Arc::clone(&self.queue);
            let last_seen = Arc::clone(&self.last_seen);
            let filter = correlation_id.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(envelope) = tap.recv().await {
                    if let Some(correlation) = &filter {
                        if &envelope.correlation_id != correlation {
                            continue;
                        }
                    }
                    // Replayed history already covered this position.
                    if let (Some(seq), Some(seen)) = (
                        envelope.sequence,
                        last_seen.get(&envelope.correlation_id).map(|s| *s),
                    ) {
                        if seq <= seen {
                            continue;
                        }
                    }
                    if let Some(seq) = envelope.sequence {
                        last_seen.insert(envelope.correlation_id.clone(), seq);
                    }
                    let class = topic_class(&envelope.topic);
                    if !queue.push(ServerMessage::Event(envelope), class) {
                        debug!("outbound queue closed, tail task exiting");
                        break;
                    }
                }
            }));
        }
        Ok(())
    }

    fn deliver(&self, envelope: EventEnvelope) {
        if let Some(seq) = envelope.sequence {
            self.last_seen
                .entry(envelope.correlation_id.clone())
                .and_modify(|s| *s = (*s).max(seq))
                .or_insert(seq);
        }
        let class = topic_class(&envelope.topic);
        if !self.queue.push(ServerMessage::Event(envelope), class) {
            warn!("client disconnected during replay");
        }
    }

    /// Next outbound message; `None` once disconnected and drained.
    pub async fn next(&self) -> Option<ServerMessage> {
        self.queue.next().await
    }

    pub fn is_disconnected(&self) -> bool {
        self.queue.disconnected.load(Ordering::Acquire)
    }

    pub fn last_seen(&self, correlation_id: &CorrelationId) -> Option<u64> {
        self.last_seen.get(correlation_id).map(|s| *s)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// Tear the connection down and stop its tail tasks.
    pub fn close(&self) {
        self.queue.disconnected.store(true, Ordering::Release);
        self.queue.notify.notify_waiters();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Accepts client connections over the core.
pub struct Gateway {
    bus: Arc<EventBus>,
    read: ReadApi,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(bus: Arc<EventBus>, read: ReadApi, config: GatewayConfig) -> Self {
        Self { bus, read, config }
    }

    pub fn connect(&self) -> Connection {
        Connection {
            bus: Arc::clone(&self.bus),
            read: self.read.clone(),
            queue: Arc::new(OutboundQueue::new(self.config.queue_depth)),
            subscriptions: Mutex::new(HashSet::new()),
            last_seen: Arc::new(DashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }
}
