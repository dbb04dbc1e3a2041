//! Orchex Coordinator - The Single Writer
//!
//! Exactly one component mutates durable state: this one. The coordinator
//! consumes every domain topic through the durable `coordinator` queue
//! group and, per envelope, runs the critical section
//!
//! ```text
//! claim seen:{event_id} → assign/validate sequence → append → project
//! ```
//!
//! under a per-correlation lock. The event log is the source of truth; read
//! models are pure projections of a correlation's event prefix and can be
//! rebuilt from the log at any time.
//!
//! Ordering is per correlation only. Out-of-order arrivals ahead of the
//! cursor are parked in a bounded gap buffer and released when the gap
//! fills; on timeout the coordinator fails forward, advancing the cursor
//! past the hole and recording a `sequence_gap`.

mod read_api;
pub mod reducer;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use orchex_bus::QueueSubscription;
use orchex_store::{intent_key, plan_key, seen_key, seq_key, EventLog, ReadModelStore, StoreError};
use orchex_types::{CorrelationId, EventEnvelope, EventId, IntentReadModel, PlanReadModel};

pub use read_api::ReadApi;
pub use reducer::{apply, plan_id_of, ApplyOutcome};

/// Coordinator errors.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("envelope has no sequence after assignment")]
    MissingSequence,
}

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum buffered out-of-order envelopes per correlation.
    pub gap_window: usize,
    /// How long a gap may stay open before failing forward.
    pub gap_timeout: Duration,
    /// Base backoff for post-append write retries.
    pub write_retry_base: Duration,
    /// Backoff cap for post-append write retries.
    pub write_retry_cap: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            gap_window: 256,
            gap_timeout: Duration::from_secs(30),
            write_retry_base: Duration::from_millis(50),
            write_retry_cap: Duration::from_secs(5),
        }
    }
}

/// Protocol-breach counters. Breaches never block ingestion; they are
/// counted, and invalid transitions still reach the log.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub sequence_conflicts: AtomicU64,
    pub sequence_gaps: AtomicU64,
    pub invalid_transitions: AtomicU64,
    pub duplicates: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sequence_conflicts: u64,
    pub sequence_gaps: u64,
    pub invalid_transitions: u64,
    pub duplicates: u64,
}

impl CoordinatorMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sequence_conflicts: self.sequence_conflicts.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            invalid_transitions: self.invalid_transitions.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of ingesting one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Appended and projected (possibly releasing buffered successors).
    Applied,
    /// `event_id` already claimed; dropped.
    Duplicate,
    /// Sequence at or below the cursor; first-seen envelope wins.
    SequenceConflict,
    /// Ahead of the cursor; parked in the gap buffer.
    Buffered,
}

struct GapBuffer {
    pending: BTreeMap<u64, EventEnvelope>,
    since: Instant,
}

/// The single-writer state coordinator.
pub struct Coordinator {
    log: Arc<dyn EventLog>,
    models: Arc<dyn ReadModelStore>,
    config: CoordinatorConfig,
    metrics: Arc<CoordinatorMetrics>,
    locks: DashMap<CorrelationId, Arc<Mutex<()>>>,
    gaps: DashMap<CorrelationId, GapBuffer>,
}

impl Coordinator {
    pub fn new(
        log: Arc<dyn EventLog>,
        models: Arc<dyn ReadModelStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            log,
            models,
            config,
            metrics: Arc::new(CoordinatorMetrics::default()),
            locks: DashMap::new(),
            gaps: DashMap::new(),
        }
    }

    pub fn metrics(&self) -> Arc<CoordinatorMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn read_api(&self) -> ReadApi {
        ReadApi::new(Arc::clone(&self.log), Arc::clone(&self.models))
    }

    fn correlation_lock(&self, correlation_id: &CorrelationId) -> Arc<Mutex<()>> {
        self.locks
            .entry(correlation_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Ingest one envelope through the critical section.
    pub async fn ingest(&self, envelope: EventEnvelope) -> CoordinatorResult<IngestOutcome> {
        let lock = self.correlation_lock(&envelope.correlation_id);
        let _guard = lock.lock().await;

        let event_id = envelope.event_id;
        if !self.models.claim(&seen_key(&event_id)).await? {
            self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(event_id = %event_id, "duplicate event dropped");
            return Ok(IngestOutcome::Duplicate);
        }

        match self.ingest_claimed(envelope).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Nothing reached the log; release the claim so the bus
                // redelivery is not swallowed by idempotency.
                let _ = self.models.delete(&seen_key(&event_id)).await;
                Err(e)
            }
        }
    }

    async fn ingest_claimed(
        &self,
        mut envelope: EventEnvelope,
    ) -> CoordinatorResult<IngestOutcome> {
        let correlation_id = envelope.correlation_id.clone();
        let last = self.last_sequence(&correlation_id).await?;

        let sequence = match envelope.sequence {
            Some(s) => s,
            None => {
                let assigned = last + 1;
                envelope.sequence = Some(assigned);
                assigned
            }
        };

        if sequence <= last {
            self.metrics.sequence_conflicts.fetch_add(1, Ordering::Relaxed);
            warn!(
                correlation_id = %correlation_id,
                sequence,
                cursor = last,
                "sequence conflict, keeping first-seen envelope"
            );
            return Ok(IngestOutcome::SequenceConflict);
        }

        if sequence > last + 1 {
            let overflow = {
                let mut gap = self.gaps.entry(correlation_id.clone()).or_insert_with(|| {
                    GapBuffer {
                        pending: BTreeMap::new(),
                        since: Instant::now(),
                    }
                });
                gap.pending.insert(sequence, envelope);
                gap.pending.len() > self.config.gap_window
            };
            if overflow {
                self.fail_forward(&correlation_id).await?;
            }
            return Ok(IngestOutcome::Buffered);
        }

        self.commit(&correlation_id, envelope).await?;
        self.drain_ready(&correlation_id).await?;
        Ok(IngestOutcome::Applied)
    }

    /// Append + cursor advance + projection for the envelope at
    /// `cursor + 1`. The append is the commit point: failures before it
    /// propagate (and nack), failures after it are retried until the
    /// projection catches up with the log.
    async fn commit(
        &self,
        correlation_id: &CorrelationId,
        envelope: EventEnvelope,
    ) -> CoordinatorResult<()> {
        let sequence = envelope.sequence.ok_or(CoordinatorError::MissingSequence)?;
        self.log.append(&envelope).await?;
        self.put_with_retry(&seq_key(correlation_id), serde_json::json!(sequence))
            .await;
        self.project(correlation_id, &envelope).await;
        Ok(())
    }

    async fn project(&self, correlation_id: &CorrelationId, envelope: &EventEnvelope) {
        let intent_model = self.load_intent(correlation_id).await;
        let plan_id = reducer::plan_id_of(envelope);
        let plan_model = match plan_id {
            Some(id) => self.load_plan(&id).await,
            None => None,
        };

        match reducer::apply(intent_model.as_ref(), plan_model.as_ref(), envelope) {
            ApplyOutcome::Applied { intent, plan } => {
                if let Some(model) = intent {
                    let value = serde_json::to_value(&model).unwrap_or(serde_json::Value::Null);
                    self.put_with_retry(&intent_key(&model.intent_id), value).await;
                }
                if let Some(model) = plan {
                    let value = serde_json::to_value(&model).unwrap_or(serde_json::Value::Null);
                    self.put_with_retry(&plan_key(&model.plan_id), value).await;
                }
            }
            ApplyOutcome::Stale => {
                debug!(event_id = %envelope.event_id, "stale envelope, projection no-op");
            }
            ApplyOutcome::InvalidTransition => {
                self.metrics.invalid_transitions.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_id = %envelope.event_id,
                    topic = %envelope.topic,
                    correlation_id = %correlation_id,
                    "invalid transition, envelope logged but not projected"
                );
            }
            ApplyOutcome::UnknownTopic => {
                debug!(topic = %envelope.topic, "unknown topic stored verbatim, projection skipped");
            }
        }
    }

    /// Release buffered envelopes that have become contiguous with the
    /// cursor.
    async fn drain_ready(&self, correlation_id: &CorrelationId) -> CoordinatorResult<()> {
        loop {
            let last = self.last_sequence(correlation_id).await?;
            let next = {
                let Some(mut gap) = self.gaps.get_mut(correlation_id) else {
                    return Ok(());
                };
                // Conflicting stragglers at or below the cursor are dropped.
                loop {
                    let lowest = gap.pending.keys().next().copied();
                    match lowest {
                        Some(seq) if seq <= last => {
                            gap.pending.remove(&seq);
                            self.metrics.sequence_conflicts.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => break,
                    }
                }
                let lowest = gap.pending.keys().next().copied();
                match lowest {
                    Some(seq) if seq == last + 1 => gap.pending.remove(&seq),
                    _ => {
                        if gap.pending.is_empty() {
                            drop(gap);
                            self.gaps.remove(correlation_id);
                        }
                        return Ok(());
                    }
                }
            };
            if let Some(envelope) = next {
                self.commit(correlation_id, envelope).await?;
            }
        }
    }

    /// Advance the cursor past a hole that never filled and release what is
    /// buffered beyond it.
    async fn fail_forward(&self, correlation_id: &CorrelationId) -> CoordinatorResult<()> {
        let lowest = match self.gaps.get(correlation_id) {
            Some(gap) => match gap.pending.keys().next() {
                Some(&seq) => seq,
                None => return Ok(()),
            },
            None => return Ok(()),
        };
        let last = self.last_sequence(correlation_id).await?;
        if lowest > last + 1 {
            self.metrics.sequence_gaps.fetch_add(1, Ordering::Relaxed);
            warn!(
                correlation_id = %correlation_id,
                cursor = last,
                resumed_at = lowest,
                "sequence gap timed out, failing forward"
            );
            self.put_with_retry(&seq_key(correlation_id), serde_json::json!(lowest - 1))
                .await;
        }
        if let Some(mut gap) = self.gaps.get_mut(correlation_id) {
            gap.since = Instant::now();
        }
        self.drain_ready(correlation_id).await
    }

    /// One pass over gap buffers, failing forward those past the timeout.
    /// Called periodically by the sweeper.
    pub async fn gap_pass(&self) {
        let expired: Vec<CorrelationId> = self
            .gaps
            .iter()
            .filter(|entry| {
                !entry.pending.is_empty() && entry.since.elapsed() >= self.config.gap_timeout
            })
            .map(|entry| entry.key().clone())
            .collect();
        for correlation_id in expired {
            let lock = self.correlation_lock(&correlation_id);
            let _guard = lock.lock().await;
            if let Err(e) = self.fail_forward(&correlation_id).await {
                warn!(correlation_id = %correlation_id, error = %e, "gap fail-forward failed");
            }
        }
    }

    /// Spawn the periodic gap sweeper; exits on shutdown signal.
    pub fn spawn_gap_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let interval = coordinator.config.gap_timeout.min(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => coordinator.gap_pass().await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Consume a queue subscription until shutdown, acking applied
    /// envelopes and nacking on infrastructure failure.
    pub async fn run(self: Arc<Self>, sub: QueueSubscription, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                maybe = sub.recv() => {
                    let Some(envelope) = maybe else { break };
                    let event_id = envelope.event_id;
                    match self.ingest(envelope).await {
                        Ok(_) => sub.ack(&event_id),
                        Err(e) => {
                            warn!(event_id = %event_id, error = %e, "ingest failed, nacking");
                            sub.nack(&event_id);
                        }
                    }
                }
            }
        }
    }

    /// Rebuild a correlation's read models by replaying its log prefix
    /// through the reducer from the empty state.
    pub async fn rebuild(
        &self,
        correlation_id: &CorrelationId,
    ) -> CoordinatorResult<Option<IntentReadModel>> {
        let lock = self.correlation_lock(correlation_id);
        let _guard = lock.lock().await;

        let events = self.log.events_for(correlation_id, 1).await?;
        let mut intent: Option<IntentReadModel> = None;
        let mut plans: std::collections::HashMap<EventId, PlanReadModel> =
            std::collections::HashMap::new();

        for envelope in &events {
            let plan_model = reducer::plan_id_of(envelope).and_then(|id| plans.get(&id).cloned());
            if let ApplyOutcome::Applied { intent: i, plan: p } =
                reducer::apply(intent.as_ref(), plan_model.as_ref(), envelope)
            {
                if let Some(model) = i {
                    intent = Some(model);
                }
                if let Some(model) = p {
                    plans.insert(model.plan_id, model);
                }
            }
        }

        if let Some(model) = &intent {
            let value = serde_json::to_value(model).map_err(|e| CoordinatorError::Codec(e.to_string()))?;
            self.models.put(&intent_key(&model.intent_id), value).await?;
        }
        for model in plans.values() {
            let value = serde_json::to_value(model).map_err(|e| CoordinatorError::Codec(e.to_string()))?;
            self.models.put(&plan_key(&model.plan_id), value).await?;
        }
        Ok(intent)
    }

    async fn last_sequence(&self, correlation_id: &CorrelationId) -> CoordinatorResult<u64> {
        Ok(self
            .models
            .get(&seq_key(correlation_id))
            .await?
            .and_then(|v| v.as_u64())
            .unwrap_or(0))
    }

    async fn load_intent(&self, correlation_id: &CorrelationId) -> Option<IntentReadModel> {
        let intent_id = correlation_id.root_intent_id()?;
        let value = self.models.get(&intent_key(&intent_id)).await.ok()??;
        serde_json::from_value(value).ok()
    }

    async fn load_plan(&self, plan_id: &EventId) -> Option<PlanReadModel> {
        let value = self.models.get(&plan_key(plan_id)).await.ok()??;
        serde_json::from_value(value).ok()
    }

    /// Write-after-append: the log is truth, so the projection write is
    /// retried until it lands.
    async fn put_with_retry(&self, key: &str, value: serde_json::Value) {
        let mut backoff = self.config.write_retry_base;
        loop {
            match self.models.put(key, value.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(key, error = %e, backoff_ms = backoff.as_millis() as u64, "read-model write failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.write_retry_cap);
                }
            }
        }
    }
}
