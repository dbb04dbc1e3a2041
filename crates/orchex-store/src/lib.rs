//! Orchex Store - Event Log and Read-Model Backends
//!
//! Two storage contracts back the state coordinator:
//!
//! - [`EventLog`]: the append-only source of truth. Append is idempotent on
//!   `event_id`; reads are ordered by per-correlation sequence.
//! - [`ReadModelStore`]: string-keyed JSON values for materialized
//!   projections (`intent:{id}`, `plan:{id}`), idempotency claims
//!   (`seen:{event_id}`), and sequence cursors (`seq:{correlation_id}`).
//!
//! Only the coordinator writes to either store; everything else reads.
//!
//! [`MemoryEventLog`]/[`MemoryReadModelStore`] serve tests and single-node
//! deployments; [`SledEventLog`]/[`SledReadModelStore`] persist across
//! restarts on an embedded sled database.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

pub use orchex_types::{CorrelationId, EventEnvelope, EventId};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("envelope has no sequence assigned")]
    MissingSequence,
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of an idempotent append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The `event_id` was already in the log; nothing was written.
    AlreadyPresent,
}

/// Append-only durable event log.
///
/// Envelopes must carry an assigned sequence by the time they reach the
/// log; the coordinator guarantees this.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, envelope: &EventEnvelope) -> StoreResult<AppendOutcome>;

    async fn get(&self, event_id: &EventId) -> StoreResult<Option<EventEnvelope>>;

    /// Envelopes for a correlation with `sequence >= from_sequence`, in
    /// ascending sequence order.
    async fn events_for(
        &self,
        correlation_id: &CorrelationId,
        from_sequence: u64,
    ) -> StoreResult<Vec<EventEnvelope>>;
}

/// Key/value store for read models and coordinator bookkeeping.
#[async_trait]
pub trait ReadModelStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>>;

    async fn put(&self, key: &str, value: serde_json::Value) -> StoreResult<()>;

    /// Atomic test-and-set. Returns true when this call claimed the key.
    async fn claim(&self, key: &str) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<()>;
}

// ============================================================================
// Key helpers
// ============================================================================

pub fn intent_key(intent_id: &EventId) -> String {
    format!("intent:{}", intent_id)
}

pub fn plan_key(plan_id: &EventId) -> String {
    format!("plan:{}", plan_id)
}

pub fn seen_key(event_id: &EventId) -> String {
    format!("seen:{}", event_id)
}

pub fn seq_key(correlation_id: &CorrelationId) -> String {
    format!("seq:{}", correlation_id)
}

// ============================================================================
// In-memory backends
// ============================================================================

/// In-memory event log.
#[derive(Default)]
pub struct MemoryEventLog {
    by_id: DashMap<EventId, EventEnvelope>,
    by_correlation: DashMap<CorrelationId, Vec<EventEnvelope>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, envelope: &EventEnvelope) -> StoreResult<AppendOutcome> {
        let sequence = envelope.sequence.ok_or(StoreError::MissingSequence)?;
        if self.by_id.contains_key(&envelope.event_id) {
            return Ok(AppendOutcome::AlreadyPresent);
        }
        self.by_id.insert(envelope.event_id, envelope.clone());
        let mut entry = self
            .by_correlation
            .entry(envelope.correlation_id.clone())
            .or_default();
        // The log may receive envelopes out of arrival order; keep the
        // per-correlation slice sorted by sequence.
        let pos = entry
            .binary_search_by_key(&sequence, |e| e.sequence.unwrap_or(0))
            .unwrap_or_else(|p| p);
        entry.insert(pos, envelope.clone());
        Ok(AppendOutcome::Appended)
    }

    async fn get(&self, event_id: &EventId) -> StoreResult<Option<EventEnvelope>> {
        Ok(self.by_id.get(event_id).map(|e| e.clone()))
    }

    async fn events_for(
        &self,
        correlation_id: &CorrelationId,
        from_sequence: u64,
    ) -> StoreResult<Vec<EventEnvelope>> {
        Ok(self
            .by_correlation
            .get(correlation_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence.unwrap_or(0) >= from_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// In-memory read-model store.
#[derive(Default)]
pub struct MemoryReadModelStore {
    values: DashMap<String, serde_json::Value>,
}

impl MemoryReadModelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReadModelStore for MemoryReadModelStore {
    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        Ok(self.values.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> StoreResult<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn claim(&self, key: &str) -> StoreResult<bool> {
        match self.values.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(serde_json::Value::Bool(true));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.values.remove(key);
        Ok(())
    }
}

// ============================================================================
// Sled backends
// ============================================================================

/// Composite log key: `{correlation_id}\x00{sequence:be}` so a prefix scan
/// yields one correlation in ascending sequence order.
fn log_key(correlation_id: &CorrelationId, sequence: u64) -> Vec<u8> {
    let mut key = correlation_id.0.as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

/// Sled-backed event log. Two trees: `events` keyed by correlation and
/// sequence, `events_by_id` mapping event id to the composite key. The
/// by-id insert lands last and acts as the presence marker, so a crashed
/// partial write is repaired by the idempotent retry.
pub struct SledEventLog {
    events: sled::Tree,
    by_id: sled::Tree,
}

impl SledEventLog {
    pub fn open(db: &sled::Db) -> StoreResult<Self> {
        Ok(Self {
            events: db
                .open_tree("events")
                .map_err(|e| StoreError::Storage(e.to_string()))?,
            by_id: db
                .open_tree("events_by_id")
                .map_err(|e| StoreError::Storage(e.to_string()))?,
        })
    }

    fn decode(bytes: &[u8]) -> StoreResult<EventEnvelope> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

#[async_trait]
impl EventLog for SledEventLog {
    async fn append(&self, envelope: &EventEnvelope) -> StoreResult<AppendOutcome> {
        let sequence = envelope.sequence.ok_or(StoreError::MissingSequence)?;
        let id_key = envelope.event_id.to_string();
        if self
            .by_id
            .contains_key(id_key.as_bytes())
            .map_err(|e| StoreError::Storage(e.to_string()))?
        {
            return Ok(AppendOutcome::AlreadyPresent);
        }
        let key = log_key(&envelope.correlation_id, sequence);
        let bytes = serde_json::to_vec(envelope).map_err(|e| StoreError::Codec(e.to_string()))?;
        self.events
            .insert(key.as_slice(), bytes)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        self.by_id
            .insert(id_key.as_bytes(), key)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(AppendOutcome::Appended)
    }

    async fn get(&self, event_id: &EventId) -> StoreResult<Option<EventEnvelope>> {
        let id_key = event_id.to_string();
        let Some(key) = self
            .by_id
            .get(id_key.as_bytes())
            .map_err(|e| StoreError::Storage(e.to_string()))?
        else {
            return Ok(None);
        };
        let Some(bytes) = self
            .events
            .get(&key)
            .map_err(|e| StoreError::Storage(e.to_string()))?
        else {
            return Ok(None);
        };
        Ok(Some(Self::decode(&bytes)?))
    }

    async fn events_for(
        &self,
        correlation_id: &CorrelationId,
        from_sequence: u64,
    ) -> StoreResult<Vec<EventEnvelope>> {
        let mut prefix = correlation_id.0.as_bytes().to_vec();
        prefix.push(0);
        let mut out = Vec::new();
        for item in self.events.scan_prefix(&prefix) {
            let (_, bytes) = item.map_err(|e| StoreError::Storage(e.to_string()))?;
            let envelope = Self::decode(&bytes)?;
            if envelope.sequence.unwrap_or(0) >= from_sequence {
                out.push(envelope);
            }
        }
        Ok(out)
    }
}

/// Sled-backed read-model store.
pub struct SledReadModelStore {
    tree: sled::Tree,
}

impl SledReadModelStore {
    pub fn open(db: &sled::Db) -> StoreResult<Self> {
        Ok(Self {
            tree: db
                .open_tree("read_models")
                .map_err(|e| StoreError::Storage(e.to_string()))?,
        })
    }
}

#[async_trait]
impl ReadModelStore for SledReadModelStore {
    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let Some(bytes) = self
            .tree
            .get(key.as_bytes())
            .map_err(|e| StoreError::Storage(e.to_string()))?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Codec(e.to_string()))
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> StoreResult<()> {
        let bytes = serde_json::to_vec(&value).map_err(|e| StoreError::Codec(e.to_string()))?;
        self.tree
            .insert(key.as_bytes(), bytes)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn claim(&self, key: &str) -> StoreResult<bool> {
        let result = self
            .tree
            .compare_and_swap(
                key.as_bytes(),
                None as Option<&[u8]>,
                Some(b"true".as_slice()),
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(result.is_ok())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.tree
            .remove(key.as_bytes())
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }
}
