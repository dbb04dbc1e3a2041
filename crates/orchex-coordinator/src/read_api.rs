//! Read-side lookups over the durable log and read-model store.
//!
//! Consumed by the realtime gateway (resume replay), the planner (intent
//! payload fallback), and the HTTP front outside the core. Reads never
//! mutate anything.

use std::sync::Arc;

use orchex_store::{intent_key, plan_key, EventLog, ReadModelStore};
use orchex_types::{
    CorrelationId, EventEnvelope, EventId, EventPayload, Intent, IntentReadModel, PlanReadModel,
};

use crate::{CoordinatorError, CoordinatorResult};

/// Query surface over the coordinator's stores.
#[derive(Clone)]
pub struct ReadApi {
    log: Arc<dyn EventLog>,
    models: Arc<dyn ReadModelStore>,
}

impl ReadApi {
    pub fn new(log: Arc<dyn EventLog>, models: Arc<dyn ReadModelStore>) -> Self {
        Self { log, models }
    }

    pub async fn get_intent(&self, intent_id: &EventId) -> CoordinatorResult<Option<IntentReadModel>> {
        let Some(value) = self.models.get(&intent_key(intent_id)).await? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| CoordinatorError::Codec(e.to_string()))
    }

    pub async fn get_plan(&self, plan_id: &EventId) -> CoordinatorResult<Option<PlanReadModel>> {
        let Some(value) = self.models.get(&plan_key(plan_id)).await? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| CoordinatorError::Codec(e.to_string()))
    }

    /// Ordered envelopes for a correlation, `sequence >= from_sequence`.
    pub async fn get_events(
        &self,
        correlation_id: &CorrelationId,
        from_sequence: u64,
    ) -> CoordinatorResult<Vec<EventEnvelope>> {
        Ok(self.log.events_for(correlation_id, from_sequence).await?)
    }

    /// The original intent payload for a correlation, recovered from the
    /// root `intent.submitted` envelope.
    pub async fn intent_for_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> CoordinatorResult<Option<Intent>> {
        let events = self.log.events_for(correlation_id, 1).await?;
        Ok(events.into_iter().find_map(|e| match e.payload {
            EventPayload::IntentSubmitted(intent) => Some(intent),
            _ => None,
        }))
    }
}
