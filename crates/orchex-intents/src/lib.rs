//! Orchex Intents - Submission Front of the Execution Core
//!
//! The intent manager is the only entry point for new work. For each
//! submission it:
//!
//! 1. Validates schema and constraint bounds (failures return synchronously;
//!    no events are emitted)
//! 2. Mints the intent id and correlation, publishes `intent.submitted`
//! 3. Runs the risk gate synchronously
//! 4. Publishes `risk.approved` then `intent.accepted`, or `risk.rejected`
//!
//! The manager never writes to a store; the event log is fed exclusively by
//! the coordinator consuming these publishes.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use orchex_bus::{BusError, EventBus};
use orchex_risk::{evaluate, RiskConfig, RiskVerdict};
use orchex_types::{
    Asset, Constraints, CorrelationId, EnvelopeError, EventEnvelope, EventId, EventPayload,
    Intent, IntentAccepted, IntentFailed, IntentType, Reason, RiskApproved, RiskRejected, Topic,
    ValidationError,
};

/// A submission before the core has minted its identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRequest {
    pub intent_type: IntentType,
    pub assets: [Asset; 2],
    pub amount_in: rust_decimal::Decimal,
    pub constraints: Constraints,
}

/// Submission errors, surfaced synchronously to the submitter.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("publish failed: {0}")]
    Publish(#[from] BusError),
}

/// Result type for submission operations.
pub type SubmitResult<T> = Result<T, SubmitError>;

/// Intent manager configuration.
#[derive(Debug, Clone)]
pub struct IntentManagerConfig {
    /// Attempts for the `intent.accepted` publish.
    pub accept_publish_attempts: u32,
    /// Base backoff between accept-publish attempts.
    pub accept_retry_base: Duration,
}

impl Default for IntentManagerConfig {
    fn default() -> Self {
        Self {
            accept_publish_attempts: 3,
            accept_retry_base: Duration::from_millis(100),
        }
    }
}

/// Accepts intent submissions and drives them through the risk gate.
pub struct IntentManager {
    bus: Arc<EventBus>,
    risk: RiskConfig,
    config: IntentManagerConfig,
}

impl IntentManager {
    pub fn new(bus: Arc<EventBus>, risk: RiskConfig, config: IntentManagerConfig) -> Self {
        Self { bus, risk, config }
    }

    /// Submit an intent. Returns once the root publish (and the risk
    /// outcome publish) have acknowledged; later lifecycle steps are
    /// asynchronous and cannot be cancelled from outside.
    pub async fn submit(&self, request: IntentRequest) -> SubmitResult<EventId> {
        let intent_id = EventId::new();
        let intent = Intent {
            intent_id,
            intent_type: request.intent_type,
            assets: request.assets,
            amount_in: request.amount_in,
            constraints: request.constraints,
        };
        intent.validate()?;

        let correlation_id = CorrelationId::for_intent(&intent_id);
        let mut submitted = EventEnvelope::make(
            Topic::IntentSubmitted,
            EventPayload::IntentSubmitted(intent.clone()),
            correlation_id.clone(),
            None,
            Some(1),
        )?;
        // The root envelope id doubles as the intent id.
        submitted.event_id = intent_id;
        self.bus.publish(submitted.clone())?;
        info!(intent_id = %intent_id, "intent submitted");

        match evaluate(&self.risk, &intent) {
            RiskVerdict::Rejected { reason } => {
                let rejected = EventEnvelope::make(
                    Topic::RiskRejected,
                    EventPayload::RiskRejected(RiskRejected { intent_id, reason }),
                    correlation_id,
                    Some(submitted.event_id),
                    Some(2),
                )?;
                self.bus.publish(rejected)?;
                info!(intent_id = %intent_id, reason = %reason, "intent rejected by risk gate");
                Ok(intent_id)
            }
            RiskVerdict::Approved => {
                let approved = EventEnvelope::make(
                    Topic::RiskApproved,
                    EventPayload::RiskApproved(RiskApproved { intent_id }),
                    correlation_id.clone(),
                    Some(submitted.event_id),
                    Some(2),
                )?;
                self.bus.publish(approved.clone())?;

                let accepted = EventEnvelope::make(
                    Topic::IntentAccepted,
                    EventPayload::IntentAccepted(IntentAccepted { intent_id }),
                    correlation_id.clone(),
                    Some(approved.event_id),
                    Some(3),
                )?;
                if self.publish_with_retry(&accepted).await {
                    info!(intent_id = %intent_id, "intent accepted");
                    return Ok(intent_id);
                }

                // risk.approved already landed, so the failure must surface
                // as an event rather than leave the correlation dangling.
                warn!(intent_id = %intent_id, "accept publish exhausted retries");
                let failed = EventEnvelope::make(
                    Topic::IntentFailed,
                    EventPayload::IntentFailed(IntentFailed {
                        intent_id,
                        reason: Reason::AcceptPublishFailed,
                    }),
                    correlation_id,
                    Some(approved.event_id),
                    Some(3),
                )?;
                self.bus.publish(failed)?;
                Ok(intent_id)
            }
        }
    }

    async fn publish_with_retry(&self, envelope: &EventEnvelope) -> bool {
        for attempt in 1..=self.config.accept_publish_attempts {
            match self.bus.publish(envelope.clone()) {
                Ok(_) => return true,
                Err(e) => {
                    warn!(
                        event_id = %envelope.event_id,
                        attempt,
                        error = %e,
                        "accept publish failed"
                    );
                    if attempt < self.config.accept_publish_attempts {
                        tokio::time::sleep(backoff_with_jitter(
                            self.config.accept_retry_base,
                            attempt,
                        ))
                        .await;
                    }
                }
            }
        }
        false
    }
}

/// Exponential backoff with ±20% jitter.
fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_millis() as u64 * (1u64 << (attempt - 1).min(16));
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((exp as f64 * jitter) as u64)
}
