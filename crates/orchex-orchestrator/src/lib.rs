//! Orchex Orchestrator - Driving Plans Through the Venue
//!
//! Orchestrator workers consume `plan.created` through the
//! `orchestrator.workers` queue group and run each plan's single step
//! through the venue lifecycle:
//!
//! ```text
//! Planned → Building → Submitted → Awaiting → (Filled | Reverted | TimedOut)
//! ```
//!
//! Reverts and transient venue failures are retried with a fresh build
//! (fresh nonce, re-derived deadline) up to the attempt cap, with
//! exponential backoff and jitter between attempts. The intent's execution
//! window is a hard deadline: once it passes, the worker stops awaiting and
//! emits `exec.failed` with `DEADLINE_EXCEEDED`.
//!
//! Emitted envelopes chain causation and carry `prev.sequence + 1`. Racing
//! workers may emit the same intended sequence with distinct event ids; the
//! coordinator keeps the first and suppresses the rest.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use orchex_bus::{BusError, EventBus, QueueSubscription};
use orchex_coordinator::{CoordinatorError, ReadApi};
use orchex_types::{
    CorrelationId, EnvelopeError, EventEnvelope, EventId, EventPayload, ExecCompleted, ExecFailed,
    ExecStarted, ExecStepFilled, ExecStepSubmitted, ExecutionPlan, Reason, Topic,
};
use orchex_venue::{SwapParams, TxStatus, VenueAdapter};

/// Orchestrator errors. These nack the plan envelope for redelivery;
/// terminal execution outcomes are events, not errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The intent's constraints are not yet readable; redeliver later.
    #[error("intent unavailable for {0}")]
    IntentUnavailable(CorrelationId),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Publish(#[from] BusError),

    #[error(transparent)]
    Read(#[from] CoordinatorError),
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Total submissions per plan.
    pub max_attempts: u32,
    /// Backoff base between attempts.
    pub backoff_base: Duration,
    /// Per-await hard cap.
    pub await_receipt_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(200),
            await_receipt_timeout: Duration::from_secs(120),
        }
    }
}

/// Terminal outcome of one plan execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Completed { attempts: u32 },
    Failed { reason: Reason },
}

/// Envelope chain for one correlation: each emission carries the previous
/// event id as causation and the next sequence number.
struct EmitChain<'a> {
    bus: &'a EventBus,
    correlation_id: CorrelationId,
    causation: EventId,
    next_sequence: Option<u64>,
}

impl<'a> EmitChain<'a> {
    fn new(bus: &'a EventBus, cause: &EventEnvelope) -> Self {
        Self {
            bus,
            correlation_id: cause.correlation_id.clone(),
            causation: cause.event_id,
            next_sequence: cause.sequence.map(|s| s + 1),
        }
    }

    fn emit(&mut self, topic: Topic, payload: EventPayload) -> Result<EventId, OrchestratorError> {
        let envelope = EventEnvelope::make(
            topic,
            payload,
            self.correlation_id.clone(),
            Some(self.causation),
            self.next_sequence,
        )?;
        let event_id = envelope.event_id;
        self.bus.publish(envelope)?;
        self.causation = event_id;
        self.next_sequence = self.next_sequence.map(|s| s + 1);
        Ok(event_id)
    }
}

/// Plan execution worker pool state.
pub struct Orchestrator {
    bus: Arc<EventBus>,
    adapter: Arc<dyn VenueAdapter>,
    read: ReadApi,
    config: OrchestratorConfig,
    /// Plans that already emitted `exec.started`.
    started: DashMap<EventId, ()>,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<EventBus>,
        adapter: Arc<dyn VenueAdapter>,
        read: ReadApi,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            bus,
            adapter,
            read,
            config,
            started: DashMap::new(),
        }
    }

    /// Execute one plan envelope to a terminal event.
    pub async fn handle(
        &self,
        plan_envelope: &EventEnvelope,
    ) -> Result<ExecOutcome, OrchestratorError> {
        let EventPayload::PlanCreated(plan) = &plan_envelope.payload else {
            // Not a plan; nothing to execute.
            return Ok(ExecOutcome::Failed {
                reason: Reason::MaxAttemptsExceeded,
            });
        };

        let deadline = self.intent_deadline(&plan_envelope.correlation_id).await?;
        let mut chain = EmitChain::new(&self.bus, plan_envelope);

        if self.started.insert(plan.plan_id, ()).is_none() {
            chain.emit(
                Topic::ExecStarted,
                EventPayload::ExecStarted(ExecStarted {
                    plan_id: plan.plan_id,
                    intent_id: plan.intent_id,
                }),
            )?;
            info!(plan_id = %plan.plan_id, "execution started");
        }

        let outcome = self.run_step(plan, deadline, &mut chain).await?;
        match &outcome {
            ExecOutcome::Completed { attempts } => {
                info!(plan_id = %plan.plan_id, attempts, "execution completed");
            }
            ExecOutcome::Failed { reason } => {
                chain.emit(
                    Topic::ExecFailed,
                    EventPayload::ExecFailed(ExecFailed {
                        plan_id: Some(plan.plan_id),
                        reason: *reason,
                    }),
                )?;
                warn!(plan_id = %plan.plan_id, reason = %reason, "execution failed");
            }
        }
        Ok(outcome)
    }

    async fn run_step(
        &self,
        plan: &ExecutionPlan,
        deadline: DateTime<Utc>,
        chain: &mut EmitChain<'_>,
    ) -> Result<ExecOutcome, OrchestratorError> {
        let Some(step) = plan.steps.first() else {
            return Ok(ExecOutcome::Failed {
                reason: Reason::MaxAttemptsExceeded,
            });
        };

        let mut attempt: u32 = 0;
        let mut last_reverted = false;
        while attempt < self.config.max_attempts {
            attempt += 1;

            let remaining = deadline - Utc::now();
            let Ok(remaining) = remaining.to_std() else {
                return Ok(ExecOutcome::Failed {
                    reason: Reason::DeadlineExceeded,
                });
            };

            // Building: fresh tx, re-derived deadline, fresh nonce.
            let built = match self
                .adapter
                .build_swap_tx(SwapParams {
                    base: step.base.clone(),
                    quote: step.quote.clone(),
                    amount_in: step.amount_in,
                    min_out: step.min_out,
                    recipient: step.recipient.clone(),
                    deadline,
                })
                .await
            {
                Ok(tx) => tx,
                Err(e) if e.is_transient() => {
                    debug!(attempt, error = %e, "build failed, will retry");
                    self.backoff(attempt).await;
                    continue;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "build failed terminally");
                    return Ok(ExecOutcome::Failed {
                        reason: Reason::MaxAttemptsExceeded,
                    });
                }
            };

            // Submitted.
            let tx_hash = match self.adapter.submit_tx(&built).await {
                Ok(hash) => hash,
                Err(e) if e.is_transient() => {
                    debug!(attempt, error = %e, "submit failed, will retry");
                    self.backoff(attempt).await;
                    continue;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "submit failed terminally");
                    return Ok(ExecOutcome::Failed {
                        reason: Reason::MaxAttemptsExceeded,
                    });
                }
            };
            chain.emit(
                Topic::ExecStepSubmitted,
                EventPayload::ExecStepSubmitted(ExecStepSubmitted {
                    plan_id: plan.plan_id,
                    step: 0,
                    tx_hash: tx_hash.clone(),
                }),
            )?;

            // Awaiting, capped by both the per-await limit and what is left
            // of the intent's window.
            let await_cap = remaining.min(self.config.await_receipt_timeout);
            let receipt = tokio::time::timeout(
                await_cap,
                self.adapter.wait_receipt(&tx_hash, await_cap),
            )
            .await;

            match receipt {
                Ok(Ok(receipt)) => match receipt.status {
                    TxStatus::Success => {
                        let amount_out = receipt.amount_out.unwrap_or(step.min_out);
                        chain.emit(
                            Topic::ExecStepFilled,
                            EventPayload::ExecStepFilled(ExecStepFilled {
                                plan_id: plan.plan_id,
                                step: 0,
                                tx_hash: tx_hash.clone(),
                                amount_out,
                            }),
                        )?;
                        chain.emit(
                            Topic::ExecCompleted,
                            EventPayload::ExecCompleted(ExecCompleted {
                                plan_id: plan.plan_id,
                                tx_hash,
                                amount_out,
                            }),
                        )?;
                        return Ok(ExecOutcome::Completed { attempts: attempt });
                    }
                    TxStatus::Reverted => {
                        debug!(attempt, tx_hash = %tx_hash, "tx reverted");
                        last_reverted = true;
                        self.backoff(attempt).await;
                        continue;
                    }
                },
                Ok(Err(e)) if e.is_transient() => {
                    // The window may have run out while waiting.
                    if Utc::now() >= deadline {
                        return Ok(ExecOutcome::Failed {
                            reason: Reason::DeadlineExceeded,
                        });
                    }
                    debug!(attempt, error = %e, "await failed, will retry");
                    self.backoff(attempt).await;
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "await failed terminally");
                    return Ok(ExecOutcome::Failed {
                        reason: Reason::MaxAttemptsExceeded,
                    });
                }
                Err(_elapsed) => {
                    // Hard cap fired; stop awaiting.
                    if Utc::now() >= deadline {
                        return Ok(ExecOutcome::Failed {
                            reason: Reason::DeadlineExceeded,
                        });
                    }
                    self.backoff(attempt).await;
                    continue;
                }
            }
        }

        Ok(ExecOutcome::Failed {
            reason: if last_reverted {
                Reason::Reverted
            } else {
                Reason::MaxAttemptsExceeded
            },
        })
    }

    /// Deadline = root submission time + the intent's execution window.
    async fn intent_deadline(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<DateTime<Utc>, OrchestratorError> {
        let intent = self
            .read
            .intent_for_correlation(correlation_id)
            .await?
            .ok_or_else(|| OrchestratorError::IntentUnavailable(correlation_id.clone()))?;
        let submitted_ms = intent.intent_id.timestamp_ms() as i64;
        let submitted_at = Utc
            .timestamp_millis_opt(submitted_ms)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(submitted_at + chrono::Duration::milliseconds(intent.constraints.time_window_ms as i64))
    }

    async fn backoff(&self, attempt: u32) {
        let exp = self.config.backoff_base.as_millis() as u64 * (1u64 << (attempt - 1).min(16));
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        tokio::time::sleep(Duration::from_millis((exp as f64 * jitter) as u64)).await;
    }

    /// Consume the plan queue until shutdown.
    pub async fn run(
        self: Arc<Self>,
        sub: QueueSubscription,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                maybe = sub.recv() => {
                    let Some(envelope) = maybe else { break };
                    if envelope.topic != Topic::PlanCreated {
                        sub.ack(&envelope.event_id);
                        continue;
                    }
                    let event_id = envelope.event_id;
                    match self.handle(&envelope).await {
                        Ok(_) => sub.ack(&event_id),
                        Err(e) => {
                            warn!(event_id = %event_id, error = %e, "plan execution errored, nacking");
                            sub.nack(&event_id);
                        }
                    }
                }
            }
        }
    }
}
