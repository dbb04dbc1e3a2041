//! Pure projection reducer: `apply(state, envelope) -> state'`.
//!
//! The reducer is total over the topic registry and idempotent under
//! re-apply given sequence monotonicity: a stale envelope (sequence at or
//! below the model's `last_sequence`) is a no-op, and rebuilding a read
//! model by replaying its correlation prefix from the empty state yields
//! the stored value (modulo `updated_at` timestamps, which come from the
//! envelopes themselves and therefore replay identically).

use rust_decimal::Decimal;

use orchex_types::{
    EventEnvelope, EventId, EventPayload, IntentReadModel, IntentState, PlanReadModel, PlanStatus,
    Topic,
};

/// Result of applying one envelope to the read models it touches.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Transition accepted; write back the returned models.
    Applied {
        intent: Option<IntentReadModel>,
        plan: Option<PlanReadModel>,
    },
    /// Sequence at or below the model's last applied sequence.
    Stale,
    /// Transition not in the table; the envelope stays in the log but the
    /// projection is untouched.
    InvalidTransition,
    /// Unknown topic from a newer writer; skipped silently.
    UnknownTopic,
}

/// The plan read model an envelope addresses, if any.
pub fn plan_id_of(envelope: &EventEnvelope) -> Option<EventId> {
    match &envelope.payload {
        EventPayload::PlanCreated(plan) => Some(plan.plan_id),
        EventPayload::ExecStarted(p) => Some(p.plan_id),
        EventPayload::ExecStepSubmitted(p) => Some(p.plan_id),
        EventPayload::ExecStepFilled(p) => Some(p.plan_id),
        EventPayload::ExecCompleted(p) => Some(p.plan_id),
        EventPayload::ExecFailed(p) => p.plan_id,
        _ => None,
    }
}

fn touch(model: &mut IntentReadModel, envelope: &EventEnvelope, sequence: u64) {
    model.last_event_id = envelope.event_id;
    model.last_sequence = sequence;
    model.updated_at = envelope.timestamp;
}

/// Apply one envelope to the current intent and plan read models.
///
/// `intent` is the model for the envelope's correlation; `plan` is the
/// model addressed by [`plan_id_of`], when one exists.
pub fn apply(
    intent: Option<&IntentReadModel>,
    plan: Option<&PlanReadModel>,
    envelope: &EventEnvelope,
) -> ApplyOutcome {
    let Some(sequence) = envelope.sequence else {
        return ApplyOutcome::InvalidTransition;
    };
    if let Some(model) = intent {
        if sequence <= model.last_sequence {
            return ApplyOutcome::Stale;
        }
    }

    match (&envelope.topic, &envelope.payload) {
        (Topic::IntentSubmitted, EventPayload::IntentSubmitted(submitted)) => {
            if intent.is_some() {
                return ApplyOutcome::InvalidTransition;
            }
            ApplyOutcome::Applied {
                intent: Some(IntentReadModel {
                    intent_id: submitted.intent_id,
                    correlation_id: envelope.correlation_id.clone(),
                    state: IntentState::Submitted,
                    last_event_id: envelope.event_id,
                    last_sequence: sequence,
                    updated_at: envelope.timestamp,
                    latest_plan_id: None,
                    reason: None,
                    tx_hash: None,
                    amount_out: None,
                }),
                plan: None,
            }
        }

        (Topic::RiskApproved, EventPayload::RiskApproved(_)) => {
            let Some(model) = intent else {
                return ApplyOutcome::InvalidTransition;
            };
            if model.state != IntentState::Submitted {
                return ApplyOutcome::InvalidTransition;
            }
            let mut next = model.clone();
            touch(&mut next, envelope, sequence);
            ApplyOutcome::Applied {
                intent: Some(next),
                plan: None,
            }
        }

        (Topic::IntentAccepted, EventPayload::IntentAccepted(_)) => {
            let Some(model) = intent else {
                return ApplyOutcome::InvalidTransition;
            };
            if model.state != IntentState::Submitted {
                return ApplyOutcome::InvalidTransition;
            }
            let mut next = model.clone();
            next.state = IntentState::Accepted;
            touch(&mut next, envelope, sequence);
            ApplyOutcome::Applied {
                intent: Some(next),
                plan: None,
            }
        }

        (Topic::RiskRejected, EventPayload::RiskRejected(rejected)) => {
            let Some(model) = intent else {
                return ApplyOutcome::InvalidTransition;
            };
            if model.state != IntentState::Submitted {
                return ApplyOutcome::InvalidTransition;
            }
            let mut next = model.clone();
            next.state = IntentState::Rejected;
            next.reason = Some(rejected.reason);
            touch(&mut next, envelope, sequence);
            ApplyOutcome::Applied {
                intent: Some(next),
                plan: None,
            }
        }

        (Topic::IntentFailed, EventPayload::IntentFailed(failed)) => {
            let Some(model) = intent else {
                return ApplyOutcome::InvalidTransition;
            };
            if model.state.is_terminal() {
                return ApplyOutcome::InvalidTransition;
            }
            let mut next = model.clone();
            next.state = IntentState::Failed;
            next.reason = Some(failed.reason);
            touch(&mut next, envelope, sequence);
            ApplyOutcome::Applied {
                intent: Some(next),
                plan: None,
            }
        }

        (Topic::PlanCreated, EventPayload::PlanCreated(created)) => {
            let Some(model) = intent else {
                return ApplyOutcome::InvalidTransition;
            };
            if model.state != IntentState::Accepted || plan.is_some() {
                return ApplyOutcome::InvalidTransition;
            }
            let mut next = model.clone();
            next.state = IntentState::Planned;
            next.latest_plan_id = Some(created.plan_id);
            touch(&mut next, envelope, sequence);
            ApplyOutcome::Applied {
                intent: Some(next),
                plan: Some(PlanReadModel {
                    plan_id: created.plan_id,
                    intent_id: created.intent_id,
                    status: PlanStatus::Planned,
                    steps: created.steps.clone(),
                    progress: Decimal::ZERO,
                    updated_at: envelope.timestamp,
                }),
            }
        }

        (Topic::PlanRejected, EventPayload::PlanRejected(rejected)) => {
            let Some(model) = intent else {
                return ApplyOutcome::InvalidTransition;
            };
            if model.state != IntentState::Accepted {
                return ApplyOutcome::InvalidTransition;
            }
            let mut next = model.clone();
            next.state = IntentState::Failed;
            next.reason = Some(rejected.reason);
            touch(&mut next, envelope, sequence);
            ApplyOutcome::Applied {
                intent: Some(next),
                plan: None,
            }
        }

        (Topic::ExecStarted, EventPayload::ExecStarted(_)) => {
            let (Some(model), Some(plan_model)) = (intent, plan) else {
                return ApplyOutcome::InvalidTransition;
            };
            if model.state != IntentState::Planned || plan_model.status != PlanStatus::Planned {
                return ApplyOutcome::InvalidTransition;
            }
            let mut next = model.clone();
            next.state = IntentState::Executing;
            touch(&mut next, envelope, sequence);
            let mut next_plan = plan_model.clone();
            next_plan.status = PlanStatus::Executing;
            next_plan.updated_at = envelope.timestamp;
            ApplyOutcome::Applied {
                intent: Some(next),
                plan: Some(next_plan),
            }
        }

        (Topic::ExecStepSubmitted, EventPayload::ExecStepSubmitted(submitted)) => {
            let (Some(model), Some(plan_model)) = (intent, plan) else {
                return ApplyOutcome::InvalidTransition;
            };
            if model.state != IntentState::Executing || plan_model.status != PlanStatus::Executing {
                return ApplyOutcome::InvalidTransition;
            }
            let mut next = model.clone();
            next.tx_hash = Some(submitted.tx_hash.clone());
            touch(&mut next, envelope, sequence);
            let mut next_plan = plan_model.clone();
            next_plan.updated_at = envelope.timestamp;
            ApplyOutcome::Applied {
                intent: Some(next),
                plan: Some(next_plan),
            }
        }

        (Topic::ExecStepFilled, EventPayload::ExecStepFilled(filled)) => {
            let (Some(model), Some(plan_model)) = (intent, plan) else {
                return ApplyOutcome::InvalidTransition;
            };
            // A fill for an already fully-filled plan would double-apply.
            if model.state != IntentState::Executing
                || plan_model.status != PlanStatus::Executing
                || plan_model.progress >= Decimal::ONE
            {
                return ApplyOutcome::InvalidTransition;
            }
            let mut next = model.clone();
            next.amount_out = Some(filled.amount_out);
            next.tx_hash = Some(filled.tx_hash.clone());
            touch(&mut next, envelope, sequence);
            let mut next_plan = plan_model.clone();
            let total = Decimal::from(next_plan.steps.len().max(1));
            next_plan.progress = (Decimal::from(filled.step + 1) / total).min(Decimal::ONE);
            next_plan.updated_at = envelope.timestamp;
            ApplyOutcome::Applied {
                intent: Some(next),
                plan: Some(next_plan),
            }
        }

        (Topic::ExecCompleted, EventPayload::ExecCompleted(completed)) => {
            let (Some(model), Some(plan_model)) = (intent, plan) else {
                return ApplyOutcome::InvalidTransition;
            };
            if model.state != IntentState::Executing || plan_model.status != PlanStatus::Executing {
                return ApplyOutcome::InvalidTransition;
            }
            let mut next = model.clone();
            next.state = IntentState::Completed;
            next.amount_out = Some(completed.amount_out);
            next.tx_hash = Some(completed.tx_hash.clone());
            touch(&mut next, envelope, sequence);
            let mut next_plan = plan_model.clone();
            next_plan.status = PlanStatus::Completed;
            next_plan.updated_at = envelope.timestamp;
            ApplyOutcome::Applied {
                intent: Some(next),
                plan: Some(next_plan),
            }
        }

        (Topic::ExecFailed, EventPayload::ExecFailed(failed)) => {
            let Some(model) = intent else {
                return ApplyOutcome::InvalidTransition;
            };
            // Terminal states are absorbing.
            if model.state.is_terminal() {
                return ApplyOutcome::InvalidTransition;
            }
            let mut next = model.clone();
            next.state = IntentState::Failed;
            next.reason = Some(failed.reason);
            touch(&mut next, envelope, sequence);
            let next_plan = plan.and_then(|p| {
                if matches!(p.status, PlanStatus::Completed | PlanStatus::Failed) {
                    None
                } else {
                    let mut next_plan = p.clone();
                    next_plan.status = PlanStatus::Failed;
                    next_plan.updated_at = envelope.timestamp;
                    Some(next_plan)
                }
            });
            ApplyOutcome::Applied {
                intent: Some(next),
                plan: next_plan,
            }
        }

        (Topic::Unknown(_), _) | (_, EventPayload::Unknown(_)) => ApplyOutcome::UnknownTopic,

        // Topic/payload disagreement cannot come from make_envelope; treat
        // as a transition outside the table.
        _ => ApplyOutcome::InvalidTransition,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchex_types::{
        Asset, Constraints, CorrelationId, ExecCompleted, ExecStarted, ExecStepFilled,
        ExecStepSubmitted, ExecutionPlan, ExecutionStyle, Intent, IntentAccepted, IntentType,
        PlanStep, Reason, RiskApproved, RiskRejected, TxHash, VenueId,
    };
    use rust_decimal_macros::dec;

    struct Fixture {
        correlation: CorrelationId,
        intent_id: EventId,
        plan_id: EventId,
        last: EventId,
        seq: u64,
    }

    impl Fixture {
        fn new() -> Self {
            let intent_id = EventId::new();
            Self {
                correlation: CorrelationId::for_intent(&intent_id),
                intent_id,
                plan_id: EventId::new(),
                last: intent_id,
                seq: 0,
            }
        }

        fn envelope(&mut self, topic: Topic, payload: EventPayload) -> EventEnvelope {
            self.seq += 1;
            let env = EventEnvelope::make(
                topic,
                payload,
                self.correlation.clone(),
                (self.seq > 1).then_some(self.last),
                Some(self.seq),
            )
            .unwrap();
            self.last = env.event_id;
            env
        }

        fn intent(&self) -> Intent {
            Intent {
                intent_id: self.intent_id,
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
            }
        }

        fn plan(&self) -> ExecutionPlan {
            ExecutionPlan {
                plan_id: self.plan_id,
                intent_id: self.intent_id,
                steps: vec![PlanStep {
                    venue: VenueId::uniswap_v3(),
                    base: Asset::new("USDC", 1, "0xa0b8", 6),
                    quote: Asset::new("WETH", 1, "0xc02a", 18),
                    amount_in: dec!(1000),
                    min_out: dec!(0.32),
                    recipient: "0xrecipient".to_string(),
                }],
                estimated_cost: dec!(3),
                estimated_duration_ms: 15_000,
            }
        }
    }

    fn applied(outcome: ApplyOutcome) -> (Option<IntentReadModel>, Option<PlanReadModel>) {
        match outcome {
            ApplyOutcome::Applied { intent, plan } => (intent, plan),
            other => panic!("expected Applied, got {:?}", other),
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut fx = Fixture::new();

        let submitted = fx.envelope(
            Topic::IntentSubmitted,
            EventPayload::IntentSubmitted(fx.intent()),
        );
        let (intent, _) = applied(apply(None, None, &submitted));
        let intent = intent.unwrap();
        assert_eq!(intent.state, IntentState::Submitted);
        assert_eq!(intent.last_sequence, 1);

        let approved = fx.envelope(
            Topic::RiskApproved,
            EventPayload::RiskApproved(RiskApproved {
                intent_id: fx.intent_id,
            }),
        );
        let (intent, _) = applied(apply(Some(&intent), None, &approved));
        let intent = intent.unwrap();
        assert_eq!(intent.state, IntentState::Submitted);
        assert_eq!(intent.last_sequence, 2);

        let accepted = fx.envelope(
            Topic::IntentAccepted,
            EventPayload::IntentAccepted(IntentAccepted {
                intent_id: fx.intent_id,
            }),
        );
        let (intent, _) = applied(apply(Some(&intent), None, &accepted));
        let intent = intent.unwrap();
        assert_eq!(intent.state, IntentState::Accepted);

        let plan_created = fx.envelope(Topic::PlanCreated, EventPayload::PlanCreated(fx.plan()));
        let (intent, plan) = applied(apply(Some(&intent), None, &plan_created));
        let intent = intent.unwrap();
        let plan = plan.unwrap();
        assert_eq!(intent.state, IntentState::Planned);
        assert_eq!(intent.latest_plan_id, Some(fx.plan_id));
        assert_eq!(plan.status, PlanStatus::Planned);
        assert_eq!(plan.progress, dec!(0));

        let started = fx.envelope(
            Topic::ExecStarted,
            EventPayload::ExecStarted(ExecStarted {
                plan_id: fx.plan_id,
                intent_id: fx.intent_id,
            }),
        );
        let (intent, plan) = applied(apply(Some(&intent), Some(&plan), &started));
        let (intent, plan) = (intent.unwrap(), plan.unwrap());
        assert_eq!(intent.state, IntentState::Executing);
        assert_eq!(plan.status, PlanStatus::Executing);

        let tx_hash = TxHash::new("0xabc");
        let step_submitted = fx.envelope(
            Topic::ExecStepSubmitted,
            EventPayload::ExecStepSubmitted(ExecStepSubmitted {
                plan_id: fx.plan_id,
                step: 0,
                tx_hash: tx_hash.clone(),
            }),
        );
        let (intent, plan) = applied(apply(Some(&intent), Some(&plan), &step_submitted));
        let (intent, plan) = (intent.unwrap(), plan.unwrap());
        assert_eq!(intent.tx_hash, Some(tx_hash.clone()));

        let filled = fx.envelope(
            Topic::ExecStepFilled,
            EventPayload::ExecStepFilled(ExecStepFilled {
                plan_id: fx.plan_id,
                step: 0,
                tx_hash: tx_hash.clone(),
                amount_out: dec!(0.33),
            }),
        );
        let (intent, plan) = applied(apply(Some(&intent), Some(&plan), &filled));
        let (intent, plan) = (intent.unwrap(), plan.unwrap());
        assert_eq!(intent.amount_out, Some(dec!(0.33)));
        assert_eq!(plan.progress, dec!(1));

        let completed = fx.envelope(
            Topic::ExecCompleted,
            EventPayload::ExecCompleted(ExecCompleted {
                plan_id: fx.plan_id,
                tx_hash,
                amount_out: dec!(0.33),
            }),
        );
        let (intent, plan) = applied(apply(Some(&intent), Some(&plan), &completed));
        let (intent, plan) = (intent.unwrap(), plan.unwrap());
        assert_eq!(intent.state, IntentState::Completed);
        assert_eq!(plan.status, PlanStatus::Completed);
        assert_eq!(intent.last_sequence, 8);
    }

    #[test]
    fn test_risk_rejection() {
        let mut fx = Fixture::new();
        let submitted = fx.envelope(
            Topic::IntentSubmitted,
            EventPayload::IntentSubmitted(fx.intent()),
        );
        let (intent, _) = applied(apply(None, None, &submitted));
        let intent = intent.unwrap();

        let rejected = fx.envelope(
            Topic::RiskRejected,
            EventPayload::RiskRejected(RiskRejected {
                intent_id: fx.intent_id,
                reason: Reason::SlippageLimit,
            }),
        );
        let (intent, _) = applied(apply(Some(&intent), None, &rejected));
        let intent = intent.unwrap();
        assert_eq!(intent.state, IntentState::Rejected);
        assert_eq!(intent.reason, Some(Reason::SlippageLimit));
    }

    #[test]
    fn test_stale_sequence_is_noop() {
        let mut fx = Fixture::new();
        let submitted = fx.envelope(
            Topic::IntentSubmitted,
            EventPayload::IntentSubmitted(fx.intent()),
        );
        let (intent, _) = applied(apply(None, None, &submitted));
        let intent = intent.unwrap();

        // Re-applying the same sequence must not mutate.
        assert_eq!(apply(Some(&intent), None, &submitted), ApplyOutcome::Stale);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut fx = Fixture::new();

        // accepted with no prior model
        let accepted = fx.envelope(
            Topic::IntentAccepted,
            EventPayload::IntentAccepted(IntentAccepted {
                intent_id: fx.intent_id,
            }),
        );
        assert_eq!(apply(None, None, &accepted), ApplyOutcome::InvalidTransition);

        // double submit
        let mut fx = Fixture::new();
        let submitted = fx.envelope(
            Topic::IntentSubmitted,
            EventPayload::IntentSubmitted(fx.intent()),
        );
        let (intent, _) = applied(apply(None, None, &submitted));
        let intent = intent.unwrap();
        let submitted_again = fx.envelope(
            Topic::IntentSubmitted,
            EventPayload::IntentSubmitted(fx.intent()),
        );
        assert_eq!(
            apply(Some(&intent), None, &submitted_again),
            ApplyOutcome::InvalidTransition
        );
    }

    #[test]
    fn test_terminal_states_absorbing() {
        let mut fx = Fixture::new();
        let submitted = fx.envelope(
            Topic::IntentSubmitted,
            EventPayload::IntentSubmitted(fx.intent()),
        );
        let (intent, _) = applied(apply(None, None, &submitted));
        let mut intent = intent.unwrap();
        intent.state = IntentState::Completed;

        let failed = fx.envelope(
            Topic::ExecFailed,
            EventPayload::ExecFailed(orchex_types::ExecFailed {
                plan_id: None,
                reason: Reason::DeadlineExceeded,
            }),
        );
        assert_eq!(
            apply(Some(&intent), None, &failed),
            ApplyOutcome::InvalidTransition
        );
    }

    #[test]
    fn test_unknown_topic_skipped() {
        let envelope_json = serde_json::json!({
            "eventId": EventId::new().to_string(),
            "timestamp": chrono::Utc::now(),
            "topic": "market.tick",
            "correlationId": "intent-x",
            "causationId": null,
            "sequence": 9,
            "payload": {"price": "1.0"},
            "version": 1,
        });
        let envelope: EventEnvelope = serde_json::from_value(envelope_json).unwrap();
        assert_eq!(apply(None, None, &envelope), ApplyOutcome::UnknownTopic);
    }

    #[test]
    fn test_double_fill_same_tx_rejected() {
        let mut fx = Fixture::new();
        // Drive to Executing with progress 1.
        let submitted = fx.envelope(
            Topic::IntentSubmitted,
            EventPayload::IntentSubmitted(fx.intent()),
        );
        let (intent, _) = applied(apply(None, None, &submitted));
        let mut intent = intent.unwrap();
        intent.state = IntentState::Executing;

        let plan = PlanReadModel {
            plan_id: fx.plan_id,
            intent_id: fx.intent_id,
            status: PlanStatus::Executing,
            steps: fx.plan().steps,
            progress: dec!(1),
            updated_at: intent.updated_at,
        };

        let filled = fx.envelope(
            Topic::ExecStepFilled,
            EventPayload::ExecStepFilled(ExecStepFilled {
                plan_id: fx.plan_id,
                step: 0,
                tx_hash: TxHash::new("0xabc"),
                amount_out: dec!(0.33),
            }),
        );
        assert_eq!(
            apply(Some(&intent), Some(&plan), &filled),
            ApplyOutcome::InvalidTransition
        );
    }
}
