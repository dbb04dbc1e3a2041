//! End-to-end pipeline scenarios over the in-process bus, in-memory
//! stores, and a scripted venue.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;

use orchex_intents::IntentRequest;
use orchex_runtime::{Config, Runtime};
use orchex_store::{intent_key, plan_key, MemoryEventLog, MemoryReadModelStore, ReadModelStore};
use orchex_types::{
    Asset, Constraints, CorrelationId, EventEnvelope, EventId, EventPayload, ExecutionStyle,
    Intent, IntentState, IntentType, Reason, Topic,
};
use orchex_venue::{MockVenue, PriceQuote, TxReceipt, TxStatus};

fn weth() -> Asset {
    Asset::new("WETH", 1, "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", 18)
}

fn usdc() -> Asset {
    Asset::new("USDC", 1, "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48", 6)
}

fn acquire_request(max_slippage: rust_decimal::Decimal, time_window_ms: u64) -> IntentRequest {
    IntentRequest {
        intent_type: IntentType::Acquire,
        assets: [weth(), usdc()],
        amount_in: dec!(1000.00),
        constraints: Constraints {
            max_slippage,
            time_window_ms,
            execution_style: ExecutionStyle::Adaptive,
            allowed_venues: None,
        },
    }
}

fn quote(amount_out: rust_decimal::Decimal) -> PriceQuote {
    PriceQuote {
        amount_out,
        pool_ref: "pool:USDC-WETH".to_string(),
        fee_bps: 30,
    }
}

fn success_receipt(amount_out: rust_decimal::Decimal) -> TxReceipt {
    TxReceipt {
        status: TxStatus::Success,
        amount_out: Some(amount_out),
        gas_used: 121_000,
        block_number: 19_000_001,
    }
}

fn reverted_receipt() -> TxReceipt {
    TxReceipt {
        status: TxStatus::Reverted,
        amount_out: None,
        gas_used: 61_000,
        block_number: 19_000_001,
    }
}

/// Poll the intent read model until it reaches a terminal state.
async fn wait_terminal(runtime: &Runtime, intent_id: &EventId) -> orchex_types::IntentReadModel {
    for _ in 0..1000 {
        if let Some(model) = runtime.read.get_intent(intent_id).await.unwrap() {
            if model.state.is_terminal() {
                return model;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("intent {} never reached a terminal state", intent_id);
}

async fn wait_event_count(runtime: &Runtime, correlation: &CorrelationId, count: usize) {
    for _ in 0..500 {
        let events = runtime.read.get_events(correlation, 1).await.unwrap();
        if events.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("correlation {} never reached {} events", correlation, count);
}

#[tokio::test]
async fn scenario_a_happy_path_acquire() {
    let venue = Arc::new(MockVenue::new());
    venue.script_quote(Ok(quote(dec!(0.335))));
    venue.script_receipt(Ok(success_receipt(dec!(0.3321))));
    let runtime = Runtime::start_in_memory(Config::default(), venue).unwrap();

    let intent_id = runtime
        .intents
        .submit(acquire_request(dec!(0.01), 300_000))
        .await
        .unwrap();
    let model = wait_terminal(&runtime, &intent_id).await;

    assert_eq!(model.state, IntentState::Completed);
    assert!(model.tx_hash.is_some());

    let correlation = CorrelationId::for_intent(&intent_id);
    let events = runtime.read.get_events(&correlation, 1).await.unwrap();
    let topics: Vec<Topic> = events.iter().map(|e| e.topic.clone()).collect();
    assert_eq!(
        topics,
        vec![
            Topic::IntentSubmitted,
            Topic::RiskApproved,
            Topic::IntentAccepted,
            Topic::PlanCreated,
            Topic::ExecStarted,
            Topic::ExecStepSubmitted,
            Topic::ExecStepFilled,
            Topic::ExecCompleted,
        ]
    );
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence.unwrap()).collect();
    assert_eq!(sequences, (1..=8).collect::<Vec<u64>>());

    // min_out = floor(quote_out × (1 − 0.01)) toward zero.
    let plan = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::PlanCreated(plan) => Some(plan.clone()),
            _ => None,
        })
        .unwrap();
    let min_out = plan.steps[0].min_out;
    assert_eq!(min_out, dec!(0.33165));
    assert!(model.amount_out.unwrap() >= min_out);

    // Causation chains back to the root; only the root is uncaused.
    assert_eq!(events[0].causation_id, None);
    for window in events.windows(2) {
        assert_eq!(window[1].causation_id, Some(window[0].event_id));
    }

    runtime.shutdown().await;
}

#[tokio::test]
async fn scenario_b_risk_rejection() {
    let venue = Arc::new(MockVenue::new());
    let runtime = Runtime::start_in_memory(Config::default(), venue).unwrap();

    let intent_id = runtime
        .intents
        .submit(acquire_request(dec!(0.1), 300_000))
        .await
        .unwrap();
    let model = wait_terminal(&runtime, &intent_id).await;

    assert_eq!(model.state, IntentState::Rejected);
    assert_eq!(model.reason, Some(Reason::SlippageLimit));

    let correlation = CorrelationId::for_intent(&intent_id);
    let events = runtime.read.get_events(&correlation, 1).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].topic, Topic::IntentSubmitted);
    assert_eq!(events[1].topic, Topic::RiskRejected);
    assert!(!events.iter().any(|e| e.topic == Topic::IntentAccepted));

    runtime.shutdown().await;
}

#[tokio::test]
async fn scenario_c_duplicate_submission_at_the_bus() {
    let venue = Arc::new(MockVenue::new());
    let runtime = Runtime::start_in_memory(Config::default(), venue).unwrap();

    // Hand-fed root envelope, bypassing the manager, published twice with
    // the same event id.
    let intent_id = EventId::new();
    let intent = Intent {
        intent_id,
        intent_type: IntentType::Acquire,
        assets: [weth(), usdc()],
        amount_in: dec!(1000.00),
        constraints: Constraints {
            max_slippage: dec!(0.01),
            time_window_ms: 300_000,
            execution_style: ExecutionStyle::Adaptive,
            allowed_venues: None,
        },
    };
    let correlation = CorrelationId::for_intent(&intent_id);
    let mut envelope = EventEnvelope::make(
        Topic::IntentSubmitted,
        EventPayload::IntentSubmitted(intent),
        correlation.clone(),
        None,
        Some(1),
    )
    .unwrap();
    envelope.event_id = intent_id;

    use orchex_bus::PublishOutcome;
    assert_eq!(
        runtime.bus.publish(envelope.clone()).unwrap(),
        PublishOutcome::Ack
    );
    assert_eq!(
        runtime.bus.publish(envelope).unwrap(),
        PublishOutcome::DuplicateSuppressed
    );

    wait_event_count(&runtime, &correlation, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = runtime.read.get_events(&correlation, 1).await.unwrap();
    assert_eq!(events.len(), 1);
    let model = runtime.read.get_intent(&intent_id).await.unwrap().unwrap();
    assert_eq!(model.state, IntentState::Submitted);
    assert_eq!(model.last_sequence, 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn scenario_d_transient_revert_then_success() {
    let venue = Arc::new(MockVenue::new());
    venue.script_quote(Ok(quote(dec!(0.335))));
    venue.script_receipt(Ok(reverted_receipt()));
    venue.script_receipt(Ok(success_receipt(dec!(0.3321))));
    let venue_handle: Arc<dyn orchex_venue::VenueAdapter> = venue.clone();
    let runtime = Runtime::start_in_memory(Config::default(), venue_handle).unwrap();

    let intent_id = runtime
        .intents
        .submit(acquire_request(dec!(0.01), 300_000))
        .await
        .unwrap();
    let model = wait_terminal(&runtime, &intent_id).await;
    assert_eq!(model.state, IntentState::Completed);

    // Two wire submissions, one logical execution.
    assert_eq!(venue.submit_count.load(std::sync::atomic::Ordering::SeqCst), 2);

    let correlation = CorrelationId::for_intent(&intent_id);
    let events = runtime.read.get_events(&correlation, 1).await.unwrap();
    let count = |topic: Topic| events.iter().filter(|e| e.topic == topic).count();
    assert_eq!(count(Topic::ExecStarted), 1);
    assert_eq!(count(Topic::ExecStepSubmitted), 2);
    assert_eq!(count(Topic::ExecStepFilled), 1);
    assert_eq!(count(Topic::ExecCompleted), 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn scenario_e_deadline_exceeded() {
    let venue = Arc::new(MockVenue::new());
    venue.script_quote(Ok(quote(dec!(0.335))));
    // Receipt takes 5s against a 1s execution window.
    venue.script_receipt_delayed(Duration::from_secs(5), Ok(success_receipt(dec!(0.3321))));
    let runtime = Runtime::start_in_memory(Config::default(), venue).unwrap();

    let intent_id = runtime
        .intents
        .submit(acquire_request(dec!(0.01), 1_000))
        .await
        .unwrap();
    let model = wait_terminal(&runtime, &intent_id).await;

    assert_eq!(model.state, IntentState::Failed);
    assert_eq!(model.reason, Some(Reason::DeadlineExceeded));

    runtime.shutdown().await;
}

#[tokio::test]
async fn scenario_f_rebuild_from_log() {
    let venue = Arc::new(MockVenue::new());
    venue.script_quote(Ok(quote(dec!(0.335))));
    venue.script_receipt(Ok(success_receipt(dec!(0.3321))));

    let log = Arc::new(MemoryEventLog::new());
    let models = Arc::new(MemoryReadModelStore::new());
    let runtime = Runtime::start(
        Config::default(),
        venue,
        log,
        Arc::clone(&models) as Arc<dyn ReadModelStore>,
    )
    .unwrap();

    let intent_id = runtime
        .intents
        .submit(acquire_request(dec!(0.01), 300_000))
        .await
        .unwrap();
    let before = wait_terminal(&runtime, &intent_id).await;
    assert_eq!(before.state, IntentState::Completed);
    let plan_id = before.latest_plan_id.unwrap();
    let plan_before = runtime.read.get_plan(&plan_id).await.unwrap().unwrap();

    // Wipe the projections, then replay the correlation from the log.
    models.delete(&intent_key(&intent_id)).await.unwrap();
    models.delete(&plan_key(&plan_id)).await.unwrap();
    assert!(runtime.read.get_intent(&intent_id).await.unwrap().is_none());

    let correlation = CorrelationId::for_intent(&intent_id);
    let rebuilt = runtime
        .coordinator
        .rebuild(&correlation)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rebuilt, before);

    let plan_after = runtime.read.get_plan(&plan_id).await.unwrap().unwrap();
    assert_eq!(plan_after, plan_before);

    runtime.shutdown().await;
}

#[tokio::test]
async fn metrics_stay_clean_on_happy_path() {
    let venue = Arc::new(MockVenue::new());
    venue.script_quote(Ok(quote(dec!(0.335))));
    venue.script_receipt(Ok(success_receipt(dec!(0.3321))));
    let runtime = Runtime::start_in_memory(Config::default(), venue).unwrap();

    let intent_id = runtime
        .intents
        .submit(acquire_request(dec!(0.01), 300_000))
        .await
        .unwrap();
    wait_terminal(&runtime, &intent_id).await;

    let snapshot = runtime.metrics().snapshot();
    assert_eq!(snapshot.invalid_transitions, 0);
    assert_eq!(snapshot.sequence_gaps, 0);

    runtime.shutdown().await;
}
