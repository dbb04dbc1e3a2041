//! Orchex Planner - From Accepted Intent to Executable Plan
//!
//! Planner workers consume `intent.accepted` through the `planner.workers`
//! queue group. For each acceptance the worker recovers the original intent
//! payload (from a short-lived local cache fed by the live bus tap, falling
//! back to the coordinator's read API), asks the route source for the best
//! route, derives `min_out` with exact decimal arithmetic, and publishes a
//! single-step `plan.created` — or `plan.rejected` when routing fails.
//!
//! The planner holds no state between envelopes; duplicate deliveries are
//! tolerated because the coordinator enforces idempotency downstream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use orchex_bus::{BusError, EventBus, QueueSubscription};
use orchex_coordinator::{CoordinatorError, ReadApi};
use orchex_types::{
    Asset, CorrelationId, EnvelopeError, EventEnvelope, EventId, EventPayload, ExecutionPlan,
    Intent, PlanRejected, PlanStep, Reason, Topic, VenueId,
};
use orchex_venue::{VenueAdapter, VenueError};

/// Output of the external route function.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub amount_out: Decimal,
    pub path: Vec<String>,
}

/// Routing failures, classified for the `plan.rejected` reason.
#[derive(Debug, Clone, Error)]
pub enum RouteError {
    #[error("no route for pair")]
    NoRoute,

    #[error("route lookup timed out")]
    Timeout,

    #[error("route function error: {0}")]
    Internal(String),
}

impl RouteError {
    pub fn reason(&self) -> Reason {
        match self {
            RouteError::NoRoute => Reason::NoRoute,
            RouteError::Timeout => Reason::RouteTimeout,
            RouteError::Internal(_) => Reason::RouteInternal,
        }
    }

    /// Timeouts and internal errors are worth a local retry; a missing
    /// route is not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RouteError::NoRoute)
    }
}

/// External pure route function: deterministic output given pool snapshots.
#[async_trait]
pub trait RouteSource: Send + Sync {
    async fn best_route(
        &self,
        base: &Asset,
        quote: &Asset,
        amount_in: Decimal,
    ) -> Result<Route, RouteError>;
}

/// Route source backed by a venue adapter's quoting surface.
pub struct VenueRouteSource {
    adapter: Arc<dyn VenueAdapter>,
}

impl VenueRouteSource {
    pub fn new(adapter: Arc<dyn VenueAdapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl RouteSource for VenueRouteSource {
    async fn best_route(
        &self,
        base: &Asset,
        quote: &Asset,
        amount_in: Decimal,
    ) -> Result<Route, RouteError> {
        match self.adapter.price_quote(base, quote, amount_in).await {
            Ok(q) => Ok(Route {
                amount_out: q.amount_out,
                path: vec![q.pool_ref],
            }),
            Err(VenueError::NoPool { .. }) => Err(RouteError::NoRoute),
            Err(VenueError::RpcTimeout(_)) => Err(RouteError::Timeout),
            Err(e) => Err(RouteError::Internal(e.to_string())),
        }
    }
}

/// `floor(amount_out × (1 − max_slippage))` in exact decimal arithmetic,
/// rounded toward zero at the receive asset's decimals.
pub fn min_out(amount_out: Decimal, max_slippage: Decimal, decimals: u8) -> Decimal {
    (amount_out * (Decimal::ONE - max_slippage))
        .round_dp_with_strategy(decimals as u32, RoundingStrategy::ToZero)
}

/// Planner errors.
#[derive(Debug, Error)]
pub enum PlannerError {
    /// The intent payload is not yet available anywhere; redeliver later.
    #[error("intent payload unavailable for {0}")]
    IntentUnavailable(CorrelationId),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Publish(#[from] BusError),

    #[error(transparent)]
    Read(#[from] CoordinatorError),
}

/// What the planner did with one acceptance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Planned {
    Created(EventId),
    Rejected(Reason),
}

/// Planner configuration.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Total route attempts (1 + local retries).
    pub route_attempts: u32,
    /// TTL for the local intent cache; matches the bus dedup horizon.
    pub cache_ttl: Duration,
    /// Recipient address stamped into plan steps.
    pub recipient: String,
    /// Venue used for the single-step plan.
    pub venue: VenueId,
    /// Flat execution cost estimate, quote units.
    pub estimated_cost: Decimal,
    pub estimated_duration_ms: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            route_attempts: 3,
            cache_ttl: Duration::from_secs(120),
            recipient: "0x0000000000000000000000000000000000000000".to_string(),
            venue: VenueId::uniswap_v3(),
            estimated_cost: dec!(3),
            estimated_duration_ms: 15_000,
        }
    }
}

/// Stateless planning worker pool state.
pub struct Planner {
    bus: Arc<EventBus>,
    routes: Arc<dyn RouteSource>,
    read: ReadApi,
    config: PlannerConfig,
    cache: DashMap<CorrelationId, (Intent, Instant)>,
}

impl Planner {
    pub fn new(
        bus: Arc<EventBus>,
        routes: Arc<dyn RouteSource>,
        read: ReadApi,
        config: PlannerConfig,
    ) -> Self {
        Self {
            bus,
            routes,
            read,
            config,
            cache: DashMap::new(),
        }
    }

    /// Remember an intent payload seen on the live tap.
    pub fn cache_intent(&self, correlation_id: CorrelationId, intent: Intent) {
        self.cache.insert(correlation_id, (intent, Instant::now()));
        if self.cache.len() > 4096 {
            let ttl = self.config.cache_ttl;
            self.cache.retain(|_, (_, at)| at.elapsed() < ttl);
        }
    }

    async fn lookup_intent(&self, correlation_id: &CorrelationId) -> Result<Intent, PlannerError> {
        if let Some(entry) = self.cache.get(correlation_id) {
            let (intent, at) = entry.value();
            if at.elapsed() < self.config.cache_ttl {
                return Ok(intent.clone());
            }
        }
        self.read
            .intent_for_correlation(correlation_id)
            .await?
            .ok_or_else(|| PlannerError::IntentUnavailable(correlation_id.clone()))
    }

    async fn route_with_retries(
        &self,
        base: &Asset,
        quote: &Asset,
        amount_in: Decimal,
    ) -> Result<Route, RouteError> {
        let mut last = RouteError::Internal("no attempts".to_string());
        for attempt in 1..=self.config.route_attempts {
            match self.routes.best_route(base, quote, amount_in).await {
                Ok(route) => return Ok(route),
                Err(e) if e.is_retryable() && attempt < self.config.route_attempts => {
                    debug!(attempt, error = %e, "route attempt failed, retrying");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Plan one accepted intent.
    pub async fn handle(&self, accepted: &EventEnvelope) -> Result<Planned, PlannerError> {
        let correlation_id = accepted.correlation_id.clone();
        let intent = self.lookup_intent(&correlation_id).await?;
        let next_sequence = accepted.sequence.map(|s| s + 1);
        let (spend, receive) = intent.direction();

        let route = match self
            .route_with_retries(spend, receive, intent.amount_in)
            .await
        {
            Ok(route) => route,
            Err(e) => {
                let reason = e.reason();
                warn!(intent_id = %intent.intent_id, reason = %reason, "routing failed");
                let rejected = EventEnvelope::make(
                    Topic::PlanRejected,
                    EventPayload::PlanRejected(PlanRejected {
                        intent_id: intent.intent_id,
                        reason,
                    }),
                    correlation_id,
                    Some(accepted.event_id),
                    next_sequence,
                )?;
                self.bus.publish(rejected)?;
                return Ok(Planned::Rejected(reason));
            }
        };

        let plan_id = EventId::new();
        let plan = ExecutionPlan {
            plan_id,
            intent_id: intent.intent_id,
            steps: vec![PlanStep {
                venue: self.config.venue.clone(),
                base: spend.clone(),
                quote: receive.clone(),
                amount_in: intent.amount_in,
                min_out: min_out(
                    route.amount_out,
                    intent.constraints.max_slippage,
                    receive.decimals,
                ),
                recipient: self.config.recipient.clone(),
            }],
            estimated_cost: self.config.estimated_cost,
            estimated_duration_ms: self.config.estimated_duration_ms,
        };

        let mut created = EventEnvelope::make(
            Topic::PlanCreated,
            EventPayload::PlanCreated(plan),
            correlation_id,
            Some(accepted.event_id),
            next_sequence,
        )?;
        // The plan envelope id doubles as the plan id.
        created.event_id = plan_id;
        self.bus.publish(created)?;
        info!(intent_id = %intent.intent_id, plan_id = %plan_id, "plan created");
        Ok(Planned::Created(plan_id))
    }

    /// Consume the acceptance queue until shutdown.
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
                    let event_id = envelope.event_id;
                    match self.handle(&envelope).await {
                        Ok(_) => sub.ack(&event_id),
                        Err(e) => {
                            warn!(event_id = %event_id, error = %e, "planning failed, nacking");
                            sub.nack(&event_id);
                        }
                    }
                }
            }
        }
    }

    /// Tail `intent.submitted` live and keep the local payload cache warm.
    pub fn spawn_cache_filler(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let planner = Arc::clone(self);
        let mut tap = match planner.bus.subscribe_ephemeral("intent.submitted", None) {
            Ok(tap) => tap,
            Err(e) => {
                warn!(error = %e, "cache filler could not subscribe");
                return tokio::spawn(async {});
            }
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    maybe = tap.recv() => {
                        let Some(envelope) = maybe else { break };
                        if let EventPayload::IntentSubmitted(intent) = envelope.payload {
                            planner.cache_intent(envelope.correlation_id, intent);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchex_bus::BusConfig;
    use orchex_store::{EventLog, MemoryEventLog, MemoryReadModelStore};
    use orchex_types::{Constraints, ExecutionStyle, IntentAccepted, IntentType};
    use orchex_venue::{MockVenue, PriceQuote};

    fn weth() -> Asset {
        Asset::new("WETH", 1, "0xc02a", 18)
    }

    fn usdc() -> Asset {
        Asset::new("USDC", 1, "0xa0b8", 6)
    }

    fn test_intent(intent_id: EventId) -> Intent {
        Intent {
            intent_id,
            intent_type: IntentType::Acquire,
            assets: [weth(), usdc()],
            amount_in: dec!(1000),
            constraints: Constraints {
                max_slippage: dec!(0.01),
                time_window_ms: 300_000,
                execution_style: ExecutionStyle::Adaptive,
                allowed_venues: None,
            },
        }
    }

    fn accepted_envelope(intent_id: EventId) -> EventEnvelope {
        EventEnvelope::make(
            Topic::IntentAccepted,
            EventPayload::IntentAccepted(IntentAccepted { intent_id }),
            CorrelationId::for_intent(&intent_id),
            Some(intent_id),
            Some(3),
        )
        .unwrap()
    }

    fn planner_with(venue: Arc<MockVenue>) -> (Arc<Planner>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(BusConfig::default()));
        let read = ReadApi::new(
            Arc::new(MemoryEventLog::new()),
            Arc::new(MemoryReadModelStore::new()),
        );
        let planner = Arc::new(Planner::new(
            Arc::clone(&bus),
            Arc::new(VenueRouteSource::new(venue)),
            read,
            PlannerConfig::default(),
        ));
        (planner, bus)
    }

    #[test]
    fn test_min_out_rounds_toward_zero() {
        // 3.333... × 0.99 truncated at 6 decimals
        assert_eq!(
            min_out(dec!(3.3333339), dec!(0.01), 6),
            dec!(3.300000)
        );
        assert_eq!(min_out(dec!(100), dec!(0.01), 18), dec!(99));
        // Never rounds up.
        assert!(min_out(dec!(0.9999999), dec!(0.5), 6) <= dec!(0.49999995));
    }

    #[tokio::test]
    async fn test_plan_created_from_cached_intent() {
        let venue = Arc::new(MockVenue::new());
        venue.script_quote(Ok(PriceQuote {
            amount_out: dec!(0.331),
            pool_ref: "pool:USDC-WETH".to_string(),
            fee_bps: 30,
        }));
        let (planner, bus) = planner_with(venue);
        let capture = bus.subscribe_queue("plan.*", "capture").unwrap();

        let intent_id = EventId::new();
        planner.cache_intent(
            CorrelationId::for_intent(&intent_id),
            test_intent(intent_id),
        );

        let accepted = accepted_envelope(intent_id);
        let outcome = planner.handle(&accepted).await.unwrap();
        let Planned::Created(plan_id) = outcome else {
            panic!("expected plan, got {:?}", outcome);
        };

        let created = capture.recv().await.unwrap();
        assert_eq!(created.topic, Topic::PlanCreated);
        assert_eq!(created.event_id, plan_id);
        assert_eq!(created.sequence, Some(4));
        assert_eq!(created.causation_id, Some(accepted.event_id));
        match created.payload {
            EventPayload::PlanCreated(plan) => {
                assert_eq!(plan.plan_id, plan_id);
                assert_eq!(plan.steps.len(), 1);
                let step = &plan.steps[0];
                // Acquire: spend the quote leg, receive the target.
                assert_eq!(step.base.symbol, "USDC");
                assert_eq!(step.quote.symbol, "WETH");
                assert_eq!(step.min_out, min_out(dec!(0.331), dec!(0.01), 18));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_route_rejects_plan() {
        let venue = Arc::new(MockVenue::new());
        venue.script_quote(Err(VenueError::NoPool {
            base: "USDC".to_string(),
            quote: "WETH".to_string(),
        }));
        let (planner, bus) = planner_with(venue);
        let capture = bus.subscribe_queue("plan.*", "capture").unwrap();

        let intent_id = EventId::new();
        planner.cache_intent(
            CorrelationId::for_intent(&intent_id),
            test_intent(intent_id),
        );

        let outcome = planner.handle(&accepted_envelope(intent_id)).await.unwrap();
        assert_eq!(outcome, Planned::Rejected(Reason::NoRoute));

        let rejected = capture.recv().await.unwrap();
        assert_eq!(rejected.topic, Topic::PlanRejected);
        match rejected.payload {
            EventPayload::PlanRejected(p) => assert_eq!(p.reason, Reason::NoRoute),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_route_failure_retried() {
        let venue = Arc::new(MockVenue::new());
        venue.script_quote(Err(VenueError::RpcTimeout(Duration::from_millis(1))));
        venue.script_quote(Ok(PriceQuote {
            amount_out: dec!(0.33),
            pool_ref: "pool:USDC-WETH".to_string(),
            fee_bps: 30,
        }));
        let (planner, _) = planner_with(venue);

        let intent_id = EventId::new();
        planner.cache_intent(
            CorrelationId::for_intent(&intent_id),
            test_intent(intent_id),
        );

        let outcome = planner.handle(&accepted_envelope(intent_id)).await.unwrap();
        assert!(matches!(outcome, Planned::Created(_)));
    }

    #[tokio::test]
    async fn test_missing_intent_is_retryable_error() {
        let (planner, _) = planner_with(Arc::new(MockVenue::new()));
        let err = planner
            .handle(&accepted_envelope(EventId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::IntentUnavailable(_)));
    }

    #[tokio::test]
    async fn test_fallback_to_read_api() {
        let venue = Arc::new(MockVenue::new());
        let bus = Arc::new(EventBus::new(BusConfig::default()));
        let log = Arc::new(MemoryEventLog::new());
        let models = Arc::new(MemoryReadModelStore::new());

        let intent_id = EventId::new();
        let submitted = EventEnvelope::make(
            Topic::IntentSubmitted,
            EventPayload::IntentSubmitted(test_intent(intent_id)),
            CorrelationId::for_intent(&intent_id),
            None,
            Some(1),
        )
        .unwrap();
        log.append(&submitted).await.unwrap();

        let planner = Planner::new(
            bus,
            Arc::new(VenueRouteSource::new(venue)),
            ReadApi::new(log, models),
            PlannerConfig::default(),
        );

        // Cold cache: the payload comes from the durable log.
        let outcome = planner.handle(&accepted_envelope(intent_id)).await.unwrap();
        assert!(matches!(outcome, Planned::Created(_)));
    }
}
