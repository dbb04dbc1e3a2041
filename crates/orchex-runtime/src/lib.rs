//! Orchex Runtime - Explicit Process Wiring
//!
//! There is no ambient service locator in Orchex: every component is
//! constructed here, handed exactly the collaborators it needs, and run as
//! a pool of tokio workers consuming from the bus. The coordinator holds
//! references to the log store and read-model store only; the planner and
//! orchestrator see storage exclusively through the coordinator's read API.
//!
//! [`Runtime::start`] brings the core up; [`Runtime::shutdown`] flips the
//! process-wide signal and waits for every worker to finish its in-flight
//! envelope.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use orchex_bus::{BusConfig, BusError, EventBus};
use orchex_coordinator::{Coordinator, CoordinatorConfig, CoordinatorMetrics, ReadApi};
use orchex_gateway::{Gateway, GatewayConfig};
use orchex_intents::{IntentManager, IntentManagerConfig};
use orchex_orchestrator::{Orchestrator, OrchestratorConfig};
use orchex_planner::{Planner, PlannerConfig, VenueRouteSource};
use orchex_risk::RiskConfig;
use orchex_store::{EventLog, MemoryEventLog, MemoryReadModelStore, ReadModelStore};
use orchex_types::VenueId;
use orchex_venue::VenueAdapter;

/// Process-wide configuration (§external-interface keys plus worker pool
/// sizing), normally populated from the environment by the server binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_notional_usd: Decimal,
    pub max_slippage: Decimal,
    pub await_receipt_timeout_ms: u64,
    pub max_exec_attempts: u32,
    pub bus_dedup_window_seconds: u64,
    pub coordinator_gap_window: usize,
    pub coordinator_gap_timeout_ms: u64,
    pub gateway_queue_depth: usize,
    pub venue: VenueId,
    pub chain_id: u64,
    pub rpc_url: String,
    pub recipient_address: String,
    pub planner_workers: usize,
    pub orchestrator_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_notional_usd: dec!(10_000),
            max_slippage: dec!(0.05),
            await_receipt_timeout_ms: 120_000,
            max_exec_attempts: 3,
            bus_dedup_window_seconds: 120,
            coordinator_gap_window: 256,
            coordinator_gap_timeout_ms: 30_000,
            gateway_queue_depth: 1024,
            venue: VenueId::uniswap_v3(),
            chain_id: 1,
            rpc_url: "http://127.0.0.1:8545".to_string(),
            recipient_address: "0x0000000000000000000000000000000000000000".to_string(),
            planner_workers: 2,
            orchestrator_workers: 2,
        }
    }
}

/// Runtime startup errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// The assembled execution core.
pub struct Runtime {
    pub bus: Arc<EventBus>,
    pub coordinator: Arc<Coordinator>,
    pub read: ReadApi,
    pub gateway: Arc<Gateway>,
    pub intents: Arc<IntentManager>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Runtime {
    /// Construct and start every component against the given stores and
    /// venue adapter.
    pub fn start(
        config: Config,
        adapter: Arc<dyn VenueAdapter>,
        log: Arc<dyn EventLog>,
        models: Arc<dyn ReadModelStore>,
    ) -> RuntimeResult<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let bus = Arc::new(EventBus::new(BusConfig {
            dedup_window: Duration::from_secs(config.bus_dedup_window_seconds),
            ..Default::default()
        }));
        tasks.push(bus.spawn_sweeper(shutdown_rx.clone()));

        let coordinator = Arc::new(Coordinator::new(
            log,
            models,
            CoordinatorConfig {
                gap_window: config.coordinator_gap_window,
                gap_timeout: Duration::from_millis(config.coordinator_gap_timeout_ms),
                ..Default::default()
            },
        ));
        let read = coordinator.read_api();

        // Single-active durable consumer per domain wildcard.
        for pattern in ["intent.*", "risk.*", "plan.*", "exec.*"] {
            let sub = bus.subscribe_queue(pattern, "coordinator")?;
            tasks.push(tokio::spawn(
                Arc::clone(&coordinator).run(sub, shutdown_rx.clone()),
            ));
        }
        tasks.push(coordinator.spawn_gap_sweeper(shutdown_rx.clone()));

        let planner = Arc::new(Planner::new(
            Arc::clone(&bus),
            Arc::new(VenueRouteSource::new(Arc::clone(&adapter))),
            read.clone(),
            PlannerConfig {
                recipient: config.recipient_address.clone(),
                venue: config.venue.clone(),
                cache_ttl: Duration::from_secs(config.bus_dedup_window_seconds),
                ..Default::default()
            },
        ));
        tasks.push(planner.spawn_cache_filler(shutdown_rx.clone()));
        for _ in 0..config.planner_workers {
            let sub = bus.subscribe_queue("intent.accepted", "planner.workers")?;
            tasks.push(tokio::spawn(
                Arc::clone(&planner).run(sub, shutdown_rx.clone()),
            ));
        }

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&bus),
            adapter,
            read.clone(),
            OrchestratorConfig {
                max_attempts: config.max_exec_attempts,
                await_receipt_timeout: Duration::from_millis(config.await_receipt_timeout_ms),
                ..Default::default()
            },
        ));
        for _ in 0..config.orchestrator_workers {
            let sub = bus.subscribe_queue("plan.created", "orchestrator.workers")?;
            tasks.push(tokio::spawn(
                Arc::clone(&orchestrator).run(sub, shutdown_rx.clone()),
            ));
        }

        let gateway = Arc::new(Gateway::new(
            Arc::clone(&bus),
            read.clone(),
            GatewayConfig {
                queue_depth: config.gateway_queue_depth,
            },
        ));

        let intents = Arc::new(IntentManager::new(
            Arc::clone(&bus),
            RiskConfig {
                max_notional_usd: config.max_notional_usd,
                max_slippage: config.max_slippage,
                supported_venues: vec![config.venue.clone()],
                ..Default::default()
            },
            IntentManagerConfig::default(),
        ));

        info!(
            planner_workers = config.planner_workers,
            orchestrator_workers = config.orchestrator_workers,
            venue = %config.venue,
            "execution core started"
        );

        Ok(Self {
            bus,
            coordinator,
            read,
            gateway,
            intents,
            shutdown_tx,
            tasks,
        })
    }

    /// Start against fresh in-memory stores.
    pub fn start_in_memory(
        config: Config,
        adapter: Arc<dyn VenueAdapter>,
    ) -> RuntimeResult<Self> {
        Self::start(
            config,
            adapter,
            Arc::new(MemoryEventLog::new()),
            Arc::new(MemoryReadModelStore::new()),
        )
    }

    pub fn metrics(&self) -> Arc<CoordinatorMetrics> {
        self.coordinator.metrics()
    }

    /// Signal shutdown and wait for every worker to finish its in-flight
    /// envelope.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("execution core stopped");
    }
}
