//! Orchex Server - Intent-Driven Execution Core
//!
//! Wires the execution core at process start: bus, stores, coordinator,
//! planner and orchestrator pools, risk gate, and gateway. The HTTP and
//! WebSocket surfaces are thin translations that live outside this binary.
//!
//! # Quick Start
//!
//! ```bash
//! # In-memory stores, simulated venue
//! cargo run -p orchex-server
//!
//! # Durable stores under ./orchex-data, with a demo submitter
//! cargo run -p orchex-server -- --data-dir ./orchex-data --demo
//! ```

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use orchex_intents::IntentRequest;
use orchex_runtime::{Config, Runtime};
use orchex_store::{
    EventLog, MemoryEventLog, MemoryReadModelStore, ReadModelStore, SledEventLog,
    SledReadModelStore,
};
use orchex_types::{Asset, Constraints, ExecutionStyle, IntentType, VenueId};
use orchex_venue::UniswapV3Adapter;

#[derive(Parser)]
#[command(name = "orchex")]
#[command(about = "Orchex - Intent-Driven Trading Execution Core")]
struct Cli {
    /// Persist the event log and read models under this directory
    #[arg(long)]
    data_dir: Option<String>,

    /// Submit a demo intent on an interval
    #[arg(long)]
    demo: bool,

    /// Seconds between demo submissions
    #[arg(long, default_value = "10")]
    demo_interval_secs: u64,
}

fn env_parsed<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

fn config_from_env() -> Result<Config> {
    let defaults = Config::default();
    Ok(Config {
        max_notional_usd: env_parsed("MAX_NOTIONAL_USD", defaults.max_notional_usd)?,
        max_slippage: env_parsed("MAX_SLIPPAGE", defaults.max_slippage)?,
        await_receipt_timeout_ms: env_parsed(
            "AWAIT_RECEIPT_TIMEOUT_MS",
            defaults.await_receipt_timeout_ms,
        )?,
        max_exec_attempts: env_parsed("MAX_EXEC_ATTEMPTS", defaults.max_exec_attempts)?,
        bus_dedup_window_seconds: env_parsed(
            "BUS_DEDUP_WINDOW_SECONDS",
            defaults.bus_dedup_window_seconds,
        )?,
        coordinator_gap_window: env_parsed(
            "COORDINATOR_GAP_WINDOW",
            defaults.coordinator_gap_window,
        )?,
        coordinator_gap_timeout_ms: defaults.coordinator_gap_timeout_ms,
        gateway_queue_depth: env_parsed("GATEWAY_QUEUE_DEPTH", defaults.gateway_queue_depth)?,
        venue: VenueId::new(env::var("VENUE").unwrap_or_else(|_| "uniswap_v3".to_string())),
        chain_id: env_parsed("CHAIN_ID", defaults.chain_id)?,
        rpc_url: env::var("RPC_URL").unwrap_or(defaults.rpc_url),
        recipient_address: env::var("RECIPIENT_ADDRESS").unwrap_or(defaults.recipient_address),
        planner_workers: env_parsed("PLANNER_WORKERS", defaults.planner_workers)?,
        orchestrator_workers: env_parsed("ORCHESTRATOR_WORKERS", defaults.orchestrator_workers)?,
    })
}

fn weth() -> Asset {
    Asset::new("WETH", 1, "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", 18)
}

fn usdc() -> Asset {
    Asset::new("USDC", 1, "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48", 6)
}

fn demo_request() -> IntentRequest {
    IntentRequest {
        intent_type: IntentType::Acquire,
        assets: [weth(), usdc()],
        amount_in: dec!(1000.00),
        constraints: Constraints {
            max_slippage: dec!(0.01),
            time_window_ms: 300_000,
            execution_style: ExecutionStyle::Adaptive,
            allowed_venues: None,
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = config_from_env()?;

    let (log, models): (Arc<dyn EventLog>, Arc<dyn ReadModelStore>) = match &cli.data_dir {
        Some(dir) => {
            let db = sled::open(dir).with_context(|| format!("opening database at {dir}"))?;
            info!(data_dir = %dir, "durable stores enabled");
            (
                Arc::new(SledEventLog::open(&db)?),
                Arc::new(SledReadModelStore::open(&db)?),
            )
        }
        None => {
            info!("in-memory stores (state is lost on exit)");
            (
                Arc::new(MemoryEventLog::new()),
                Arc::new(MemoryReadModelStore::new()),
            )
        }
    };

    // Simulated AMM venue; a real RPC-backed adapter slots in here.
    let adapter = Arc::new(UniswapV3Adapter::new(config.chain_id));
    adapter.add_pool(&weth(), &usdc(), dec!(1000), dec!(3_000_000), 30);

    let runtime = Runtime::start(config, adapter, log, models)?;

    let demo_task = cli.demo.then(|| {
        let intents = Arc::clone(&runtime.intents);
        let read = runtime.read.clone();
        let interval = Duration::from_secs(cli.demo_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                match intents.submit(demo_request()).await {
                    Ok(intent_id) => {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        match read.get_intent(&intent_id).await {
                            Ok(Some(model)) => info!(
                                intent_id = %intent_id,
                                state = ?model.state,
                                amount_out = ?model.amount_out,
                                "demo intent progressed"
                            ),
                            Ok(None) => warn!(intent_id = %intent_id, "demo intent not yet projected"),
                            Err(e) => warn!(error = %e, "demo read failed"),
                        }
                    }
                    Err(e) => warn!(error = %e, "demo submission failed"),
                }
                tokio::time::sleep(interval).await;
            }
        })
    });

    info!("orchex core running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    if let Some(task) = demo_task {
        task.abort();
    }
    runtime.shutdown().await;
    Ok(())
}
