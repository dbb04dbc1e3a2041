//! Orchex Venue - Quote/Build/Submit/Await Adapter Contract
//!
//! The venue adapter is the core's only view of a trading venue. The
//! contract covers the full transaction lifecycle:
//!
//! 1. `price_quote` — indicative output for a (base, quote, amount) triple
//! 2. `build_swap_tx` — assemble a signed-ready transaction
//! 3. `submit_tx` — broadcast; NOT idempotent at the wire level
//! 4. `wait_receipt` — block until mined or timeout
//!
//! Implementations must be safe to call concurrently. Nonce management is
//! the adapter's concern: every `submit_tx` call carries a fresh nonce, so
//! orchestrator retries never collide on the wire.
//!
//! [`UniswapV3Adapter`] is a deterministic single-pool AMM simulation used
//! by the default deployment; [`MockVenue`] is a scriptable test double.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use orchex_types::{Asset, TxHash, VenueId};

/// Venue failure kinds. `is_transient` drives orchestrator retry
/// eligibility.
#[derive(Debug, Clone, Error)]
pub enum VenueError {
    #[error("rpc timeout after {0:?}")]
    RpcTimeout(Duration),

    #[error("nonce conflict for nonce {0}")]
    NonceConflict(u64),

    #[error("transient revert: {0}")]
    TransientRevert(String),

    #[error("no liquidity pool for {base}/{quote}")]
    NoPool { base: String, quote: String },

    #[error("unknown transaction: {0}")]
    UnknownTx(TxHash),

    #[error("adapter invariant breach: {0}")]
    InvariantBreach(String),
}

impl VenueError {
    /// Whether the orchestrator may retry after this failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VenueError::RpcTimeout(_)
                | VenueError::NonceConflict(_)
                | VenueError::TransientRevert(_)
        )
    }
}

/// Result type for venue operations.
pub type VenueResult<T> = Result<T, VenueError>;

/// Indicative quote for a swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub amount_out: Decimal,
    /// Opaque pool reference (address or pool id)
    pub pool_ref: String,
    pub fee_bps: u32,
}

/// Parameters for building a swap transaction.
#[derive(Debug, Clone)]
pub struct SwapParams {
    pub base: Asset,
    pub quote: Asset,
    pub amount_in: Decimal,
    pub min_out: Decimal,
    pub recipient: String,
    pub deadline: DateTime<Utc>,
}

/// A transaction ready for broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuiltTx {
    pub venue: VenueId,
    pub base: Asset,
    pub quote: Asset,
    pub amount_in: Decimal,
    pub min_out: Decimal,
    pub recipient: String,
    pub deadline: DateTime<Utc>,
    pub nonce: u64,
    /// Encoded call payload (opaque to the core)
    pub calldata: String,
}

/// Terminal state of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Success,
    Reverted,
}

/// Mined transaction receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub status: TxStatus,
    pub amount_out: Option<Decimal>,
    pub gas_used: u64,
    pub block_number: u64,
}

/// Interface to one trading venue's quote/build/submit/await lifecycle.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn venue_id(&self) -> VenueId;

    async fn price_quote(
        &self,
        base: &Asset,
        quote: &Asset,
        amount_in: Decimal,
    ) -> VenueResult<PriceQuote>;

    async fn build_swap_tx(&self, params: SwapParams) -> VenueResult<BuiltTx>;

    /// Broadcast. NOT idempotent: a second call submits a second
    /// transaction with a fresh nonce.
    async fn submit_tx(&self, tx: &BuiltTx) -> VenueResult<TxHash>;

    async fn wait_receipt(&self, tx_hash: &TxHash, timeout: Duration) -> VenueResult<TxReceipt>;
}

// ============================================================================
// Uniswap v3 style simulation
// ============================================================================

/// Output scale for pool math.
const OUT_SCALE: u32 = 18;

#[derive(Debug, Clone)]
struct PoolState {
    reserve_base: Decimal,
    reserve_quote: Decimal,
    fee_bps: u32,
}

impl PoolState {
    /// Constant-product output for `amount_in` of the input side after the
    /// pool fee. Rounds toward zero.
    fn amount_out(&self, base_in: bool, amount_in: Decimal) -> Decimal {
        let (reserve_in, reserve_out) = if base_in {
            (self.reserve_base, self.reserve_quote)
        } else {
            (self.reserve_quote, self.reserve_base)
        };
        let net_in = amount_in * (Decimal::ONE - Decimal::from(self.fee_bps) / dec!(10_000));
        let out = reserve_out * net_in / (reserve_in + net_in);
        out.round_dp_with_strategy(OUT_SCALE, RoundingStrategy::ToZero)
    }

    fn apply_swap(&mut self, base_in: bool, amount_in: Decimal, amount_out: Decimal) {
        if base_in {
            self.reserve_base += amount_in;
            self.reserve_quote -= amount_out;
        } else {
            self.reserve_quote += amount_in;
            self.reserve_base -= amount_out;
        }
    }
}

struct PendingTx {
    tx: BuiltTx,
    submitted_at: DateTime<Utc>,
}

/// Deterministic single-chain AMM venue.
///
/// Pools are keyed by unordered symbol pair; pricing is constant-product
/// with the pool fee taken on the input side. Each `submit_tx` consumes a
/// fresh nonce from an atomic counter, and receipts settle against the
/// live pool state (so a swap moves the price for the next one).
pub struct UniswapV3Adapter {
    chain_id: u64,
    pools: DashMap<(String, String), PoolState>,
    pending: DashMap<TxHash, PendingTx>,
    nonce: AtomicU64,
    block: AtomicU64,
    /// Simulated confirmation latency.
    confirm_latency: Duration,
}

impl UniswapV3Adapter {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            pools: DashMap::new(),
            pending: DashMap::new(),
            nonce: AtomicU64::new(0),
            block: AtomicU64::new(19_000_000),
            confirm_latency: Duration::from_millis(20),
        }
    }

    pub fn with_confirm_latency(mut self, latency: Duration) -> Self {
        self.confirm_latency = latency;
        self
    }

    /// Seed a liquidity pool for a symbol pair.
    pub fn add_pool(
        &self,
        base: &Asset,
        quote: &Asset,
        reserve_base: Decimal,
        reserve_quote: Decimal,
        fee_bps: u32,
    ) {
        let key = Self::pool_key(&base.symbol, &quote.symbol);
        // Reserves are stored in canonical key order.
        let (reserve_base, reserve_quote) = if Self::is_base_side(&key, &base.symbol) {
            (reserve_base, reserve_quote)
        } else {
            (reserve_quote, reserve_base)
        };
        self.pools.insert(
            key,
            PoolState {
                reserve_base,
                reserve_quote,
                fee_bps,
            },
        );
    }

    fn pool_key(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    fn pool_ref(key: &(String, String)) -> String {
        format!("pool:{}-{}", key.0, key.1)
    }

    /// Whether `symbol` is the canonical base side of the pool key.
    fn is_base_side(key: &(String, String), symbol: &str) -> bool {
        key.0 == symbol
    }

    fn tx_hash(tx: &BuiltTx) -> TxHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&tx.nonce.to_be_bytes());
        hasher.update(tx.calldata.as_bytes());
        let digest = hasher.finalize();
        TxHash(format!("0x{}", hex::encode(digest.as_bytes())))
    }
}

#[async_trait]
impl VenueAdapter for UniswapV3Adapter {
    fn venue_id(&self) -> VenueId {
        VenueId::uniswap_v3()
    }

    async fn price_quote(
        &self,
        base: &Asset,
        quote: &Asset,
        amount_in: Decimal,
    ) -> VenueResult<PriceQuote> {
        let key = Self::pool_key(&base.symbol, &quote.symbol);
        let pool = self.pools.get(&key).ok_or_else(|| VenueError::NoPool {
            base: base.symbol.clone(),
            quote: quote.symbol.clone(),
        })?;
        // `base` here is the input side of the swap.
        let base_in = Self::is_base_side(&key, &base.symbol);
        Ok(PriceQuote {
            amount_out: pool.amount_out(base_in, amount_in),
            pool_ref: Self::pool_ref(&key),
            fee_bps: pool.fee_bps,
        })
    }

    async fn build_swap_tx(&self, params: SwapParams) -> VenueResult<BuiltTx> {
        let key = Self::pool_key(&params.base.symbol, &params.quote.symbol);
        if !self.pools.contains_key(&key) {
            return Err(VenueError::NoPool {
                base: params.base.symbol.clone(),
                quote: params.quote.symbol.clone(),
            });
        }
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let calldata = format!(
            "swap(chain={},in={},out={},amount={},minOut={},to={},deadline={},nonce={})",
            self.chain_id,
            params.base.address,
            params.quote.address,
            params.amount_in,
            params.min_out,
            params.recipient,
            params.deadline.timestamp_millis(),
            nonce,
        );
        Ok(BuiltTx {
            venue: self.venue_id(),
            base: params.base,
            quote: params.quote,
            amount_in: params.amount_in,
            min_out: params.min_out,
            recipient: params.recipient,
            deadline: params.deadline,
            nonce,
            calldata,
        })
    }

    async fn submit_tx(&self, tx: &BuiltTx) -> VenueResult<TxHash> {
        let hash = Self::tx_hash(tx);
        if self.pending.contains_key(&hash) {
            // Same built tx broadcast twice; the wire rejects the nonce reuse.
            return Err(VenueError::NonceConflict(tx.nonce));
        }
        self.pending.insert(
            hash.clone(),
            PendingTx {
                tx: tx.clone(),
                submitted_at: Utc::now(),
            },
        );
        debug!(tx_hash = %hash, nonce = tx.nonce, "tx broadcast");
        Ok(hash)
    }

    async fn wait_receipt(&self, tx_hash: &TxHash, timeout: Duration) -> VenueResult<TxReceipt> {
        if self.confirm_latency > timeout {
            return Err(VenueError::RpcTimeout(timeout));
        }
        tokio::time::sleep(self.confirm_latency).await;

        let (_, pending) = self
            .pending
            .remove(tx_hash)
            .ok_or_else(|| VenueError::UnknownTx(tx_hash.clone()))?;
        let tx = pending.tx;
        let block_number = self.block.fetch_add(1, Ordering::SeqCst);

        if tx.deadline <= pending.submitted_at {
            return Ok(TxReceipt {
                status: TxStatus::Reverted,
                amount_out: None,
                gas_used: 42_000,
                block_number,
            });
        }

        let key = Self::pool_key(&tx.base.symbol, &tx.quote.symbol);
        let mut pool = self.pools.get_mut(&key).ok_or_else(|| VenueError::NoPool {
            base: tx.base.symbol.clone(),
            quote: tx.quote.symbol.clone(),
        })?;
        let base_in = Self::is_base_side(&key, &tx.base.symbol);
        let amount_out = pool.amount_out(base_in, tx.amount_in);

        if amount_out < tx.min_out {
            // Slippage guard tripped on-chain.
            return Ok(TxReceipt {
                status: TxStatus::Reverted,
                amount_out: None,
                gas_used: 61_000,
                block_number,
            });
        }

        pool.apply_swap(base_in, tx.amount_in, amount_out);
        Ok(TxReceipt {
            status: TxStatus::Success,
            amount_out: Some(amount_out),
            gas_used: 121_000,
            block_number,
        })
    }
}

// ============================================================================
// Scriptable mock
// ============================================================================

type ReceiptScript = (Option<Duration>, VenueResult<TxReceipt>);

/// Scriptable venue for driving orchestrator scenarios in tests: each call
/// pops the next scripted outcome, falling back to a benign default.
#[derive(Default)]
pub struct MockVenue {
    pub quotes: Mutex<std::collections::VecDeque<VenueResult<PriceQuote>>>,
    pub submits: Mutex<std::collections::VecDeque<VenueResult<TxHash>>>,
    pub receipts: Mutex<std::collections::VecDeque<ReceiptScript>>,
    nonce: AtomicU64,
    pub submit_count: AtomicU64,
    pub build_count: AtomicU64,
}

impl MockVenue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_quote(&self, quote: VenueResult<PriceQuote>) -> &Self {
        self.quotes.lock().push_back(quote);
        self
    }

    pub fn script_submit(&self, submit: VenueResult<TxHash>) -> &Self {
        self.submits.lock().push_back(submit);
        self
    }

    pub fn script_receipt(&self, receipt: VenueResult<TxReceipt>) -> &Self {
        self.receipts.lock().push_back((None, receipt));
        self
    }

    /// Script a receipt that takes `delay` to arrive (bounded by the
    /// caller's timeout).
    pub fn script_receipt_delayed(&self, delay: Duration, receipt: VenueResult<TxReceipt>) -> &Self {
        self.receipts.lock().push_back((Some(delay), receipt));
        self
    }

    pub fn default_receipt() -> TxReceipt {
        TxReceipt {
            status: TxStatus::Success,
            amount_out: Some(dec!(1)),
            gas_used: 100_000,
            block_number: 1,
        }
    }
}

#[async_trait]
impl VenueAdapter for MockVenue {
    fn venue_id(&self) -> VenueId {
        VenueId::new("mock")
    }

    async fn price_quote(
        &self,
        _base: &Asset,
        _quote: &Asset,
        amount_in: Decimal,
    ) -> VenueResult<PriceQuote> {
        self.quotes.lock().pop_front().unwrap_or(Ok(PriceQuote {
            amount_out: amount_in,
            pool_ref: "pool:mock".to_string(),
            fee_bps: 30,
        }))
    }

    async fn build_swap_tx(&self, params: SwapParams) -> VenueResult<BuiltTx> {
        self.build_count.fetch_add(1, Ordering::SeqCst);
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        Ok(BuiltTx {
            venue: self.venue_id(),
            base: params.base,
            quote: params.quote,
            amount_in: params.amount_in,
            min_out: params.min_out,
            recipient: params.recipient,
            deadline: params.deadline,
            nonce,
            calldata: format!("mock-swap-{}", nonce),
        })
    }

    async fn submit_tx(&self, tx: &BuiltTx) -> VenueResult<TxHash> {
        self.submit_count.fetch_add(1, Ordering::SeqCst);
        self.submits
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(TxHash(format!("0xmock{}", tx.nonce))))
    }

    async fn wait_receipt(&self, _tx_hash: &TxHash, timeout: Duration) -> VenueResult<TxReceipt> {
        let scripted = self.receipts.lock().pop_front();
        match scripted {
            Some((Some(delay), result)) => {
                if delay > timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(VenueError::RpcTimeout(timeout));
                }
                tokio::time::sleep(delay).await;
                result
            }
            Some((None, result)) => result,
            None => Ok(Self::default_receipt()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weth() -> Asset {
        Asset::new("WETH", 1, "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", 18)
    }

    fn usdc() -> Asset {
        Asset::new("USDC", 1, "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48", 6)
    }

    fn adapter_with_pool() -> UniswapV3Adapter {
        let adapter = UniswapV3Adapter::new(1).with_confirm_latency(Duration::from_millis(1));
        // 1000 WETH / 3_000_000 USDC → spot ≈ 3000 USDC per WETH
        adapter.add_pool(&weth(), &usdc(), dec!(1000), dec!(3_000_000), 30);
        adapter
    }

    fn swap_params(amount_in: Decimal, min_out: Decimal) -> SwapParams {
        SwapParams {
            base: usdc(),
            quote: weth(),
            amount_in,
            min_out,
            recipient: "0xrecipient".to_string(),
            deadline: Utc::now() + chrono::Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn test_quote_constant_product() {
        let adapter = adapter_with_pool();
        let quote = adapter
            .price_quote(&usdc(), &weth(), dec!(3000))
            .await
            .unwrap();
        // 3000 USDC in, fee 30bps → slightly under 1 WETH out.
        assert!(quote.amount_out < dec!(1));
        assert!(quote.amount_out > dec!(0.99));
        assert_eq!(quote.fee_bps, 30);
    }

    #[tokio::test]
    async fn test_no_pool() {
        let adapter = UniswapV3Adapter::new(1);
        let err = adapter
            .price_quote(&usdc(), &weth(), dec!(100))
            .await
            .unwrap_err();
        assert!(matches!(err, VenueError::NoPool { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let adapter = adapter_with_pool();
        let quote = adapter
            .price_quote(&usdc(), &weth(), dec!(3000))
            .await
            .unwrap();
        let min_out = quote.amount_out * dec!(0.99);

        let tx = adapter
            .build_swap_tx(swap_params(dec!(3000), min_out))
            .await
            .unwrap();
        let hash = adapter.submit_tx(&tx).await.unwrap();
        let receipt = adapter
            .wait_receipt(&hash, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(receipt.status, TxStatus::Success);
        let amount_out = receipt.amount_out.unwrap();
        assert!(amount_out >= min_out);
        assert_eq!(amount_out, quote.amount_out);
    }

    #[tokio::test]
    async fn test_fresh_nonce_per_build() {
        let adapter = adapter_with_pool();
        let a = adapter
            .build_swap_tx(swap_params(dec!(100), dec!(0)))
            .await
            .unwrap();
        let b = adapter
            .build_swap_tx(swap_params(dec!(100), dec!(0)))
            .await
            .unwrap();
        assert_ne!(a.nonce, b.nonce);

        let ha = adapter.submit_tx(&a).await.unwrap();
        let hb = adapter.submit_tx(&b).await.unwrap();
        assert_ne!(ha, hb);
    }

    #[tokio::test]
    async fn test_double_submit_same_tx_conflicts() {
        let adapter = adapter_with_pool();
        let tx = adapter
            .build_swap_tx(swap_params(dec!(100), dec!(0)))
            .await
            .unwrap();
        adapter.submit_tx(&tx).await.unwrap();
        let err = adapter.submit_tx(&tx).await.unwrap_err();
        assert!(matches!(err, VenueError::NonceConflict(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_min_out_revert() {
        let adapter = adapter_with_pool();
        // Demand more than the pool can give.
        let tx = adapter
            .build_swap_tx(swap_params(dec!(3000), dec!(2)))
            .await
            .unwrap();
        let hash = adapter.submit_tx(&tx).await.unwrap();
        let receipt = adapter
            .wait_receipt(&hash, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(receipt.status, TxStatus::Reverted);
        assert!(receipt.amount_out.is_none());
    }

    #[tokio::test]
    async fn test_receipt_timeout() {
        let adapter = UniswapV3Adapter::new(1).with_confirm_latency(Duration::from_secs(5));
        adapter.add_pool(&weth(), &usdc(), dec!(1000), dec!(3_000_000), 30);
        let tx = adapter
            .build_swap_tx(swap_params(dec!(100), dec!(0)))
            .await
            .unwrap();
        let hash = adapter.submit_tx(&tx).await.unwrap();
        let err = adapter
            .wait_receipt(&hash, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, VenueError::RpcTimeout(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_swap_moves_price() {
        let adapter = adapter_with_pool();
        let before = adapter
            .price_quote(&usdc(), &weth(), dec!(3000))
            .await
            .unwrap();

        let tx = adapter
            .build_swap_tx(swap_params(dec!(300_000), dec!(0)))
            .await
            .unwrap();
        let hash = adapter.submit_tx(&tx).await.unwrap();
        adapter.wait_receipt(&hash, Duration::from_secs(1)).await.unwrap();

        let after = adapter
            .price_quote(&usdc(), &weth(), dec!(3000))
            .await
            .unwrap();
        assert!(after.amount_out < before.amount_out);
    }

    #[tokio::test]
    async fn test_mock_scripts_pop_in_order() {
        let mock = MockVenue::new();
        mock.script_receipt(Ok(TxReceipt {
            status: TxStatus::Reverted,
            amount_out: None,
            gas_used: 1,
            block_number: 1,
        }));
        mock.script_receipt(Ok(MockVenue::default_receipt()));

        let hash = TxHash::new("0x1");
        let first = mock.wait_receipt(&hash, Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.status, TxStatus::Reverted);
        let second = mock.wait_receipt(&hash, Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.status, TxStatus::Success);
    }
}
