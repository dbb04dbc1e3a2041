//! Orchex Risk - Pre-Acceptance Policy Gate
//!
//! Stateless evaluation of an intent against process-wide risk policy:
//! notional cap, slippage cap, execution-window bounds, and the venue
//! allow-list. Called synchronously by the intent manager between
//! `intent.submitted` and `intent.accepted`.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use orchex_types::{Intent, IntentType, Reason, VenueId};

/// Risk policy limits. All fields are process-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum intent notional in USD
    pub max_notional_usd: Decimal,
    /// Maximum tolerated slippage
    pub max_slippage: Decimal,
    /// Execution window lower bound in milliseconds
    pub min_window_ms: u64,
    /// Execution window upper bound in milliseconds
    pub max_window_ms: u64,
    /// Venues this deployment can execute against
    pub supported_venues: Vec<VenueId>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_notional_usd: dec!(10_000),
            max_slippage: dec!(0.05),
            min_window_ms: 1_000,
            max_window_ms: 3_600_000,
            supported_venues: vec![VenueId::uniswap_v3()],
        }
    }
}

/// Outcome of a risk evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskVerdict {
    Approved,
    Rejected { reason: Reason },
}

impl RiskVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskVerdict::Approved)
    }
}

/// USD notional of an intent.
///
/// V1 prices against the USD-pegged quote leg: an acquire spends quote
/// units directly, and a dispose's target amount is taken at par with the
/// quote. A proper oracle replaces this once non-USD pairs are supported.
pub fn notional_usd(intent: &Intent) -> Decimal {
    match intent.intent_type {
        IntentType::Acquire => intent.amount_in,
        IntentType::Dispose => intent.amount_in,
    }
}

/// Evaluate an intent against the policy. Pure and total: every intent
/// yields either approval or a machine-readable rejection reason.
pub fn evaluate(config: &RiskConfig, intent: &Intent) -> RiskVerdict {
    if notional_usd(intent) > config.max_notional_usd {
        return RiskVerdict::Rejected {
            reason: Reason::NotionalLimit,
        };
    }
    if intent.constraints.max_slippage > config.max_slippage {
        return RiskVerdict::Rejected {
            reason: Reason::SlippageLimit,
        };
    }
    let window = intent.constraints.time_window_ms;
    if window < config.min_window_ms || window > config.max_window_ms {
        return RiskVerdict::Rejected {
            reason: Reason::WindowOutOfRange,
        };
    }
    if let Some(allowed) = &intent.constraints.allowed_venues {
        if !allowed.iter().any(|v| config.supported_venues.contains(v)) {
            return RiskVerdict::Rejected {
                reason: Reason::UnsupportedVenue,
            };
        }
    }
    RiskVerdict::Approved
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchex_types::{Asset, Constraints, EventId, ExecutionStyle};

    fn test_intent() -> Intent {
        Intent {
            intent_id: EventId::new(),
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

    #[test]
    fn test_happy_path_approved() {
        let verdict = evaluate(&RiskConfig::default(), &test_intent());
        assert!(verdict.is_approved());
    }

    #[test]
    fn test_notional_limit() {
        let mut intent = test_intent();
        intent.amount_in = dec!(10_001);
        let verdict = evaluate(&RiskConfig::default(), &intent);
        assert_eq!(
            verdict,
            RiskVerdict::Rejected {
                reason: Reason::NotionalLimit
            }
        );
    }

    #[test]
    fn test_slippage_limit() {
        let mut intent = test_intent();
        intent.constraints.max_slippage = dec!(0.1);
        let verdict = evaluate(&RiskConfig::default(), &intent);
        assert_eq!(
            verdict,
            RiskVerdict::Rejected {
                reason: Reason::SlippageLimit
            }
        );
    }

    #[test]
    fn test_window_bounds() {
        let config = RiskConfig::default();

        let mut intent = test_intent();
        intent.constraints.time_window_ms = 999;
        assert_eq!(
            evaluate(&config, &intent),
            RiskVerdict::Rejected {
                reason: Reason::WindowOutOfRange
            }
        );

        intent.constraints.time_window_ms = 3_600_001;
        assert_eq!(
            evaluate(&config, &intent),
            RiskVerdict::Rejected {
                reason: Reason::WindowOutOfRange
            }
        );

        intent.constraints.time_window_ms = 1_000;
        assert!(evaluate(&config, &intent).is_approved());
        intent.constraints.time_window_ms = 3_600_000;
        assert!(evaluate(&config, &intent).is_approved());
    }

    #[test]
    fn test_unsupported_venue() {
        let mut intent = test_intent();
        intent.constraints.allowed_venues = Some(vec![VenueId::new("sushiswap")]);
        let verdict = evaluate(&RiskConfig::default(), &intent);
        assert_eq!(
            verdict,
            RiskVerdict::Rejected {
                reason: Reason::UnsupportedVenue
            }
        );

        // Any overlap with the supported set passes.
        intent.constraints.allowed_venues =
            Some(vec![VenueId::new("sushiswap"), VenueId::uniswap_v3()]);
        assert!(evaluate(&RiskConfig::default(), &intent).is_approved());
    }

    #[test]
    fn test_boundary_notional_allowed() {
        let mut intent = test_intent();
        intent.amount_in = dec!(10_000);
        assert!(evaluate(&RiskConfig::default(), &intent).is_approved());
    }
}
