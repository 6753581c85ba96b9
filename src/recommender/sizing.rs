//! Dynamic position sizing
//!
//! Size with conviction, shrink with doubt. The fraction of account starts
//! from the configured base, scales with confidence and with recent realized
//! performance, and always lands inside the configured rails.

use serde::{Deserialize, Serialize};

use crate::config::RiskConfig;

/// Aggressive-path boost for cheap tickers (price under $3)
const CHEAP_TICKER_BOOST: f64 = 1.5;
/// Price below which the aggressive path applies
const CHEAP_TICKER_PRICE: f64 = 3.0;

/// Inputs to a sizing decision
#[derive(Debug, Clone)]
pub struct SizingContext {
    /// Final recommendation confidence in [0, 10]
    pub confidence: f64,
    pub entry_price: f64,
    /// Recent realized win rate from the learning layer, when enough
    /// outcomes exist
    pub recent_win_rate: Option<f64>,
}

/// A sized position with the multipliers that produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizedPosition {
    /// Fraction of account value, inside the configured rails
    pub fraction: f64,
    pub confidence_multiplier: f64,
    pub learning_multiplier: f64,
}

/// Position sizer
pub struct PositionSizer {
    config: RiskConfig,
}

impl PositionSizer {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Compute the account fraction for a trade
    pub fn size(&self, ctx: &SizingContext) -> SizedPosition {
        // Confidence scaling: 0.5x at zero confidence, capped at 1.5x
        let confidence_multiplier = (0.5 + ctx.confidence / 10.0).min(1.5);

        // Learning scaling from recent realized win rate
        let learning_multiplier = match ctx.recent_win_rate {
            Some(rate) if rate > 0.7 => 1.2,
            Some(rate) if rate < 0.4 => 0.7,
            _ => 1.0,
        };

        let mut fraction =
            self.config.position_size_percent * confidence_multiplier * learning_multiplier;

        // Cheap tickers ride the aggressive path: boosted, but capped at the
        // configured fraction before the rails ever see it
        if ctx.entry_price < CHEAP_TICKER_PRICE {
            fraction = (fraction * CHEAP_TICKER_BOOST).min(self.config.sub_three_dollar_cap);
        }

        fraction = fraction.clamp(
            self.config.min_position_size_percent,
            self.config.max_position_size_percent,
        );

        SizedPosition {
            fraction,
            confidence_multiplier,
            learning_multiplier,
        }
    }

    /// Whole shares for a fraction of the account at the entry price
    pub fn shares(&self, fraction: f64, account_value: f64, entry_price: f64) -> u64 {
        if entry_price <= 0.0 {
            return 0;
        }
        (fraction * account_value / entry_price).floor() as u64
    }
}
