//! Trade level computation
//!
//! Stop and target come from configured base percentages scaled by the
//! confidence band, rounded to cents. Feasibility is enforced here: a level
//! set that violates `stop < entry < target` or the risk/reward threshold is
//! refused, never emitted.

use serde::{Deserialize, Serialize};

use crate::config::TradingConfig;

/// A feasible set of trade levels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLevels {
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Stop distance as a fraction of entry
    pub stop_pct: f64,
    /// Target distance as a fraction of entry
    pub target_pct: f64,
    /// (take_profit - entry) / (entry - stop_loss)
    pub risk_reward: f64,
}

/// Round a price to cents
fn to_cents(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

/// Compute levels for a long entry at `entry` with the given confidence.
/// Returns `None` when the resulting levels are infeasible.
pub fn compute_levels(entry: f64, confidence: f64, config: &TradingConfig) -> Option<TradeLevels> {
    if entry <= 0.0 {
        return None;
    }

    let base_stop = config.base_stop_pct;
    let base_target = config.base_target_pct;

    // Confidence bands: conviction buys a tighter stop and a higher target
    let (stop_pct, target_pct) = if confidence >= 9.0 {
        (base_stop * 0.8, base_target * 1.3)
    } else if confidence <= 7.5 {
        (base_stop * 1.2, base_target * 0.9)
    } else {
        (base_stop, base_target)
    };

    let stop_loss = to_cents(entry * (1.0 - stop_pct));
    let take_profit = to_cents(entry * (1.0 + target_pct));
    let entry = to_cents(entry);

    // Feasibility after rounding
    if stop_loss >= entry || take_profit <= entry {
        return None;
    }
    let risk = entry - stop_loss;
    let reward = take_profit - entry;
    let risk_reward = reward / risk;
    if risk_reward < config.rr_threshold {
        return None;
    }

    Some(TradeLevels {
        entry,
        stop_loss,
        take_profit,
        stop_pct,
        target_pct,
        risk_reward,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TradingConfig {
        TradingConfig::default()
    }

    #[test]
    fn test_mid_band_uses_base_percentages() {
        let levels = compute_levels(10.0, 8.0, &config()).unwrap();
        assert!((levels.stop_loss - 9.70).abs() < 1e-9);
        assert!((levels.take_profit - 10.60).abs() < 1e-9);
        assert!((levels.risk_reward - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_high_confidence_tightens_stop_raises_target() {
        let levels = compute_levels(25.50, 9.3, &config()).unwrap();
        // 2.4% stop, 7.8% target
        assert!((levels.stop_loss - 24.89).abs() < 1e-9);
        assert!((levels.take_profit - 27.49).abs() < 1e-9);
        assert!(levels.risk_reward > 3.0);
    }

    #[test]
    fn test_low_confidence_fails_rr_threshold() {
        // 3.6% stop vs 5.4% target -> rr 1.5 < 2.0
        assert!(compute_levels(10.0, 7.0, &config()).is_none());
    }

    #[test]
    fn test_rounding_collapse_is_infeasible() {
        // At two cents the rounded stop meets the entry
        assert!(compute_levels(0.02, 8.0, &config()).is_none());
    }

    #[test]
    fn test_invariant_ordering_always_holds() {
        for entry in [0.75, 1.0, 3.85, 9.99, 25.50] {
            for confidence in [7.0, 7.6, 8.5, 9.0, 9.9] {
                if let Some(l) = compute_levels(entry, confidence, &config()) {
                    assert!(l.stop_loss < l.entry, "stop {} entry {}", l.stop_loss, l.entry);
                    assert!(l.take_profit > l.entry);
                    assert!(l.risk_reward >= config().rr_threshold);
                }
            }
        }
    }
}
