//! Performance metrics over closed trades
//!
//! Computed each learning cycle over the paired prediction/outcome history:
//! win rate, directional accuracy, a Sharpe-like ratio of per-trade returns,
//! max drawdown, winner/loser ratio, and binned confidence calibration.

use serde::{Deserialize, Serialize};

use crate::journal::{Outcome, Prediction};

/// A prediction paired with its realized outcome
#[derive(Debug, Clone)]
pub struct Sample {
    pub prediction: Prediction,
    pub outcome: Outcome,
}

/// Aggregate performance metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub sample_count: usize,
    pub win_rate: f64,
    /// Fraction of trades whose move matched the predicted direction
    pub directional_accuracy: f64,
    pub mean_accuracy: f64,
    /// Mean over std of per-trade fractional returns
    pub sharpe_like: f64,
    /// Worst peak-to-trough drop of the cumulative return curve (fraction)
    pub max_drawdown: f64,
    /// Mean winner return over mean loser magnitude
    pub winner_loser_ratio: f64,
    /// Binned confidence calibration in [0, 1]
    pub confidence_calibration: f64,
}

impl PerformanceMetrics {
    pub fn empty() -> Self {
        Self {
            sample_count: 0,
            win_rate: 0.0,
            directional_accuracy: 0.0,
            mean_accuracy: 0.0,
            sharpe_like: 0.0,
            max_drawdown: 0.0,
            winner_loser_ratio: 0.0,
            confidence_calibration: 0.5,
        }
    }
}

/// Compute metrics over a sample set
pub fn compute(samples: &[Sample]) -> PerformanceMetrics {
    if samples.is_empty() {
        return PerformanceMetrics::empty();
    }
    let n = samples.len() as f64;

    let returns: Vec<f64> = samples
        .iter()
        .map(|s| s.outcome.realized_move_pct / 100.0)
        .collect();

    let wins = samples.iter().filter(|s| s.outcome.success).count();
    let win_rate = wins as f64 / n;

    // Long-only: direction is correct when the move was positive
    let directional_accuracy = returns.iter().filter(|&&r| r > 0.0).count() as f64 / n;

    let mean_accuracy = samples
        .iter()
        .map(|s| s.outcome.accuracy_score)
        .sum::<f64>()
        / n;

    let mean_return = returns.iter().sum::<f64>() / n;
    let variance = returns
        .iter()
        .map(|r| (r - mean_return).powi(2))
        .sum::<f64>()
        / n;
    let std = variance.sqrt();
    let sharpe_like = if std > 0.0 { mean_return / std } else { 0.0 };

    let max_drawdown = max_drawdown(&returns);

    let winners: Vec<f64> = returns.iter().copied().filter(|&r| r > 0.0).collect();
    let losers: Vec<f64> = returns.iter().copied().filter(|&r| r < 0.0).collect();
    let mean_win = if winners.is_empty() {
        0.0
    } else {
        winners.iter().sum::<f64>() / winners.len() as f64
    };
    let mean_loss = if losers.is_empty() {
        0.0
    } else {
        losers.iter().map(|r| r.abs()).sum::<f64>() / losers.len() as f64
    };
    let winner_loser_ratio = if mean_loss > 0.0 {
        mean_win / mean_loss
    } else if mean_win > 0.0 {
        10.0
    } else {
        0.0
    };

    PerformanceMetrics {
        sample_count: samples.len(),
        win_rate,
        directional_accuracy,
        mean_accuracy,
        sharpe_like,
        max_drawdown,
        winner_loser_ratio,
        confidence_calibration: confidence_calibration(samples),
    }
}

/// Worst peak-to-trough drop of the cumulative return curve
fn max_drawdown(returns: &[f64]) -> f64 {
    let mut equity = 1.0;
    let mut peak = 1.0f64;
    let mut worst = 0.0f64;
    for r in returns {
        equity *= 1.0 + r;
        peak = peak.max(equity);
        if peak > 0.0 {
            worst = worst.max((peak - equity) / peak);
        }
    }
    worst
}

/// Binned confidence calibration: how well predicted confidence buckets
/// match realized success rates. 1.0 is perfectly calibrated.
pub fn confidence_calibration(samples: &[Sample]) -> f64 {
    const BINS: usize = 5;
    let mut totals = [0usize; BINS];
    let mut successes = [0usize; BINS];

    for s in samples {
        let bin = ((s.prediction.confidence / 10.0 * BINS as f64) as usize).min(BINS - 1);
        totals[bin] += 1;
        if s.outcome.success {
            successes[bin] += 1;
        }
    }

    let mut weighted_error = 0.0;
    let mut counted = 0usize;
    for bin in 0..BINS {
        if totals[bin] == 0 {
            continue;
        }
        let predicted = (bin as f64 + 0.5) / BINS as f64;
        let realized = successes[bin] as f64 / totals[bin] as f64;
        weighted_error += (predicted - realized).abs() * totals[bin] as f64;
        counted += totals[bin];
    }
    if counted == 0 {
        return 0.5;
    }
    1.0 - weighted_error / counted as f64
}
