//! Market regime classifier
//!
//! Different thresholds for different tapes. Classifies the recent window
//! into trending vs mean-reverting crossed with high vs low volatility, and
//! publishes the adaptive threshold map consumed by the indicator engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::market::Bar;

/// Coarse market-state classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    TrendingHighVol,
    TrendingLowVol,
    MeanRevertingHighVol,
    MeanRevertingLowVol,
    Uncertain,
}

impl Regime {
    pub fn is_high_vol(&self) -> bool {
        matches!(self, Regime::TrendingHighVol | Regime::MeanRevertingHighVol)
    }

    pub fn is_trending(&self) -> bool {
        matches!(self, Regime::TrendingHighVol | Regime::TrendingLowVol)
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Regime::TrendingHighVol => "trending_high_vol",
            Regime::TrendingLowVol => "trending_low_vol",
            Regime::MeanRevertingHighVol => "mean_reverting_high_vol",
            Regime::MeanRevertingLowVol => "mean_reverting_low_vol",
            Regime::Uncertain => "uncertain",
        };
        f.write_str(s)
    }
}

/// Regime classification result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeClassification {
    pub regime: Regime,
    pub confidence: f64,
    /// Percentile of current volatility within the lookback, in [0, 1]
    pub volatility_percentile: f64,
    /// Net drift of the window (fractional return), sign gives trend direction
    pub drift: f64,
    /// Threshold map consumed by regime-aware indicators
    pub adaptive_thresholds: HashMap<String, f64>,
    pub reasons: Vec<String>,
}

impl RegimeClassification {
    /// Neutral classification used before enough data has accumulated
    pub fn uncertain() -> Self {
        let mut adaptive_thresholds = HashMap::new();
        adaptive_thresholds.insert("rsi_z_oversold".into(), -2.0);
        adaptive_thresholds.insert("rsi_z_overbought".into(), 2.0);
        Self {
            regime: Regime::Uncertain,
            confidence: 0.0,
            volatility_percentile: 0.5,
            drift: 0.0,
            adaptive_thresholds,
            reasons: vec!["insufficient data".into()],
        }
    }

    /// RSI z-score band for this regime (±2.0 in high vol, ±1.5 otherwise)
    pub fn rsi_z_band(&self) -> (f64, f64) {
        let oversold = self
            .adaptive_thresholds
            .get("rsi_z_oversold")
            .copied()
            .unwrap_or(-2.0);
        let overbought = self
            .adaptive_thresholds
            .get("rsi_z_overbought")
            .copied()
            .unwrap_or(2.0);
        (oversold, overbought)
    }

    /// Whether the regime supports a long entry
    pub fn favors_long(&self) -> bool {
        self.regime.is_trending() && self.drift > 0.0
    }

    /// Whether the regime argues against a long entry
    pub fn adverse_for_long(&self) -> bool {
        self.regime.is_trending() && self.drift < 0.0
    }
}

/// Regime detector over a bar window
pub struct RegimeDetector {
    /// Window for the efficiency-ratio trend measure
    trend_window: usize,
    /// Window for realized volatility
    vol_window: usize,
    /// Efficiency ratio above this reads as trending
    trending_threshold: f64,
    /// Efficiency ratio below this reads as mean-reverting
    mean_reverting_threshold: f64,
    /// Volatility percentile above this reads as high-vol
    high_vol_percentile: f64,
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self {
            trend_window: 20,
            vol_window: 20,
            trending_threshold: 0.35,
            mean_reverting_threshold: 0.20,
            high_vol_percentile: 0.70,
        }
    }
}

impl RegimeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify the given window. Needs at least `trend_window + vol_window`
    /// bars; fewer yields `Uncertain`.
    pub fn classify(&self, bars: &[Bar]) -> RegimeClassification {
        if bars.len() < self.trend_window + self.vol_window {
            return RegimeClassification::uncertain();
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let mut reasons = Vec::new();

        // Kaufman efficiency ratio over the trend window
        let tail = &closes[closes.len() - self.trend_window..];
        let net = (tail[tail.len() - 1] - tail[0]).abs();
        let path: f64 = tail.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
        let efficiency = if path > 0.0 { net / path } else { 0.0 };

        let drift = (tail[tail.len() - 1] - tail[0]) / tail[0];

        // Realized vol percentile: rank the latest window std among all
        // trailing windows of the same length.
        let returns: Vec<f64> = closes.windows(2).map(|w| (w[1] - w[0]) / w[0]).collect();
        let vol_percentile = self.volatility_percentile(&returns);

        let high_vol = vol_percentile >= self.high_vol_percentile;

        let regime = if efficiency >= self.trending_threshold {
            reasons.push(format!("efficiency ratio {efficiency:.2} trending"));
            if high_vol {
                Regime::TrendingHighVol
            } else {
                Regime::TrendingLowVol
            }
        } else if efficiency <= self.mean_reverting_threshold {
            reasons.push(format!("efficiency ratio {efficiency:.2} mean-reverting"));
            if high_vol {
                Regime::MeanRevertingHighVol
            } else {
                Regime::MeanRevertingLowVol
            }
        } else {
            reasons.push(format!("efficiency ratio {efficiency:.2} inconclusive"));
            Regime::Uncertain
        };

        if high_vol {
            reasons.push(format!("volatility percentile {vol_percentile:.2} high"));
        }

        // Confidence: distance of the efficiency ratio from the dead zone,
        // scaled into [0, 1].
        let confidence = if regime == Regime::Uncertain {
            0.2
        } else if efficiency >= self.trending_threshold {
            ((efficiency - self.trending_threshold) / (1.0 - self.trending_threshold))
                .clamp(0.3, 1.0)
        } else {
            ((self.mean_reverting_threshold - efficiency) / self.mean_reverting_threshold)
                .clamp(0.3, 1.0)
        };

        let mut adaptive_thresholds = HashMap::new();
        let band = if high_vol { 2.0 } else { 1.5 };
        adaptive_thresholds.insert("rsi_z_oversold".into(), -band);
        adaptive_thresholds.insert("rsi_z_overbought".into(), band);

        RegimeClassification {
            regime,
            confidence,
            volatility_percentile: vol_percentile,
            drift,
            adaptive_thresholds,
            reasons,
        }
    }

    /// Fraction of trailing same-length windows whose realized vol is at or
    /// below the latest window's.
    fn volatility_percentile(&self, returns: &[f64]) -> f64 {
        if returns.len() < self.vol_window {
            return 0.5;
        }
        let window_std = |w: &[f64]| {
            let mean = w.iter().sum::<f64>() / w.len() as f64;
            (w.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / w.len() as f64).sqrt()
        };
        let current = window_std(&returns[returns.len() - self.vol_window..]);
        let windows: Vec<f64> = returns.windows(self.vol_window).map(window_std).collect();
        let at_or_below = windows.iter().filter(|&&s| s <= current).count();
        at_or_below as f64 / windows.len() as f64
    }
}
