//! Indicator engine
//!
//! Pure, stateless functions from OHLCV windows to scalar signals. All data
//! the indicators need is fetched before scoring begins; nothing in this
//! module suspends. Insufficient data always yields a neutral signal, never
//! an error.

pub mod bollinger;
pub mod divergence;
pub mod order_flow;
pub mod relative_strength;
pub mod rsi;
pub mod vpt;
pub mod williams;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::learning::weights::LearnedWeights;
use crate::market::Bar;
use crate::regime::RegimeClassification;

/// Signal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Bullish,
    Bearish,
    Neutral,
}

impl Direction {
    /// Sign used in weighted sums: bullish +1, bearish -1, neutral 0
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Bullish => 1.0,
            Direction::Bearish => -1.0,
            Direction::Neutral => 0.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::Bullish => "bullish",
            Direction::Bearish => "bearish",
            Direction::Neutral => "neutral",
        };
        f.write_str(s)
    }
}

/// The indicators the engine computes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    RsiZscore,
    MomentumDivergence,
    VolumePriceTrend,
    OrderFlow,
    SectorStrength,
    AdaptiveBollinger,
    WilliamsR,
    BollingerSqueeze,
    Composite,
}

impl IndicatorKind {
    /// Stable key used for learned-weight lookups and journaling
    pub fn key(&self) -> &'static str {
        match self {
            IndicatorKind::RsiZscore => "rsi_zscore",
            IndicatorKind::MomentumDivergence => "momentum_divergence",
            IndicatorKind::VolumePriceTrend => "vpt",
            IndicatorKind::OrderFlow => "order_flow",
            IndicatorKind::SectorStrength => "sector_rs",
            IndicatorKind::AdaptiveBollinger => "adaptive_bb",
            IndicatorKind::WilliamsR => "williams_r",
            IndicatorKind::BollingerSqueeze => "bb_squeeze",
            IndicatorKind::Composite => "composite",
        }
    }

    /// Default category weight in the confidence sum. Legacy hooks carry no
    /// weight; they feed setup tagging only.
    pub fn default_weight(&self) -> f64 {
        match self {
            IndicatorKind::RsiZscore => 0.15,
            IndicatorKind::MomentumDivergence => 0.25,
            IndicatorKind::VolumePriceTrend => 0.20,
            IndicatorKind::OrderFlow => 0.20,
            IndicatorKind::SectorStrength => 0.15,
            IndicatorKind::AdaptiveBollinger => 0.05,
            IndicatorKind::WilliamsR
            | IndicatorKind::BollingerSqueeze
            | IndicatorKind::Composite => 0.0,
        }
    }

    /// The six kinds that participate in the composite
    pub fn scored() -> [IndicatorKind; 6] {
        [
            IndicatorKind::RsiZscore,
            IndicatorKind::MomentumDivergence,
            IndicatorKind::VolumePriceTrend,
            IndicatorKind::OrderFlow,
            IndicatorKind::SectorStrength,
            IndicatorKind::AdaptiveBollinger,
        ]
    }
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// One computed signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSignal {
    pub kind: IndicatorKind,
    pub value: f64,
    pub direction: Direction,
    /// Signal magnitude in [0, 1]
    pub strength: f64,
    /// Confidence in the signal in [0, 1]
    pub confidence: f64,
    /// Auxiliary scalars (thresholds, components, flags as 0/1)
    pub aux: HashMap<String, f64>,
}

impl IndicatorSignal {
    /// Neutral result used whenever a window is too short
    pub fn neutral(kind: IndicatorKind) -> Self {
        Self {
            kind,
            value: 0.0,
            direction: Direction::Neutral,
            strength: 0.0,
            confidence: 0.0,
            aux: HashMap::new(),
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.direction == Direction::Neutral
    }
}

/// Everything an indicator evaluation needs, fetched up front
pub struct IndicatorInputs<'a> {
    pub bars: &'a [Bar],
    pub regime: &'a RegimeClassification,
    /// Sector reference closes aligned to the tail of `bars` (when available)
    pub sector_ref: Option<&'a [f64]>,
    /// Market reference closes aligned to the tail of `bars` (when available)
    pub market_ref: Option<&'a [f64]>,
}

/// The full signal set for one evaluation
#[derive(Debug, Clone)]
pub struct IndicatorSet {
    pub signals: Vec<IndicatorSignal>,
}

impl IndicatorSet {
    pub fn get(&self, kind: IndicatorKind) -> Option<&IndicatorSignal> {
        self.signals.iter().find(|s| s.kind == kind)
    }

    /// Weighted composite over the six scored indicators. Category weights
    /// are multiplied by the learned per-feature multipliers.
    pub fn composite(&self, learned: &LearnedWeights) -> IndicatorSignal {
        let mut weighted_sum = 0.0;
        let mut weight_sum = 0.0;
        let mut confidence_sum = 0.0;
        let mut counted = 0usize;

        for kind in IndicatorKind::scored() {
            let Some(signal) = self.get(kind) else {
                continue;
            };
            let weight = kind.default_weight() * learned.multiplier(kind.key());
            weighted_sum +=
                signal.direction.sign() * signal.strength * signal.confidence * weight;
            weight_sum += weight;
            confidence_sum += signal.confidence;
            counted += 1;
        }

        if weight_sum <= 0.0 || counted == 0 {
            return IndicatorSignal::neutral(IndicatorKind::Composite);
        }

        let value = weighted_sum / weight_sum;
        let direction = if value > 0.1 {
            Direction::Bullish
        } else if value < -0.1 {
            Direction::Bearish
        } else {
            Direction::Neutral
        };

        IndicatorSignal {
            kind: IndicatorKind::Composite,
            value,
            direction,
            strength: value.abs().min(1.0),
            confidence: confidence_sum / counted as f64,
            aux: HashMap::new(),
        }
    }
}

/// Stateless indicator engine holding the fixed default parameters
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    pub rsi_period: usize,
}

impl Default for IndicatorEngine {
    fn default() -> Self {
        Self { rsi_period: 14 }
    }
}

impl IndicatorEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute every indicator over the inputs. Never fails; short windows
    /// yield neutral members.
    pub fn compute_all(&self, inputs: &IndicatorInputs<'_>) -> IndicatorSet {
        let signals = vec![
            rsi::rsi_zscore(inputs.bars, self.rsi_period, inputs.regime),
            divergence::momentum_divergence(inputs.bars),
            vpt::volume_price_trend(inputs.bars),
            order_flow::order_flow_imbalance(inputs.bars),
            relative_strength::sector_relative_strength(
                inputs.bars,
                inputs.sector_ref,
                inputs.market_ref,
            ),
            bollinger::adaptive_bollinger(inputs.bars),
            williams::williams_r(inputs.bars),
            bollinger::squeeze_signal(inputs.bars),
        ];
        IndicatorSet { signals }
    }
}

// =============================================================================
// Shared window math
// =============================================================================

/// Simple moving average of the last `window` values at each index; entries
/// before the window fills mirror the available prefix mean.
pub(crate) fn sma(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for i in 0..values.len() {
        sum += values[i];
        if i >= window {
            sum -= values[i - window];
            out.push(sum / window as f64);
        } else {
            out.push(sum / (i + 1) as f64);
        }
    }
    out
}

/// Exponential moving average with pandas `span` semantics
/// (alpha = 2 / (span + 1)), seeded from the first value.
pub(crate) fn ema(values: &[f64], span: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let Some(&first) = values.first() else {
        return out;
    };
    let alpha = 2.0 / (span as f64 + 1.0);
    let mut prev = first;
    out.push(prev);
    for &v in &values[1..] {
        prev = alpha * v + (1.0 - alpha) * prev;
        out.push(prev);
    }
    out
}

/// Rolling population standard deviation over trailing `window` values;
/// shorter prefixes use what is available.
pub(crate) fn rolling_std(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        let lo = (i + 1).saturating_sub(window);
        out.push(std_dev(&values[lo..=i]));
    }
    out
}

/// Population mean
pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation
pub(crate) fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Fractional bar-to-bar changes; output length is `values.len() - 1`
pub(crate) fn pct_changes(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .map(|w| if w[0] != 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect()
}

/// Fraction of the last `lookback` values whose magnitude exceeds
/// `threshold`; the persistence measure behind signal confidence.
pub(crate) fn persistence(series: &[f64], threshold: f64, lookback: usize) -> f64 {
    if series.is_empty() {
        return 0.5;
    }
    let tail = &series[series.len().saturating_sub(lookback)..];
    let crossings = tail.iter().filter(|v| v.abs() > threshold).count();
    (crossings as f64 / tail.len() as f64).min(1.0)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::RegimeClassification;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_sma_and_ema_shapes() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let s = sma(&values, 3);
        assert_eq!(s.len(), 5);
        assert!((s[4] - 4.0).abs() < 1e-12);

        let e = ema(&values, 3);
        assert_eq!(e.len(), 5);
        assert_eq!(e[0], 1.0);
        assert!(e[4] > e[0]);
    }

    #[test]
    fn test_pct_changes() {
        let changes = pct_changes(&[100.0, 110.0, 99.0]);
        assert_eq!(changes.len(), 2);
        assert!((changes[0] - 0.10).abs() < 1e-12);
        assert!((changes[1] + 0.10).abs() < 1e-12);
    }

    #[test]
    fn test_persistence() {
        let series = [0.0, 0.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0];
        assert!((persistence(&series, 1.0, 10) - 0.8).abs() < 1e-12);
        assert_eq!(persistence(&[], 1.0, 10), 0.5);
    }

    #[test]
    fn test_composite_weights_learned_multipliers() {
        let mut set = IndicatorSet { signals: vec![] };
        for kind in IndicatorKind::scored() {
            let mut s = IndicatorSignal::neutral(kind);
            s.direction = Direction::Bullish;
            s.strength = 0.5;
            s.confidence = 1.0;
            set.signals.push(s);
        }

        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let identity = LearnedWeights::initial(now);
        let base = set.composite(&identity);
        assert_eq!(base.direction, Direction::Bullish);
        assert!((base.value - 0.5).abs() < 1e-9);

        // Boosting a now-bearish member drags the composite down
        set.signals[1].direction = Direction::Bearish;
        let mut boosted = LearnedWeights::initial(now);
        boosted.set_multiplier("momentum_divergence", 2.0);
        let flipped = set.composite(&boosted);
        assert!(flipped.value < base.value);
    }

    #[test]
    fn test_compute_all_on_short_window_is_all_neutral() {
        let engine = IndicatorEngine::new();
        let bars = testutil::bars_from_closes(&[5.0, 5.1, 5.2]);
        let regime = RegimeClassification::uncertain();
        let set = engine.compute_all(&IndicatorInputs {
            bars: &bars,
            regime: &regime,
            sector_ref: None,
            market_ref: None,
        });
        assert_eq!(set.signals.len(), 8);
        for s in &set.signals {
            assert_eq!(s.direction, Direction::Neutral, "{:?}", s.kind);
            assert_eq!(s.strength, 0.0);
        }
    }
}
