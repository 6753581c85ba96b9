//! Momentum divergence
//!
//! True-Strength-Index style double-smoothed momentum, scanned for
//! price/momentum disagreement: a lower low in price against a higher low in
//! momentum is the bullish setup, the mirror is bearish. Divergences are
//! strong signals; plain TSI direction is a weaker fallback.

use std::collections::HashMap;

use super::{ema, persistence, Direction, IndicatorKind, IndicatorSignal};
use crate::market::Bar;

const TSI_LONG: usize = 25;
const TSI_SHORT: usize = 13;
const EXTREME_WINDOW: usize = 20;
const MIN_BARS: usize = 45;

/// Double-smoothed momentum oscillator normalized to [-1, 1]
pub fn tsi_series(closes: &[f64]) -> Vec<f64> {
    if closes.len() < 2 {
        return Vec::new();
    }
    let momentum: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let abs_momentum: Vec<f64> = momentum.iter().map(|m| m.abs()).collect();

    let double_smooth = ema(&ema(&momentum, TSI_LONG), TSI_SHORT);
    let double_smooth_abs = ema(&ema(&abs_momentum, TSI_LONG), TSI_SHORT);

    double_smooth
        .iter()
        .zip(&double_smooth_abs)
        .map(|(&m, &a)| if a > 0.0 { m / a } else { 0.0 })
        .collect()
}

/// Rolling minimum over trailing `window` values
fn rolling_min(values: &[f64], window: usize) -> Vec<f64> {
    values
        .iter()
        .enumerate()
        .map(|(i, _)| {
            let lo = (i + 1).saturating_sub(window);
            values[lo..=i].iter().cloned().fold(f64::INFINITY, f64::min)
        })
        .collect()
}

/// Rolling maximum over trailing `window` values
fn rolling_max(values: &[f64], window: usize) -> Vec<f64> {
    values
        .iter()
        .enumerate()
        .map(|(i, _)| {
            let lo = (i + 1).saturating_sub(window);
            values[lo..=i]
                .iter()
                .cloned()
                .fold(f64::NEG_INFINITY, f64::max)
        })
        .collect()
}

/// Momentum divergence signal over a 20-bar extreme window
pub fn momentum_divergence(bars: &[Bar]) -> IndicatorSignal {
    if bars.len() < MIN_BARS {
        return IndicatorSignal::neutral(IndicatorKind::MomentumDivergence);
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();

    let tsi = tsi_series(&closes);
    let last_close = *closes.last().expect("non-empty");
    let last_tsi = *tsi.last().expect("non-empty");

    let price_lows = rolling_min(&lows, EXTREME_WINDOW);
    let price_highs = rolling_max(&highs, EXTREME_WINDOW);
    let tsi_lows = rolling_min(&tsi, EXTREME_WINDOW);
    let tsi_highs = rolling_max(&tsi, EXTREME_WINDOW);

    // Compare the latest print to the extreme band as it stood five bars ago
    let ref_idx = closes.len() - 6;
    let tsi_ref_idx = tsi.len() - 6;

    let price_lower_low = last_close < price_lows[ref_idx];
    let momentum_higher_low = last_tsi > tsi_lows[tsi_ref_idx];
    let bullish_divergence = price_lower_low && momentum_higher_low;

    let price_higher_high = last_close > price_highs[ref_idx];
    let momentum_lower_high = last_tsi < tsi_highs[tsi_ref_idx];
    let bearish_divergence = price_higher_high && momentum_lower_high;

    let (direction, strength) = if bullish_divergence {
        (Direction::Bullish, 0.8)
    } else if bearish_divergence {
        (Direction::Bearish, 0.8)
    } else if last_tsi > 0.1 {
        (Direction::Bullish, (last_tsi.abs() * 3.0).min(0.6))
    } else if last_tsi < -0.1 {
        (Direction::Bearish, (last_tsi.abs() * 3.0).min(0.6))
    } else {
        (Direction::Neutral, 0.0)
    };

    let confidence = persistence(&tsi, 0.05, 10);

    let mut aux = HashMap::new();
    aux.insert(
        "bullish_divergence".into(),
        if bullish_divergence { 1.0 } else { 0.0 },
    );
    aux.insert(
        "bearish_divergence".into(),
        if bearish_divergence { 1.0 } else { 0.0 },
    );
    aux.insert("tsi".into(), last_tsi);

    IndicatorSignal {
        kind: IndicatorKind::MomentumDivergence,
        value: last_tsi,
        direction,
        strength,
        confidence,
        aux,
    }
}
