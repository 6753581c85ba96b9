//! Volume-price trend
//!
//! Cumulative sum of volume times bar-to-bar return. Less gameable than
//! VWAP-anchored measures: a move only counts when volume travels with it.
//! Bullish requires the VPT line rising, sitting above its moving average,
//! and current volume at least 1.2x the 20-bar mean.

use std::collections::HashMap;

use super::{mean, sma, std_dev, Direction, IndicatorKind, IndicatorSignal};
use crate::market::Bar;

const MA_WINDOW: usize = 14;
const VOLUME_WINDOW: usize = 20;
const TREND_SPAN: usize = 5;
const MIN_BARS: usize = 25;
/// Relative volume needed to confirm a directional read
const VOLUME_CONFIRMATION: f64 = 1.2;

/// Cumulative volume-price trend series; length is `bars.len() - 1`
pub fn vpt_series(bars: &[Bar]) -> Vec<f64> {
    let mut out = Vec::with_capacity(bars.len().saturating_sub(1));
    let mut acc = 0.0;
    for w in bars.windows(2) {
        let ret = w[1].return_from(w[0].close);
        acc += ret * w[1].volume as f64;
        out.push(acc);
    }
    out
}

/// Volume-price trend signal
pub fn volume_price_trend(bars: &[Bar]) -> IndicatorSignal {
    if bars.len() < MIN_BARS {
        return IndicatorSignal::neutral(IndicatorKind::VolumePriceTrend);
    }

    let vpt = vpt_series(bars);
    let vpt_ma = sma(&vpt, MA_WINDOW);

    let volumes: Vec<f64> = bars.iter().map(|b| b.volume as f64).collect();
    let avg_volume = mean(&volumes[volumes.len() - VOLUME_WINDOW..]);
    if avg_volume <= 0.0 {
        return IndicatorSignal::neutral(IndicatorKind::VolumePriceTrend);
    }
    let relative_volume = volumes[volumes.len() - 1] / avg_volume;

    let last = vpt[vpt.len() - 1];
    let trend = last - vpt[vpt.len() - 1 - TREND_SPAN];
    let above_ma = last > vpt_ma[vpt_ma.len() - 1];
    let vpt_std = std_dev(&vpt);

    let volume_confirmed = relative_volume >= VOLUME_CONFIRMATION;

    let (direction, strength) = if trend > 0.0 && above_ma && volume_confirmed {
        let s = if vpt_std > 0.0 {
            ((trend / vpt_std) * relative_volume / 2.0).min(1.0)
        } else {
            0.5
        };
        (Direction::Bullish, s)
    } else if trend < 0.0 && !above_ma && volume_confirmed {
        let s = if vpt_std > 0.0 {
            ((trend.abs() / vpt_std) * relative_volume / 2.0).min(1.0)
        } else {
            0.5
        };
        (Direction::Bearish, s)
    } else {
        (Direction::Neutral, 0.0)
    };

    let confidence = if relative_volume > 1.0 {
        (relative_volume / 2.0).min(1.0)
    } else {
        0.3
    };

    let mut aux = HashMap::new();
    aux.insert("vpt_trend".into(), trend);
    aux.insert("vpt_ma".into(), vpt_ma[vpt_ma.len() - 1]);
    aux.insert("relative_volume".into(), relative_volume);
    aux.insert(
        "volume_confirmation".into(),
        if volume_confirmed { 1.0 } else { 0.0 },
    );

    IndicatorSignal {
        kind: IndicatorKind::VolumePriceTrend,
        value: last,
        direction,
        strength,
        confidence,
        aux,
    }
}
