//! Williams %R
//!
//! Textbook definition, kept as a legacy scoring hook: it carries no
//! composite weight but feeds setup-type tagging.

use std::collections::HashMap;

use super::{Direction, IndicatorKind, IndicatorSignal};
use crate::market::Bar;

const PERIOD: usize = 14;
const OVERSOLD: f64 = -80.0;
const OVERBOUGHT: f64 = -20.0;

/// Williams %R series in [-100, 0]; output length is
/// `bars.len() - PERIOD + 1`
pub fn williams_r_series(bars: &[Bar], period: usize) -> Vec<f64> {
    if bars.len() < period {
        return Vec::new();
    }
    (period - 1..bars.len())
        .map(|i| {
            let window = &bars[i + 1 - period..=i];
            let highest = window.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
            let lowest = window.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
            let range = highest - lowest;
            if range > 0.0 {
                (highest - bars[i].close) / range * -100.0
            } else {
                -50.0
            }
        })
        .collect()
}

/// Williams %R signal: below -80 oversold (bullish), above -20 overbought
/// (bearish)
pub fn williams_r(bars: &[Bar]) -> IndicatorSignal {
    let series = williams_r_series(bars, PERIOD);
    let Some(&current) = series.last() else {
        return IndicatorSignal::neutral(IndicatorKind::WilliamsR);
    };

    let (direction, strength) = if current <= OVERSOLD {
        (Direction::Bullish, ((OVERSOLD - current) / 20.0).min(1.0))
    } else if current >= OVERBOUGHT {
        (Direction::Bearish, ((current - OVERBOUGHT) / 20.0).min(1.0))
    } else {
        (Direction::Neutral, 0.0)
    };

    // Confidence from time spent in the zone over the last ten readings
    let tail = &series[series.len().saturating_sub(10)..];
    let in_zone = tail
        .iter()
        .filter(|&&v| v <= OVERSOLD || v >= OVERBOUGHT)
        .count();
    let confidence = (in_zone as f64 / tail.len() as f64).max(0.3);

    let mut aux = HashMap::new();
    aux.insert("oversold_threshold".into(), OVERSOLD);
    aux.insert("overbought_threshold".into(), OVERBOUGHT);

    IndicatorSignal {
        kind: IndicatorKind::WilliamsR,
        value: current,
        direction,
        strength,
        confidence,
        aux,
    }
}
