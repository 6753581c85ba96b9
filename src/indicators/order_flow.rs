//! Order-flow imbalance proxy
//!
//! No tape access, so flow is estimated from bar microstructure: where the
//! close sits in the range, how fast it got there, and how much volume rode
//! along. Large volume with controlled price movement gets boosted as an
//! institutional signature. Flows are read on three horizons and judged
//! against volatility-scaled thresholds.

use std::collections::HashMap;

use super::{mean, rolling_std, sma, std_dev, Direction, IndicatorKind, IndicatorSignal};
use crate::market::Bar;

const SHORT_WINDOW: usize = 5;
const MEDIUM_WINDOW: usize = 20;
const LONG_WINDOW: usize = 50;
const MIN_BARS: usize = 60;

/// Per-bar net flow (buying pressure minus selling pressure) with the
/// institutional boost applied
fn net_flows(bars: &[Bar]) -> Vec<f64> {
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume as f64).collect();
    let volume_ma = sma(&volumes, MEDIUM_WINDOW);

    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let position = bar.close_position();
            let velocity = bar.intrabar_return();
            let volume = bar.volume as f64;

            let buying = position * volume * (1.0 + velocity.max(0.0));
            let selling = (1.0 - position) * volume * (1.0 + (-velocity).max(0.0));

            // Institutional signature: volume spike with low price impact
            let spike = if volume_ma[i] > 0.0 {
                volume / volume_ma[i]
            } else {
                1.0
            };
            let impact = velocity.abs();
            let institutional = if spike > 1.5 && impact < 0.02 {
                spike * 0.5
            } else {
                1.0
            };

            (buying - selling) * institutional
        })
        .collect()
}

/// Rolling sum over trailing `window` values
fn rolling_sum(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for i in 0..values.len() {
        sum += values[i];
        if i >= window {
            sum -= values[i - window];
        }
        out.push(sum);
    }
    out
}

/// N-step difference; output aligned to the input tail
fn diff(values: &[f64], step: usize) -> Vec<f64> {
    if values.len() <= step {
        return Vec::new();
    }
    (step..values.len())
        .map(|i| values[i] - values[i - step])
        .collect()
}

/// Order-flow imbalance signal over 5/20/50-bar horizons
pub fn order_flow_imbalance(bars: &[Bar]) -> IndicatorSignal {
    if bars.len() < MIN_BARS {
        return IndicatorSignal::neutral(IndicatorKind::OrderFlow);
    }

    let flows = net_flows(bars);
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume as f64).collect();
    let avg_volume = mean(&volumes[volumes.len() - LONG_WINDOW..]);
    if avg_volume <= 0.0 {
        return IndicatorSignal::neutral(IndicatorKind::OrderFlow);
    }

    // Normalize each horizon by the volume it could have carried
    let norm = |sums: Vec<f64>, window: usize| -> Vec<f64> {
        sums.into_iter()
            .map(|s| s / (avg_volume * window as f64))
            .collect()
    };
    let short = norm(rolling_sum(&flows, SHORT_WINDOW), SHORT_WINDOW);
    let medium = norm(rolling_sum(&flows, MEDIUM_WINDOW), MEDIUM_WINDOW);
    let long = norm(rolling_sum(&flows, LONG_WINDOW), LONG_WINDOW);

    let momentum = diff(&medium, 3);
    let acceleration = diff(&momentum, 2);

    let current_short = short[short.len() - 1];
    let current_medium = medium[medium.len() - 1];
    let current_momentum = *momentum.last().unwrap_or(&0.0);
    let current_acceleration = *acceleration.last().unwrap_or(&0.0);

    // Volatility-scaled thresholds
    let medium_std = *rolling_std(&medium, MEDIUM_WINDOW)
        .last()
        .expect("non-empty");
    if medium_std <= f64::EPSILON {
        return IndicatorSignal::neutral(IndicatorKind::OrderFlow);
    }
    let momentum_threshold = medium_std * 0.3;
    let acceleration_threshold = medium_std * 0.2;

    let mut signal_strength = 0.0;
    if current_short.abs() > momentum_threshold {
        signal_strength += 0.3 * (current_short.abs() / momentum_threshold);
    }
    if current_medium.abs() > momentum_threshold {
        signal_strength += 0.4 * (current_medium.abs() / momentum_threshold);
    }
    if current_acceleration.abs() > acceleration_threshold {
        signal_strength += 0.3 * (current_acceleration.abs() / acceleration_threshold);
    }

    let (direction, strength) = if current_medium > momentum_threshold && current_momentum > 0.0 {
        (Direction::Bullish, signal_strength.min(1.0))
    } else if current_medium < -momentum_threshold && current_momentum < 0.0 {
        (Direction::Bearish, signal_strength.min(1.0))
    } else {
        (Direction::Neutral, (signal_strength * 0.5).min(1.0))
    };

    // Confidence blends volume consistency, price impact, and the
    // institutional read
    let recent_volumes = &volumes[volumes.len() - 10..];
    let vol_mean = mean(recent_volumes);
    let volume_consistency = if vol_mean > 0.0 {
        1.0 - (std_dev(recent_volumes) / vol_mean).min(1.0)
    } else {
        0.0
    };
    let last_impact = bars[bars.len() - 1].intrabar_return().abs();
    let price_consistency = 1.0 - last_impact.min(1.0);
    let last_volume_ma = *sma(&volumes, MEDIUM_WINDOW).last().expect("non-empty");
    let institutional_confidence = if last_volume_ma > 0.0 {
        ((volumes[volumes.len() - 1] / last_volume_ma) / 2.0).min(1.0)
    } else {
        0.0
    };
    let confidence =
        volume_consistency * 0.4 + price_consistency * 0.3 + institutional_confidence * 0.3;

    let mut aux = HashMap::new();
    aux.insert("short_flow".into(), current_short);
    aux.insert("medium_flow".into(), current_medium);
    aux.insert("long_flow".into(), long[long.len() - 1]);
    aux.insert("flow_momentum".into(), current_momentum);
    aux.insert("flow_acceleration".into(), current_acceleration);
    aux.insert("flow_threshold".into(), momentum_threshold);

    IndicatorSignal {
        kind: IndicatorKind::OrderFlow,
        value: current_medium,
        direction,
        strength,
        confidence,
        aux,
    }
}
