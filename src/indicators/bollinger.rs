//! Adaptive Bollinger bands and squeeze detection
//!
//! Band period and width adapt to the volatility percentile of the last 20
//! bars: high-vol tape gets shorter, wider bands; quiet tape gets longer,
//! tighter ones. A band-width squeeze vetoes the positional read entirely --
//! inside a squeeze the next move is a coin flip until the breakout shows
//! its hand.

use std::collections::HashMap;

use super::{pct_changes, rolling_std, sma, Direction, IndicatorKind, IndicatorSignal};
use crate::market::Bar;

const BASE_PERIOD: usize = 20;
const VOL_WINDOW: usize = 20;
const MIN_BARS: usize = 45;
/// Band width below 0.8x its average reads as a squeeze
const SQUEEZE_RATIO: f64 = 0.8;

struct Bands {
    upper: f64,
    middle: f64,
    lower: f64,
    period: usize,
    std_multiplier: f64,
    vol_percentile: f64,
}

/// Resolve the adaptive period and multiplier, then compute the latest bands
fn adaptive_bands(closes: &[f64]) -> Option<Bands> {
    let returns = pct_changes(closes);
    if returns.len() < VOL_WINDOW * 2 {
        return None;
    }

    // Percentile of the latest rolling volatility within its own history
    let vol_series = rolling_std(&returns, VOL_WINDOW);
    let current_vol = *vol_series.last()?;
    let at_or_below = vol_series.iter().filter(|&&v| v <= current_vol).count();
    let vol_percentile = at_or_below as f64 / vol_series.len() as f64;

    let (period, std_multiplier) = if vol_percentile > 0.8 {
        ((BASE_PERIOD as f64 * 0.8) as usize, 2.5)
    } else if vol_percentile < 0.2 {
        ((BASE_PERIOD as f64 * 1.2) as usize, 1.5)
    } else {
        (BASE_PERIOD, 2.0)
    };

    if closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let middle = super::mean(window);
    let sd = super::std_dev(window);

    Some(Bands {
        upper: middle + sd * std_multiplier,
        middle,
        lower: middle - sd * std_multiplier,
        period,
        std_multiplier,
        vol_percentile,
    })
}

/// Band width series ((upper-lower)/middle) at a fixed 20/2.0 parameterization,
/// used for squeeze detection
fn band_width_series(closes: &[f64]) -> Vec<f64> {
    let ma = sma(closes, BASE_PERIOD);
    let sd = rolling_std(closes, BASE_PERIOD);
    ma.iter()
        .zip(&sd)
        .map(|(&m, &s)| if m > 0.0 { (4.0 * s) / m } else { 0.0 })
        .collect()
}

/// Whether the current band width sits below 0.8x its 20-bar average
fn detect_squeeze(closes: &[f64]) -> (bool, f64) {
    let widths = band_width_series(closes);
    let avg = sma(&widths, BASE_PERIOD);
    let current = *widths.last().unwrap_or(&0.0);
    let reference = *avg.last().unwrap_or(&0.0);
    (reference > 0.0 && current < reference * SQUEEZE_RATIO, current)
}

/// Adaptive Bollinger position signal
pub fn adaptive_bollinger(bars: &[Bar]) -> IndicatorSignal {
    if bars.len() < MIN_BARS {
        return IndicatorSignal::neutral(IndicatorKind::AdaptiveBollinger);
    }
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    let Some(bands) = adaptive_bands(&closes) else {
        return IndicatorSignal::neutral(IndicatorKind::AdaptiveBollinger);
    };

    let last = closes[closes.len() - 1];
    let width = bands.upper - bands.lower;
    let position = if width > 0.0 {
        (last - bands.lower) / width
    } else {
        0.5
    };

    let (squeeze, current_width) = detect_squeeze(&closes);

    let (direction, strength) = if squeeze {
        // Wait for the breakout
        (Direction::Neutral, 0.0)
    } else if position <= 0.1 {
        (Direction::Bullish, (1.0 - position * 5.0).clamp(0.0, 1.0))
    } else if position >= 0.9 {
        (Direction::Bearish, ((position - 0.9) * 10.0).clamp(0.0, 1.0))
    } else {
        (Direction::Neutral, 0.0)
    };

    let confidence = if squeeze { 0.3 } else { 0.8 };

    let mut aux = HashMap::new();
    aux.insert("upper_band".into(), bands.upper);
    aux.insert("middle_band".into(), bands.middle);
    aux.insert("lower_band".into(), bands.lower);
    aux.insert("band_width".into(), current_width);
    aux.insert("squeeze".into(), if squeeze { 1.0 } else { 0.0 });
    aux.insert("vol_percentile".into(), bands.vol_percentile);
    aux.insert("adaptive_period".into(), bands.period as f64);
    aux.insert("std_multiplier".into(), bands.std_multiplier);

    IndicatorSignal {
        kind: IndicatorKind::AdaptiveBollinger,
        value: position,
        direction,
        strength,
        confidence,
        aux,
    }
}

/// Legacy squeeze detector hook: textbook 20/2.0 bands, neutral direction,
/// value is the current band width.
pub fn squeeze_signal(bars: &[Bar]) -> IndicatorSignal {
    if bars.len() < MIN_BARS {
        return IndicatorSignal::neutral(IndicatorKind::BollingerSqueeze);
    }
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let (squeeze, width) = detect_squeeze(&closes);

    let mut aux = HashMap::new();
    aux.insert("squeeze".into(), if squeeze { 1.0 } else { 0.0 });

    IndicatorSignal {
        kind: IndicatorKind::BollingerSqueeze,
        value: width,
        direction: Direction::Neutral,
        strength: if squeeze { 1.0 } else { 0.0 },
        confidence: if squeeze { 0.7 } else { 0.4 },
        aux,
    }
}
