//! RSI z-score
//!
//! Standard RSI normalized by its own rolling distribution. The z-score
//! removes the static-threshold problem: what counts as stretched depends on
//! how volatile RSI itself has been, and the entry band widens in
//! high-volatility regimes.

use std::collections::HashMap;

use super::{mean, persistence, std_dev, Direction, IndicatorKind, IndicatorSignal};
use crate::market::Bar;
use crate::regime::RegimeClassification;

/// Wilder-smoothed RSI series. Output starts once `period + 1` closes are
/// available; output length is `closes.len() - period`.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    if closes.len() <= period || period == 0 {
        return Vec::new();
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for w in closes[..=period].windows(2) {
        let change = w[1] - w[0];
        if change >= 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;

    let mut out = Vec::with_capacity(closes.len() - period);
    out.push(rsi_value(avg_gain, avg_loss));

    for w in closes[period..].windows(2) {
        let change = w[1] - w[0];
        let (gain, loss) = if change >= 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out.push(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss <= 0.0 {
        if avg_gain <= 0.0 {
            50.0
        } else {
            100.0
        }
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// Z-scores of an RSI series against its rolling window
fn zscore_series(rsi: &[f64], window: usize) -> Vec<f64> {
    let mut out = Vec::new();
    for i in 0..rsi.len() {
        if i + 1 < window {
            continue;
        }
        let slice = &rsi[i + 1 - window..=i];
        let sd = std_dev(slice);
        if sd > 0.0 {
            out.push((rsi[i] - mean(slice)) / sd);
        } else {
            out.push(0.0);
        }
    }
    out
}

/// RSI z-score signal. The z window is 3x the RSI period; the entry band is
/// regime-adaptive (±2.0 in high-vol regimes, ±1.5 otherwise).
pub fn rsi_zscore(bars: &[Bar], period: usize, regime: &RegimeClassification) -> IndicatorSignal {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let z_window = period * 3;
    // Need one z value at minimum: period+1 closes for the first RSI value,
    // then z_window RSI values.
    if closes.len() < period + z_window {
        return IndicatorSignal::neutral(IndicatorKind::RsiZscore);
    }

    let rsi = rsi_series(&closes, period);
    let zscores = zscore_series(&rsi, z_window);
    let Some(&z) = zscores.last() else {
        return IndicatorSignal::neutral(IndicatorKind::RsiZscore);
    };
    let current_rsi = *rsi.last().expect("rsi nonempty when zscores are");

    let (oversold, overbought) = regime.rsi_z_band();

    let (direction, strength) = if z <= oversold {
        (Direction::Bullish, (z.abs() / oversold.abs()).min(1.0))
    } else if z >= overbought {
        (Direction::Bearish, (z.abs() / overbought).min(1.0))
    } else {
        (Direction::Neutral, 0.0)
    };

    let confidence = persistence(&zscores, 1.0, 10);

    let tail = &rsi[rsi.len() - z_window..];
    let mut aux = HashMap::new();
    aux.insert("traditional_rsi".into(), current_rsi);
    aux.insert("rsi_mean".into(), mean(tail));
    aux.insert("rsi_std".into(), std_dev(tail));
    aux.insert("oversold_threshold".into(), oversold);
    aux.insert("overbought_threshold".into(), overbought);

    IndicatorSignal {
        kind: IndicatorKind::RsiZscore,
        value: z,
        direction,
        strength,
        confidence,
        aux,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::testutil::bars_from_closes;
    use crate::regime::RegimeClassification;

    #[test]
    fn test_rsi_series_bounds() {
        // Steady gains push RSI toward 100
        let closes: Vec<f64> = (0..30).map(|i| 10.0 + i as f64 * 0.1).collect();
        let rsi = rsi_series(&closes, 14);
        assert_eq!(rsi.len(), closes.len() - 14);
        assert!(rsi.iter().all(|&v| (0.0..=100.0).contains(&v)));
        assert!(*rsi.last().unwrap() > 90.0);

        // Steady losses push RSI toward 0
        let closes: Vec<f64> = (0..30).map(|i| 20.0 - i as f64 * 0.1).collect();
        let rsi = rsi_series(&closes, 14);
        assert!(*rsi.last().unwrap() < 10.0);
    }

    #[test]
    fn test_short_window_is_neutral() {
        let bars = bars_from_closes(&[5.0; 30]);
        let signal = rsi_zscore(&bars, 14, &RegimeClassification::uncertain());
        assert_eq!(signal.direction, Direction::Neutral);
        assert_eq!(signal.confidence, 0.0);
    }

    #[test]
    fn test_washout_reads_bullish() {
        // Choppy base long enough to establish an RSI distribution, then a
        // hard multi-bar washout drives the z-score deep negative.
        let mut closes: Vec<f64> = (0..70)
            .map(|i| 5.0 + if i % 2 == 0 { 0.02 } else { -0.02 })
            .collect();
        for i in 0..10 {
            closes.push(4.9 - 0.12 * i as f64);
        }
        let bars = bars_from_closes(&closes);
        let signal = rsi_zscore(&bars, 14, &RegimeClassification::uncertain());
        assert_eq!(signal.direction, Direction::Bullish, "z={}", signal.value);
        assert!(signal.value <= -2.0);
        assert!(signal.strength > 0.0);
    }

    #[test]
    fn test_band_narrows_outside_high_vol() {
        let mut closes: Vec<f64> = (0..70)
            .map(|i| 5.0 + if i % 2 == 0 { 0.02 } else { -0.02 })
            .collect();
        for i in 0..4 {
            closes.push(4.9 - 0.1 * i as f64);
        }
        let bars = bars_from_closes(&closes);

        // A moderate washout: may not clear |z| >= 2.0 but should clear 1.5
        let mut low_vol = RegimeClassification::uncertain();
        low_vol
            .adaptive_thresholds
            .insert("rsi_z_oversold".into(), -1.5);
        low_vol
            .adaptive_thresholds
            .insert("rsi_z_overbought".into(), 1.5);

        let wide = rsi_zscore(&bars, 14, &RegimeClassification::uncertain());
        let narrow = rsi_zscore(&bars, 14, &low_vol);
        // The narrow band can only make the signal easier to trigger
        if wide.direction == Direction::Bullish {
            assert_eq!(narrow.direction, Direction::Bullish);
        }
    }
}
