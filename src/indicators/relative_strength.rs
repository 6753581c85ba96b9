//! Sector relative strength
//!
//! Multi-timeframe excess return against a sector reference series and a
//! market reference series, weighted toward recent performance. The sector
//! reference symbol comes from a built-in map; the price series themselves
//! are fetched before scoring and passed in.

use lazy_static::lazy_static;
use std::collections::HashMap;

use super::{mean, pct_changes, sma, std_dev, Direction, IndicatorKind, IndicatorSignal};
use crate::market::Bar;

const TIMEFRAMES: [usize; 4] = [5, 10, 20, 50];
const TIMEFRAME_WEIGHTS: [f64; 4] = [0.4, 0.3, 0.2, 0.1];
const MIN_BARS: usize = 51;
/// Market proxy window used when no market reference series is supplied
const PROXY_WINDOW: usize = 100;

lazy_static! {
    /// Sector label -> reference ETF symbol
    static ref SECTOR_ETFS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("technology", "XLK");
        m.insert("healthcare", "XLV");
        m.insert("financials", "XLF");
        m.insert("consumer discretionary", "XLY");
        m.insert("consumer staples", "XLP");
        m.insert("energy", "XLE");
        m.insert("industrials", "XLI");
        m.insert("utilities", "XLU");
        m.insert("materials", "XLB");
        m.insert("real estate", "XLRE");
        m.insert("communication services", "XLC");
        m
    };
}

/// Reference ETF for a sector label; unknown sectors fall back to SPY
pub fn etf_for_sector(sector: &str) -> &'static str {
    SECTOR_ETFS
        .get(sector.to_lowercase().as_str())
        .copied()
        .unwrap_or("SPY")
}

/// Market reference symbol
pub const MARKET_ETF: &str = "SPY";

/// Trailing return over `timeframe` bars, in percent
fn trailing_return(closes: &[f64], timeframe: usize) -> Option<f64> {
    if closes.len() <= timeframe {
        return None;
    }
    let last = closes[closes.len() - 1];
    let base = closes[closes.len() - 1 - timeframe];
    if base <= 0.0 {
        return None;
    }
    Some((last / base - 1.0) * 100.0)
}

/// Sector relative strength signal.
///
/// `sector_ref` and `market_ref` are reference closes aligned to the tail of
/// `bars`. Without a sector reference the read is neutral; without a market
/// reference a long rolling mean of the stock itself stands in.
pub fn sector_relative_strength(
    bars: &[Bar],
    sector_ref: Option<&[f64]>,
    market_ref: Option<&[f64]>,
) -> IndicatorSignal {
    if bars.len() < MIN_BARS {
        return IndicatorSignal::neutral(IndicatorKind::SectorStrength);
    }
    let Some(sector) = sector_ref else {
        return IndicatorSignal::neutral(IndicatorKind::SectorStrength);
    };
    if sector.len() < MIN_BARS {
        return IndicatorSignal::neutral(IndicatorKind::SectorStrength);
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    // Market series: supplied reference, else a slow proxy of the stock
    let market_proxy;
    let market: &[f64] = match market_ref {
        Some(m) if m.len() >= MIN_BARS => m,
        _ => {
            market_proxy = sma(&closes, PROXY_WINDOW);
            &market_proxy
        }
    };

    let mut composite_vs_sector = 0.0;
    let mut composite_vs_market = 0.0;
    let mut consistent = 0usize;
    let mut measured = 0usize;

    for (timeframe, weight) in TIMEFRAMES.iter().zip(TIMEFRAME_WEIGHTS) {
        let (Some(stock_ret), Some(sector_ret), Some(market_ret)) = (
            trailing_return(&closes, *timeframe),
            trailing_return(sector, *timeframe),
            trailing_return(market, *timeframe),
        ) else {
            continue;
        };
        let vs_sector = stock_ret - sector_ret;
        let vs_market = stock_ret - market_ret;
        composite_vs_sector += vs_sector * weight;
        composite_vs_market += vs_market * weight;
        if vs_sector > 0.0 && vs_market > 0.0 {
            consistent += 1;
        }
        measured += 1;
    }

    if measured == 0 {
        return IndicatorSignal::neutral(IndicatorKind::SectorStrength);
    }
    let trend_consistency = consistent as f64 / measured as f64;

    // Five-bar momentum advantage over the sector, in percent
    let stock_momentum = mean(&pct_changes(&closes[closes.len() - 6..])) * 100.0;
    let sector_momentum = mean(&pct_changes(&sector[sector.len() - 6..])) * 100.0;
    let momentum_advantage = stock_momentum - sector_momentum;

    let mut signal_strength: f64 = 0.0;
    if composite_vs_sector > 2.0 {
        signal_strength += 0.4;
    } else if composite_vs_sector < -2.0 {
        signal_strength -= 0.4;
    }
    if composite_vs_market > 3.0 {
        signal_strength += 0.3;
    } else if composite_vs_market < -3.0 {
        signal_strength -= 0.3;
    }
    if trend_consistency >= 0.75 {
        signal_strength += 0.2 * signal_strength.signum();
    }
    if momentum_advantage > 0.5 {
        signal_strength += 0.1;
    } else if momentum_advantage < -0.5 {
        signal_strength -= 0.1;
    }

    let (direction, strength) = if signal_strength > 0.3 {
        (Direction::Bullish, signal_strength.min(1.0))
    } else if signal_strength < -0.3 {
        (Direction::Bearish, signal_strength.abs().min(1.0))
    } else {
        (Direction::Neutral, signal_strength.abs())
    };

    let stock_volatility = std_dev(&pct_changes(&closes[closes.len() - 21..])) * 100.0;
    let magnitude_confidence = (composite_vs_sector.abs() / 5.0).min(1.0);
    let volatility_confidence = (1.0 - stock_volatility / 50.0).max(0.2);
    let confidence =
        magnitude_confidence * 0.4 + trend_consistency * 0.4 + volatility_confidence * 0.2;

    let mut aux = HashMap::new();
    aux.insert("composite_vs_sector".into(), composite_vs_sector);
    aux.insert("composite_vs_market".into(), composite_vs_market);
    aux.insert("trend_consistency".into(), trend_consistency);
    aux.insert("momentum_advantage".into(), momentum_advantage);
    aux.insert("stock_volatility".into(), stock_volatility);

    IndicatorSignal {
        kind: IndicatorKind::SectorStrength,
        value: composite_vs_sector,
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

    #[test]
    fn test_etf_lookup() {
        assert_eq!(etf_for_sector("Technology"), "XLK");
        assert_eq!(etf_for_sector("energy"), "XLE");
        assert_eq!(etf_for_sector("unknown"), "SPY");
    }

    #[test]
    fn test_missing_sector_ref_is_neutral() {
        let closes: Vec<f64> = (0..60).map(|i| 5.0 + 0.01 * i as f64).collect();
        let bars = bars_from_closes(&closes);
        let signal = sector_relative_strength(&bars, None, None);
        assert_eq!(signal.direction, Direction::Neutral);
        assert_eq!(signal.confidence, 0.0);
    }

    #[test]
    fn test_outperformance_reads_bullish() {
        // Stock up ~18% over the window while sector and market stay flat
        let closes: Vec<f64> = (0..60).map(|i| 5.0 * (1.0 + 0.003 * i as f64)).collect();
        let flat: Vec<f64> = vec![100.0; 60];
        let bars = bars_from_closes(&closes);
        let signal = sector_relative_strength(&bars, Some(&flat), Some(&flat));
        assert_eq!(signal.direction, Direction::Bullish);
        assert!(signal.aux["composite_vs_sector"] > 2.0);
        assert!(signal.aux["composite_vs_market"] > 3.0);
        assert!(signal.aux["trend_consistency"] >= 0.75);
    }

    #[test]
    fn test_underperformance_reads_bearish() {
        let closes: Vec<f64> = (0..60).map(|i| 5.0 * (1.0 - 0.002 * i as f64)).collect();
        let rising: Vec<f64> = (0..60).map(|i| 100.0 + 0.1 * i as f64).collect();
        let bars = bars_from_closes(&closes);
        let signal = sector_relative_strength(&bars, Some(&rising), Some(&rising));
        assert_eq!(signal.direction, Direction::Bearish);
    }

    #[test]
    fn test_matching_sector_is_neutral() {
        // Stock tracks its sector exactly: no excess return either way
        let closes: Vec<f64> = (0..60).map(|i| 5.0 * (1.0 + 0.001 * i as f64)).collect();
        let sector: Vec<f64> = (0..60).map(|i| 100.0 * (1.0 + 0.001 * i as f64)).collect();
        let bars = bars_from_closes(&closes);
        let signal = sector_relative_strength(&bars, Some(&sector), Some(&sector));
        assert_eq!(signal.direction, Direction::Neutral);
    }
}
