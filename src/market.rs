//! Core market data types
//!
//! Validated at construction: a `Ticker`, `Quote`, or `Bar` that exists is
//! well-formed. Downstream code relies on these invariants instead of
//! re-checking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// An equity ticker symbol: 1-6 uppercase ASCII characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticker(String);

impl Ticker {
    /// Parse and validate a ticker symbol
    pub fn new(symbol: impl AsRef<str>) -> Result<Self> {
        let symbol = symbol.as_ref().trim().to_uppercase();
        if symbol.is_empty() || symbol.len() > 6 {
            return Err(Error::InvalidTicker(format!(
                "length {} outside 1-6",
                symbol.len()
            )));
        }
        if !symbol.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(Error::InvalidTicker(symbol));
        }
        Ok(Self(symbol))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Ticker {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Bar aggregation interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    OneDay,
}

impl Interval {
    /// Interval length in seconds
    pub fn secs(&self) -> i64 {
        match self {
            Interval::OneMinute => 60,
            Interval::FiveMinutes => 300,
            Interval::FifteenMinutes => 900,
            Interval::OneHour => 3600,
            Interval::OneDay => 86400,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Interval::OneMinute => "1m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::OneHour => "1h",
            Interval::OneDay => "1d",
        };
        f.write_str(s)
    }
}

/// Latest consolidated quote for a ticker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub ticker: Ticker,
    pub timestamp: DateTime<Utc>,
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub session_volume: u64,
    pub day_open: f64,
    pub day_high: f64,
    pub day_low: f64,
    pub prev_close: f64,
}

impl Quote {
    /// Validate price fields; call after construction from external data
    pub fn validate(self) -> Result<Self> {
        for (name, v) in [
            ("last", self.last),
            ("bid", self.bid),
            ("ask", self.ask),
            ("day_open", self.day_open),
            ("day_high", self.day_high),
            ("day_low", self.day_low),
            ("prev_close", self.prev_close),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return Err(Error::InvalidQuote(format!(
                    "{}: non-positive price {} for {}",
                    self.ticker, v, name
                )));
            }
        }
        Ok(self)
    }

    /// Day change as a fraction of previous close
    pub fn day_change_pct(&self) -> f64 {
        (self.last - self.prev_close) / self.prev_close
    }

    /// Quote age relative to the given instant
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds()
    }
}

/// OHLCV aggregate over a fixed interval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub ticker: Ticker,
    pub interval: Interval,
    pub start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Bar {
    /// Construct a validated bar. Enforces
    /// `low <= min(open, close) <= max(open, close) <= high` and positive
    /// prices.
    pub fn new(
        ticker: Ticker,
        interval: Interval,
        start: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: u64,
    ) -> Result<Self> {
        for (name, v) in [("open", open), ("high", high), ("low", low), ("close", close)] {
            if !v.is_finite() || v <= 0.0 {
                return Err(Error::InvalidBar(format!(
                    "{ticker}: non-positive {name} {v}"
                )));
            }
        }
        let body_lo = open.min(close);
        let body_hi = open.max(close);
        if low > body_lo || body_hi > high {
            return Err(Error::InvalidBar(format!(
                "{ticker}: OHLC ordering violated (o={open} h={high} l={low} c={close})"
            )));
        }
        Ok(Self {
            ticker,
            interval,
            start,
            open,
            high,
            low,
            close,
            volume,
        })
    }

    /// Bar-to-bar return given the previous close
    pub fn return_from(&self, prev_close: f64) -> f64 {
        (self.close - prev_close) / prev_close
    }

    /// Intrabar return (close vs open)
    pub fn intrabar_return(&self) -> f64 {
        (self.close - self.open) / self.open
    }

    /// Position of the close within the bar range, in [0, 1].
    /// A doji with zero range reads as 0.5.
    pub fn close_position(&self) -> f64 {
        let range = self.high - self.low;
        if range <= 0.0 {
            0.5
        } else {
            (self.close - self.low) / range
        }
    }

    /// Typical price (HLC/3)
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Extract closes from a bar window
pub fn closes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

/// Extract volumes from a bar window
pub fn volumes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.volume as f64).collect()
}

/// Volume-weighted average price over a bar window
pub fn vwap(bars: &[Bar]) -> Option<f64> {
    let total_volume: f64 = bars.iter().map(|b| b.volume as f64).sum();
    if total_volume <= 0.0 {
        return None;
    }
    let weighted: f64 = bars
        .iter()
        .map(|b| b.typical_price() * b.volume as f64)
        .sum();
    Some(weighted / total_volume)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 14, 30, 0).unwrap()
    }

    pub(crate) fn bar(open: f64, high: f64, low: f64, close: f64, volume: u64) -> Bar {
        Bar::new(
            Ticker::new("TEST").unwrap(),
            Interval::FiveMinutes,
            ts(),
            open,
            high,
            low,
            close,
            volume,
        )
        .unwrap()
    }

    #[test]
    fn test_ticker_validation() {
        assert!(Ticker::new("SIRI").is_ok());
        assert!(Ticker::new("f").is_ok()); // uppercased
        assert_eq!(Ticker::new("plug").unwrap().as_str(), "PLUG");
        assert!(Ticker::new("").is_err());
        assert!(Ticker::new("TOOLONGX").is_err());
        assert!(Ticker::new("BRK.B").is_err());
    }

    #[test]
    fn test_bar_ordering_enforced() {
        assert!(Bar::new(
            Ticker::new("TEST").unwrap(),
            Interval::OneMinute,
            ts(),
            2.0,
            1.9, // high below open
            1.8,
            1.95,
            1000,
        )
        .is_err());

        assert!(Bar::new(
            Ticker::new("TEST").unwrap(),
            Interval::OneMinute,
            ts(),
            2.0,
            2.2,
            2.05, // low above close
            2.01,
            1000,
        )
        .is_err());
    }

    #[test]
    fn test_bar_rejects_non_positive() {
        assert!(Bar::new(
            Ticker::new("TEST").unwrap(),
            Interval::OneMinute,
            ts(),
            0.0,
            1.0,
            0.5,
            0.8,
            100,
        )
        .is_err());
    }

    #[test]
    fn test_close_position() {
        let b = bar(2.0, 3.0, 1.0, 2.5, 1000);
        assert!((b.close_position() - 0.75).abs() < 1e-12);

        // Zero-range doji
        let b = bar(2.0, 2.0, 2.0, 2.0, 1000);
        assert_eq!(b.close_position(), 0.5);
    }

    #[test]
    fn test_vwap() {
        let bars = vec![bar(1.0, 1.2, 0.9, 1.1, 100), bar(1.1, 1.4, 1.0, 1.3, 300)];
        let v = vwap(&bars).unwrap();
        // (1.0667*100 + 1.2333*300) / 400
        assert!((v - 1.1917).abs() < 1e-3);
        assert!(vwap(&[]).is_none());
    }

    #[test]
    fn test_quote_day_change() {
        let q = Quote {
            ticker: Ticker::new("SIRI").unwrap(),
            timestamp: ts(),
            last: 5.5,
            bid: 5.49,
            ask: 5.51,
            session_volume: 1_000_000,
            day_open: 5.0,
            day_high: 5.6,
            day_low: 4.9,
            prev_close: 5.0,
        }
        .validate()
        .unwrap();
        assert!((q.day_change_pct() - 0.10).abs() < 1e-12);
    }
}
