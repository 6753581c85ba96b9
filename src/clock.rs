//! Market clock and calendar
//!
//! The clock is the single source of wall time; every other component takes
//! time via injection so tests can drive the pipeline deterministically.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Session classification for an instant in market time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketSession {
    Weekend,
    Closed,
    PreMarket,
    Open,
    AfterHours,
}

impl MarketSession {
    pub fn is_open(&self) -> bool {
        matches!(self, MarketSession::Open)
    }
}

impl fmt::Display for MarketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarketSession::Weekend => "weekend",
            MarketSession::Closed => "closed",
            MarketSession::PreMarket => "pre_market",
            MarketSession::Open => "open",
            MarketSession::AfterHours => "after_hours",
        };
        f.write_str(s)
    }
}

/// Intraday bucket recorded on feature snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionBucket {
    PreMarket,
    OpeningHour,
    Midday,
    PowerHour,
    AfterHours,
}

impl fmt::Display for SessionBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionBucket::PreMarket => "pre_market",
            SessionBucket::OpeningHour => "opening_hour",
            SessionBucket::Midday => "midday",
            SessionBucket::PowerHour => "power_hour",
            SessionBucket::AfterHours => "after_hours",
        };
        f.write_str(s)
    }
}

/// Source of current time. The only implementation allowed to read the host
/// clock is `SystemClock`.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock backed implementation
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock for tests and replays
#[derive(Debug)]
pub struct ManualClock {
    // Unix millis, advanced explicitly
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.millis.store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .single()
            .expect("manual clock millis in range")
    }
}

/// US equities market calendar in exchange time (America/New_York).
///
/// Regular session 09:30-16:00, pre-market from 04:00, after-hours to 20:00.
/// Exchange holidays are not modeled; weekends are.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    tz: Tz,
    pre_market_start: NaiveTime,
    open: NaiveTime,
    close: NaiveTime,
    after_hours_end: NaiveTime,
}

impl Default for MarketCalendar {
    fn default() -> Self {
        Self {
            tz: New_York,
            pre_market_start: NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            after_hours_end: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
        }
    }
}

impl MarketCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert an instant into exchange-local time
    pub fn local(&self, at: DateTime<Utc>) -> DateTime<Tz> {
        at.with_timezone(&self.tz)
    }

    /// Classify an instant into a market session
    pub fn session(&self, at: DateTime<Utc>) -> MarketSession {
        let local = self.local(at);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return MarketSession::Weekend;
        }
        let t = local.time();
        if t < self.pre_market_start {
            MarketSession::Closed
        } else if t < self.open {
            MarketSession::PreMarket
        } else if t < self.close {
            MarketSession::Open
        } else if t < self.after_hours_end {
            MarketSession::AfterHours
        } else {
            MarketSession::Closed
        }
    }

    /// Intraday bucket for feature snapshots
    pub fn session_bucket(&self, at: DateTime<Utc>) -> SessionBucket {
        let local = self.local(at);
        let t = local.time();
        if t < self.open {
            SessionBucket::PreMarket
        } else if t < NaiveTime::from_hms_opt(10, 30, 0).unwrap() {
            SessionBucket::OpeningHour
        } else if t < NaiveTime::from_hms_opt(15, 0, 0).unwrap() {
            SessionBucket::Midday
        } else if t < self.close {
            SessionBucket::PowerHour
        } else {
            SessionBucket::AfterHours
        }
    }

    /// Time until the next regular-session open
    pub fn until_next_open(&self, at: DateTime<Utc>) -> Duration {
        let mut local = self.local(at);
        // Today's open if still ahead on a weekday, else walk forward.
        for _ in 0..8 {
            let candidate = local.date_naive().and_time(self.open);
            let candidate = self
                .tz
                .from_local_datetime(&candidate)
                .single()
                .expect("exchange open is never ambiguous");
            if candidate > self.local(at)
                && !matches!(candidate.weekday(), Weekday::Sat | Weekday::Sun)
            {
                return candidate.with_timezone(&Utc) - at;
            }
            local += Duration::days(1);
        }
        // Unreachable with an 8-day scan
        Duration::zero()
    }

    /// Time until today's close; zero when the market is not open
    pub fn until_close(&self, at: DateTime<Utc>) -> Duration {
        if self.session(at) != MarketSession::Open {
            return Duration::zero();
        }
        let local = self.local(at);
        let close = self
            .tz
            .from_local_datetime(&local.date_naive().and_time(self.close))
            .single()
            .expect("exchange close is never ambiguous");
        close.with_timezone(&Utc) - at
    }

    /// Whether the local time falls in [start, end] (HH:MM inclusive)
    pub fn within_window(&self, at: DateTime<Utc>, start: (u32, u32), end: (u32, u32)) -> bool {
        let local = self.local(at);
        let minutes = local.hour() * 60 + local.minute();
        let lo = start.0 * 60 + start.1;
        let hi = end.0 * 60 + end.1;
        minutes >= lo && minutes <= hi
    }

    /// Guard against a clearly invalid host clock. Components must refuse to
    /// trade when this returns false.
    pub fn is_sane(&self, at: DateTime<Utc>) -> bool {
        at.year() >= 2000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_session_classification() {
        let cal = MarketCalendar::new();
        // Monday 2025-06-02, 10:00 ET = 14:00 UTC (EDT)
        assert_eq!(cal.session(utc(2025, 6, 2, 14, 0)), MarketSession::Open);
        // 08:00 ET
        assert_eq!(
            cal.session(utc(2025, 6, 2, 12, 0)),
            MarketSession::PreMarket
        );
        // 17:00 ET
        assert_eq!(
            cal.session(utc(2025, 6, 2, 21, 0)),
            MarketSession::AfterHours
        );
        // 02:00 ET
        assert_eq!(cal.session(utc(2025, 6, 2, 6, 0)), MarketSession::Closed);
        // Saturday
        assert_eq!(cal.session(utc(2025, 6, 7, 14, 0)), MarketSession::Weekend);
    }

    #[test]
    fn test_session_boundaries() {
        let cal = MarketCalendar::new();
        // Exactly 09:30 ET is open; exactly 16:00 ET is after-hours
        assert_eq!(cal.session(utc(2025, 6, 2, 13, 30)), MarketSession::Open);
        assert_eq!(
            cal.session(utc(2025, 6, 2, 20, 0)),
            MarketSession::AfterHours
        );
    }

    #[test]
    fn test_session_bucket() {
        let cal = MarketCalendar::new();
        assert_eq!(
            cal.session_bucket(utc(2025, 6, 2, 13, 45)),
            SessionBucket::OpeningHour
        );
        assert_eq!(
            cal.session_bucket(utc(2025, 6, 2, 16, 0)),
            SessionBucket::Midday
        );
        assert_eq!(
            cal.session_bucket(utc(2025, 6, 2, 19, 30)),
            SessionBucket::PowerHour
        );
    }

    #[test]
    fn test_until_close() {
        let cal = MarketCalendar::new();
        let d = cal.until_close(utc(2025, 6, 2, 14, 0)); // 10:00 ET
        assert_eq!(d.num_hours(), 6);
        assert_eq!(cal.until_close(utc(2025, 6, 7, 14, 0)), Duration::zero());
    }

    #[test]
    fn test_until_next_open_from_friday_evening() {
        let cal = MarketCalendar::new();
        // Friday 2025-06-06 18:00 ET -> Monday 09:30 ET
        let d = cal.until_next_open(utc(2025, 6, 6, 22, 0));
        assert!(d.num_hours() >= 60 && d.num_hours() <= 66, "{d:?}");
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(utc(2025, 6, 2, 14, 0));
        clock.advance(Duration::seconds(45));
        assert_eq!(clock.now(), utc(2025, 6, 2, 14, 0) + Duration::seconds(45));
    }

    #[test]
    fn test_sanity_guard() {
        let cal = MarketCalendar::new();
        assert!(cal.is_sane(utc(2025, 6, 2, 0, 0)));
        assert!(!cal.is_sane(utc(1999, 12, 31, 0, 0)));
    }

    #[test]
    fn test_within_window() {
        let cal = MarketCalendar::new();
        // 10:00 ET within 09:30-15:45
        assert!(cal.within_window(utc(2025, 6, 2, 14, 0), (9, 30), (15, 45)));
        // 15:50 ET outside
        assert!(!cal.within_window(utc(2025, 6, 2, 19, 50), (9, 30), (15, 45)));
    }
}
