//! Position tracking
//!
//! The execution monitor exclusively owns mutation of positions. Each
//! position's state sits behind its own async mutex so the exit path is
//! serialized per position; the book preserves insertion order for the
//! monitor's sweep. Daily counters live behind a single mutex and reset only
//! at rollover.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::journal::ExitReason;
use crate::market::Ticker;

/// Mutable state of an open position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionState {
    pub entry_fill: f64,
    pub shares: u64,
    /// Fraction of account committed at entry; scales realized returns into
    /// account terms for the daily counters
    pub size_fraction: f64,
    /// Stop as originally placed; the trailing rule measures risk off this
    pub initial_stop: f64,
    /// Current stop; only ever moves up
    pub stop: f64,
    pub target: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub created_at: DateTime<Utc>,
    pub max_hold_until: DateTime<Utc>,
    pub trailing_enabled: bool,
    /// True once the trailing rule has advanced the stop
    pub stop_advanced: bool,
    /// Exit retries consumed after sell failures
    pub exit_attempts: u32,
    /// Set exactly once when the position terminates
    pub closed: Option<ExitReason>,
}

impl PositionState {
    pub fn unrealized_pct(&self, price: f64) -> f64 {
        (price - self.entry_fill) / self.entry_fill
    }

    /// Initial risk per share (entry minus initial stop)
    pub fn initial_risk(&self) -> f64 {
        self.entry_fill - self.initial_stop
    }

    /// Maximum favorable excursion observed, percent
    pub fn max_favorable_pct(&self) -> f64 {
        (self.highest_price - self.entry_fill) / self.entry_fill * 100.0
    }

    /// Maximum adverse excursion observed, percent (non-positive)
    pub fn max_adverse_pct(&self) -> f64 {
        (self.lowest_price - self.entry_fill) / self.entry_fill * 100.0
    }
}

/// A position plus its identity and journal links
pub struct PositionHandle {
    pub id: Uuid,
    pub ticker: Ticker,
    pub recommendation_id: Uuid,
    pub prediction_id: Uuid,
    pub decision_id: Uuid,
    /// Expected move carried from the prediction, percent
    pub expected_move_pct: f64,
    /// Expected horizon carried from the prediction, hours
    pub expected_horizon_hours: f64,
    pub state: AsyncMutex<PositionState>,
}

/// Ordered book of open positions
#[derive(Default)]
pub struct PositionBook {
    positions: RwLock<Vec<Arc<PositionHandle>>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a position; insertion order is observation order
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &self,
        ticker: Ticker,
        recommendation_id: Uuid,
        prediction_id: Uuid,
        decision_id: Uuid,
        expected_move_pct: f64,
        expected_horizon_hours: f64,
        state: PositionState,
    ) -> Arc<PositionHandle> {
        let handle = Arc::new(PositionHandle {
            id: Uuid::new_v4(),
            ticker,
            recommendation_id,
            prediction_id,
            decision_id,
            expected_move_pct,
            expected_horizon_hours,
            state: AsyncMutex::new(state),
        });
        self.positions.write().unwrap().push(handle.clone());
        handle
    }

    /// Snapshot of handles in insertion order
    pub fn iter_ordered(&self) -> Vec<Arc<PositionHandle>> {
        self.positions.read().unwrap().clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<PositionHandle>> {
        self.positions
            .read()
            .unwrap()
            .iter()
            .find(|h| h.id == id)
            .cloned()
    }

    pub fn find_by_ticker(&self, ticker: &Ticker) -> Option<Arc<PositionHandle>> {
        self.positions
            .read()
            .unwrap()
            .iter()
            .find(|h| &h.ticker == ticker)
            .cloned()
    }

    /// Drop a closed position from the book
    pub fn remove(&self, id: Uuid) {
        self.positions.write().unwrap().retain(|h| h.id != id);
    }

    pub fn len(&self) -> usize {
        self.positions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Daily trading statistics, reset at rollover
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyStats {
    pub trade_count: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    /// Sum of realized per-trade returns as account fractions
    pub realized_pnl_pct: f64,
    pub best_trade_pct: f64,
    pub worst_trade_pct: f64,
}

impl DailyStats {
    pub fn win_rate(&self) -> f64 {
        let closed = self.winning_trades + self.losing_trades;
        if closed == 0 {
            return 0.0;
        }
        self.winning_trades as f64 / closed as f64
    }
}

/// Single-mutex guard over the day's counters
#[derive(Default)]
pub struct DailyCounters {
    stats: Mutex<DailyStats>,
}

impl DailyCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a newly opened trade toward the daily cap
    pub fn record_entry(&self) -> u32 {
        let mut stats = self.stats.lock().unwrap();
        stats.trade_count += 1;
        stats.trade_count
    }

    /// Record a realized exit. `pnl_fraction` is the per-trade return scaled
    /// by the position's account fraction.
    pub fn record_exit(&self, pnl_fraction: f64) {
        let mut stats = self.stats.lock().unwrap();
        if pnl_fraction >= 0.0 {
            stats.winning_trades += 1;
        } else {
            stats.losing_trades += 1;
        }
        stats.realized_pnl_pct += pnl_fraction;
        if pnl_fraction > stats.best_trade_pct {
            stats.best_trade_pct = pnl_fraction;
        }
        if pnl_fraction < stats.worst_trade_pct {
            stats.worst_trade_pct = pnl_fraction;
        }
    }

    pub fn snapshot(&self) -> DailyStats {
        self.stats.lock().unwrap().clone()
    }

    /// Rollover: clear everything
    pub fn reset(&self) -> DailyStats {
        let mut stats = self.stats.lock().unwrap();
        std::mem::take(&mut *stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 14, 30, 0).unwrap()
    }

    pub(crate) fn state(entry: f64, stop: f64, target: f64) -> PositionState {
        PositionState {
            entry_fill: entry,
            shares: 100,
            size_fraction: 0.10,
            initial_stop: stop,
            stop,
            target,
            highest_price: entry,
            lowest_price: entry,
            created_at: now(),
            max_hold_until: now() + Duration::hours(6),
            trailing_enabled: true,
            stop_advanced: false,
            exit_attempts: 0,
            closed: None,
        }
    }

    fn open(book: &PositionBook, symbol: &str) -> Arc<PositionHandle> {
        book.open(
            Ticker::new(symbol).unwrap(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            6.0,
            4.0,
            state(5.0, 4.85, 5.3),
        )
    }

    #[test]
    fn test_book_preserves_insertion_order() {
        let book = PositionBook::new();
        open(&book, "AAA");
        open(&book, "BBB");
        open(&book, "CCC");

        let order: Vec<_> = book
            .iter_ordered()
            .iter()
            .map(|h| h.ticker.as_str().to_string())
            .collect();
        assert_eq!(order, vec!["AAA", "BBB", "CCC"]);
    }

    #[test]
    fn test_remove() {
        let book = PositionBook::new();
        let h = open(&book, "AAA");
        open(&book, "BBB");
        assert_eq!(book.len(), 2);
        book.remove(h.id);
        assert_eq!(book.len(), 1);
        assert!(book.get(h.id).is_none());
    }

    #[test]
    fn test_excursion_tracking() {
        let mut s = state(5.0, 4.85, 5.3);
        s.highest_price = 5.25;
        s.lowest_price = 4.90;
        assert!((s.max_favorable_pct() - 5.0).abs() < 1e-9);
        assert!((s.max_adverse_pct() + 2.0).abs() < 1e-9);
        assert!((s.initial_risk() - 0.15).abs() < 1e-12);
    }

    #[test]
    fn test_daily_counters() {
        let counters = DailyCounters::new();
        assert_eq!(counters.record_entry(), 1);
        assert_eq!(counters.record_entry(), 2);
        counters.record_exit(0.008);
        counters.record_exit(-0.004);

        let stats = counters.snapshot();
        assert_eq!(stats.trade_count, 2);
        assert_eq!(stats.winning_trades, 1);
        assert_eq!(stats.losing_trades, 1);
        assert!((stats.realized_pnl_pct - 0.004).abs() < 1e-12);
        assert!((stats.win_rate() - 0.5).abs() < 1e-12);

        let before_reset = counters.reset();
        assert_eq!(before_reset.trade_count, 2);
        assert_eq!(counters.snapshot().trade_count, 0);
    }
}
