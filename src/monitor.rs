//! Execution monitor
//!
//! Owns the position lifecycle after fill: advances trailing stops, fires
//! exits, and writes the outcome record that feeds the learning engine.
//! Stops never move down, and each position's exit path is serialized
//! through its own mutex so duplicate ticks cannot place a second sell.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RiskConfig;
use crate::error::Result;
use crate::journal::{ExitReason, Family, JournalStore, Outcome};
use crate::market::Ticker;
use crate::ports::broker::BrokerPort;
use crate::ports::market_data::MarketDataPort;
use crate::ports::notifier::NotifierPort;
use crate::position::{DailyCounters, PositionBook, PositionHandle, PositionState};
use crate::recommender::Recommendation;

/// Sell attempts before escalation
const MAX_EXIT_ATTEMPTS: u32 = 3;

/// Snapshot journaled to the positions family on open and close
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct PositionEvent {
    position_id: Uuid,
    ticker: String,
    event: String,
    price: f64,
    shares: u64,
    stop: f64,
    target: f64,
    at: DateTime<Utc>,
}

/// The execution monitor
pub struct ExecutionMonitor {
    market: Arc<dyn MarketDataPort>,
    broker: Arc<dyn BrokerPort>,
    notifier: Arc<dyn NotifierPort>,
    journal: Arc<JournalStore>,
    book: Arc<PositionBook>,
    counters: Arc<DailyCounters>,
    risk: RiskConfig,
}

impl ExecutionMonitor {
    pub fn new(
        market: Arc<dyn MarketDataPort>,
        broker: Arc<dyn BrokerPort>,
        notifier: Arc<dyn NotifierPort>,
        journal: Arc<JournalStore>,
        book: Arc<PositionBook>,
        counters: Arc<DailyCounters>,
        risk: RiskConfig,
    ) -> Self {
        Self {
            market,
            broker,
            notifier,
            journal,
            book,
            counters,
            risk,
        }
    }

    /// Open a position from an executed recommendation. The monitor is the
    /// only component that creates or mutates positions.
    pub async fn open_position(
        &self,
        recommendation: &Recommendation,
        fill_price: f64,
        now: DateTime<Utc>,
    ) -> Result<Arc<PositionHandle>> {
        let state = PositionState {
            entry_fill: fill_price,
            shares: recommendation.shares,
            size_fraction: recommendation.size_fraction,
            initial_stop: recommendation.stop_loss,
            stop: recommendation.stop_loss,
            target: recommendation.take_profit,
            highest_price: fill_price,
            lowest_price: fill_price,
            created_at: now,
            max_hold_until: now
                + Duration::seconds((self.risk.max_hold_hours * 3600.0) as i64),
            trailing_enabled: true,
            stop_advanced: false,
            exit_attempts: 0,
            closed: None,
        };
        let handle = self.book.open(
            recommendation.ticker.clone(),
            recommendation.id,
            recommendation.prediction_id,
            recommendation.decision_id,
            recommendation.expected_move_pct,
            recommendation.expected_duration_hours,
            state,
        );
        self.counters.record_entry();
        self.journal
            .append(
                Family::Positions,
                handle.id,
                now,
                &PositionEvent {
                    position_id: handle.id,
                    ticker: handle.ticker.to_string(),
                    event: "opened".into(),
                    price: fill_price,
                    shares: recommendation.shares,
                    stop: recommendation.stop_loss,
                    target: recommendation.take_profit,
                    at: now,
                },
            )
            .await?;
        info!(
            "Position opened: {} x{} @ {:.2}, stop {:.2}, target {:.2}",
            handle.ticker,
            recommendation.shares,
            fill_price,
            recommendation.stop_loss,
            recommendation.take_profit
        );
        Ok(handle)
    }

    /// One monitor pass over the book, in insertion order
    pub async fn tick(&self, now: DateTime<Utc>) {
        for handle in self.book.iter_ordered() {
            self.check_position(&handle, now).await;
        }
    }

    async fn check_position(&self, handle: &Arc<PositionHandle>, now: DateTime<Utc>) {
        let mut state = handle.state.lock().await;
        if state.closed.is_some() {
            return;
        }

        let quote = match self.market.snapshot(&handle.ticker).await {
            Ok(q) => q,
            Err(e) => {
                // Skip this tick; a stale book is better than acting blind
                warn!("No quote for {} this tick: {}", handle.ticker, e);
                return;
            }
        };
        let price = quote.last;

        if price > state.highest_price {
            state.highest_price = price;
        }
        if price < state.lowest_price {
            state.lowest_price = price;
        }

        self.advance_trailing_stop(handle, &mut state);

        if let Some(reason) = self.exit_reason(&state, price, now) {
            self.exit(handle, &mut state, price, reason, now).await;
        }
    }

    /// Advance the stop once profit reaches the activation multiple of
    /// initial risk; lock in a small profit. The stop never moves down.
    fn advance_trailing_stop(&self, handle: &Arc<PositionHandle>, state: &mut PositionState) {
        if !state.trailing_enabled {
            return;
        }
        let risk_per_share = state.initial_risk();
        if risk_per_share <= 0.0 {
            return;
        }
        let activation =
            state.entry_fill + self.risk.trailing_activation_r * risk_per_share;
        if state.highest_price >= activation {
            let new_stop = state.entry_fill + self.risk.trailing_lock_r * risk_per_share;
            if new_stop > state.stop {
                info!(
                    "Trailing stop advanced for {}: {:.2} -> {:.2}",
                    handle.ticker, state.stop, new_stop
                );
                state.stop = new_stop;
                state.stop_advanced = true;
            }
        }
    }

    /// Exit decision. The emergency drawdown rule preempts everything so a
    /// gap through the stop still reads as an emergency; otherwise target,
    /// stop, and time are checked in order.
    fn exit_reason(
        &self,
        state: &PositionState,
        price: f64,
        now: DateTime<Utc>,
    ) -> Option<ExitReason> {
        if state.unrealized_pct(price) <= -self.risk.emergency_loss_pct {
            return Some(ExitReason::Emergency);
        }
        if price >= state.target {
            return Some(ExitReason::Target);
        }
        if price <= state.stop {
            return Some(if state.stop_advanced {
                ExitReason::TrailingStop
            } else {
                ExitReason::Stop
            });
        }
        if now >= state.max_hold_until {
            return Some(ExitReason::Time);
        }
        None
    }

    async fn exit(
        &self,
        handle: &Arc<PositionHandle>,
        state: &mut PositionState,
        price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) {
        match self.broker.place_sell(&handle.ticker, state.shares).await {
            Ok(ack) => {
                let exit_fill = ack.fill_price.unwrap_or(price);
                state.closed = Some(reason);
                if let Err(e) = self
                    .finalize_exit(handle, state, exit_fill, reason, now)
                    .await
                {
                    error!("Failed to journal exit for {}: {}", handle.ticker, e);
                }
                self.book.remove(handle.id);
            }
            Err(e) => {
                state.exit_attempts += 1;
                if state.exit_attempts >= MAX_EXIT_ATTEMPTS {
                    error!(
                        "Exit escalation for {}: {} sell attempts failed, last error: {}",
                        handle.ticker, state.exit_attempts, e
                    );
                    self.notifier
                        .send(
                            &format!(
                                "MANUAL ACTION NEEDED: cannot close {} ({} attempts): {}",
                                handle.ticker, state.exit_attempts, e
                            ),
                            None,
                        )
                        .await
                        .ok();
                    self.journal
                        .append(
                            Family::SystemHealth,
                            Uuid::new_v4(),
                            now,
                            &serde_json::json!({
                                "event": "exit_escalation",
                                "ticker": handle.ticker.to_string(),
                                "position_id": handle.id,
                                "attempts": state.exit_attempts,
                                "error": e.to_string(),
                            }),
                        )
                        .await
                        .ok();
                } else {
                    warn!(
                        "Sell failed for {} (attempt {}), retrying next tick: {}",
                        handle.ticker, state.exit_attempts, e
                    );
                }
            }
        }
    }

    async fn finalize_exit(
        &self,
        handle: &Arc<PositionHandle>,
        state: &PositionState,
        exit_fill: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let realized_frac = (exit_fill - state.entry_fill) / state.entry_fill;
        let duration_hours = (now - state.created_at).num_seconds() as f64 / 3600.0;
        let accuracy = accuracy_score(
            handle.expected_move_pct,
            realized_frac,
            handle.expected_horizon_hours,
            duration_hours,
        );

        let outcome = Outcome {
            id: Uuid::new_v4(),
            prediction_id: handle.prediction_id,
            decision_id: handle.decision_id,
            ticker: handle.ticker.clone(),
            entry_fill: state.entry_fill,
            exit_fill,
            realized_move_pct: realized_frac * 100.0,
            realized_duration_hours: duration_hours,
            exit_reason: reason,
            max_favorable_pct: state.max_favorable_pct(),
            max_adverse_pct: state.max_adverse_pct(),
            accuracy_score: accuracy,
            success: realized_frac > 0.0,
            closed_at: now,
        };
        self.journal
            .append(Family::Outcomes, outcome.id, now, &outcome)
            .await?;
        if let Err(e) = self.journal.update_outcome(handle.decision_id, &outcome).await {
            // The decision may have been pruned; the outcome still stands
            warn!("Could not augment decision {}: {}", handle.decision_id, e);
        }
        self.journal
            .append(
                Family::Positions,
                Uuid::new_v4(),
                now,
                &PositionEvent {
                    position_id: handle.id,
                    ticker: handle.ticker.to_string(),
                    event: format!("closed_{reason}"),
                    price: exit_fill,
                    shares: state.shares,
                    stop: state.stop,
                    target: state.target,
                    at: now,
                },
            )
            .await?;

        self.counters.record_exit(realized_frac * state.size_fraction);

        info!(
            "Position closed: {} @ {:.2} ({}), move {:+.2}% over {:.1}h",
            handle.ticker,
            exit_fill,
            reason,
            realized_frac * 100.0,
            duration_hours
        );
        self.notifier
            .send(
                &format!(
                    "Closed {} @ {:.2} ({}): {:+.2}%",
                    handle.ticker,
                    exit_fill,
                    reason,
                    realized_frac * 100.0
                ),
                None,
            )
            .await
            .ok();
        Ok(())
    }

    /// Close a position out-of-band. Goes through the same serialized exit
    /// path as the automatic rules.
    pub async fn manual_exit(&self, ticker: &Ticker, now: DateTime<Utc>) -> bool {
        let Some(handle) = self.book.find_by_ticker(ticker) else {
            debug!("Manual exit requested for {} with no open position", ticker);
            return false;
        };
        let mut state = handle.state.lock().await;
        if state.closed.is_some() {
            return false;
        }
        let price = match self.market.snapshot(ticker).await {
            Ok(q) => q.last,
            Err(_) => state.entry_fill,
        };
        self.exit(&handle, &mut state, price, ExitReason::Manual, now)
            .await;
        state.closed.is_some()
    }
}

/// Accuracy of a closed prediction/outcome pair: direction 0.5, magnitude
/// closeness 0.3, timing closeness 0.2.
pub fn accuracy_score(
    expected_move: f64,
    actual_move: f64,
    expected_hours: f64,
    actual_hours: f64,
) -> f64 {
    let mut score = 0.0;
    // Long-only: predicted direction is up
    if actual_move > 0.0 {
        score += 0.5;
    }
    if expected_move.abs() > 0.0 {
        let magnitude = (1.0 - (expected_move - actual_move).abs() / expected_move.abs()).max(0.0);
        score += magnitude * 0.3;
    }
    if expected_hours > 0.0 {
        let timing = (1.0 - (expected_hours - actual_hours).abs() / expected_hours).max(0.0);
        score += timing * 0.2;
    }
    score
}
