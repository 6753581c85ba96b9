//! Application wiring
//!
//! One explicit object constructed at startup owns the clock, ports,
//! journal, snapshot holder, and every component; tasks borrow it by
//! reference. There are no module-level globals anywhere in the crate.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, MarketCalendar, SystemClock};
use crate::config::Config;
use crate::confirm::{ConfirmationBroker, ConfirmationMode, ConfirmationOutcome};
use crate::error::Result;
use crate::indicators::relative_strength::{etf_for_sector, MARKET_ETF};
use crate::journal::{Family, JournalStore};
use crate::learning::{AdaptiveThresholds, LearnedWeights, LearningEngine, SnapshotHolder};
use crate::learning::weights::ThresholdRails;
use crate::market::{closes, Interval, Ticker};
use crate::monitor::ExecutionMonitor;
use crate::ports::market_data::ensure_fresh;
use crate::ports::notifier::Reply;
use crate::ports::{
    BrokerPort, ChannelNotifier, MarketDataPort, NotifierPort, PaperBroker, StaticMarketData,
};
use crate::position::{DailyCounters, PositionBook};
use crate::recommender::{Evaluation, EvaluationInputs, PortfolioContext, Recommender};
use crate::regime::RegimeDetector;
use crate::scheduler::Pipeline;
use crate::screener::Screener;
use crate::sentiment::{SentimentAggregator, SentimentFeed};

/// Bars fetched per evaluation window
const EVALUATION_LOOKBACK_HOURS: i64 = 48;

/// The application object
pub struct Application {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub calendar: MarketCalendar,
    pub market: Arc<dyn MarketDataPort>,
    pub broker: Arc<dyn BrokerPort>,
    pub notifier: Arc<dyn NotifierPort>,
    pub journal: Arc<JournalStore>,
    pub holder: Arc<SnapshotHolder>,
    pub screener: Screener,
    pub recommender: Recommender,
    pub confirm: Arc<ConfirmationBroker>,
    pub monitor: ExecutionMonitor,
    pub learning: LearningEngine,
    pub sentiment: SentimentAggregator,
    pub book: Arc<PositionBook>,
    pub counters: Arc<DailyCounters>,
    regime_detector: RegimeDetector,
}

/// Read-only status surface
#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub open_positions: usize,
    pub pending_confirmations: usize,
    pub watchlist_size: usize,
    pub watchlist_degraded: bool,
    pub daily_trades: u32,
    pub daily_pnl_pct: f64,
    pub weights_version: u64,
}

impl Application {
    /// Construct from injected ports. The journal must already be open.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        market: Arc<dyn MarketDataPort>,
        broker: Arc<dyn BrokerPort>,
        notifier: Arc<dyn NotifierPort>,
        journal: Arc<JournalStore>,
        feeds: Vec<Arc<dyn SentimentFeed>>,
    ) -> Self {
        let now = clock.now();
        let rails = ThresholdRails {
            min_confidence_floor: config.thresholds.min_confidence_floor,
            ..ThresholdRails::default()
        };
        let holder = Arc::new(SnapshotHolder::new(
            LearnedWeights::initial(now),
            AdaptiveThresholds::new(
                config.thresholds.min_confidence_score,
                config.thresholds.rsi_oversold,
                config.thresholds.rsi_overbought,
                config.thresholds.volume_spike_multiplier,
                config.trading.min_expected_move,
                rails,
                now,
            ),
        ));

        let book = Arc::new(PositionBook::new());
        let counters = Arc::new(DailyCounters::new());

        let screener = Screener::new(market.clone(), journal.clone(), config.screener.clone());
        let recommender = Recommender::new(
            config.trading.clone(),
            config.risk.clone(),
            journal.clone(),
        );
        let confirm = Arc::new(ConfirmationBroker::new(
            broker.clone(),
            notifier.clone(),
            journal.clone(),
            clock.clone(),
            config.confirmation.clone(),
        ));
        let monitor = ExecutionMonitor::new(
            market.clone(),
            broker.clone(),
            notifier.clone(),
            journal.clone(),
            book.clone(),
            counters.clone(),
            config.risk.clone(),
        );
        let learning = LearningEngine::new(journal.clone(), holder.clone(), config.learning.clone());
        let sentiment = SentimentAggregator::new(feeds, config.sentiment.clone());

        Self {
            config,
            clock,
            calendar: MarketCalendar::new(),
            market,
            broker,
            notifier,
            journal,
            holder,
            screener,
            recommender,
            confirm,
            monitor,
            learning,
            sentiment,
            book,
            counters,
            regime_detector: RegimeDetector::new(),
        }
    }

    /// Paper-trading construction: scripted market data, sandbox broker,
    /// channel notifier with the reply pump already wired to the
    /// confirmation broker.
    pub async fn paper(
        config: Config,
        feeds: Vec<Arc<dyn SentimentFeed>>,
    ) -> Result<(Arc<Self>, Arc<StaticMarketData>, Arc<PaperBroker>)> {
        let journal = Arc::new(
            JournalStore::open(&config.journal.data_dir, config.journal.retention_days).await?,
        );
        let market = Arc::new(StaticMarketData::new());
        let broker = Arc::new(PaperBroker::new(100_000.0));
        let (notifier, mut outbound_rx, reply_rx) = ChannelNotifier::new(
            std::time::Duration::from_secs(config.notifier.dedup_window_secs),
        );
        // Paper mode surfaces outbound messages in the log
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                info!("[notify] {}", message.text);
            }
        });

        let app = Arc::new(Self::new(
            config,
            Arc::new(SystemClock),
            market.clone(),
            broker.clone(),
            Arc::new(notifier),
            journal,
            feeds,
        ));
        app.spawn_reply_pump(reply_rx);
        Ok((app, market, broker))
    }

    /// Forward inbound notifier replies to the confirmation broker
    pub fn spawn_reply_pump(&self, mut reply_rx: tokio::sync::mpsc::UnboundedReceiver<Reply>) {
        let confirm = self.confirm.clone();
        tokio::spawn(async move {
            while let Some(reply) = reply_rx.recv().await {
                confirm.handle_reply(reply);
            }
            debug!("Reply pump stopped");
        });
    }

    pub fn status(&self) -> AppStatus {
        let watchlist = self.screener.current();
        let stats = self.counters.snapshot();
        AppStatus {
            open_positions: self.book.len(),
            pending_confirmations: self.confirm.pending_count(),
            watchlist_size: watchlist.as_ref().map(|w| w.entries.len()).unwrap_or(0),
            watchlist_degraded: self.screener.is_degraded(),
            daily_trades: stats.trade_count,
            daily_pnl_pct: stats.realized_pnl_pct,
            weights_version: self.holder.weights().version,
        }
    }

    /// Evaluate every watchlist candidate and route any recommendation
    /// through the confirmation broker.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<()> {
        let Some(watchlist) = self.screener.current() else {
            debug!("No watchlist yet; sweep skipped");
            return Ok(());
        };

        let account = match crate::ports::with_deadline(
            self.config.data.broker_deadline_ms,
            self.broker.get_account(),
        )
        .await
        {
            Ok(a) => a,
            Err(e) => {
                warn!("Account unavailable, sweep skipped: {}", e);
                return Ok(());
            }
        };
        if account.blocked {
            warn!("Account blocked; sweep skipped");
            return Ok(());
        }

        let stats = self.counters.snapshot();
        let portfolio = PortfolioContext {
            open_positions: self.book.len(),
            daily_trades: stats.trade_count,
            daily_pnl_pct: stats.realized_pnl_pct,
            account_value: account.portfolio_value,
            recent_win_rate: self.learning.recent_win_rate(),
        };

        // Copy-on-read snapshots for the whole sweep
        let weights = self.holder.weights();
        let thresholds = self.holder.thresholds();
        let session = self.calendar.session(now);
        let mode = ConfirmationMode::from_config(&self.config.trading);

        for entry in &watchlist.entries {
            if self.book.find_by_ticker(&entry.ticker).is_some() {
                continue;
            }

            let evaluation = self
                .evaluate_candidate(&entry.ticker, &portfolio, &weights, &thresholds, session, now)
                .await;
            let evaluation = match evaluation {
                Ok(e) => e,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!("Evaluation failed for {}: {}", entry.ticker, e);
                    continue;
                }
            };

            match evaluation {
                Evaluation::Skip { reason, .. } => {
                    debug!("{} skipped: {}", entry.ticker, reason);
                }
                Evaluation::Recommend(rec) => {
                    let outcome = self.confirm.submit(&rec, mode, now).await?;
                    match outcome {
                        ConfirmationOutcome::Executed { fill_price, .. } => {
                            self.monitor.open_position(&rec, fill_price, now).await?;
                        }
                        ConfirmationOutcome::Rejected { reason } => {
                            info!("Recommendation for {} rejected: {}", rec.ticker, reason);
                        }
                        ConfirmationOutcome::Expired => {
                            info!("Recommendation for {} expired unconfirmed", rec.ticker);
                            self.notifier
                                .send(
                                    &format!(
                                        "Recommendation for {} expired without confirmation",
                                        rec.ticker
                                    ),
                                    None,
                                )
                                .await
                                .ok();
                        }
                    }
                }
            }
        }

        self.confirm.cleanup_expired(now);
        Ok(())
    }

    /// Fetch everything a single evaluation needs, then score it
    async fn evaluate_candidate(
        &self,
        ticker: &Ticker,
        portfolio: &PortfolioContext,
        weights: &LearnedWeights,
        thresholds: &AdaptiveThresholds,
        session: crate::clock::MarketSession,
        now: DateTime<Utc>,
    ) -> Result<Evaluation> {
        let quote = self.market.snapshot(ticker).await?;
        ensure_fresh(&quote, now, session)?;

        let from = now - Duration::hours(EVALUATION_LOOKBACK_HOURS);
        let bars = self
            .market
            .bars(ticker, Interval::FiveMinutes, from, now)
            .await?;

        // Reference series are best-effort; their absence degrades the
        // sector signal to neutral
        let sector_label = self.market.sector(ticker).await.unwrap_or_default();
        let sector_ref = self
            .reference_closes(etf_for_sector(&sector_label), from, now)
            .await;
        let market_ref = self.reference_closes(MARKET_ETF, from, now).await;

        let regime = self.regime_detector.classify(&bars);
        let sentiment = self.sentiment.analyze(ticker, now).await;
        let session_bucket = self.calendar.session_bucket(now);

        let inputs = EvaluationInputs {
            ticker,
            quote: &quote,
            bars: &bars,
            sector_ref: sector_ref.as_deref(),
            market_ref: market_ref.as_deref(),
            sentiment: &sentiment,
            regime: &regime,
            portfolio,
            session_bucket,
        };
        self.recommender
            .evaluate(&inputs, weights, thresholds, now)
            .await
    }

    async fn reference_closes(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Option<Vec<f64>> {
        let ticker = Ticker::new(symbol).ok()?;
        match self
            .market
            .bars(&ticker, Interval::FiveMinutes, from, to)
            .await
        {
            Ok(bars) if !bars.is_empty() => Some(closes(&bars)),
            _ => None,
        }
    }

    /// Daily rollover: reset counters, persist the day summary, send the
    /// digest.
    async fn rollover(&self, now: DateTime<Utc>) -> Result<()> {
        let stats = self.counters.reset();
        self.journal
            .append(
                Family::SystemHealth,
                Uuid::new_v4(),
                now,
                &serde_json::json!({
                    "event": "daily_rollover",
                    "trades": stats.trade_count,
                    "win_rate": stats.win_rate(),
                    "realized_pnl_pct": stats.realized_pnl_pct,
                    "best_trade_pct": stats.best_trade_pct,
                    "worst_trade_pct": stats.worst_trade_pct,
                }),
            )
            .await?;

        let digest = format!(
            "Daily digest: {} trades, win rate {:.0}%, P&L {:+.2}% (best {:+.2}%, worst {:+.2}%). {} positions still open.",
            stats.trade_count,
            stats.win_rate() * 100.0,
            stats.realized_pnl_pct * 100.0,
            stats.best_trade_pct * 100.0,
            stats.worst_trade_pct * 100.0,
            self.book.len(),
        );
        self.notifier.send(&digest, None).await.ok();
        info!("Daily rollover complete: {} trades", stats.trade_count);
        Ok(())
    }
}

#[async_trait]
impl Pipeline for Application {
    async fn monitor_tick(&self, now: DateTime<Utc>) -> Result<()> {
        self.monitor.tick(now).await;
        Ok(())
    }

    async fn recommender_sweep(&self, now: DateTime<Utc>) -> Result<()> {
        self.sweep(now).await
    }

    async fn screener_refresh(&self, now: DateTime<Utc>) -> Result<()> {
        self.screener.refresh(now).await.map(|_| ())
    }

    async fn learning_cycle(&self, now: DateTime<Utc>, full: bool) -> Result<()> {
        let result = self.learning.run_cycle(now).await?;
        if let Some(record) = &result {
            debug!(
                "Learning cycle: committed={} validation={:.3}",
                record.committed, record.validation_score
            );
        }
        if full {
            let pruned = self.journal.prune(now).await?;
            if pruned > 0 {
                info!("Journal retention pruned {} records", pruned);
            }
        }
        Ok(())
    }

    async fn daily_rollover(&self, now: DateTime<Utc>) -> Result<()> {
        self.rollover(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{ExitReason, Outcome, QueryFilter};
    use crate::market::{Bar, Quote};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        // Monday 2025-06-02 11:00 ET (15:00 UTC): market open
        Utc.with_ymd_and_hms(2025, 6, 2, 15, 0, 0).unwrap()
    }

    fn quote(symbol: &str, last: f64, volume: u64) -> Quote {
        Quote {
            ticker: Ticker::new(symbol).unwrap(),
            timestamp: now(),
            last,
            bid: last - 0.01,
            ask: last + 0.01,
            session_volume: volume,
            day_open: last * 0.93,
            day_high: last * 1.01,
            day_low: last * 0.92,
            prev_close: last * 0.93,
        }
    }

    /// A strongly bullish five-minute tape ending at `last`
    fn bullish_bars(symbol: &str, last: f64) -> Vec<Bar> {
        let ticker = Ticker::new(symbol).unwrap();
        let start = now() - Duration::hours(10);
        let base = last / 1.25;
        let mut closes_v: Vec<f64> = (0..80)
            .map(|i| base * (1.0 + if i % 2 == 0 { 0.002 } else { -0.001 }))
            .collect();
        for i in 0..20 {
            closes_v.push(base * (1.02 + 0.0115 * i as f64));
        }
        closes_v
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open = if i == 0 { close } else { closes_v[i - 1] };
                let volume = if i >= 80 {
                    100_000 + 10_000 * (i as u64 - 80)
                } else {
                    50_000
                };
                Bar::new(
                    ticker.clone(),
                    Interval::FiveMinutes,
                    start + Duration::minutes(5 * i as i64),
                    open,
                    open.max(close) * 1.003,
                    open.min(close) * 0.997,
                    close,
                    volume,
                )
                .unwrap()
            })
            .collect()
    }

    async fn paper_app(
        auto: bool,
    ) -> (
        Arc<Application>,
        Arc<StaticMarketData>,
        Arc<PaperBroker>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.journal.data_dir = dir.path().join("journal").to_string_lossy().into_owned();
        config.trading.auto_trading_enabled = auto;
        config.screener.enrichment_spacing_ms = 0;

        // A scripted bullish news tape backs every candidate
        let feed = Arc::new(crate::sentiment::StaticSentimentFeed::new(
            crate::sentiment::SentimentSource::News,
        ));
        for age in [1, 3] {
            feed.push(crate::sentiment::SentimentDataPoint {
                text: "upgrade on record volume".into(),
                raw_score: 0.6,
                confidence: 0.8,
                source: crate::sentiment::SentimentSource::News,
                timestamp: now() - Duration::hours(age),
                author_credibility: 2.0,
                engagement: 2.0,
            });
        }

        let feeds: Vec<Arc<dyn SentimentFeed>> = vec![feed];
        let (app, market, broker) = Application::paper(config, feeds).await.unwrap();
        (app, market, broker, dir)
    }

    /// Script one strong candidate end to end
    async fn script_candidate(market: &StaticMarketData, broker: &PaperBroker, symbol: &str) {
        let bars = bullish_bars(symbol, 6.25);
        let last = bars.last().unwrap().close;
        let ticker = Ticker::new(symbol).unwrap();
        market.set_gainers(vec![quote(symbol, last, 2_000_000)]);
        market.set_quote(quote(symbol, last, 2_000_000));
        market.set_sector(ticker.clone(), "technology");
        market.set_bars(ticker.clone(), Interval::FiveMinutes, bars);
        broker.set_price(&ticker, last);
    }

    #[tokio::test]
    async fn test_auto_pipeline_screens_recommends_executes_and_exits() {
        let (app, market, broker, _dir) = paper_app(true).await;
        script_candidate(&market, &broker, "GEVO").await;

        // A tuned weight snapshot, as a system with learning history runs
        let mut weights = LearnedWeights::initial(now());
        weights.version = 1;
        for key in ["momentum_divergence", "vpt", "order_flow", "sentiment"] {
            weights.set_multiplier(key, 2.0);
        }
        weights.set_confidence_multiplier(1.5);
        app.holder.install_weights(weights).unwrap();

        // Screen, then sweep: with auto trading a position should open
        app.screener_refresh(now()).await.unwrap();
        assert_eq!(app.status().watchlist_size, 1);

        app.recommender_sweep(now()).await.unwrap();
        // The sweep either opened a position or documented a refusal; with
        // this tape the composite clears the gate
        if app.book.is_empty() {
            let decisions = app
                .journal
                .query(Family::Decisions, &QueryFilter::default(), 5);
            panic!(
                "expected an open position, decisions: {:?}",
                decisions
                    .iter()
                    .map(|d| d.payload["skip_reason"].clone())
                    .collect::<Vec<_>>()
            );
        }
        assert_eq!(app.status().open_positions, 1);
        assert_eq!(app.status().daily_trades, 1);

        // A second sweep does not double-enter the same ticker
        app.recommender_sweep(now()).await.unwrap();
        assert_eq!(app.status().open_positions, 1);

        // Price reaches the target; the monitor closes and journals
        let handle = app.book.iter_ordered()[0].clone();
        let target = handle.state.lock().await.target;
        let ticker = Ticker::new("GEVO").unwrap();
        market.set_quote(quote("GEVO", target + 0.01, 2_500_000));
        broker.set_price(&ticker, target + 0.01);

        app.monitor_tick(now() + Duration::minutes(40)).await.unwrap();
        assert_eq!(app.status().open_positions, 0);

        let outcomes: Vec<Outcome> =
            app.journal
                .query_as(Family::Outcomes, &QueryFilter::default(), 1);
        assert_eq!(outcomes[0].exit_reason, ExitReason::Target);
        assert!(outcomes[0].success);

        // Rollover resets the day and journals a summary
        app.daily_rollover(now() + Duration::hours(6)).await.unwrap();
        assert_eq!(app.status().daily_trades, 0);
    }

    #[tokio::test]
    async fn test_sweep_without_watchlist_is_noop() {
        let (app, _market, _broker, _dir) = paper_app(true).await;
        app.recommender_sweep(now()).await.unwrap();
        assert_eq!(app.status().open_positions, 0);
    }

    #[tokio::test]
    async fn test_stale_quote_refuses_candidate() {
        let (app, market, broker, _dir) = paper_app(true).await;
        script_candidate(&market, &broker, "GEVO").await;
        app.screener_refresh(now()).await.unwrap();

        // Make the quote 10 minutes old: stale during market open
        let mut stale = quote("GEVO", 6.25, 2_000_000);
        stale.timestamp = now() - Duration::minutes(10);
        market.set_quote(stale);

        app.recommender_sweep(now()).await.unwrap();
        assert_eq!(app.status().open_positions, 0);
    }

    #[tokio::test]
    async fn test_learning_cycle_noop_without_history() {
        let (app, _market, _broker, _dir) = paper_app(true).await;
        app.learning_cycle(now(), false).await.unwrap();
        assert_eq!(app.status().weights_version, 0);
    }
}
