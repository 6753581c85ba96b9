//! Scheduler
//!
//! One cooperative dispatcher drives every pipeline phase from a single tick
//! source. Market-open tasks run only when the calendar says the market is
//! open; each task kind has a wall-time budget, and an overrun is canceled
//! and journaled without starving later ticks. Control commands cross in
//! through a queue processed at tick boundaries.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, MarketCalendar, MarketSession};
use crate::config::ScheduleConfig;
use crate::error::Result;
use crate::journal::{Family, JournalStore};

/// The task kinds the dispatcher can fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickKind {
    Monitor,
    RecommenderSweep,
    ScreenerRefresh,
    IncrementalLearning,
    DailyRollover,
    FullLearning,
}

impl TickKind {
    pub fn name(&self) -> &'static str {
        match self {
            TickKind::Monitor => "monitor",
            TickKind::RecommenderSweep => "recommender_sweep",
            TickKind::ScreenerRefresh => "screener_refresh",
            TickKind::IncrementalLearning => "incremental_learning",
            TickKind::DailyRollover => "daily_rollover",
            TickKind::FullLearning => "full_learning",
        }
    }
}

/// Control commands processed at tick boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    PauseTrading,
    ResumeTrading,
    ForceScreen,
    RequestShutdown,
}

/// What the scheduler dispatches into
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn monitor_tick(&self, now: DateTime<Utc>) -> Result<()>;
    async fn recommender_sweep(&self, now: DateTime<Utc>) -> Result<()>;
    async fn screener_refresh(&self, now: DateTime<Utc>) -> Result<()>;
    async fn learning_cycle(&self, now: DateTime<Utc>, full: bool) -> Result<()>;
    async fn daily_rollover(&self, now: DateTime<Utc>) -> Result<()>;
}

/// Read-only status surface
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub paused: bool,
    pub shutting_down: bool,
    pub last_ticks: HashMap<String, DateTime<Utc>>,
    pub tick_count: u64,
    pub session: Option<String>,
}

/// Due-task bookkeeping, separated from the async loop for testability
struct DispatchState {
    last_monitor: Option<DateTime<Utc>>,
    last_recommender: Option<DateTime<Utc>>,
    last_screener: Option<DateTime<Utc>>,
    last_incremental: Option<DateTime<Utc>>,
    rollover_done: Option<NaiveDate>,
    full_learning_done: Option<NaiveDate>,
    /// Set while the market is open; a transition out of open triggers the
    /// rollover
    saw_open_today: Option<NaiveDate>,
}

impl DispatchState {
    fn new() -> Self {
        Self {
            last_monitor: None,
            last_recommender: None,
            last_screener: None,
            last_incremental: None,
            rollover_done: None,
            full_learning_done: None,
            saw_open_today: None,
        }
    }

    fn elapsed(last: Option<DateTime<Utc>>, now: DateTime<Utc>, secs: u64) -> bool {
        match last {
            None => true,
            Some(t) => (now - t).num_seconds() >= secs as i64,
        }
    }
}

/// The scheduler
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    calendar: MarketCalendar,
    config: ScheduleConfig,
    /// Inclusive trading window within the open session, from TradingConfig
    trading_window: ((u32, u32), (u32, u32)),
    full_learning_time: (u32, u32),
    journal: Arc<JournalStore>,
    control_tx: async_channel::Sender<ControlCommand>,
    control_rx: async_channel::Receiver<ControlCommand>,
    status: RwLock<SchedulerStatus>,
}

impl Scheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        calendar: MarketCalendar,
        config: ScheduleConfig,
        trading_window: ((u32, u32), (u32, u32)),
        full_learning_time: (u32, u32),
        journal: Arc<JournalStore>,
    ) -> Self {
        let (control_tx, control_rx) = async_channel::unbounded();
        Self {
            clock,
            calendar,
            config,
            trading_window,
            full_learning_time,
            journal,
            control_tx,
            control_rx,
            status: RwLock::new(SchedulerStatus::default()),
        }
    }

    /// Handle for submitting control commands
    pub fn controls(&self) -> async_channel::Sender<ControlCommand> {
        self.control_tx.clone()
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status.read().unwrap().clone()
    }

    /// Drive the pipeline until shutdown is requested or the token fires.
    /// The current tick always completes before the loop exits.
    pub async fn run(&self, pipeline: Arc<dyn Pipeline>, shutdown: CancellationToken) {
        let mut state = DispatchState::new();
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut clock_warned = false;

        info!("Scheduler running");
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => {
                    info!("Scheduler shutdown via token");
                    break;
                }
            }

            // Control commands first, at the tick boundary
            let mut force_screen = false;
            let mut stop = false;
            while let Ok(command) = self.control_rx.try_recv() {
                match command {
                    ControlCommand::PauseTrading => {
                        info!("Trading paused");
                        self.status.write().unwrap().paused = true;
                    }
                    ControlCommand::ResumeTrading => {
                        info!("Trading resumed");
                        self.status.write().unwrap().paused = false;
                    }
                    ControlCommand::ForceScreen => force_screen = true,
                    ControlCommand::RequestShutdown => stop = true,
                }
            }
            if stop {
                self.status.write().unwrap().shutting_down = true;
                info!("Scheduler shutdown via control command");
                break;
            }

            let now = self.clock.now();
            if !self.calendar.is_sane(now) {
                if !clock_warned {
                    error!("Host clock is invalid ({now}); refusing to trade");
                    clock_warned = true;
                }
                continue;
            }
            clock_warned = false;

            let session = self.calendar.session(now);
            let paused = self.status.read().unwrap().paused;
            {
                let mut status = self.status.write().unwrap();
                status.tick_count += 1;
                status.session = Some(session.to_string());
            }

            for kind in self.due_tasks(&mut state, now, session, paused, force_screen) {
                self.dispatch(&pipeline, kind, now).await;
            }
        }
        info!("Scheduler stopped");
    }

    /// Decide which tasks fire this tick. Market-open tasks require the open
    /// classification; the rollover fires on the transition out of open; the
    /// full learning cycle fires once a day at its configured time outside
    /// hours.
    fn due_tasks(
        &self,
        state: &mut DispatchState,
        now: DateTime<Utc>,
        session: MarketSession,
        paused: bool,
        force_screen: bool,
    ) -> Vec<TickKind> {
        let mut due = Vec::new();
        let local_date = self.calendar.local(now).date_naive();
        let cfg = &self.config;

        if session == MarketSession::Open {
            state.saw_open_today = Some(local_date);

            if DispatchState::elapsed(state.last_monitor, now, cfg.monitor_interval_secs) {
                state.last_monitor = Some(now);
                due.push(TickKind::Monitor);
            }

            let in_window =
                self.calendar
                    .within_window(now, self.trading_window.0, self.trading_window.1);
            if !paused && in_window {
                if force_screen
                    || DispatchState::elapsed(
                        state.last_screener,
                        now,
                        cfg.screener_interval_secs,
                    )
                {
                    state.last_screener = Some(now);
                    due.push(TickKind::ScreenerRefresh);
                }
                if DispatchState::elapsed(
                    state.last_recommender,
                    now,
                    cfg.recommender_interval_secs,
                ) {
                    state.last_recommender = Some(now);
                    due.push(TickKind::RecommenderSweep);
                }
            }

            if DispatchState::elapsed(
                state.last_incremental,
                now,
                cfg.incremental_learning_interval_secs,
            ) {
                state.last_incremental = Some(now);
                due.push(TickKind::IncrementalLearning);
            }
        } else {
            // Transition out of the open session: run the rollover once
            if state.saw_open_today == Some(local_date)
                && state.rollover_done != Some(local_date)
            {
                state.rollover_done = Some(local_date);
                due.push(TickKind::DailyRollover);
            }

            // Full learning at the configured time, outside hours
            let (h, m) = self.full_learning_time;
            let local = self.calendar.local(now);
            let past_time = {
                use chrono::Timelike;
                local.hour() * 60 + local.minute() >= h * 60 + m
            };
            if past_time && state.full_learning_done != Some(local_date) {
                state.full_learning_done = Some(local_date);
                due.push(TickKind::FullLearning);
            }

            if force_screen {
                warn!("force_screen ignored outside market hours");
            }
        }

        due
    }

    /// Run one task under its wall-time budget
    async fn dispatch(&self, pipeline: &Arc<dyn Pipeline>, kind: TickKind, now: DateTime<Utc>) {
        let budget = Duration::from_millis(match kind {
            TickKind::Monitor => self.config.monitor_budget_ms,
            TickKind::RecommenderSweep => self.config.recommender_budget_ms,
            TickKind::ScreenerRefresh => self.config.screener_budget_ms,
            TickKind::IncrementalLearning | TickKind::FullLearning => {
                self.config.learning_budget_ms
            }
            TickKind::DailyRollover => self.config.learning_budget_ms,
        });

        debug!("Dispatching {}", kind.name());
        let work = async {
            match kind {
                TickKind::Monitor => pipeline.monitor_tick(now).await,
                TickKind::RecommenderSweep => pipeline.recommender_sweep(now).await,
                TickKind::ScreenerRefresh => pipeline.screener_refresh(now).await,
                TickKind::IncrementalLearning => pipeline.learning_cycle(now, false).await,
                TickKind::FullLearning => pipeline.learning_cycle(now, true).await,
                TickKind::DailyRollover => pipeline.daily_rollover(now).await,
            }
        };

        let outcome = tokio::time::timeout(budget, work).await;
        match outcome {
            Ok(Ok(())) => {
                self.status
                    .write()
                    .unwrap()
                    .last_ticks
                    .insert(kind.name().to_string(), now);
            }
            Ok(Err(e)) if e.is_fatal() => {
                error!("Fatal error in {}: {}; requesting shutdown", kind.name(), e);
                let _ = self.control_tx.try_send(ControlCommand::RequestShutdown);
            }
            Ok(Err(e)) => {
                warn!("Task {} failed: {}", kind.name(), e);
                self.journal_task_failure(kind, now, &e.to_string()).await;
            }
            Err(_) => {
                warn!(
                    "Task {} overran its {}ms budget and was canceled",
                    kind.name(),
                    budget.as_millis()
                );
                self.journal_task_failure(kind, now, "budget overrun").await;
            }
        }
    }

    async fn journal_task_failure(&self, kind: TickKind, now: DateTime<Utc>, detail: &str) {
        self.journal
            .append(
                Family::SystemHealth,
                Uuid::new_v4(),
                now,
                &serde_json::json!({
                    "event": "task_failure",
                    "task": kind.name(),
                    "detail": detail,
                }),
            )
            .await
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Monday 2025-06-02 at the given ET hour/minute (EDT = UTC-4)
    fn et(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, h + 4, m, 0).unwrap()
    }

    #[derive(Default)]
    struct CountingPipeline {
        monitor: AtomicU32,
        sweeps: AtomicU32,
        screens: AtomicU32,
        learning: AtomicU32,
        full_learning: AtomicU32,
        rollovers: AtomicU32,
        slow_monitor: bool,
    }

    #[async_trait]
    impl Pipeline for CountingPipeline {
        async fn monitor_tick(&self, _now: DateTime<Utc>) -> Result<()> {
            self.monitor.fetch_add(1, Ordering::SeqCst);
            if self.slow_monitor {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(())
        }
        async fn recommender_sweep(&self, _now: DateTime<Utc>) -> Result<()> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn screener_refresh(&self, _now: DateTime<Utc>) -> Result<()> {
            self.screens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn learning_cycle(&self, _now: DateTime<Utc>, full: bool) -> Result<()> {
            if full {
                self.full_learning.fetch_add(1, Ordering::SeqCst);
            } else {
                self.learning.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
        async fn daily_rollover(&self, _now: DateTime<Utc>) -> Result<()> {
            self.rollovers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn scheduler(clock: Arc<ManualClock>) -> (Scheduler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(JournalStore::open(dir.path(), 90).await.unwrap());
        let s = Scheduler::new(
            clock,
            MarketCalendar::new(),
            ScheduleConfig::default(),
            ((9, 30), (15, 45)),
            (17, 30),
            journal,
        );
        (s, dir)
    }

    #[tokio::test]
    async fn test_market_open_tasks_fire_while_open() {
        let clock = Arc::new(ManualClock::new(et(10, 0)));
        let (sched, _dir) = scheduler(clock.clone()).await;
        let pipeline = Arc::new(CountingPipeline::default());
        let mut state = DispatchState::new();

        let due = sched.due_tasks(&mut state, clock.now(), MarketSession::Open, false, false);
        assert!(due.contains(&TickKind::Monitor));
        assert!(due.contains(&TickKind::RecommenderSweep));
        assert!(due.contains(&TickKind::ScreenerRefresh));
        assert!(due.contains(&TickKind::IncrementalLearning));

        // Within the intervals nothing re-fires
        clock.advance(chrono::Duration::seconds(5));
        let due = sched.due_tasks(&mut state, clock.now(), MarketSession::Open, false, false);
        assert!(due.is_empty());

        // After 30s only the monitor is due again
        clock.advance(chrono::Duration::seconds(26));
        let due = sched.due_tasks(&mut state, clock.now(), MarketSession::Open, false, false);
        assert_eq!(due, vec![TickKind::Monitor]);

        drop(pipeline);
    }

    #[tokio::test]
    async fn test_no_market_open_tasks_when_closed() {
        let clock = Arc::new(ManualClock::new(et(6, 0)));
        let (sched, _dir) = scheduler(clock.clone()).await;
        let mut state = DispatchState::new();

        let due = sched.due_tasks(
            &mut state,
            clock.now(),
            MarketSession::PreMarket,
            false,
            false,
        );
        assert!(!due.contains(&TickKind::Monitor));
        assert!(!due.contains(&TickKind::RecommenderSweep));
        assert!(!due.contains(&TickKind::ScreenerRefresh));
    }

    #[tokio::test]
    async fn test_pause_stops_trading_but_not_monitor() {
        let clock = Arc::new(ManualClock::new(et(10, 0)));
        let (sched, _dir) = scheduler(clock.clone()).await;
        let mut state = DispatchState::new();

        let due = sched.due_tasks(&mut state, clock.now(), MarketSession::Open, true, false);
        assert!(due.contains(&TickKind::Monitor));
        assert!(!due.contains(&TickKind::RecommenderSweep));
        assert!(!due.contains(&TickKind::ScreenerRefresh));
    }

    #[tokio::test]
    async fn test_trading_window_gates_sweeps() {
        // 15:50 ET: market open but past trading_end_time 15:45
        let clock = Arc::new(ManualClock::new(et(15, 50)));
        let (sched, _dir) = scheduler(clock.clone()).await;
        let mut state = DispatchState::new();

        let due = sched.due_tasks(&mut state, clock.now(), MarketSession::Open, false, false);
        assert!(due.contains(&TickKind::Monitor));
        assert!(!due.contains(&TickKind::RecommenderSweep));
    }

    #[tokio::test]
    async fn test_rollover_fires_once_after_close() {
        let clock = Arc::new(ManualClock::new(et(15, 0)));
        let (sched, _dir) = scheduler(clock.clone()).await;
        let mut state = DispatchState::new();

        // Seen open during the day
        sched.due_tasks(&mut state, clock.now(), MarketSession::Open, false, false);

        // After the close the rollover fires exactly once
        clock.set(et(16, 30));
        let due = sched.due_tasks(
            &mut state,
            clock.now(),
            MarketSession::AfterHours,
            false,
            false,
        );
        assert!(due.contains(&TickKind::DailyRollover));
        let due = sched.due_tasks(
            &mut state,
            clock.now(),
            MarketSession::AfterHours,
            false,
            false,
        );
        assert!(!due.contains(&TickKind::DailyRollover));
    }

    #[tokio::test]
    async fn test_full_learning_at_configured_time() {
        let clock = Arc::new(ManualClock::new(et(17, 0)));
        let (sched, _dir) = scheduler(clock.clone()).await;
        let mut state = DispatchState::new();

        // Before 17:30 ET nothing fires
        let due = sched.due_tasks(
            &mut state,
            clock.now(),
            MarketSession::AfterHours,
            false,
            false,
        );
        assert!(!due.contains(&TickKind::FullLearning));

        clock.set(et(17, 31));
        let due = sched.due_tasks(
            &mut state,
            clock.now(),
            MarketSession::AfterHours,
            false,
            false,
        );
        assert!(due.contains(&TickKind::FullLearning));

        // Only once per day
        clock.set(et(18, 0));
        let due = sched.due_tasks(
            &mut state,
            clock.now(),
            MarketSession::AfterHours,
            false,
            false,
        );
        assert!(!due.contains(&TickKind::FullLearning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_overrun_is_journaled_and_does_not_starve() {
        let clock = Arc::new(ManualClock::new(et(10, 0)));
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(JournalStore::open(dir.path(), 90).await.unwrap());
        let mut config = ScheduleConfig::default();
        config.monitor_budget_ms = 50;
        let sched = Scheduler::new(
            clock.clone(),
            MarketCalendar::new(),
            config,
            ((9, 30), (15, 45)),
            (17, 30),
            journal.clone(),
        );
        let pipeline = Arc::new(CountingPipeline {
            slow_monitor: true,
            ..Default::default()
        });

        sched
            .dispatch(
                &(pipeline.clone() as Arc<dyn Pipeline>),
                TickKind::Monitor,
                clock.now(),
            )
            .await;

        let health = journal.query(
            Family::SystemHealth,
            &crate::journal::QueryFilter::default(),
            10,
        );
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].payload["detail"], "budget overrun");
        // The monitor started exactly once and was canceled
        assert_eq!(pipeline.monitor.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_command_stops_loop() {
        let clock = Arc::new(ManualClock::new(et(10, 0)));
        let (sched, _dir) = scheduler(clock).await;
        let sched = Arc::new(sched);
        let pipeline = Arc::new(CountingPipeline::default());

        let controls = sched.controls();
        controls.send(ControlCommand::RequestShutdown).await.unwrap();

        let token = CancellationToken::new();
        // Returns promptly because the command is already queued
        tokio::time::timeout(
            Duration::from_secs(5),
            sched.run(pipeline, token),
        )
        .await
        .expect("scheduler should stop on shutdown command");
        assert!(sched.status().shutting_down);
    }
}
