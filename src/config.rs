//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub screener: ScreenerConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub sentiment: SentimentConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

/// Market data and port deadline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_endpoint")]
    pub endpoint: String,
    /// Hard deadline for single market data calls (quotes, snapshots)
    #[serde(default = "default_market_data_deadline_ms")]
    pub market_data_deadline_ms: u64,
    /// Hard deadline for bulk historical bar fetches
    #[serde(default = "default_bulk_deadline_ms")]
    pub bulk_deadline_ms: u64,
    /// Hard deadline for broker calls
    #[serde(default = "default_broker_deadline_ms")]
    pub broker_deadline_ms: u64,
    /// Hard deadline for notifier sends
    #[serde(default = "default_notifier_deadline_ms")]
    pub notifier_deadline_ms: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            endpoint: default_data_endpoint(),
            market_data_deadline_ms: default_market_data_deadline_ms(),
            bulk_deadline_ms: default_bulk_deadline_ms(),
            broker_deadline_ms: default_broker_deadline_ms(),
            notifier_deadline_ms: default_notifier_deadline_ms(),
        }
    }
}

/// Watchlist screening configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ScreenerConfig {
    /// Lower bound of the screening price band (inclusive)
    #[serde(default = "default_ticker_price_min")]
    pub ticker_price_min: f64,
    /// Upper bound of the screening price band (inclusive)
    #[serde(default = "default_ticker_price_max")]
    pub ticker_price_max: f64,
    /// Minimum session volume for a candidate
    #[serde(default = "default_min_session_volume")]
    pub min_session_volume: u64,
    /// Cap on the gainers universe pulled per refresh
    #[serde(default = "default_max_universe")]
    pub max_universe: usize,
    /// Minimum momentum score (0-10) to stay on the watchlist
    #[serde(default = "default_min_momentum_score")]
    pub min_momentum_score: f64,
    /// Maximum candidates per sector
    #[serde(default = "default_max_per_sector")]
    pub max_per_sector: usize,
    /// Minimum spacing between per-ticker enrichment calls (ms)
    #[serde(default = "default_enrichment_spacing_ms")]
    pub enrichment_spacing_ms: u64,
    /// Bounded concurrency for enrichment calls
    #[serde(default = "default_enrichment_concurrency")]
    pub enrichment_concurrency: usize,
}

impl Default for ScreenerConfig {
    fn default() -> Self {
        Self {
            ticker_price_min: default_ticker_price_min(),
            ticker_price_max: default_ticker_price_max(),
            min_session_volume: default_min_session_volume(),
            max_universe: default_max_universe(),
            min_momentum_score: default_min_momentum_score(),
            max_per_sector: default_max_per_sector(),
            enrichment_spacing_ms: default_enrichment_spacing_ms(),
            enrichment_concurrency: default_enrichment_concurrency(),
        }
    }
}

/// Trading behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Route broker calls to the sandbox endpoint
    #[serde(default = "default_true")]
    pub paper_trading: bool,
    /// Execute recommendations without confirmation
    #[serde(default)]
    pub auto_trading_enabled: bool,
    /// Ask for confirmation via the notifier before executing
    #[serde(default = "default_true")]
    pub interactive_trading_enabled: bool,
    /// Hard cap on trades per day
    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,
    /// Inclusive start of the trading window within the open session (HH:MM)
    #[serde(default = "default_trading_start_time")]
    pub trading_start_time: String,
    /// Inclusive end of the trading window within the open session (HH:MM)
    #[serde(default = "default_trading_end_time")]
    pub trading_end_time: String,
    /// Minimum acceptable reward/risk ratio
    #[serde(default = "default_rr_threshold")]
    pub rr_threshold: f64,
    /// Floor on recommendation expected move (fraction)
    #[serde(default = "default_min_expected_move")]
    pub min_expected_move: f64,
    /// Base stop-loss distance (fraction of entry)
    #[serde(default = "default_base_stop_pct")]
    pub base_stop_pct: f64,
    /// Base take-profit distance (fraction of entry)
    #[serde(default = "default_base_target_pct")]
    pub base_target_pct: f64,
    /// Recommendation validity window (minutes)
    #[serde(default = "default_validity_minutes")]
    pub validity_minutes: i64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            paper_trading: true,
            auto_trading_enabled: false,
            interactive_trading_enabled: true,
            max_daily_trades: default_max_daily_trades(),
            trading_start_time: default_trading_start_time(),
            trading_end_time: default_trading_end_time(),
            rr_threshold: default_rr_threshold(),
            min_expected_move: default_min_expected_move(),
            base_stop_pct: default_base_stop_pct(),
            base_target_pct: default_base_target_pct(),
            validity_minutes: default_validity_minutes(),
        }
    }
}

/// Position sizing and loss limits
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Base position size as a fraction of account value
    #[serde(default = "default_position_size_percent")]
    pub position_size_percent: f64,
    /// Lower rail on any position fraction
    #[serde(default = "default_min_position_size_percent")]
    pub min_position_size_percent: f64,
    /// Upper rail on any position fraction
    #[serde(default = "default_max_position_size_percent")]
    pub max_position_size_percent: f64,
    /// Aggressive-path cap for candidates priced under $3
    #[serde(default = "default_sub_three_dollar_cap")]
    pub sub_three_dollar_cap: f64,
    /// Realized daily loss (fraction) that halts new entries
    #[serde(default = "default_max_daily_loss_percent")]
    pub max_daily_loss_percent: f64,
    /// Drawdown (fraction) that forces an emergency exit
    #[serde(default = "default_emergency_loss_pct")]
    pub emergency_loss_pct: f64,
    /// Maximum concurrently open positions
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    /// Default maximum hold time for a position (hours)
    #[serde(default = "default_max_hold_hours")]
    pub max_hold_hours: f64,
    /// Advance the stop once profit reaches this multiple of initial risk
    #[serde(default = "default_trailing_activation_r")]
    pub trailing_activation_r: f64,
    /// Stop is advanced to entry plus this multiple of initial risk
    #[serde(default = "default_trailing_lock_r")]
    pub trailing_lock_r: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            position_size_percent: default_position_size_percent(),
            min_position_size_percent: default_min_position_size_percent(),
            max_position_size_percent: default_max_position_size_percent(),
            sub_three_dollar_cap: default_sub_three_dollar_cap(),
            max_daily_loss_percent: default_max_daily_loss_percent(),
            emergency_loss_pct: default_emergency_loss_pct(),
            max_open_positions: default_max_open_positions(),
            max_hold_hours: default_max_hold_hours(),
            trailing_activation_r: default_trailing_activation_r(),
            trailing_lock_r: default_trailing_lock_r(),
        }
    }
}

/// Interactive confirmation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationConfig {
    /// Seconds to wait for a user reply before expiring
    #[serde(default = "default_confirmation_timeout_secs")]
    pub trade_confirmation_timeout_seconds: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            trade_confirmation_timeout_seconds: default_confirmation_timeout_secs(),
        }
    }
}

/// Seed values for the adaptive thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,
    #[serde(default = "default_volume_spike_multiplier")]
    pub volume_spike_multiplier: f64,
    /// Minimum confidence (0-10) to emit a recommendation
    #[serde(default = "default_min_confidence_score")]
    pub min_confidence_score: f64,
    /// Floor below which learning may never lower min_confidence_score
    #[serde(default = "default_min_confidence_floor")]
    pub min_confidence_floor: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            rsi_oversold: default_rsi_oversold(),
            rsi_overbought: default_rsi_overbought(),
            volume_spike_multiplier: default_volume_spike_multiplier(),
            min_confidence_score: default_min_confidence_score(),
            min_confidence_floor: default_min_confidence_floor(),
        }
    }
}

/// Sentiment aggregation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SentimentConfig {
    /// Lookback horizon for sentiment collection (hours)
    #[serde(default = "default_sentiment_hours_back")]
    pub hours_back: i64,
    /// Source-family weight for professional news
    #[serde(default = "default_news_weight")]
    pub news_weight: f64,
    /// Source-family weight for forum posts
    #[serde(default = "default_forum_weight")]
    pub forum_weight: f64,
    /// Source-family weight for general social
    #[serde(default = "default_social_weight")]
    pub social_weight: f64,
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self {
            hours_back: default_sentiment_hours_back(),
            news_weight: default_news_weight(),
            forum_weight: default_forum_weight(),
            social_weight: default_social_weight(),
        }
    }
}

/// Learning engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LearningConfig {
    /// Minimum outcomes before a learning cycle runs
    #[serde(default = "default_min_outcomes")]
    pub min_outcomes: usize,
    /// Minimum samples per pattern for weight adjustment
    #[serde(default = "default_min_pattern_samples")]
    pub min_pattern_samples: usize,
    /// Weight update learning rate
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Fraction of outcomes (oldest) used for training
    #[serde(default = "default_train_fraction")]
    pub train_fraction: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            min_outcomes: default_min_outcomes(),
            min_pattern_samples: default_min_pattern_samples(),
            learning_rate: default_learning_rate(),
            train_fraction: default_train_fraction(),
        }
    }
}

/// Scheduler cadences and task budgets
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Execution monitor cadence during market open (seconds)
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Recommender sweep cadence during market open (seconds)
    #[serde(default = "default_recommender_interval_secs")]
    pub recommender_interval_secs: u64,
    /// Screener refresh cadence during market open (seconds)
    #[serde(default = "default_screener_interval_secs")]
    pub screener_interval_secs: u64,
    /// Incremental learning cadence during market open (seconds)
    #[serde(default = "default_incremental_learning_interval_secs")]
    pub incremental_learning_interval_secs: u64,
    /// Daily time for the full learning cycle, outside hours (HH:MM market time)
    #[serde(default = "default_full_learning_time")]
    pub full_learning_time: String,
    /// Wall-time budget per monitor tick (ms)
    #[serde(default = "default_monitor_budget_ms")]
    pub monitor_budget_ms: u64,
    /// Wall-time budget per recommender sweep (ms)
    #[serde(default = "default_recommender_budget_ms")]
    pub recommender_budget_ms: u64,
    /// Wall-time budget per screener refresh (ms)
    #[serde(default = "default_screener_budget_ms")]
    pub screener_budget_ms: u64,
    /// Wall-time budget per learning cycle (ms)
    #[serde(default = "default_learning_budget_ms")]
    pub learning_budget_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval_secs(),
            recommender_interval_secs: default_recommender_interval_secs(),
            screener_interval_secs: default_screener_interval_secs(),
            incremental_learning_interval_secs: default_incremental_learning_interval_secs(),
            full_learning_time: default_full_learning_time(),
            monitor_budget_ms: default_monitor_budget_ms(),
            recommender_budget_ms: default_recommender_budget_ms(),
            screener_budget_ms: default_screener_budget_ms(),
            learning_budget_ms: default_learning_budget_ms(),
        }
    }
}

/// Journal store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct JournalConfig {
    /// Directory for the per-family append-only logs
    #[serde(default = "default_journal_dir")]
    pub data_dir: String,
    /// Records older than this many days may be pruned
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            data_dir: default_journal_dir(),
            retention_days: default_retention_days(),
        }
    }
}

/// Notifier configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Identical messages within this window are deduplicated (seconds)
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_dedup_window_secs(),
        }
    }
}

// Default value functions
fn default_data_endpoint() -> String {
    std::env::var("MARKET_DATA_ENDPOINT").unwrap_or_else(|_| "https://api.polygon.io".into())
}

fn default_market_data_deadline_ms() -> u64 {
    5000
}

fn default_bulk_deadline_ms() -> u64 {
    30000
}

fn default_broker_deadline_ms() -> u64 {
    10000
}

fn default_notifier_deadline_ms() -> u64 {
    5000
}

fn default_ticker_price_min() -> f64 {
    0.75
}

fn default_ticker_price_max() -> f64 {
    10.0
}

fn default_min_session_volume() -> u64 {
    100_000
}

fn default_max_universe() -> usize {
    100
}

fn default_min_momentum_score() -> f64 {
    5.0
}

fn default_max_per_sector() -> usize {
    3
}

fn default_enrichment_spacing_ms() -> u64 {
    100
}

fn default_enrichment_concurrency() -> usize {
    8
}

fn default_max_daily_trades() -> u32 {
    10
}

fn default_trading_start_time() -> String {
    "09:30".into()
}

fn default_trading_end_time() -> String {
    "15:45".into()
}

fn default_rr_threshold() -> f64 {
    2.0
}

fn default_min_expected_move() -> f64 {
    0.03
}

fn default_base_stop_pct() -> f64 {
    0.03
}

fn default_base_target_pct() -> f64 {
    0.06
}

fn default_validity_minutes() -> i64 {
    30
}

fn default_position_size_percent() -> f64 {
    0.05
}

fn default_min_position_size_percent() -> f64 {
    0.02
}

fn default_max_position_size_percent() -> f64 {
    0.15
}

fn default_sub_three_dollar_cap() -> f64 {
    0.50
}

fn default_max_daily_loss_percent() -> f64 {
    0.15
}

fn default_emergency_loss_pct() -> f64 {
    0.08
}

fn default_max_open_positions() -> usize {
    5
}

fn default_max_hold_hours() -> f64 {
    6.0
}

fn default_trailing_activation_r() -> f64 {
    1.5
}

fn default_trailing_lock_r() -> f64 {
    0.2
}

fn default_confirmation_timeout_secs() -> u64 {
    30
}

fn default_rsi_oversold() -> f64 {
    30.0
}

fn default_rsi_overbought() -> f64 {
    70.0
}

fn default_volume_spike_multiplier() -> f64 {
    1.2
}

fn default_min_confidence_score() -> f64 {
    7.0
}

fn default_min_confidence_floor() -> f64 {
    6.0
}

fn default_sentiment_hours_back() -> i64 {
    24
}

fn default_news_weight() -> f64 {
    1.0
}

fn default_forum_weight() -> f64 {
    0.8
}

fn default_social_weight() -> f64 {
    0.5
}

fn default_min_outcomes() -> usize {
    20
}

fn default_min_pattern_samples() -> usize {
    5
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_train_fraction() -> f64 {
    0.3
}

fn default_monitor_interval_secs() -> u64 {
    30
}

fn default_recommender_interval_secs() -> u64 {
    60
}

fn default_screener_interval_secs() -> u64 {
    300
}

fn default_incremental_learning_interval_secs() -> u64 {
    1800
}

fn default_full_learning_time() -> String {
    "17:30".into()
}

fn default_monitor_budget_ms() -> u64 {
    20_000
}

fn default_recommender_budget_ms() -> u64 {
    45_000
}

fn default_screener_budget_ms() -> u64 {
    120_000
}

fn default_learning_budget_ms() -> u64 {
    120_000
}

fn default_journal_dir() -> String {
    "journal".into()
}

fn default_retention_days() -> i64 {
    90
}

fn default_dedup_window_secs() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix OPENBELL_)
            .add_source(
                config::Environment::with_prefix("OPENBELL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.screener.ticker_price_min <= 0.0 {
            anyhow::bail!("ticker_price_min must be positive");
        }

        if self.screener.ticker_price_max <= self.screener.ticker_price_min {
            anyhow::bail!(
                "ticker_price_max {} must exceed ticker_price_min {}",
                self.screener.ticker_price_max,
                self.screener.ticker_price_min
            );
        }

        if self.trading.rr_threshold <= 0.0 {
            anyhow::bail!("rr_threshold must be positive");
        }

        if self.trading.base_stop_pct <= 0.0 || self.trading.base_stop_pct >= 1.0 {
            anyhow::bail!("base_stop_pct must be in (0, 1)");
        }

        if self.trading.base_target_pct <= self.trading.base_stop_pct {
            anyhow::bail!("base_target_pct must exceed base_stop_pct");
        }

        // Sizing rails: 0 < min <= base <= max <= 0.20
        let r = &self.risk;
        if r.min_position_size_percent <= 0.0
            || r.min_position_size_percent > r.position_size_percent
            || r.position_size_percent > r.max_position_size_percent
            || r.max_position_size_percent > 0.20
        {
            anyhow::bail!(
                "position size rails must satisfy 0 < min <= base <= max <= 0.20, got {}/{}/{}",
                r.min_position_size_percent,
                r.position_size_percent,
                r.max_position_size_percent
            );
        }

        if r.sub_three_dollar_cap > 1.0 || r.sub_three_dollar_cap < r.min_position_size_percent {
            anyhow::bail!(
                "sub_three_dollar_cap {} must lie in [min_position_size_percent, 1.0]",
                r.sub_three_dollar_cap
            );
        }

        if r.max_daily_loss_percent <= 0.0 || r.max_daily_loss_percent >= 1.0 {
            anyhow::bail!("max_daily_loss_percent must be in (0, 1)");
        }

        if self.thresholds.rsi_oversold >= self.thresholds.rsi_overbought {
            anyhow::bail!("rsi_oversold must be below rsi_overbought");
        }

        if self.thresholds.min_confidence_floor > self.thresholds.min_confidence_score {
            anyhow::bail!("min_confidence_floor cannot exceed min_confidence_score");
        }

        if self.learning.train_fraction <= 0.0 || self.learning.train_fraction >= 1.0 {
            anyhow::bail!("train_fraction must be in (0, 1)");
        }

        parse_hhmm(&self.trading.trading_start_time)
            .context("trading_start_time must be HH:MM")?;
        parse_hhmm(&self.trading.trading_end_time).context("trading_end_time must be HH:MM")?;
        parse_hhmm(&self.schedule.full_learning_time)
            .context("full_learning_time must be HH:MM")?;

        Ok(())
    }
}

/// Parse an "HH:MM" string into (hour, minute)
pub fn parse_hhmm(s: &str) -> Result<(u32, u32)> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("missing ':' in {s}"))?;
    let h: u32 = h.parse().context("bad hour")?;
    let m: u32 = m.parse().context("bad minute")?;
    if h > 23 || m > 59 {
        anyhow::bail!("{s} out of range");
    }
    Ok((h, m))
}
