//! Journaled record types
//!
//! Every record carries `id`, `created_at`, and `schema_version`; schema
//! changes are additive only. The journal store owns persistence of all of
//! these.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::clock::SessionBucket;
use crate::market::Ticker;

/// Current record schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Record family, one append-only log each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Predictions,
    Decisions,
    Outcomes,
    Positions,
    AgentLogs,
    SystemHealth,
    LearningCycles,
    Watchlists,
}

impl Family {
    pub fn all() -> [Family; 8] {
        [
            Family::Predictions,
            Family::Decisions,
            Family::Outcomes,
            Family::Positions,
            Family::AgentLogs,
            Family::SystemHealth,
            Family::LearningCycles,
            Family::Watchlists,
        ]
    }

    /// Log file stem for this family
    pub fn file_stem(&self) -> &'static str {
        match self {
            Family::Predictions => "predictions",
            Family::Decisions => "decisions",
            Family::Outcomes => "outcomes",
            Family::Positions => "positions",
            Family::AgentLogs => "agent_logs",
            Family::SystemHealth => "system_health",
            Family::LearningCycles => "learning_cycles",
            Family::Watchlists => "watchlists",
        }
    }

    /// Families whose records must survive retention pruning
    pub fn prunable(&self) -> bool {
        !matches!(self, Family::Outcomes | Family::LearningCycles)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// Envelope persisted to the per-family log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub schema_version: u32,
    pub payload: serde_json::Value,
}

impl JournalRecord {
    pub fn new(id: Uuid, created_at: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            id,
            created_at,
            schema_version: SCHEMA_VERSION,
            payload,
        }
    }
}

/// Final action of a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Buy,
    Skip,
    Hold,
    Sell,
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionAction::Buy => "buy",
            DecisionAction::Skip => "skip",
            DecisionAction::Hold => "hold",
            DecisionAction::Sell => "sell",
        };
        f.write_str(s)
    }
}

/// One step of recorded reasoning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub step: String,
    /// What the step looked at, as free-form scalars
    pub input: HashMap<String, f64>,
    /// Contribution to the confidence sum
    pub confidence_delta: f64,
    pub rationale: String,
}

/// Context captured when a decision opens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionContext {
    pub price: f64,
    pub day_change_pct: f64,
    pub session_volume: u64,
    pub regime: String,
    pub regime_confidence: f64,
    pub sentiment_score: f64,
    pub sentiment_confidence: f64,
    pub session_bucket: SessionBucket,
    pub open_positions: usize,
    pub daily_trades: u32,
    pub daily_pnl_pct: f64,
}

/// A full decision record. Opened before scoring, finalized when the
/// evaluation resolves, and updated in place when the outcome arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: Uuid,
    pub ticker: Ticker,
    pub created_at: DateTime<Utc>,
    pub context: DecisionContext,
    pub reasoning: Vec<ReasoningStep>,
    /// step name -> contribution
    pub confidence_breakdown: HashMap<String, f64>,
    pub risk_factors: Vec<String>,
    pub alternatives_considered: Vec<String>,
    pub action: DecisionAction,
    pub final_confidence: f64,
    /// Reason attached to refusals
    pub skip_reason: Option<String>,
    pub expected_move_pct: Option<f64>,
    pub prediction_id: Option<Uuid>,
    // Filled in by update_outcome when the trade closes
    pub actual_move_pct: Option<f64>,
    pub actual_duration_hours: Option<f64>,
    pub accuracy_score: Option<f64>,
    pub outcome_success: Option<bool>,
}

/// Direction of a prediction; the core is long-only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictedDirection {
    Up,
}

/// A journaled prediction, correlated with an outcome later
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: Uuid,
    pub ticker: Ticker,
    pub direction: PredictedDirection,
    pub predicted_move_pct: f64,
    pub predicted_horizon_hours: f64,
    pub confidence: f64,
    /// Feature snapshot keyed by feature name; indicator contributions,
    /// sentiment, regime and clock bucket flags
    pub features: HashMap<String, f64>,
    /// Dominant setup tag driving the horizon
    pub setup_type: SetupType,
    pub created_at: DateTime<Utc>,
}

/// Dominant setup classification; drives the predicted horizon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupType {
    VwapBounce,
    RsiOversold,
    VolumeSpike,
    Momentum,
}

impl SetupType {
    /// Expected holding horizon for the setup, in hours
    pub fn base_horizon_hours(&self) -> f64 {
        match self {
            SetupType::VwapBounce => 4.0,
            SetupType::RsiOversold => 8.0,
            SetupType::VolumeSpike => 2.0,
            SetupType::Momentum => 6.0,
        }
    }
}

impl fmt::Display for SetupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SetupType::VwapBounce => "vwap_bounce",
            SetupType::RsiOversold => "rsi_oversold",
            SetupType::VolumeSpike => "volume_spike",
            SetupType::Momentum => "momentum",
        };
        f.write_str(s)
    }
}

/// Why a position closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Target,
    Stop,
    TrailingStop,
    Time,
    Emergency,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::Target => "target",
            ExitReason::Stop => "stop",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::Time => "time",
            ExitReason::Emergency => "emergency",
            ExitReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Realized outcome of a closed position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub id: Uuid,
    pub prediction_id: Uuid,
    pub decision_id: Uuid,
    pub ticker: Ticker,
    pub entry_fill: f64,
    pub exit_fill: f64,
    pub realized_move_pct: f64,
    pub realized_duration_hours: f64,
    pub exit_reason: ExitReason,
    /// Maximum favorable excursion while open, percent
    pub max_favorable_pct: f64,
    /// Maximum adverse excursion while open, percent
    pub max_adverse_pct: f64,
    pub accuracy_score: f64,
    pub success: bool,
    pub closed_at: DateTime<Utc>,
}

/// Persisted watchlist refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistRecord {
    pub id: Uuid,
    pub entries: Vec<crate::screener::WatchlistEntry>,
    /// Criteria in force when the list was built
    pub price_min: f64,
    pub price_max: f64,
    pub min_volume: u64,
    pub min_score: f64,
    /// True when this is a carried-over list after an upstream failure
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
}

/// Summary of one learning cycle, committed or not
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningCycleRecord {
    pub id: Uuid,
    pub outcomes_considered: usize,
    pub validation_score: f64,
    pub previous_validation_score: f64,
    pub committed: bool,
    pub weights_version: u64,
    /// Human-readable observations from the cycle
    pub insights: Vec<String>,
    pub created_at: DateTime<Utc>,
}
