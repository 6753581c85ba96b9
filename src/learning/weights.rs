//! Learned weights and adaptive thresholds
//!
//! Both are copy-on-read: consumers take an immutable snapshot at the start
//! of a phase and never observe a mid-phase update. Only the learning engine
//! installs new versions, and versions only move forward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Rails for per-feature weight multipliers
pub const WEIGHT_MIN: f64 = 0.3;
pub const WEIGHT_MAX: f64 = 2.0;
/// Rails for the scalar confidence multiplier
pub const CONFIDENCE_MULT_MIN: f64 = 0.5;
pub const CONFIDENCE_MULT_MAX: f64 = 1.5;

/// Per-feature multipliers learned from outcomes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedWeights {
    /// feature name -> multiplier in [0.3, 2.0]
    pub weights: HashMap<String, f64>,
    /// scalar multiplier applied to the summed confidence, in [0.5, 1.5]
    pub confidence_multiplier: f64,
    /// Monotonic; only a validated update advances it
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl LearnedWeights {
    /// Identity weights, version 0
    pub fn initial(at: DateTime<Utc>) -> Self {
        Self {
            weights: HashMap::new(),
            confidence_multiplier: 1.0,
            version: 0,
            updated_at: at,
        }
    }

    /// Multiplier for a feature; unknown features are 1.0
    pub fn multiplier(&self, name: &str) -> f64 {
        self.weights.get(name).copied().unwrap_or(1.0)
    }

    /// Set a multiplier, clamped to the rails
    pub fn set_multiplier(&mut self, name: impl Into<String>, value: f64) {
        self.weights
            .insert(name.into(), value.clamp(WEIGHT_MIN, WEIGHT_MAX));
    }

    /// Set the confidence multiplier, clamped to the rails
    pub fn set_confidence_multiplier(&mut self, value: f64) {
        self.confidence_multiplier = value.clamp(CONFIDENCE_MULT_MIN, CONFIDENCE_MULT_MAX);
    }
}

/// Safety rails for adaptive threshold adjustment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRails {
    pub min_confidence_floor: f64,
    pub min_confidence_ceiling: f64,
    pub rsi_oversold_min: f64,
    pub rsi_oversold_max: f64,
    pub rsi_overbought_min: f64,
    pub rsi_overbought_max: f64,
}

impl Default for ThresholdRails {
    fn default() -> Self {
        Self {
            min_confidence_floor: 6.0,
            min_confidence_ceiling: 9.0,
            rsi_oversold_min: 20.0,
            rsi_oversold_max: 35.0,
            rsi_overbought_min: 65.0,
            rsi_overbought_max: 80.0,
        }
    }
}

/// Thresholds the learning engine tunes within fixed safety rails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveThresholds {
    /// Minimum confidence (0-10) to emit a recommendation
    pub min_confidence_score: f64,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub volume_spike_multiplier: f64,
    /// Floor on a recommendation's expected move (fraction)
    pub min_expected_move: f64,
    pub rails: ThresholdRails,
    pub updated_at: DateTime<Utc>,
}

impl AdaptiveThresholds {
    pub fn new(
        min_confidence_score: f64,
        rsi_oversold: f64,
        rsi_overbought: f64,
        volume_spike_multiplier: f64,
        min_expected_move: f64,
        rails: ThresholdRails,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            min_confidence_score,
            rsi_oversold,
            rsi_overbought,
            volume_spike_multiplier,
            min_expected_move,
            rails,
            updated_at: at,
        }
    }

    /// Raise the confidence gate by `delta`, capped at the ceiling
    pub fn raise_min_confidence(&mut self, delta: f64) {
        self.min_confidence_score =
            (self.min_confidence_score + delta).min(self.rails.min_confidence_ceiling);
    }

    /// Lower the confidence gate by `delta`, never below the floor
    pub fn lower_min_confidence(&mut self, delta: f64) {
        self.min_confidence_score =
            (self.min_confidence_score - delta).max(self.rails.min_confidence_floor);
    }

    /// Shift the RSI oversold band, clamped to its rails
    pub fn shift_rsi_oversold(&mut self, delta: f64) {
        self.rsi_oversold = (self.rsi_oversold + delta)
            .clamp(self.rails.rsi_oversold_min, self.rails.rsi_oversold_max);
    }

    /// Shift the RSI overbought band, clamped to its rails
    pub fn shift_rsi_overbought(&mut self, delta: f64) {
        self.rsi_overbought = (self.rsi_overbought + delta).clamp(
            self.rails.rsi_overbought_min,
            self.rails.rsi_overbought_max,
        );
    }
}

/// Shared holder handing out immutable snapshots. The learning engine is the
/// only writer.
pub struct SnapshotHolder {
    weights: RwLock<Arc<LearnedWeights>>,
    thresholds: RwLock<Arc<AdaptiveThresholds>>,
}

impl SnapshotHolder {
    pub fn new(weights: LearnedWeights, thresholds: AdaptiveThresholds) -> Self {
        Self {
            weights: RwLock::new(Arc::new(weights)),
            thresholds: RwLock::new(Arc::new(thresholds)),
        }
    }

    /// Immutable snapshot of the current weights
    pub fn weights(&self) -> Arc<LearnedWeights> {
        self.weights.read().unwrap().clone()
    }

    /// Immutable snapshot of the current thresholds
    pub fn thresholds(&self) -> Arc<AdaptiveThresholds> {
        self.thresholds.read().unwrap().clone()
    }

    /// Install a new weights version. The version must strictly increase.
    pub fn install_weights(&self, new: LearnedWeights) -> Result<()> {
        let mut guard = self.weights.write().unwrap();
        if new.version <= guard.version {
            return Err(Error::Invariant(format!(
                "weights version {} does not advance {}",
                new.version, guard.version
            )));
        }
        *guard = Arc::new(new);
        Ok(())
    }

    /// Install adjusted thresholds
    pub fn install_thresholds(&self, new: AdaptiveThresholds) {
        *self.thresholds.write().unwrap() = Arc::new(new);
    }
}
