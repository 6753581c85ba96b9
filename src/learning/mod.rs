//! Adaptive learning engine
//!
//! Correlates predictions with outcomes and retunes feature weights, the
//! confidence multiplier, and the adaptive thresholds. Every proposed weight
//! set must beat the previously committed validation score on the newer 70%
//! of the history or it is discarded; the attempt is journaled either way.

pub mod metrics;
pub mod weights;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LearningConfig;
use crate::error::Result;
use crate::journal::{Family, JournalStore, LearningCycleRecord, Outcome, Prediction, QueryFilter};
use crate::recommender::BASE_CONFIDENCE;

pub use metrics::{compute as compute_metrics, PerformanceMetrics, Sample};
pub use weights::{AdaptiveThresholds, LearnedWeights, SnapshotHolder};

/// Feature keys eligible for weight adjustment
const WEIGHTED_FEATURES: &[&str] = &[
    "rsi_zscore",
    "momentum_divergence",
    "vpt",
    "order_flow",
    "sector_rs",
    "adaptive_bb",
    "sentiment",
];

/// Per-pattern statistics over the training partition
#[derive(Debug, Clone)]
pub struct PatternStats {
    pub samples: usize,
    pub win_rate: f64,
    pub mean_return: f64,
    pub mean_accuracy: f64,
}

impl PatternStats {
    /// Performance score folded into the weight delta, clamped to
    /// [-0.5, 0.5]
    pub fn performance_score(&self) -> f64 {
        ((self.win_rate - 0.5) + self.mean_return * 2.0).clamp(-0.5, 0.5)
    }
}

/// The learning engine. Exclusive writer of LearnedWeights and
/// AdaptiveThresholds.
pub struct LearningEngine {
    journal: Arc<JournalStore>,
    holder: Arc<SnapshotHolder>,
    config: LearningConfig,
    /// Validation score of the last committed weight set
    committed_score: RwLock<f64>,
}

impl LearningEngine {
    /// Build the engine, restoring the last committed validation score from
    /// the journal.
    pub fn new(
        journal: Arc<JournalStore>,
        holder: Arc<SnapshotHolder>,
        config: LearningConfig,
    ) -> Self {
        let committed = journal
            .query_as::<LearningCycleRecord>(Family::LearningCycles, &QueryFilter::default(), 50)
            .into_iter()
            .find(|r| r.committed)
            .map(|r| r.validation_score)
            .unwrap_or(0.0);
        if committed > 0.0 {
            debug!("Restored committed validation score {:.3}", committed);
        }
        Self {
            journal,
            holder,
            config,
            committed_score: RwLock::new(committed),
        }
    }

    /// Recent realized win rate for the position sizer, when enough closed
    /// trades exist
    pub fn recent_win_rate(&self) -> Option<f64> {
        let outcomes: Vec<Outcome> = self.journal.query_as(
            Family::Outcomes,
            &QueryFilter::default(),
            self.config.min_outcomes,
        );
        if outcomes.len() < self.config.min_outcomes {
            return None;
        }
        let wins = outcomes.iter().filter(|o| o.success).count();
        Some(wins as f64 / outcomes.len() as f64)
    }

    /// Run one learning cycle. Returns `None` when there is not yet enough
    /// history to learn from.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<Option<LearningCycleRecord>> {
        let samples = self.load_samples();
        if samples.len() < self.config.min_outcomes {
            debug!(
                "Learning deferred: {} outcomes < {} required",
                samples.len(),
                self.config.min_outcomes
            );
            return Ok(None);
        }

        // Chronological split: the oldest slice trains, the newer partition
        // validates.
        let (train, validation) = split_chronological(&samples, self.config.train_fraction);

        let full_metrics = compute_metrics(&samples);
        info!(
            "Learning cycle over {} outcomes: win rate {:.0}%, accuracy {:.2}, calibration {:.2}",
            full_metrics.sample_count,
            full_metrics.win_rate * 100.0,
            full_metrics.mean_accuracy,
            full_metrics.confidence_calibration
        );

        // Propose candidate weights from training-partition pattern stats
        let current = self.holder.weights();
        let pattern_stats = pattern_statistics(train, self.config.min_pattern_samples);
        let mut candidate = (*current).clone();
        for (feature, stats) in &pattern_stats {
            let old = current.multiplier(feature);
            let new = old * (1.0 + self.config.learning_rate * stats.performance_score());
            candidate.set_multiplier(feature.clone(), new);
        }

        // Calibration nudges the confidence multiplier
        if full_metrics.confidence_calibration < 0.7 {
            candidate.set_confidence_multiplier(candidate.confidence_multiplier * 0.95);
        } else if full_metrics.confidence_calibration > 0.9 {
            candidate.set_confidence_multiplier(candidate.confidence_multiplier * 1.02);
        }

        // Validation gate: re-score the newer partition under the candidate
        let thresholds = self.holder.thresholds();
        let validation_score = validation_score(
            validation,
            &current,
            &candidate,
            thresholds.min_confidence_score,
        );
        let previous = *self.committed_score.read().unwrap();
        let committed = validation_score > previous;

        let mut insights = build_insights(&full_metrics, &pattern_stats);

        let weights_version = if committed {
            candidate.version = current.version + 1;
            candidate.updated_at = now;
            let version = candidate.version;
            self.holder.install_weights(candidate)?;
            *self.committed_score.write().unwrap() = validation_score;
            insights.push(format!(
                "weights v{} committed (validation {:.3} > {:.3})",
                version, validation_score, previous
            ));

            // Thresholds adjust only alongside a committed update
            self.adjust_thresholds(&full_metrics, &pattern_stats, now);
            version
        } else {
            insights.push(format!(
                "weights discarded (validation {:.3} <= {:.3})",
                validation_score, previous
            ));
            warn!(
                "Learning cycle discarded candidate weights: {:.3} <= {:.3}",
                validation_score, previous
            );
            current.version
        };

        let record = LearningCycleRecord {
            id: Uuid::new_v4(),
            outcomes_considered: samples.len(),
            validation_score,
            previous_validation_score: previous,
            committed,
            weights_version,
            insights,
            created_at: now,
        };
        self.journal
            .append(Family::LearningCycles, record.id, now, &record)
            .await?;
        Ok(Some(record))
    }

    /// Threshold adjustment within the safety rails
    fn adjust_thresholds(
        &self,
        metrics: &PerformanceMetrics,
        pattern_stats: &HashMap<String, PatternStats>,
        now: DateTime<Utc>,
    ) {
        let mut thresholds = (*self.holder.thresholds()).clone();

        if metrics.mean_accuracy > 0.8 {
            thresholds.raise_min_confidence(0.5);
        } else if metrics.mean_accuracy < 0.6 {
            thresholds.lower_min_confidence(0.5);
        }

        if let Some(rsi) = pattern_stats.get("rsi_zscore") {
            let score = rsi.performance_score();
            if score > 0.2 {
                // The oversold read is working: lean into it
                thresholds.shift_rsi_oversold(-5.0);
            } else if score < 0.05 {
                thresholds.shift_rsi_oversold(5.0);
            }
        }

        thresholds.updated_at = now;
        self.holder.install_thresholds(thresholds);
    }

    /// Pair outcomes with their predictions, oldest data included
    fn load_samples(&self) -> Vec<Sample> {
        let outcomes: Vec<Outcome> =
            self.journal
                .query_as(Family::Outcomes, &QueryFilter::default(), 500);
        let predictions: HashMap<Uuid, Prediction> = self
            .journal
            .query_as::<Prediction>(Family::Predictions, &QueryFilter::default(), 1000)
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let mut samples: Vec<Sample> = outcomes
            .into_iter()
            .filter_map(|outcome| {
                predictions
                    .get(&outcome.prediction_id)
                    .map(|prediction| Sample {
                        prediction: prediction.clone(),
                        outcome,
                    })
            })
            .collect();
        // Chronological order for the train/validation split
        samples.sort_by_key(|s| s.outcome.closed_at);
        samples
    }
}

/// Chronological split: oldest `train_fraction` trains, the newer remainder
/// validates.
pub fn split_chronological(samples: &[Sample], train_fraction: f64) -> (&[Sample], &[Sample]) {
    debug_assert!(samples
        .windows(2)
        .all(|w| w[0].outcome.closed_at <= w[1].outcome.closed_at));
    let split = ((samples.len() as f64) * train_fraction).floor() as usize;
    samples.split_at(split.min(samples.len()))
}

/// Per-feature statistics on the training partition. A pattern counts a
/// sample when that feature contributed non-trivially to the prediction.
pub fn pattern_statistics(
    train: &[Sample],
    min_samples: usize,
) -> HashMap<String, PatternStats> {
    let mut out = HashMap::new();
    for feature in WEIGHTED_FEATURES {
        let hits: Vec<&Sample> = train
            .iter()
            .filter(|s| {
                s.prediction
                    .features
                    .get(*feature)
                    .map(|d| d.abs() > 0.05)
                    .unwrap_or(false)
            })
            .collect();
        if hits.len() < min_samples {
            continue;
        }
        let n = hits.len() as f64;
        let wins = hits.iter().filter(|s| s.outcome.success).count() as f64;
        let mean_return = hits
            .iter()
            .map(|s| s.outcome.realized_move_pct / 100.0)
            .sum::<f64>()
            / n;
        let mean_accuracy = hits.iter().map(|s| s.outcome.accuracy_score).sum::<f64>() / n;
        out.insert(
            feature.to_string(),
            PatternStats {
                samples: hits.len(),
                win_rate: wins / n,
                mean_return,
                mean_accuracy,
            },
        );
    }
    out
}

/// Re-score the validation partition under candidate weights: the fraction
/// of outcomes whose success matches the thresholded recomputed confidence,
/// weighted by per-trade accuracy.
pub fn validation_score(
    validation: &[Sample],
    current: &LearnedWeights,
    candidate: &LearnedWeights,
    min_confidence: f64,
) -> f64 {
    if validation.is_empty() {
        return 0.0;
    }
    let mut weighted_matches = 0.0;
    let mut total_weight = 0.0;

    for sample in validation {
        let mut contribution_sum = 0.0;
        for (feature, delta) in &sample.prediction.features {
            if WEIGHTED_FEATURES.contains(&feature.as_str()) {
                // The stored delta already carries the old multiplier;
                // re-weight it under the candidate.
                let old = current.multiplier(feature);
                let new = candidate.multiplier(feature);
                contribution_sum += delta / old * new;
            } else if feature == "market_context" {
                contribution_sum += delta;
            }
        }
        let recomputed = (BASE_CONFIDENCE
            + contribution_sum * candidate.confidence_multiplier)
            .clamp(0.0, 10.0);
        let predicted_positive = recomputed >= min_confidence;

        let weight = sample.outcome.accuracy_score.max(0.05);
        if predicted_positive == sample.outcome.success {
            weighted_matches += weight;
        }
        total_weight += weight;
    }
    weighted_matches / total_weight
}

fn build_insights(
    metrics: &PerformanceMetrics,
    pattern_stats: &HashMap<String, PatternStats>,
) -> Vec<String> {
    let mut insights = Vec::new();
    insights.push(format!(
        "{} outcomes, win rate {:.0}%, sharpe-like {:.2}, drawdown {:.1}%",
        metrics.sample_count,
        metrics.win_rate * 100.0,
        metrics.sharpe_like,
        metrics.max_drawdown * 100.0
    ));
    let mut ranked: Vec<(&String, &PatternStats)> = pattern_stats.iter().collect();
    ranked.sort_by(|a, b| {
        b.1.performance_score()
            .partial_cmp(&a.1.performance_score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if let Some((best, stats)) = ranked.first() {
        insights.push(format!(
            "strongest pattern {} (win {:.0}% over {} trades)",
            best,
            stats.win_rate * 100.0,
            stats.samples
        ));
    }
    if let Some((worst, stats)) = ranked.last() {
        if ranked.len() > 1 {
            insights.push(format!(
                "weakest pattern {} (win {:.0}% over {} trades)",
                worst,
                stats.win_rate * 100.0,
                stats.samples
            ));
        }
    }
    if metrics.confidence_calibration < 0.7 {
        insights.push(format!(
            "confidence running hot (calibration {:.2}), multiplier trimmed",
            metrics.confidence_calibration
        ));
    }
    insights
}
