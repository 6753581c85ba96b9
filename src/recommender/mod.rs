//! Trade recommender
//!
//! Converts a candidate plus its feature snapshot into either a fully
//! validated long recommendation or a documented refusal. Every evaluation
//! opens a decision record first, logs each reasoning step with its
//! confidence contribution, and finalizes exactly once -- a partially
//! validated recommendation can never escape.

pub mod levels;
pub mod sizing;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::SessionBucket;
use crate::config::{RiskConfig, TradingConfig};
use crate::error::Result;
use crate::indicators::{IndicatorEngine, IndicatorInputs, IndicatorKind, IndicatorSet};
use crate::journal::{
    DecisionAction, DecisionContext, DecisionRecord, Family, JournalStore, PredictedDirection,
    Prediction, ReasoningStep, SetupType,
};
use crate::learning::weights::{AdaptiveThresholds, LearnedWeights};
use crate::market::{vwap, Bar, Quote, Ticker};
use crate::regime::RegimeClassification;
use crate::sentiment::{SentimentDirection, SentimentSnapshot, SentimentTrend};

pub use levels::{compute_levels, TradeLevels};
pub use sizing::{PositionSizer, SizedPosition, SizingContext};

/// The neutral starting confidence
pub const BASE_CONFIDENCE: f64 = 5.0;
/// The technical category weights are fractions of this many points of
/// confidence range
pub const CONTRIBUTION_SCALE: f64 = 5.0;

/// A fully validated long trade proposal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: Uuid,
    pub ticker: Ticker,
    pub direction: PredictedDirection,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub shares: u64,
    /// Fraction of account value, inside [0.02, 0.15]
    pub size_fraction: f64,
    /// Confidence in [0, 10]
    pub confidence: f64,
    pub expected_move_pct: f64,
    pub expected_duration_hours: f64,
    pub risk_reward: f64,
    pub valid_until: DateTime<Utc>,
    pub key_factors: Vec<String>,
    pub risk_factors: Vec<String>,
    pub success_probability: f64,
    pub setup_type: SetupType,
    pub decision_id: Uuid,
    pub prediction_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Portfolio context at evaluation time
#[derive(Debug, Clone)]
pub struct PortfolioContext {
    pub open_positions: usize,
    pub daily_trades: u32,
    /// Realized day P&L as a fraction of account (negative is a loss)
    pub daily_pnl_pct: f64,
    pub account_value: f64,
    /// Recent realized win rate from the learning layer
    pub recent_win_rate: Option<f64>,
}

/// Everything one evaluation needs, fetched before scoring begins
pub struct EvaluationInputs<'a> {
    pub ticker: &'a Ticker,
    pub quote: &'a Quote,
    pub bars: &'a [Bar],
    pub sector_ref: Option<&'a [f64]>,
    pub market_ref: Option<&'a [f64]>,
    pub sentiment: &'a SentimentSnapshot,
    pub regime: &'a RegimeClassification,
    pub portfolio: &'a PortfolioContext,
    pub session_bucket: SessionBucket,
}

/// Outcome of one evaluation
#[derive(Debug)]
pub enum Evaluation {
    Recommend(Box<Recommendation>),
    Skip { decision_id: Uuid, reason: String },
}

impl Evaluation {
    pub fn is_skip(&self) -> bool {
        matches!(self, Evaluation::Skip { .. })
    }

    pub fn skip_reason(&self) -> Option<&str> {
        match self {
            Evaluation::Skip { reason, .. } => Some(reason),
            Evaluation::Recommend(_) => None,
        }
    }
}

/// The recommender
pub struct Recommender {
    engine: IndicatorEngine,
    sizer: PositionSizer,
    trading: TradingConfig,
    risk: RiskConfig,
    journal: Arc<JournalStore>,
}

impl Recommender {
    pub fn new(trading: TradingConfig, risk: RiskConfig, journal: Arc<JournalStore>) -> Self {
        Self {
            engine: IndicatorEngine::new(),
            sizer: PositionSizer::new(risk.clone()),
            trading,
            risk,
            journal,
        }
    }

    /// Evaluate one candidate. Deterministic for a given feature snapshot and
    /// weights snapshot. Errors inside scoring terminate the evaluation as a
    /// documented skip; only fatal errors propagate.
    pub async fn evaluate(
        &self,
        inputs: &EvaluationInputs<'_>,
        weights: &LearnedWeights,
        thresholds: &AdaptiveThresholds,
        now: DateTime<Utc>,
    ) -> Result<Evaluation> {
        let mut decision = self.open_decision(inputs, now);

        let result = self
            .score_and_build(&mut decision, inputs, weights, thresholds, now)
            .await;

        match result {
            Ok(Some(rec)) => {
                decision.action = DecisionAction::Buy;
                decision.final_confidence = rec.confidence;
                decision.expected_move_pct = Some(rec.expected_move_pct);
                decision.prediction_id = Some(rec.prediction_id);
                self.journal
                    .append(Family::Decisions, decision.id, decision.created_at, &decision)
                    .await?;
                info!(
                    "Recommending {} @ {:.2}: confidence {:.1}, stop {:.2}, target {:.2}, {} shares",
                    rec.ticker, rec.entry, rec.confidence, rec.stop_loss, rec.take_profit, rec.shares
                );
                Ok(Evaluation::Recommend(Box::new(rec)))
            }
            Ok(None) => {
                let reason = decision
                    .skip_reason
                    .clone()
                    .unwrap_or_else(|| "unspecified".into());
                self.journal
                    .append(Family::Decisions, decision.id, decision.created_at, &decision)
                    .await?;
                debug!("Skipping {}: {}", inputs.ticker, reason);
                Ok(Evaluation::Skip {
                    decision_id: decision.id,
                    reason,
                })
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                // Scoring failure becomes a documented refusal with the full
                // snapshot journaled
                decision.action = DecisionAction::Skip;
                decision.skip_reason = Some(format!("error: {e}"));
                self.journal
                    .append(Family::Decisions, decision.id, decision.created_at, &decision)
                    .await?;
                Ok(Evaluation::Skip {
                    decision_id: decision.id,
                    reason: format!("error: {e}"),
                })
            }
        }
    }

    fn open_decision(&self, inputs: &EvaluationInputs<'_>, now: DateTime<Utc>) -> DecisionRecord {
        DecisionRecord {
            id: Uuid::new_v4(),
            ticker: inputs.ticker.clone(),
            created_at: now,
            context: DecisionContext {
                price: inputs.quote.last,
                day_change_pct: inputs.quote.day_change_pct(),
                session_volume: inputs.quote.session_volume,
                regime: inputs.regime.regime.to_string(),
                regime_confidence: inputs.regime.confidence,
                sentiment_score: inputs.sentiment.score,
                sentiment_confidence: inputs.sentiment.confidence,
                session_bucket: inputs.session_bucket,
                open_positions: inputs.portfolio.open_positions,
                daily_trades: inputs.portfolio.daily_trades,
                daily_pnl_pct: inputs.portfolio.daily_pnl_pct,
            },
            reasoning: Vec::new(),
            confidence_breakdown: HashMap::new(),
            risk_factors: Vec::new(),
            alternatives_considered: Vec::new(),
            action: DecisionAction::Skip,
            final_confidence: 0.0,
            skip_reason: None,
            expected_move_pct: None,
            prediction_id: None,
            actual_move_pct: None,
            actual_duration_hours: None,
            accuracy_score: None,
            outcome_success: None,
        }
    }

    /// The scoring pipeline. Returns `Ok(None)` for refusals (with
    /// `decision.skip_reason` set) and `Ok(Some)` for a recommendation.
    async fn score_and_build(
        &self,
        decision: &mut DecisionRecord,
        inputs: &EvaluationInputs<'_>,
        weights: &LearnedWeights,
        thresholds: &AdaptiveThresholds,
        now: DateTime<Utc>,
    ) -> Result<Option<Recommendation>> {
        let portfolio = inputs.portfolio;

        // Hard gates before any scoring work
        if portfolio.daily_pnl_pct <= -self.risk.max_daily_loss_percent {
            decision.skip_reason = Some("daily_loss_brake".into());
            return Ok(None);
        }
        if portfolio.daily_trades >= self.trading.max_daily_trades {
            decision.skip_reason = Some("daily_limit".into());
            return Ok(None);
        }
        if portfolio.open_positions >= self.risk.max_open_positions {
            decision.skip_reason = Some("max_positions".into());
            return Ok(None);
        }

        // Indicator sweep; CPU-only, all data already fetched
        let set = self.engine.compute_all(&IndicatorInputs {
            bars: inputs.bars,
            regime: inputs.regime,
            sector_ref: inputs.sector_ref,
            market_ref: inputs.market_ref,
        });

        let mut total = 0.0;
        for kind in IndicatorKind::scored() {
            let Some(signal) = set.get(kind) else {
                continue;
            };
            if signal.is_neutral() {
                continue;
            }
            let learned = weights.multiplier(kind.key());
            let delta = signal.direction.sign()
                * signal.strength
                * signal.confidence
                * learned
                * kind.default_weight()
                * CONTRIBUTION_SCALE;
            total += delta;

            let mut input = HashMap::new();
            input.insert("value".into(), signal.value);
            input.insert("strength".into(), signal.strength);
            input.insert("confidence".into(), signal.confidence);
            input.insert("learned_weight".into(), learned);
            decision.reasoning.push(ReasoningStep {
                step: kind.key().into(),
                input,
                confidence_delta: delta,
                rationale: format!(
                    "{} {} (strength {:.2}, confidence {:.2})",
                    kind,
                    signal.direction,
                    signal.strength,
                    signal.confidence
                ),
            });
            decision
                .confidence_breakdown
                .insert(kind.key().into(), delta);
        }

        // Sentiment step: bounded contribution
        let sentiment = inputs.sentiment;
        let sentiment_weight = weights.multiplier("sentiment");
        let sentiment_delta = match sentiment.direction {
            SentimentDirection::Bullish if sentiment.score > 0.3 => {
                1.5 * sentiment.score * sentiment_weight
            }
            SentimentDirection::Bearish if sentiment.score < -0.3 => {
                -1.0 * sentiment.score.abs() * sentiment_weight
            }
            _ => 0.2 * sentiment.confidence,
        };
        total += sentiment_delta;
        decision.reasoning.push(ReasoningStep {
            step: "sentiment".into(),
            input: HashMap::from([
                ("score".into(), sentiment.score),
                ("confidence".into(), sentiment.confidence),
            ]),
            confidence_delta: sentiment_delta,
            rationale: format!(
                "sentiment {:.2} ({:?} sources)",
                sentiment.score,
                sentiment.source_counts.len()
            ),
        });
        decision
            .confidence_breakdown
            .insert("sentiment".into(), sentiment_delta);

        // Market context step
        let regime = inputs.regime;
        let high_vol = regime.regime.is_high_vol();
        let context_delta = if regime.favors_long() && !high_vol {
            0.4
        } else if regime.adverse_for_long() || high_vol {
            -0.3
        } else {
            0.0
        };
        total += context_delta;
        decision.reasoning.push(ReasoningStep {
            step: "market_context".into(),
            input: HashMap::from([
                ("regime_confidence".into(), regime.confidence),
                ("volatility_percentile".into(), regime.volatility_percentile),
            ]),
            confidence_delta: context_delta,
            rationale: format!("regime {} ({:.0}% vol percentile)", regime.regime,
                regime.volatility_percentile * 100.0),
        });
        decision
            .confidence_breakdown
            .insert("market_context".into(), context_delta);

        // Final confidence: contributions scaled uniformly by the learned
        // multiplier on top of the neutral base
        let confidence =
            (BASE_CONFIDENCE + total * weights.confidence_multiplier).clamp(0.0, 10.0);
        decision.final_confidence = confidence;

        if confidence < thresholds.min_confidence_score {
            decision.skip_reason = Some(format!(
                "below_min_confidence ({confidence:.1} < {:.1})",
                thresholds.min_confidence_score
            ));
            return Ok(None);
        }

        // Price levels
        let Some(levels) = compute_levels(inputs.quote.last, confidence, &self.trading) else {
            decision.skip_reason = Some("levels infeasible".into());
            return Ok(None);
        };

        // Expected move, floored by the adaptive threshold
        let rsi = set
            .get(IndicatorKind::RsiZscore)
            .and_then(|s| s.aux.get("traditional_rsi").copied());
        let vwap_distance = vwap(inputs.bars)
            .map(|v| (inputs.quote.last - v) / v)
            .unwrap_or(0.0);
        let expected_move =
            expected_move_pct(rsi, vwap_distance, sentiment.score, confidence);
        if expected_move < thresholds.min_expected_move {
            decision.skip_reason = Some(format!(
                "expected_move_below_floor ({:.3} < {:.3})",
                expected_move, thresholds.min_expected_move
            ));
            return Ok(None);
        }

        // Position size
        let sized = self.sizer.size(&SizingContext {
            confidence,
            entry_price: levels.entry,
            recent_win_rate: portfolio.recent_win_rate,
        });
        let shares = self
            .sizer
            .shares(sized.fraction, portfolio.account_value, levels.entry);
        if shares == 0 {
            decision.skip_reason = Some("size_too_small".into());
            return Ok(None);
        }

        // Risk factors; a stack deeper than three is a refusal
        let risk_factors = self.collect_risk_factors(inputs, &set);
        decision.risk_factors = risk_factors.clone();
        if risk_factors.len() > 3 {
            decision.skip_reason = Some("risk_stack_too_deep".into());
            return Ok(None);
        }

        // Key factors from the strongest reasoning steps
        let key_factors = key_factors(&decision.reasoning);
        decision.alternatives_considered = vec![
            "skip and keep scanning".into(),
            "wait for a pullback entry".into(),
        ];

        // Setup classification drives the predicted horizon
        let setup_type = classify_setup(rsi, vwap_distance, &set, thresholds);
        let duration_hours = expected_duration_hours(setup_type, confidence);

        let success_probability = (0.35
            + confidence / 10.0 * 0.35
            + ((levels.risk_reward - self.trading.rr_threshold) * 0.05).clamp(0.0, 0.15))
        .clamp(0.35, 0.85);

        // The journaled prediction
        let mut features: HashMap<String, f64> = decision.confidence_breakdown.clone();
        features.insert("vwap_distance".into(), vwap_distance);
        if let Some(rsi) = rsi {
            features.insert("traditional_rsi".into(), rsi);
        }
        let prediction = Prediction {
            id: Uuid::new_v4(),
            ticker: inputs.ticker.clone(),
            direction: PredictedDirection::Up,
            predicted_move_pct: expected_move,
            predicted_horizon_hours: duration_hours,
            confidence,
            features,
            setup_type,
            created_at: now,
        };
        self.journal
            .append(Family::Predictions, prediction.id, now, &prediction)
            .await?;

        Ok(Some(Recommendation {
            id: Uuid::new_v4(),
            ticker: inputs.ticker.clone(),
            direction: PredictedDirection::Up,
            entry: levels.entry,
            stop_loss: levels.stop_loss,
            take_profit: levels.take_profit,
            shares,
            size_fraction: sized.fraction,
            confidence,
            expected_move_pct: expected_move,
            expected_duration_hours: duration_hours,
            risk_reward: levels.risk_reward,
            valid_until: now + Duration::minutes(self.trading.validity_minutes),
            key_factors,
            risk_factors,
            success_probability,
            setup_type,
            decision_id: decision.id,
            prediction_id: prediction.id,
            created_at: now,
        }))
    }

    fn collect_risk_factors(
        &self,
        inputs: &EvaluationInputs<'_>,
        set: &IndicatorSet,
    ) -> Vec<String> {
        let mut risks = Vec::new();
        let regime = inputs.regime;
        if regime.adverse_for_long() {
            risks.push("adverse regime for longs".to_string());
        }
        if regime.regime.is_high_vol() {
            risks.push("high volatility regime".to_string());
        }
        if inputs.sentiment.direction == SentimentDirection::Bearish {
            risks.push("bearish sentiment".to_string());
        }
        if inputs.sentiment.trend == SentimentTrend::Deteriorating {
            risks.push("deteriorating sentiment trend".to_string());
        }
        if !inputs.sentiment.degraded_sources.is_empty() {
            risks.push(format!(
                "sentiment degraded ({} sources down)",
                inputs.sentiment.degraded_sources.len()
            ));
        }
        if set
            .get(IndicatorKind::BollingerSqueeze)
            .map(|s| s.aux.get("squeeze") == Some(&1.0))
            .unwrap_or(false)
        {
            risks.push("volatility squeeze in progress".to_string());
        }
        let quote = inputs.quote;
        if quote.last > 0.0 && (quote.ask - quote.bid) / quote.last > 0.01 {
            risks.push("wide spread".to_string());
        }
        if quote.last < 1.0 {
            risks.push("sub-dollar ticker".to_string());
        }
        risks
    }
}

/// Expected move formula shared with the learning engine's re-scoring
pub fn expected_move_pct(
    rsi: Option<f64>,
    vwap_distance: f64,
    sentiment_score: f64,
    confidence: f64,
) -> f64 {
    let mut base = 0.03;
    if let Some(rsi) = rsi {
        base += ((30.0 - rsi) / 30.0).max(0.0) * 0.02;
    }
    if vwap_distance < -0.02 {
        base += vwap_distance.abs() * 0.5;
    }
    if sentiment_score > 0.3 {
        base += sentiment_score * 0.02;
    }
    base * (confidence / 7.0)
}

/// Horizon by setup type, adjusted by conviction
pub fn expected_duration_hours(setup: SetupType, confidence: f64) -> f64 {
    let base = setup.base_horizon_hours();
    if confidence >= 9.0 {
        base * 0.7
    } else if confidence <= 7.0 {
        base * 1.3
    } else {
        base
    }
}

/// Tag the dominant setup for horizon estimation
fn classify_setup(
    rsi: Option<f64>,
    vwap_distance: f64,
    set: &IndicatorSet,
    thresholds: &AdaptiveThresholds,
) -> SetupType {
    if vwap_distance < -0.02 {
        return SetupType::VwapBounce;
    }
    if let Some(rsi) = rsi {
        if rsi <= thresholds.rsi_oversold {
            return SetupType::RsiOversold;
        }
    }
    let relative_volume = set
        .get(IndicatorKind::VolumePriceTrend)
        .and_then(|s| s.aux.get("relative_volume").copied())
        .unwrap_or(1.0);
    if relative_volume >= thresholds.volume_spike_multiplier * 2.0 {
        return SetupType::VolumeSpike;
    }
    SetupType::Momentum
}

/// Three to six key factors, strongest contributions first
fn key_factors(reasoning: &[ReasoningStep]) -> Vec<String> {
    let mut ranked: Vec<&ReasoningStep> = reasoning
        .iter()
        .filter(|s| s.confidence_delta.abs() > 1e-9)
        .collect();
    ranked.sort_by(|a, b| {
        b.confidence_delta
            .abs()
            .partial_cmp(&a.confidence_delta.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked
        .into_iter()
        .take(6)
        .map(|s| format!("{} ({:+.2})", s.step, s.confidence_delta))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RiskConfig, TradingConfig};
    use crate::journal::QueryFilter;
    use crate::learning::weights::ThresholdRails;
    use crate::market::Interval;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 15, 0, 0).unwrap()
    }

    fn thresholds() -> AdaptiveThresholds {
        AdaptiveThresholds::new(7.0, 30.0, 70.0, 1.2, 0.03, ThresholdRails::default(), now())
    }

    fn quote(symbol: &str, last: f64) -> Quote {
        Quote {
            ticker: Ticker::new(symbol).unwrap(),
            timestamp: now(),
            last,
            bid: last - 0.01,
            ask: last + 0.01,
            session_volume: 2_000_000,
            day_open: last * 0.95,
            day_high: last * 1.01,
            day_low: last * 0.94,
            prev_close: last * 0.95,
        }
    }

    fn portfolio() -> PortfolioContext {
        PortfolioContext {
            open_positions: 0,
            daily_trades: 0,
            daily_pnl_pct: 0.0,
            account_value: 100_000.0,
            recent_win_rate: None,
        }
    }

    fn bullish_sentiment(score: f64) -> SentimentSnapshot {
        let mut s = SentimentSnapshot::empty(Ticker::new("SIRI").unwrap(), now());
        s.score = score;
        s.confidence = 0.8;
        s.direction = if score > 0.1 {
            SentimentDirection::Bullish
        } else if score < -0.1 {
            SentimentDirection::Bearish
        } else {
            SentimentDirection::Neutral
        };
        s
    }

    /// A strong uptrend on expanding volume long enough for every indicator
    fn strong_bars() -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 13, 30, 0).unwrap();
        let mut closes: Vec<f64> = (0..80)
            .map(|i| 5.0 + if i % 2 == 0 { 0.01 } else { -0.005 })
            .collect();
        for i in 0..20 {
            closes.push(5.1 + 0.06 * i as f64);
        }
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open = if i == 0 { close } else { closes[i - 1] };
                let volume = if i >= 80 {
                    100_000 + 10_000 * (i as u64 - 80)
                } else {
                    50_000
                };
                Bar::new(
                    Ticker::new("SIRI").unwrap(),
                    Interval::FiveMinutes,
                    start + chrono::Duration::minutes(5 * i as i64),
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

    async fn recommender() -> (Recommender, Arc<JournalStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(JournalStore::open(dir.path(), 90).await.unwrap());
        let rec = Recommender::new(TradingConfig::default(), RiskConfig::default(), journal.clone());
        (rec, journal, dir)
    }

    fn trending_regime() -> RegimeClassification {
        let mut r = RegimeClassification::uncertain();
        r.regime = crate::regime::Regime::TrendingLowVol;
        r.drift = 0.05;
        r.confidence = 0.8;
        r
    }

    #[tokio::test]
    async fn test_daily_gates_refuse_before_scoring() {
        let (rec, journal, _dir) = recommender().await;
        let bars = strong_bars();
        let last = bars.last().unwrap().close;
        let quote = quote("SIRI", last);
        let ticker = Ticker::new("SIRI").unwrap();
        let sentiment = bullish_sentiment(0.5);
        let regime = trending_regime();

        let mut ctx = portfolio();
        ctx.daily_trades = 10;
        let inputs = EvaluationInputs {
            ticker: &ticker,
            quote: &quote,
            bars: &bars,
            sector_ref: None,
            market_ref: None,
            sentiment: &sentiment,
            regime: &regime,
            portfolio: &ctx,
            session_bucket: SessionBucket::Midday,
        };
        let weights = LearnedWeights::initial(now());
        let eval = rec.evaluate(&inputs, &weights, &thresholds(), now()).await.unwrap();
        assert_eq!(eval.skip_reason(), Some("daily_limit"));

        let mut ctx = portfolio();
        ctx.daily_pnl_pct = -0.152;
        let inputs = EvaluationInputs { portfolio: &ctx, ..inputs };
        let eval = rec.evaluate(&inputs, &weights, &thresholds(), now()).await.unwrap();
        assert_eq!(eval.skip_reason(), Some("daily_loss_brake"));

        // Both refusals journaled decisions
        let decisions = journal.query(Family::Decisions, &QueryFilter::default(), 10);
        assert_eq!(decisions.len(), 2);
    }

    #[tokio::test]
    async fn test_low_confidence_refusal_documents_breakdown() {
        let (rec, journal, _dir) = recommender().await;
        // Flat tape: indicators neutral, sentiment weak
        let closes: Vec<f64> = (0..120)
            .map(|i| 5.0 + if i % 2 == 0 { 0.001 } else { -0.001 })
            .collect();
        let bars = crate::indicators::testutil::bars_from_closes(&closes);
        let ticker = Ticker::new("SIRI").unwrap();
        let q = quote("SIRI", 5.0);
        let sentiment = bullish_sentiment(0.05);
        let regime = RegimeClassification::uncertain();
        let ctx = portfolio();

        let inputs = EvaluationInputs {
            ticker: &ticker,
            quote: &q,
            bars: &bars,
            sector_ref: None,
            market_ref: None,
            sentiment: &sentiment,
            regime: &regime,
            portfolio: &ctx,
            session_bucket: SessionBucket::Midday,
        };
        let weights = LearnedWeights::initial(now());
        let eval = rec.evaluate(&inputs, &weights, &thresholds(), now()).await.unwrap();
        assert!(eval.is_skip());
        assert!(eval.skip_reason().unwrap().starts_with("below_min_confidence"));

        let decisions: Vec<DecisionRecord> =
            journal.query_as(Family::Decisions, &QueryFilter::default(), 1);
        let d = &decisions[0];
        assert_eq!(d.action, DecisionAction::Skip);
        // The breakdown sums to final - base under identity multiplier
        let sum: f64 = d.confidence_breakdown.values().sum();
        assert!((d.final_confidence - (BASE_CONFIDENCE + sum)).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_recommendation_invariants_hold() {
        let (rec, journal, _dir) = recommender().await;
        let bars = strong_bars();
        let last = bars.last().unwrap().close;
        let ticker = Ticker::new("SIRI").unwrap();
        let q = quote("SIRI", last);
        let sentiment = bullish_sentiment(0.6);
        let regime = trending_regime();
        let ctx = portfolio();

        // Boost weights so the composite clears the gate the way a tuned
        // system would
        let mut weights = LearnedWeights::initial(now());
        for key in ["momentum_divergence", "vpt", "order_flow"] {
            weights.set_multiplier(key, 2.0);
        }
        weights.set_confidence_multiplier(1.5);

        let inputs = EvaluationInputs {
            ticker: &ticker,
            quote: &q,
            bars: &bars,
            sector_ref: None,
            market_ref: None,
            sentiment: &sentiment,
            regime: &regime,
            portfolio: &ctx,
            session_bucket: SessionBucket::Midday,
        };
        let eval = rec.evaluate(&inputs, &weights, &thresholds(), now()).await.unwrap();

        let Evaluation::Recommend(r) = eval else {
            panic!("expected a recommendation, got {:?}", eval.skip_reason());
        };
        assert!(r.stop_loss < r.entry && r.entry < r.take_profit);
        assert!(r.risk_reward >= 2.0);
        assert!((0.02..=0.15).contains(&r.size_fraction));
        assert!(r.confidence >= 7.0);
        assert!(r.shares > 0);
        assert_eq!(r.valid_until, now() + Duration::minutes(30));
        assert!(!r.key_factors.is_empty() && r.key_factors.len() <= 6);
        assert!((0.35..=0.85).contains(&r.success_probability));

        // Prediction journaled alongside the decision
        assert!(journal.get(Family::Predictions, r.prediction_id).is_some());
        let decisions: Vec<DecisionRecord> =
            journal.query_as(Family::Decisions, &QueryFilter::default(), 1);
        assert_eq!(decisions[0].action, DecisionAction::Buy);
        assert_eq!(decisions[0].prediction_id, Some(r.prediction_id));
    }

    #[tokio::test]
    async fn test_evaluation_deterministic_given_snapshot() {
        let (rec, _journal, _dir) = recommender().await;
        let bars = strong_bars();
        let last = bars.last().unwrap().close;
        let ticker = Ticker::new("SIRI").unwrap();
        let q = quote("SIRI", last);
        let sentiment = bullish_sentiment(0.6);
        let regime = trending_regime();
        let ctx = portfolio();
        let weights = LearnedWeights::initial(now());

        let inputs = EvaluationInputs {
            ticker: &ticker,
            quote: &q,
            bars: &bars,
            sector_ref: None,
            market_ref: None,
            sentiment: &sentiment,
            regime: &regime,
            portfolio: &ctx,
            session_bucket: SessionBucket::Midday,
        };

        let a = rec.evaluate(&inputs, &weights, &thresholds(), now()).await.unwrap();
        let b = rec.evaluate(&inputs, &weights, &thresholds(), now()).await.unwrap();
        match (&a, &b) {
            (Evaluation::Skip { reason: ra, .. }, Evaluation::Skip { reason: rb, .. }) => {
                assert_eq!(ra, rb)
            }
            (Evaluation::Recommend(ra), Evaluation::Recommend(rb)) => {
                assert_eq!(ra.confidence, rb.confidence);
                assert_eq!(ra.entry, rb.entry);
                assert_eq!(ra.shares, rb.shares);
            }
            _ => panic!("evaluations diverged"),
        }
    }

    #[test]
    fn test_expected_move_formula() {
        // Scenario: deep oversold, below VWAP, strong sentiment, conf 7
        let m = expected_move_pct(Some(20.0), -0.04, 0.5, 7.0);
        // 0.03 + (10/30)*0.02 + 0.04*0.5 + 0.5*0.02 = 0.0667
        assert!((m - 0.066_666).abs() < 1e-3);

        // Neutral case at confidence 7 is exactly the 3% base
        let m = expected_move_pct(Some(50.0), 0.0, 0.0, 7.0);
        assert!((m - 0.03).abs() < 1e-12);

        // Confidence scales the whole thing
        let lo = expected_move_pct(Some(50.0), 0.0, 0.0, 5.0);
        assert!(lo < 0.03);
    }

    #[test]
    fn test_duration_bands() {
        assert!((expected_duration_hours(SetupType::RsiOversold, 9.5) - 5.6).abs() < 1e-9);
        assert!((expected_duration_hours(SetupType::VolumeSpike, 6.5) - 2.6).abs() < 1e-9);
        assert!((expected_duration_hours(SetupType::Momentum, 8.0) - 6.0).abs() < 1e-9);
    }
}
