//! Sentiment aggregation
//!
//! Collects scored data points from configured sources and folds them into a
//! per-ticker sentiment vector with time-decay, source credibility, and
//! engagement weighting. A source outage is a soft miss: it thins confidence
//! but never fails the call.

pub mod lexicon;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::SentimentConfig;
use crate::error::Result;
use crate::market::Ticker;

pub use lexicon::{score_text, TextScore};

/// Source family; the configured weight differs per family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentSource {
    News,
    Forum,
    Social,
}

impl fmt::Display for SentimentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SentimentSource::News => "news",
            SentimentSource::Forum => "forum",
            SentimentSource::Social => "social",
        };
        f.write_str(s)
    }
}

/// One scored observation from a source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentDataPoint {
    pub text: String,
    /// Polarity in [-1, 1]
    pub raw_score: f64,
    /// Model confidence in [0, 1]
    pub confidence: f64,
    pub source: SentimentSource,
    pub timestamp: DateTime<Utc>,
    /// Author credibility factor, at least 1.0
    pub author_credibility: f64,
    /// Engagement factor, at least 1.0
    pub engagement: f64,
}

impl SentimentDataPoint {
    /// Build a data point by scoring the text with the lexicon model
    pub fn from_text(
        text: impl Into<String>,
        source: SentimentSource,
        timestamp: DateTime<Utc>,
        author_credibility: f64,
        engagement: f64,
    ) -> Self {
        let text = text.into();
        let scored = score_text(&text);
        Self {
            text,
            raw_score: scored.score,
            confidence: scored.confidence,
            source,
            timestamp,
            author_credibility: author_credibility.max(1.0),
            engagement: engagement.max(1.0),
        }
    }
}

/// Sentiment trend over the collection window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentTrend {
    Improving,
    Deteriorating,
    Stable,
}

/// Aggregated per-ticker sentiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentSnapshot {
    pub ticker: Ticker,
    /// Composite polarity in [-1, 1]
    pub score: f64,
    /// Composite confidence in [0, 1]
    pub confidence: f64,
    pub direction: SentimentDirection,
    pub trend: SentimentTrend,
    /// Data points counted per source family
    pub source_counts: HashMap<String, usize>,
    /// Sources that failed to respond this pass
    pub degraded_sources: Vec<String>,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentDirection {
    Bullish,
    Bearish,
    Neutral,
}

impl SentimentSnapshot {
    /// Empty snapshot used when no sources returned anything
    pub fn empty(ticker: Ticker, at: DateTime<Utc>) -> Self {
        Self {
            ticker,
            score: 0.0,
            confidence: 0.0,
            direction: SentimentDirection::Neutral,
            trend: SentimentTrend::Stable,
            source_counts: HashMap::new(),
            degraded_sources: Vec::new(),
            collected_at: at,
        }
    }
}

/// A configured sentiment source
#[async_trait]
pub trait SentimentFeed: Send + Sync {
    fn source(&self) -> SentimentSource;

    /// Collect data points for a ticker since the given instant
    async fn collect(
        &self,
        ticker: &Ticker,
        since: DateTime<Utc>,
    ) -> Result<Vec<SentimentDataPoint>>;
}

/// Scripted feed for paper mode and tests
pub struct StaticSentimentFeed {
    source: SentimentSource,
    points: std::sync::RwLock<Vec<SentimentDataPoint>>,
    outage: std::sync::atomic::AtomicBool,
}

impl StaticSentimentFeed {
    pub fn new(source: SentimentSource) -> Self {
        Self {
            source,
            points: std::sync::RwLock::new(Vec::new()),
            outage: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn push(&self, point: SentimentDataPoint) {
        self.points.write().unwrap().push(point);
    }

    pub fn set_outage(&self, outage: bool) {
        self.outage
            .store(outage, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl SentimentFeed for StaticSentimentFeed {
    fn source(&self) -> SentimentSource {
        self.source
    }

    async fn collect(
        &self,
        _ticker: &Ticker,
        since: DateTime<Utc>,
    ) -> Result<Vec<SentimentDataPoint>> {
        if self.outage.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::error::Error::DataUnavailable("feed outage".into()));
        }
        Ok(self
            .points
            .read()
            .unwrap()
            .iter()
            .filter(|p| p.timestamp >= since)
            .cloned()
            .collect())
    }
}

/// The aggregator over all configured feeds
pub struct SentimentAggregator {
    feeds: Vec<Arc<dyn SentimentFeed>>,
    config: SentimentConfig,
}

impl SentimentAggregator {
    pub fn new(feeds: Vec<Arc<dyn SentimentFeed>>, config: SentimentConfig) -> Self {
        Self { feeds, config }
    }

    fn source_weight(&self, source: SentimentSource) -> f64 {
        match source {
            SentimentSource::News => self.config.news_weight,
            SentimentSource::Forum => self.config.forum_weight,
            SentimentSource::Social => self.config.social_weight,
        }
    }

    /// Linear time decay: full weight now, floor of 0.1 at and beyond the
    /// horizon
    fn time_decay(age_hours: f64, horizon_hours: f64) -> f64 {
        (1.0 - age_hours / horizon_hours).max(0.1)
    }

    /// Produce the sentiment vector for a ticker over the configured horizon
    pub async fn analyze(&self, ticker: &Ticker, now: DateTime<Utc>) -> SentimentSnapshot {
        let since = now - Duration::hours(self.config.hours_back);
        let mut points = Vec::new();
        let mut degraded_sources = Vec::new();

        // Sources are independent; collect them concurrently
        let results = join_all(self.feeds.iter().map(|f| f.collect(ticker, since))).await;
        for (feed, result) in self.feeds.iter().zip(results) {
            match result {
                Ok(mut batch) => {
                    debug!(
                        "Collected {} sentiment points for {} from {}",
                        batch.len(),
                        ticker,
                        feed.source()
                    );
                    points.append(&mut batch);
                }
                Err(e) => {
                    // Soft miss: reduced confidence, never a failure
                    warn!("Sentiment source {} unavailable: {}", feed.source(), e);
                    degraded_sources.push(feed.source().to_string());
                }
            }
        }

        if points.is_empty() {
            let mut snapshot = SentimentSnapshot::empty(ticker.clone(), now);
            snapshot.degraded_sources = degraded_sources;
            return snapshot;
        }

        let horizon_hours = self.config.hours_back as f64;
        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;
        let mut source_counts: HashMap<String, usize> = HashMap::new();

        for p in &points {
            let age_hours = (now - p.timestamp).num_seconds() as f64 / 3600.0;
            let weight = p.confidence
                * p.author_credibility
                * p.engagement
                * Self::time_decay(age_hours, horizon_hours)
                * self.source_weight(p.source);
            weighted_sum += p.raw_score * weight;
            total_weight += weight;
            *source_counts.entry(p.source.to_string()).or_insert(0) += 1;
        }

        let score = if total_weight > 0.0 {
            weighted_sum / total_weight
        } else {
            0.0
        };
        let mut confidence = (total_weight / points.len() as f64).min(1.0);
        // Missing sources thin the confidence proportionally
        if !degraded_sources.is_empty() && !self.feeds.is_empty() {
            let available = self.feeds.len() - degraded_sources.len();
            confidence *= available as f64 / self.feeds.len() as f64;
        }

        let direction = if score > 0.1 {
            SentimentDirection::Bullish
        } else if score < -0.1 {
            SentimentDirection::Bearish
        } else {
            SentimentDirection::Neutral
        };

        let trend = Self::trend(&points, since, now);

        SentimentSnapshot {
            ticker: ticker.clone(),
            score,
            confidence,
            direction,
            trend,
            source_counts,
            degraded_sources,
            collected_at: now,
        }
    }

    /// Compare the older half of the window to the newer half
    fn trend(
        points: &[SentimentDataPoint],
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SentimentTrend {
        let midpoint = since + (now - since) / 2;
        let (older, newer): (Vec<_>, Vec<_>) =
            points.iter().partition(|p| p.timestamp < midpoint);
        if older.is_empty() || newer.is_empty() {
            return SentimentTrend::Stable;
        }
        let avg = |ps: &[&SentimentDataPoint]| {
            ps.iter().map(|p| p.raw_score).sum::<f64>() / ps.len() as f64
        };
        let delta = avg(&newer) - avg(&older);
        if delta > 0.1 {
            SentimentTrend::Improving
        } else if delta < -0.1 {
            SentimentTrend::Deteriorating
        } else {
            SentimentTrend::Stable
        }
    }
}
