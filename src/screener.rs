//! Dynamic watchlist screener
//!
//! Reduces the gainers universe to a bounded, sector-diverse watchlist of
//! low-price momentum candidates. An upstream failure never blocks the
//! recommender: the previous list is served with a degraded flag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ScreenerConfig;
use crate::error::Result;
use crate::journal::{Family, JournalStore, WatchlistRecord};
use crate::market::{Quote, Ticker};
use crate::ports::MarketDataPort;

/// One screened candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub ticker: Ticker,
    pub price: f64,
    pub day_change_pct: f64,
    /// Session volume relative to the prior day's
    pub relative_volume: f64,
    /// Momentum score in [0, 10]
    pub momentum_score: f64,
    pub sector: String,
    pub screened_at: DateTime<Utc>,
}

/// The current watchlist
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watchlist {
    pub entries: Vec<WatchlistEntry>,
    pub created_at: DateTime<Utc>,
    /// True when the list was carried over after an upstream failure
    pub degraded: bool,
}

impl Watchlist {
    pub fn empty(at: DateTime<Utc>) -> Self {
        Self {
            entries: Vec::new(),
            created_at: at,
            degraded: false,
        }
    }

    pub fn tickers(&self) -> Vec<Ticker> {
        self.entries.iter().map(|e| e.ticker.clone()).collect()
    }
}

/// Momentum score from day change, relative volume, and price-band
/// preference. 0-4 + 0-3 + 0-3 points.
pub fn momentum_score(change_pct: f64, volume_ratio: f64, price: f64) -> f64 {
    let mut score = 0.0;

    // Price change component (0-4 points), percent units
    if change_pct > 5.0 {
        score += 4.0;
    } else if change_pct > 3.0 {
        score += 3.0;
    } else if change_pct > 1.0 {
        score += 2.0;
    } else if change_pct > 0.0 {
        score += 1.0;
    }

    // Volume component (0-3 points)
    if volume_ratio > 3.0 {
        score += 3.0;
    } else if volume_ratio > 2.0 {
        score += 2.0;
    } else if volume_ratio > 1.5 {
        score += 1.0;
    }

    // Price band preference (0-3 points): the sweet spot of the low-price
    // universe moves best
    if (2.0..=7.0).contains(&price) {
        score += 3.0;
    } else if (1.0..=10.0).contains(&price) {
        score += 2.0;
    } else if (0.75..=15.0).contains(&price) {
        score += 1.0;
    }

    score
}

/// The screener
pub struct Screener {
    market: Arc<dyn MarketDataPort>,
    journal: Arc<JournalStore>,
    config: ScreenerConfig,
    last: RwLock<Option<Watchlist>>,
    /// Set on the first degraded refresh, cleared on recovery; gates the
    /// once-per-transition notification
    degraded_mode: std::sync::atomic::AtomicBool,
}

impl Screener {
    pub fn new(
        market: Arc<dyn MarketDataPort>,
        journal: Arc<JournalStore>,
        config: ScreenerConfig,
    ) -> Self {
        Self {
            market,
            journal,
            config,
            last: RwLock::new(None),
            degraded_mode: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// The most recent watchlist, if any refresh has completed
    pub fn current(&self) -> Option<Watchlist> {
        self.last.read().unwrap().clone()
    }

    /// Whether the last refresh ran degraded
    pub fn is_degraded(&self) -> bool {
        self.degraded_mode.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Run one full screening pass
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<Watchlist> {
        let gainers = match self.market.gainers().await {
            Ok(g) => {
                if self
                    .degraded_mode
                    .swap(false, std::sync::atomic::Ordering::SeqCst)
                {
                    info!("Screener recovered from degraded mode");
                }
                g
            }
            Err(e) => {
                let was_degraded = self
                    .degraded_mode
                    .swap(true, std::sync::atomic::Ordering::SeqCst);
                if !was_degraded {
                    warn!("Gainers unavailable, serving previous watchlist: {}", e);
                }
                let mut fallback = self
                    .current()
                    .unwrap_or_else(|| Watchlist::empty(now));
                fallback.degraded = true;
                self.persist(&fallback).await?;
                return Ok(fallback);
            }
        };

        // 1. Cap the universe
        let universe: Vec<Quote> = gainers
            .into_iter()
            .take(self.config.max_universe)
            .collect();
        debug!("Screening universe of {} gainers", universe.len());

        // 2. Price band and session volume filter
        let candidates: Vec<Quote> = universe
            .into_iter()
            .filter(|q| {
                q.last >= self.config.ticker_price_min
                    && q.last <= self.config.ticker_price_max
                    && q.session_volume >= self.config.min_session_volume
            })
            .collect();

        // 3. Enrich and score under bounded concurrency with spacing between
        //    launches
        let semaphore = Arc::new(Semaphore::new(self.config.enrichment_concurrency));
        let mut tasks = Vec::new();
        for quote in candidates {
            let market = self.market.clone();
            let semaphore = semaphore.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                let sector = match market.sector(&quote.ticker).await {
                    Ok(s) => s,
                    Err(e) => {
                        debug!("Sector lookup failed for {}: {}", quote.ticker, e);
                        "unknown".to_string()
                    }
                };
                // Prior-day average volume for the relative-volume read
                let prior_volume = match market
                    .bars(
                        &quote.ticker,
                        crate::market::Interval::OneDay,
                        now - chrono::Duration::days(6),
                        now - chrono::Duration::days(1),
                    )
                    .await
                {
                    Ok(bars) if !bars.is_empty() => {
                        Some(bars.iter().map(|b| b.volume as f64).sum::<f64>() / bars.len() as f64)
                    }
                    _ => None,
                };
                Some((quote, sector, prior_volume))
            }));
            tokio::time::sleep(Duration::from_millis(self.config.enrichment_spacing_ms)).await;
        }

        let mut scored = Vec::new();
        for task in tasks {
            let Ok(Some((quote, sector, prior_volume))) = task.await else {
                continue;
            };
            let change_pct = quote.day_change_pct() * 100.0;
            let relative_volume = match prior_volume {
                Some(avg) if avg > 0.0 => quote.session_volume as f64 / avg,
                _ => 1.0,
            };
            let score = momentum_score(change_pct, relative_volume, quote.last);
            // 4. Momentum cut
            if score < self.config.min_momentum_score {
                continue;
            }
            scored.push(WatchlistEntry {
                ticker: quote.ticker.clone(),
                price: quote.last,
                day_change_pct: change_pct,
                relative_volume,
                momentum_score: score,
                sector,
                screened_at: now,
            });
        }

        scored.sort_by(|a, b| {
            b.momentum_score
                .partial_cmp(&a.momentum_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // 5. Sector diversity: best-first, at most N per sector
        let mut per_sector: HashMap<String, usize> = HashMap::new();
        let mut entries = Vec::new();
        for entry in scored {
            let count = per_sector.entry(entry.sector.clone()).or_insert(0);
            if *count >= self.config.max_per_sector {
                debug!(
                    "Dropping {} for sector diversity ({} already from {})",
                    entry.ticker, count, entry.sector
                );
                continue;
            }
            *count += 1;
            entries.push(entry);
        }

        let watchlist = Watchlist {
            entries,
            created_at: now,
            degraded: false,
        };

        info!(
            "Watchlist refreshed: {} candidates across {} sectors",
            watchlist.entries.len(),
            per_sector.len()
        );

        // 6. Persist with the criteria used
        self.persist(&watchlist).await?;
        *self.last.write().unwrap() = Some(watchlist.clone());
        Ok(watchlist)
    }

    async fn persist(&self, watchlist: &Watchlist) -> Result<()> {
        let record = WatchlistRecord {
            id: Uuid::new_v4(),
            entries: watchlist.entries.clone(),
            price_min: self.config.ticker_price_min,
            price_max: self.config.ticker_price_max,
            min_volume: self.config.min_session_volume,
            min_score: self.config.min_momentum_score,
            degraded: watchlist.degraded,
            created_at: watchlist.created_at,
        };
        self.journal
            .append(Family::Watchlists, record.id, record.created_at, &record)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::StaticMarketData;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 14, 30, 0).unwrap()
    }

    fn quote(symbol: &str, last: f64, prev_close: f64, volume: u64) -> Quote {
        Quote {
            ticker: Ticker::new(symbol).unwrap(),
            timestamp: now(),
            last,
            bid: last - 0.01,
            ask: last + 0.01,
            session_volume: volume,
            day_open: prev_close,
            day_high: last.max(prev_close) * 1.02,
            day_low: last.min(prev_close) * 0.98,
            prev_close,
        }
    }

    async fn fixture() -> (Screener, Arc<StaticMarketData>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(JournalStore::open(dir.path(), 90).await.unwrap());
        let market = Arc::new(StaticMarketData::new());
        let mut config = ScreenerConfig::default();
        config.enrichment_spacing_ms = 0; // keep tests fast
        let screener = Screener::new(market.clone(), journal, config);
        (screener, market, dir)
    }

    #[test]
    fn test_momentum_score_buckets() {
        // Big gainer on huge relative volume in the sweet spot: 4+3+3
        assert_eq!(momentum_score(6.0, 3.5, 4.0), 10.0);
        // Moderate: 2 + 1 + 3
        assert_eq!(momentum_score(1.5, 1.6, 5.0), 6.0);
        // Red name scores only the band points
        assert_eq!(momentum_score(-2.0, 1.0, 4.0), 3.0);
        // Out-of-band price above the universe
        assert_eq!(momentum_score(6.0, 3.5, 50.0), 7.0);
    }

    #[tokio::test]
    async fn test_refresh_filters_and_ranks() {
        let (screener, market, _dir) = fixture().await;
        market.set_gainers(vec![
            quote("SIRI", 5.50, 5.0, 900_000),  // strong candidate
            quote("PLUG", 2.20, 2.0, 500_000),  // strong candidate
            quote("BIGCO", 120.0, 110.0, 900_000), // out of price band
            quote("THIN", 4.0, 3.8, 20_000),    // volume too low
        ]);
        for s in ["SIRI", "PLUG"] {
            market.set_sector(Ticker::new(s).unwrap(), "technology");
        }

        let list = screener.refresh(now()).await.unwrap();
        assert!(!list.degraded);
        let names: Vec<_> = list.entries.iter().map(|e| e.ticker.as_str()).collect();
        assert!(names.contains(&"SIRI"));
        assert!(names.contains(&"PLUG"));
        assert!(!names.contains(&"BIGCO"));
        assert!(!names.contains(&"THIN"));
        for e in &list.entries {
            assert!(e.momentum_score >= 5.0);
        }
    }

    #[tokio::test]
    async fn test_sector_diversity_cap() {
        let (screener, market, _dir) = fixture().await;
        let symbols = ["AAA", "BBB", "CCC", "DDD", "EEE"];
        market.set_gainers(
            symbols
                .iter()
                .map(|s| quote(s, 5.0, 4.5, 800_000))
                .collect(),
        );
        for s in symbols {
            market.set_sector(Ticker::new(s).unwrap(), "energy");
        }

        let list = screener.refresh(now()).await.unwrap();
        assert_eq!(list.entries.len(), 3); // max 3 per sector
        assert!(list.entries.iter().all(|e| e.sector == "energy"));
    }

    #[tokio::test]
    async fn test_relative_volume_from_prior_days() {
        let (screener, market, _dir) = fixture().await;
        let siri = Ticker::new("SIRI").unwrap();
        market.set_gainers(vec![quote("SIRI", 5.50, 5.0, 1_000_000)]);
        market.set_sector(siri.clone(), "technology");

        // Three prior sessions averaging 250k shares
        let daily: Vec<crate::market::Bar> = (1..=3)
            .map(|d| {
                crate::market::Bar::new(
                    siri.clone(),
                    crate::market::Interval::OneDay,
                    now() - chrono::Duration::days(d),
                    5.0,
                    5.2,
                    4.8,
                    5.1,
                    250_000,
                )
                .unwrap()
            })
            .collect();
        market.set_bars(siri, crate::market::Interval::OneDay, daily);

        let list = screener.refresh(now()).await.unwrap();
        assert_eq!(list.entries.len(), 1);
        assert!((list.entries[0].relative_volume - 4.0).abs() < 1e-9);
        // 4 (change) + 3 (rel vol > 3) + 3 (band) = 10
        assert_eq!(list.entries[0].momentum_score, 10.0);
    }

    #[tokio::test]
    async fn test_degraded_fallback_serves_previous_list() {
        let (screener, market, _dir) = fixture().await;
        market.set_gainers(vec![quote("SIRI", 5.50, 5.0, 900_000)]);
        market.set_sector(Ticker::new("SIRI").unwrap(), "technology");

        let first = screener.refresh(now()).await.unwrap();
        assert_eq!(first.entries.len(), 1);

        market.set_outage(Some("upstream 503"));
        let fallback = screener.refresh(now()).await.unwrap();
        assert!(fallback.degraded);
        assert!(screener.is_degraded());
        assert_eq!(fallback.entries.len(), 1);
        assert_eq!(fallback.entries[0].ticker.as_str(), "SIRI");

        // Recovery clears the flag
        market.set_outage(None);
        let recovered = screener.refresh(now()).await.unwrap();
        assert!(!recovered.degraded);
        assert!(!screener.is_degraded());
    }
}
