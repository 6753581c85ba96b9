//! Market data port
//!
//! Read-only view over external quotes, bars, movers, and ticker reference
//! data. All operations are idempotent and safe for concurrent calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::MarketSession;
use crate::error::{Error, Result};
use crate::market::{Bar, Interval, Quote, Ticker};

/// Quote freshness limit while the market is open
pub const FRESHNESS_OPEN_SECS: i64 = 60;
/// Quote freshness limit outside market hours
pub const FRESHNESS_CLOSED_SECS: i64 = 900;

/// Read-only market data operations
#[async_trait]
pub trait MarketDataPort: Send + Sync {
    /// Latest consolidated quote. Fails with `DataUnavailable` when no
    /// sufficiently fresh quote exists.
    async fn snapshot(&self, ticker: &Ticker) -> Result<Quote>;

    /// Historical bars ordered ascending by start time; gaps allowed.
    async fn bars(
        &self,
        ticker: &Ticker,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>>;

    /// Ranked shallow quotes for the day's top gainers
    async fn gainers(&self) -> Result<Vec<Quote>>;

    /// Ranked shallow quotes for the day's top losers
    async fn losers(&self) -> Result<Vec<Quote>>;

    /// Free-form sector label; implementations cache this.
    async fn sector(&self, ticker: &Ticker) -> Result<String>;
}

/// Check a quote against the session-dependent freshness rule
pub fn ensure_fresh(quote: &Quote, now: DateTime<Utc>, session: MarketSession) -> Result<()> {
    let limit = if session.is_open() {
        FRESHNESS_OPEN_SECS
    } else {
        FRESHNESS_CLOSED_SECS
    };
    let age = quote.age_secs(now);
    if age > limit {
        return Err(Error::StaleQuote {
            ticker: quote.ticker.to_string(),
            age_secs: age,
        });
    }
    Ok(())
}

// =============================================================================
// Scripted fixture (paper mode and tests)
// =============================================================================

/// In-memory market data backed by scripted tables. Doubles as the paper-mode
/// data source and the deterministic test fixture.
#[derive(Default)]
pub struct StaticMarketData {
    quotes: DashMap<Ticker, Quote>,
    bars: DashMap<(Ticker, Interval), Vec<Bar>>,
    sectors: DashMap<Ticker, String>,
    gainers: std::sync::RwLock<Vec<Quote>>,
    losers: std::sync::RwLock<Vec<Quote>>,
    /// When set, every call fails with this error kind (degradation drills)
    outage: std::sync::RwLock<Option<String>>,
}

impl StaticMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_quote(&self, quote: Quote) {
        self.quotes.insert(quote.ticker.clone(), quote);
    }

    pub fn set_bars(&self, ticker: Ticker, interval: Interval, bars: Vec<Bar>) {
        self.bars.insert((ticker, interval), bars);
    }

    pub fn set_sector(&self, ticker: Ticker, sector: impl Into<String>) {
        self.sectors.insert(ticker, sector.into());
    }

    pub fn set_gainers(&self, quotes: Vec<Quote>) {
        *self.gainers.write().unwrap() = quotes;
    }

    pub fn set_losers(&self, quotes: Vec<Quote>) {
        *self.losers.write().unwrap() = quotes;
    }

    /// Simulate an upstream outage; pass `None` to recover
    pub fn set_outage(&self, reason: Option<&str>) {
        *self.outage.write().unwrap() = reason.map(str::to_string);
    }

    fn check_outage(&self) -> Result<()> {
        if let Some(reason) = self.outage.read().unwrap().as_ref() {
            return Err(Error::DataUnavailable(reason.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl MarketDataPort for StaticMarketData {
    async fn snapshot(&self, ticker: &Ticker) -> Result<Quote> {
        self.check_outage()?;
        self.quotes
            .get(ticker)
            .map(|q| q.clone())
            .ok_or_else(|| Error::DataUnavailable(format!("no quote for {ticker}")))
    }

    async fn bars(
        &self,
        ticker: &Ticker,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        self.check_outage()?;
        let window = self
            .bars
            .get(&(ticker.clone(), interval))
            .map(|b| {
                b.iter()
                    .filter(|bar| bar.start >= from && bar.start <= to)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(window)
    }

    async fn gainers(&self) -> Result<Vec<Quote>> {
        self.check_outage()?;
        Ok(self.gainers.read().unwrap().clone())
    }

    async fn losers(&self) -> Result<Vec<Quote>> {
        self.check_outage()?;
        Ok(self.losers.read().unwrap().clone())
    }

    async fn sector(&self, ticker: &Ticker) -> Result<String> {
        self.check_outage()?;
        Ok(self
            .sectors
            .get(ticker)
            .map(|s| s.clone())
            .unwrap_or_else(|| "unknown".to_string()))
    }
}

// =============================================================================
// REST implementation
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
struct RestQuote {
    symbol: String,
    #[serde(rename = "updatedAt")]
    updated_at: DateTime<Utc>,
    last: f64,
    bid: f64,
    ask: f64,
    volume: u64,
    open: f64,
    high: f64,
    low: f64,
    #[serde(rename = "prevClose")]
    prev_close: f64,
}

impl RestQuote {
    fn into_quote(self) -> Result<Quote> {
        Quote {
            ticker: Ticker::new(&self.symbol)?,
            timestamp: self.updated_at,
            last: self.last,
            bid: self.bid,
            ask: self.ask,
            session_volume: self.volume,
            day_open: self.open,
            day_high: self.high,
            day_low: self.low,
            prev_close: self.prev_close,
        }
        .validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RestBar {
    #[serde(rename = "t")]
    start: DateTime<Utc>,
    #[serde(rename = "o")]
    open: f64,
    #[serde(rename = "h")]
    high: f64,
    #[serde(rename = "l")]
    low: f64,
    #[serde(rename = "c")]
    close: f64,
    #[serde(rename = "v")]
    volume: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct RestBarsResponse {
    bars: Option<Vec<RestBar>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RestMoversResponse {
    quotes: Option<Vec<RestQuote>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RestTickerDetail {
    sector: Option<String>,
}

/// REST-backed market data client with a cached sector lookup. Every call
/// carries a hard deadline; bulk bar fetches get the longer one.
pub struct RestMarketData {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    deadline: std::time::Duration,
    bulk_deadline: std::time::Duration,
    sector_cache: Arc<DashMap<Ticker, String>>,
}

impl RestMarketData {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::with_deadlines(base_url, api_key, 5_000, 30_000)
    }

    pub fn with_deadlines(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        deadline_ms: u64,
        bulk_deadline_ms: u64,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            deadline: std::time::Duration::from_millis(deadline_ms),
            bulk_deadline: std::time::Duration::from_millis(bulk_deadline_ms),
            sector_cache: Arc::new(DashMap::new()),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        deadline: std::time::Duration,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);
        let resp = self
            .client
            .get(&url)
            .timeout(deadline)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(deadline.as_millis() as u64)
                } else {
                    Error::DataUnavailable(e.to_string())
                }
            })?;

        if resp.status().as_u16() == 429 {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(Error::RateLimited {
                service: "market_data".into(),
                retry_after_ms,
            });
        }
        if !resp.status().is_success() {
            return Err(Error::DataUnavailable(format!(
                "{} returned {}",
                path,
                resp.status()
            )));
        }

        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl MarketDataPort for RestMarketData {
    async fn snapshot(&self, ticker: &Ticker) -> Result<Quote> {
        let raw: RestQuote = self
            .get_json(&format!("/v1/quotes/{ticker}"), self.deadline)
            .await?;
        raw.into_quote()
    }

    async fn bars(
        &self,
        ticker: &Ticker,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        let raw: RestBarsResponse = self
            .get_json(
                &format!(
                    "/v1/bars/{ticker}?interval={interval}&from={}&to={}",
                    from.timestamp(),
                    to.timestamp()
                ),
                self.bulk_deadline,
            )
            .await?;

        let mut out = Vec::new();
        for rb in raw.bars.unwrap_or_default() {
            match Bar::new(
                ticker.clone(),
                interval,
                rb.start,
                rb.open,
                rb.high,
                rb.low,
                rb.close,
                rb.volume,
            ) {
                Ok(bar) => out.push(bar),
                Err(e) => warn!("Dropping malformed bar for {}: {}", ticker, e),
            }
        }
        out.sort_by_key(|b| b.start);
        Ok(out)
    }

    async fn gainers(&self) -> Result<Vec<Quote>> {
        let raw: RestMoversResponse = self.get_json("/v1/movers/gainers", self.deadline).await?;
        Ok(raw
            .quotes
            .unwrap_or_default()
            .into_iter()
            .filter_map(|q| q.into_quote().ok())
            .collect())
    }

    async fn losers(&self) -> Result<Vec<Quote>> {
        let raw: RestMoversResponse = self.get_json("/v1/movers/losers", self.deadline).await?;
        Ok(raw
            .quotes
            .unwrap_or_default()
            .into_iter()
            .filter_map(|q| q.into_quote().ok())
            .collect())
    }

    async fn sector(&self, ticker: &Ticker) -> Result<String> {
        if let Some(cached) = self.sector_cache.get(ticker) {
            return Ok(cached.clone());
        }
        let raw: RestTickerDetail = self
            .get_json(&format!("/v1/tickers/{ticker}"), self.deadline)
            .await?;
        let sector = raw.sector.unwrap_or_else(|| "unknown".to_string());
        self.sector_cache.insert(ticker.clone(), sector.clone());
        Ok(sector)
    }
}
