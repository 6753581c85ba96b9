//! Broker port
//!
//! Order placement and account state. Live trading talks to the broker REST
//! API; paper trading and tests use `PaperBroker`, which fills orders
//! in-memory with realistic slippage and enforces idempotency keys the same
//! way the live endpoint does.

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::market::Ticker;

/// Account state snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub buying_power: f64,
    pub cash: f64,
    pub portfolio_value: f64,
    pub day_trade_count: u32,
    pub blocked: bool,
}

/// A position as the broker reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: u64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
}

/// Acknowledgement of an accepted order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub accepted_at: DateTime<Utc>,
    /// Fill price when immediately filled (paper mode always fills)
    pub fill_price: Option<f64>,
}

/// Order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Accepted,
    Filled,
    Canceled,
    Rejected,
}

/// An order as the broker reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub shares: u64,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
    pub fill_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Broker operations
#[async_trait]
pub trait BrokerPort: Send + Sync {
    async fn get_account(&self) -> Result<AccountSnapshot>;

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>>;

    /// Place a buy. Must be idempotent for a given `idempotency_key`:
    /// resubmitting with the same key returns the original acknowledgement
    /// and creates no second order.
    async fn place_buy(
        &self,
        ticker: &Ticker,
        shares: u64,
        limit: Option<f64>,
        idempotency_key: &str,
    ) -> Result<OrderAck>;

    async fn place_sell(&self, ticker: &Ticker, shares: u64) -> Result<OrderAck>;

    async fn list_orders(&self, status: Option<OrderStatus>, limit: usize) -> Result<Vec<Order>>;
}

/// Derive a stable idempotency key from a recommendation id
pub fn idempotency_key(recommendation_id: &str) -> String {
    let digest = Sha256::digest(recommendation_id.as_bytes());
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes
        .iter()
        .take(n)
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
}

/// Retry a transient broker submission with exponential backoff.
/// Broker-domain rejections are returned immediately.
pub async fn submit_with_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut policy = ExponentialBackoff {
        initial_interval: Duration::from_millis(200),
        max_interval: Duration::from_secs(2),
        max_elapsed_time: Some(Duration::from_secs(8)),
        ..Default::default()
    };
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => match backoff::backoff::Backoff::next_backoff(&mut policy)
            {
                Some(delay) => {
                    warn!("Transient broker error, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Paper broker
// =============================================================================

struct PaperState {
    cash: f64,
    positions: std::collections::HashMap<String, (u64, f64)>, // qty, avg entry
    orders: Vec<Order>,
    day_trade_count: u32,
}

/// In-memory sandbox broker. Fills immediately at the scripted price (or the
/// limit) with a small random slippage.
pub struct PaperBroker {
    state: Mutex<PaperState>,
    prices: DashMap<String, f64>,
    idempotency: DashMap<String, OrderAck>,
    /// Maximum random slippage as a fraction of price
    slippage: f64,
    blocked: std::sync::atomic::AtomicBool,
}

impl PaperBroker {
    pub fn new(starting_cash: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                cash: starting_cash,
                positions: std::collections::HashMap::new(),
                orders: Vec::new(),
                day_trade_count: 0,
            }),
            prices: DashMap::new(),
            idempotency: DashMap::new(),
            slippage: 0.001,
            blocked: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Script the current market price used for fills
    pub fn set_price(&self, ticker: &Ticker, price: f64) {
        self.prices.insert(ticker.to_string(), price);
    }

    /// Block or unblock the account (drills)
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked
            .store(blocked, std::sync::atomic::Ordering::SeqCst);
    }

    fn fill_price(&self, ticker: &Ticker, limit: Option<f64>, side: OrderSide) -> Result<f64> {
        if let Some(limit) = limit {
            return Ok(limit);
        }
        let base = self
            .prices
            .get(ticker.as_str())
            .map(|p| *p)
            .ok_or_else(|| Error::DataUnavailable(format!("no paper price for {ticker}")))?;
        // Slippage works against the taker
        let jitter = rand::thread_rng().gen_range(0.0..self.slippage);
        let filled = match side {
            OrderSide::Buy => base * (1.0 + jitter),
            OrderSide::Sell => base * (1.0 - jitter),
        };
        Ok((filled * 10_000.0).round() / 10_000.0)
    }

    fn next_order_id(orders: &[Order]) -> String {
        format!("paper-{:06}", orders.len() + 1)
    }
}

#[async_trait]
impl BrokerPort for PaperBroker {
    async fn get_account(&self) -> Result<AccountSnapshot> {
        let state = self.state.lock().unwrap();
        let positions_value: f64 = state
            .positions
            .iter()
            .map(|(symbol, (qty, avg))| {
                let price = self.prices.get(symbol).map(|p| *p).unwrap_or(*avg);
                *qty as f64 * price
            })
            .sum();
        Ok(AccountSnapshot {
            buying_power: state.cash,
            cash: state.cash,
            portfolio_value: state.cash + positions_value,
            day_trade_count: state.day_trade_count,
            blocked: self.blocked.load(std::sync::atomic::Ordering::SeqCst),
        })
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .positions
            .iter()
            .filter(|(_, (qty, _))| *qty > 0)
            .map(|(symbol, (qty, avg))| {
                let price = self.prices.get(symbol).map(|p| *p).unwrap_or(*avg);
                let market_value = *qty as f64 * price;
                let cost = *qty as f64 * avg;
                BrokerPosition {
                    symbol: symbol.clone(),
                    qty: *qty,
                    avg_entry_price: *avg,
                    current_price: price,
                    market_value,
                    unrealized_pnl: market_value - cost,
                    unrealized_pnl_pct: if cost > 0.0 {
                        (market_value - cost) / cost
                    } else {
                        0.0
                    },
                }
            })
            .collect())
    }

    async fn place_buy(
        &self,
        ticker: &Ticker,
        shares: u64,
        limit: Option<f64>,
        idempotency_key: &str,
    ) -> Result<OrderAck> {
        if let Some(prior) = self.idempotency.get(idempotency_key) {
            debug!(
                "Duplicate buy for key {} returned prior ack {}",
                idempotency_key, prior.order_id
            );
            return Ok(prior.clone());
        }
        if self.blocked.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Rejected("account blocked".into()));
        }
        if shares == 0 {
            return Err(Error::Rejected("zero shares".into()));
        }

        let price = self.fill_price(ticker, limit, OrderSide::Buy)?;
        let cost = price * shares as f64;

        let mut state = self.state.lock().unwrap();
        if cost > state.cash {
            return Err(Error::InsufficientBuyingPower {
                required: cost,
                available: state.cash,
            });
        }
        state.cash -= cost;
        let entry = state
            .positions
            .entry(ticker.to_string())
            .or_insert((0, 0.0));
        let total_cost = entry.0 as f64 * entry.1 + cost;
        entry.0 += shares;
        entry.1 = total_cost / entry.0 as f64;

        let order_id = Self::next_order_id(&state.orders);
        let ack = OrderAck {
            order_id: order_id.clone(),
            accepted_at: Utc::now(),
            fill_price: Some(price),
        };
        state.orders.push(Order {
            order_id,
            symbol: ticker.to_string(),
            side: OrderSide::Buy,
            shares,
            status: OrderStatus::Filled,
            submitted_at: ack.accepted_at,
            fill_price: Some(price),
        });
        state.day_trade_count += 1;

        self.idempotency
            .insert(idempotency_key.to_string(), ack.clone());
        info!(
            "Paper buy filled: {} x{} @ {:.4} (key {})",
            ticker, shares, price, idempotency_key
        );
        Ok(ack)
    }

    async fn place_sell(&self, ticker: &Ticker, shares: u64) -> Result<OrderAck> {
        if shares == 0 {
            return Err(Error::Rejected("zero shares".into()));
        }
        let price = self.fill_price(ticker, None, OrderSide::Sell)?;

        let mut state = self.state.lock().unwrap();
        let held = state
            .positions
            .get(ticker.as_str())
            .map(|(qty, _)| *qty)
            .unwrap_or(0);
        if held < shares {
            return Err(Error::Rejected(format!(
                "sell {shares} exceeds held {held} for {ticker}"
            )));
        }
        if let Some(entry) = state.positions.get_mut(ticker.as_str()) {
            entry.0 -= shares;
        }
        state.cash += price * shares as f64;

        let order_id = Self::next_order_id(&state.orders);
        let ack = OrderAck {
            order_id: order_id.clone(),
            accepted_at: Utc::now(),
            fill_price: Some(price),
        };
        state.orders.push(Order {
            order_id,
            symbol: ticker.to_string(),
            side: OrderSide::Sell,
            shares,
            status: OrderStatus::Filled,
            submitted_at: ack.accepted_at,
            fill_price: Some(price),
        });
        info!("Paper sell filled: {} x{} @ {:.4}", ticker, shares, price);
        Ok(ack)
    }

    async fn list_orders(&self, status: Option<OrderStatus>, limit: usize) -> Result<Vec<Order>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .orders
            .iter()
            .rev()
            .filter(|o| status.map_or(true, |s| o.status == s))
            .take(limit)
            .cloned()
            .collect())
    }
}
