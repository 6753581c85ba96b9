//! External ports: market data, broker, notifier
//!
//! Everything that leaves the process goes through one of these traits.
//! Implementations translate transport failures into the crate error
//! taxonomy; callers recover at the closest call site.

pub mod broker;
pub mod market_data;
pub mod notifier;

pub use broker::{AccountSnapshot, BrokerPort, BrokerPosition, Order, OrderAck, PaperBroker};
pub use market_data::{MarketDataPort, RestMarketData, StaticMarketData};
pub use notifier::{ChannelNotifier, NotifierPort, Reply};

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Enforce a hard deadline on a port call. Expiry surfaces as
/// `Error::Timeout` and is handled locally by the caller.
pub async fn with_deadline<T, F>(deadline_ms: u64, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(Duration::from_millis(deadline_ms), fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout(deadline_ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_expiry_is_timeout() {
        let res: Result<()> = with_deadline(10, async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(Error::Timeout(10))));
    }

    #[tokio::test]
    async fn test_deadline_passthrough() {
        let res = with_deadline(1000, async { Ok(42u32) }).await;
        assert_eq!(res.unwrap(), 42);
    }
}
