//! Confirmation broker
//!
//! Mediates whether a recommendation becomes an order. Auto mode goes
//! straight to the broker; interactive mode asks the user through the
//! notifier and waits out a timeout; notify-only emits the message and
//! expires immediately. Replies route by correlation id; late or unmatched
//! replies are dropped with a warning.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{ConfirmationConfig, TradingConfig};
use crate::error::Result;
use crate::journal::{Family, JournalStore};
use crate::ports::broker::{idempotency_key, submit_with_retry, BrokerPort};
use crate::ports::notifier::{NotifierPort, Reply};
use crate::recommender::Recommendation;

/// Execution mode resolved from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationMode {
    Auto,
    Interactive,
    NotifyOnly,
}

impl ConfirmationMode {
    pub fn from_config(trading: &TradingConfig) -> Self {
        if trading.auto_trading_enabled {
            ConfirmationMode::Auto
        } else if trading.interactive_trading_enabled {
            ConfirmationMode::Interactive
        } else {
            ConfirmationMode::NotifyOnly
        }
    }
}

/// Terminal state of a confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ConfirmationOutcome {
    Executed {
        order_id: String,
        fill_price: f64,
    },
    Rejected {
        reason: String,
    },
    Expired,
}

/// Journaled state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfirmationTransition {
    correlation_id: Uuid,
    recommendation_id: Uuid,
    decision_id: Uuid,
    ticker: String,
    transition: String,
    detail: Option<String>,
    at: DateTime<Utc>,
}

/// Affirmative reply vocabulary
const AFFIRMATIVE_TOKENS: &[&str] = &[
    "yes", "y", "buy", "go", "execute", "confirm", "ok", "okay", "proceed", "sell", "exit",
    "close",
];
const AFFIRMATIVE_PHRASES: &[&str] = &["do it", "send it", "place order", "buy it", "sell it"];

/// Negative reply vocabulary
const NEGATIVE_TOKENS: &[&str] = &["no", "n", "skip", "cancel", "reject", "pass", "stop"];
const NEGATIVE_PHRASES: &[&str] = &["don't", "do not", "hold off", "no thanks"];

/// Whole-token or phrase match, case-insensitive
fn matches_vocabulary(text: &str, tokens: &[&str], phrases: &[&str]) -> bool {
    let lowered = text.to_lowercase();
    if phrases.iter().any(|p| lowered.contains(p)) {
        return true;
    }
    lowered
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
        .any(|t| tokens.contains(&t))
}

pub fn is_affirmative(text: &str) -> bool {
    matches_vocabulary(text, AFFIRMATIVE_TOKENS, AFFIRMATIVE_PHRASES)
}

pub fn is_negative(text: &str) -> bool {
    matches_vocabulary(text, NEGATIVE_TOKENS, NEGATIVE_PHRASES)
}

struct Pending {
    reply_tx: mpsc::UnboundedSender<Reply>,
    deadline: DateTime<Utc>,
    ticker: String,
}

/// The confirmation broker
pub struct ConfirmationBroker {
    broker: Arc<dyn BrokerPort>,
    notifier: Arc<dyn NotifierPort>,
    journal: Arc<JournalStore>,
    clock: Arc<dyn Clock>,
    config: ConfirmationConfig,
    pending: DashMap<Uuid, Pending>,
}

impl ConfirmationBroker {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        notifier: Arc<dyn NotifierPort>,
        journal: Arc<JournalStore>,
        clock: Arc<dyn Clock>,
        config: ConfirmationConfig,
    ) -> Self {
        Self {
            broker,
            notifier,
            journal,
            clock,
            config,
            pending: DashMap::new(),
        }
    }

    /// Route an inbound reply to its pending confirmation. Unmatched and
    /// late replies are dropped with a warning.
    pub fn handle_reply(&self, reply: Reply) {
        let Some(correlation_id) = reply.correlation_id else {
            warn!("Dropping uncorrelated reply: {:?}", reply.text);
            return;
        };
        match self.pending.get(&correlation_id) {
            Some(entry) => {
                if entry.reply_tx.send(reply).is_err() {
                    warn!(
                        "Dropping late reply for {} ({})",
                        entry.ticker, correlation_id
                    );
                }
            }
            None => {
                warn!("Dropping late or unmatched reply for {}", correlation_id);
            }
        }
    }

    /// Number of confirmations currently awaiting replies
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Remove pending entries past their deadline. The waiting task
    /// normally expires itself; this catches entries orphaned by a canceled
    /// sweep.
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> usize {
        let stale: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|e| e.deadline < now)
            .map(|e| *e.key())
            .collect();
        for id in &stale {
            self.pending.remove(id);
            debug!("Swept expired confirmation {}", id);
        }
        stale.len()
    }

    /// Drive a recommendation through the state machine to a terminal state
    pub async fn submit(
        &self,
        recommendation: &Recommendation,
        mode: ConfirmationMode,
        now: DateTime<Utc>,
    ) -> Result<ConfirmationOutcome> {
        let correlation_id = Uuid::new_v4();
        self.record_transition(correlation_id, recommendation, "proposed", None, now)
            .await?;

        let outcome = match mode {
            ConfirmationMode::Auto => self.execute(recommendation).await?,
            ConfirmationMode::Interactive => {
                self.interactive(correlation_id, recommendation, now).await?
            }
            ConfirmationMode::NotifyOnly => {
                self.notifier
                    .send(&format_proposal(recommendation, false), Some(correlation_id))
                    .await?;
                ConfirmationOutcome::Expired
            }
        };

        let (transition, detail) = match &outcome {
            ConfirmationOutcome::Executed { order_id, .. } => {
                ("executed".to_string(), Some(order_id.clone()))
            }
            ConfirmationOutcome::Rejected { reason } => {
                ("rejected".to_string(), Some(reason.clone()))
            }
            ConfirmationOutcome::Expired => ("expired".to_string(), None),
        };
        self.record_transition(
            correlation_id,
            recommendation,
            &transition,
            detail,
            self.clock.now(),
        )
        .await?;
        Ok(outcome)
    }

    /// Interactive path: ask, then wait out the timeout for a matching reply
    async fn interactive(
        &self,
        correlation_id: Uuid,
        recommendation: &Recommendation,
        now: DateTime<Utc>,
    ) -> Result<ConfirmationOutcome> {
        let timeout = Duration::from_secs(self.config.trade_confirmation_timeout_seconds);
        let deadline = now + chrono::Duration::seconds(timeout.as_secs() as i64);

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        self.pending.insert(
            correlation_id,
            Pending {
                reply_tx,
                deadline,
                ticker: recommendation.ticker.to_string(),
            },
        );

        self.notifier
            .send(&format_proposal(recommendation, true), Some(correlation_id))
            .await?;

        let wait_until = tokio::time::Instant::now() + timeout;
        let outcome = loop {
            match tokio::time::timeout_at(wait_until, reply_rx.recv()).await {
                Ok(Some(reply)) => {
                    // Negation wins: "don't buy it" contains an affirmative
                    // phrase but must never place an order.
                    if is_negative(&reply.text) {
                        info!(
                            "Confirmation for {} declined: {:?}",
                            recommendation.ticker, reply.text
                        );
                        break ConfirmationOutcome::Rejected {
                            reason: format!("declined: {}", reply.text),
                        };
                    } else if is_affirmative(&reply.text) {
                        info!(
                            "Confirmation for {} affirmed: {:?}",
                            recommendation.ticker, reply.text
                        );
                        break self.execute(recommendation).await?;
                    } else {
                        debug!("Ignoring non-matching reply: {:?}", reply.text);
                    }
                }
                Ok(None) => {
                    break ConfirmationOutcome::Expired;
                }
                Err(_) => {
                    info!(
                        "Confirmation for {} expired after {}s",
                        recommendation.ticker, timeout.as_secs()
                    );
                    break ConfirmationOutcome::Expired;
                }
            }
        };

        // Replies arriving from here on are late and get dropped
        self.pending.remove(&correlation_id);
        Ok(outcome)
    }

    /// Place the buy. Transient submission failures retry with backoff;
    /// broker-domain rejections surface as Rejected.
    async fn execute(&self, recommendation: &Recommendation) -> Result<ConfirmationOutcome> {
        let key = idempotency_key(&recommendation.id.to_string());
        let broker = self.broker.clone();
        let ticker = recommendation.ticker.clone();
        let shares = recommendation.shares;
        let limit = recommendation.entry;

        let result = submit_with_retry(|| {
            let broker = broker.clone();
            let ticker = ticker.clone();
            let key = key.clone();
            async move { broker.place_buy(&ticker, shares, Some(limit), &key).await }
        })
        .await;

        match result {
            Ok(ack) => {
                let fill_price = ack.fill_price.unwrap_or(limit);
                self.notifier
                    .send(
                        &format!(
                            "Bought {} x{} @ {:.2} (order {})",
                            recommendation.ticker, shares, fill_price, ack.order_id
                        ),
                        None,
                    )
                    .await
                    .ok();
                Ok(ConfirmationOutcome::Executed {
                    order_id: ack.order_id,
                    fill_price,
                })
            }
            Err(e) if e.is_broker_domain() || e.is_transient() => {
                warn!("Buy failed for {}: {}", recommendation.ticker, e);
                self.notifier
                    .send(
                        &format!("Order for {} failed: {}", recommendation.ticker, e),
                        None,
                    )
                    .await
                    .ok();
                Ok(ConfirmationOutcome::Rejected {
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn record_transition(
        &self,
        correlation_id: Uuid,
        recommendation: &Recommendation,
        transition: &str,
        detail: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let record = ConfirmationTransition {
            correlation_id,
            recommendation_id: recommendation.id,
            decision_id: recommendation.decision_id,
            ticker: recommendation.ticker.to_string(),
            transition: transition.to_string(),
            detail,
            at,
        };
        self.journal
            .append(Family::AgentLogs, Uuid::new_v4(), at, &record)
            .await
    }
}

/// Format the outbound proposal message
fn format_proposal(rec: &Recommendation, interactive: bool) -> String {
    let mut msg = format!(
        "*{}* long {} shares @ {:.2}\nstop {:.2} | target {:.2} | R/R {:.2}\nconfidence {:.1}/10, expected move {:.1}% over ~{:.0}h",
        rec.ticker,
        rec.shares,
        rec.entry,
        rec.stop_loss,
        rec.take_profit,
        rec.risk_reward,
        rec.confidence,
        rec.expected_move_pct * 100.0,
        rec.expected_duration_hours,
    );
    if !rec.key_factors.is_empty() {
        msg.push_str(&format!("\nkey: {}", rec.key_factors.join(", ")));
    }
    if !rec.risk_factors.is_empty() {
        msg.push_str(&format!("\nrisks: {}", rec.risk_factors.join(", ")));
    }
    if interactive {
        msg.push_str("\nReply yes/no to execute.");
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{PredictedDirection, SetupType};
    use crate::market::Ticker;
    use crate::ports::broker::PaperBroker;
    use crate::ports::notifier::ChannelNotifier;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 15, 0, 0).unwrap()
    }

    fn recommendation(symbol: &str, entry: f64) -> Recommendation {
        Recommendation {
            id: Uuid::new_v4(),
            ticker: Ticker::new(symbol).unwrap(),
            direction: PredictedDirection::Up,
            entry,
            stop_loss: entry * 0.97,
            take_profit: entry * 1.06,
            shares: 100,
            size_fraction: 0.10,
            confidence: 9.3,
            expected_move_pct: 0.06,
            expected_duration_hours: 4.0,
            risk_reward: 2.0,
            valid_until: now() + chrono::Duration::minutes(30),
            key_factors: vec!["momentum_divergence (+1.20)".into()],
            risk_factors: vec![],
            success_probability: 0.72,
            setup_type: SetupType::Momentum,
            decision_id: Uuid::new_v4(),
            prediction_id: Uuid::new_v4(),
            created_at: now(),
        }
    }

    async fn fixture(
        timeout_secs: u64,
    ) -> (
        Arc<ConfirmationBroker>,
        Arc<PaperBroker>,
        Arc<ChannelNotifier>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(JournalStore::open(dir.path(), 90).await.unwrap());
        let broker = Arc::new(PaperBroker::new(100_000.0));
        let (notifier, mut outbound, _replies) = ChannelNotifier::new(Duration::from_secs(2));
        tokio::spawn(async move { while outbound.recv().await.is_some() {} });
        let notifier = Arc::new(notifier);
        let config = ConfirmationConfig {
            trade_confirmation_timeout_seconds: timeout_secs,
        };
        let confirm = Arc::new(ConfirmationBroker::new(
            broker.clone(),
            notifier.clone(),
            journal,
            Arc::new(crate::clock::SystemClock),
            config,
        ));
        (confirm, broker, notifier, dir)
    }

    #[test]
    fn test_reply_vocabulary() {
        for text in ["yes", "Y", "BUY", "ok let's go", "do it now", "place order please"] {
            assert!(is_affirmative(text), "{text}");
        }
        for text in ["no", "N", "cancel that", "hold off for now", "pass"] {
            assert!(is_negative(text), "{text}");
        }
        // Not a whole-token match
        assert!(!is_affirmative("maybe nothing"));
        assert!(!is_negative("notable"));
        // A negated affirmative matches both vocabularies; the state
        // machine resolves it by checking negation first
        for text in ["don't buy it", "do not send it", "don't do it"] {
            assert!(is_negative(text), "{text}");
            assert!(is_affirmative(text), "{text}");
        }
    }

    #[test]
    fn test_mode_resolution() {
        let mut trading = crate::config::TradingConfig::default();
        assert_eq!(
            ConfirmationMode::from_config(&trading),
            ConfirmationMode::Interactive
        );
        trading.auto_trading_enabled = true;
        assert_eq!(ConfirmationMode::from_config(&trading), ConfirmationMode::Auto);
        trading.auto_trading_enabled = false;
        trading.interactive_trading_enabled = false;
        assert_eq!(
            ConfirmationMode::from_config(&trading),
            ConfirmationMode::NotifyOnly
        );
    }

    #[tokio::test]
    async fn test_auto_mode_executes() {
        let (confirm, broker, _notifier, _dir) = fixture(30).await;
        let rec = recommendation("PLUG", 2.15);
        broker.set_price(&rec.ticker, 2.15);

        let outcome = confirm
            .submit(&rec, ConfirmationMode::Auto, now())
            .await
            .unwrap();
        assert!(matches!(outcome, ConfirmationOutcome::Executed { .. }));
        assert_eq!(broker.list_positions().await.unwrap()[0].qty, 100);
    }

    #[tokio::test]
    async fn test_auto_mode_rejection_on_insufficient_funds() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(JournalStore::open(dir.path(), 90).await.unwrap());
        let broker = Arc::new(PaperBroker::new(10.0));
        let (notifier, mut outbound, _replies) = ChannelNotifier::new(Duration::from_secs(2));
        tokio::spawn(async move { while outbound.recv().await.is_some() {} });
        let confirm = ConfirmationBroker::new(
            broker.clone(),
            Arc::new(notifier),
            journal,
            Arc::new(crate::clock::SystemClock),
            ConfirmationConfig::default(),
        );
        let rec = recommendation("PLUG", 2.15);
        broker.set_price(&rec.ticker, 2.15);

        let outcome = confirm
            .submit(&rec, ConfirmationMode::Auto, now())
            .await
            .unwrap();
        assert!(matches!(outcome, ConfirmationOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_interactive_affirmative_executes() {
        let (confirm, broker, _notifier, _dir) = fixture(5).await;
        let rec = recommendation("SIRI", 25.50);
        broker.set_price(&rec.ticker, 25.50);

        let submit = {
            let confirm = confirm.clone();
            let rec = rec.clone();
            tokio::spawn(async move {
                confirm
                    .submit(&rec, ConfirmationMode::Interactive, now())
                    .await
            })
        };

        // Wait for the pending entry, then reply affirmatively
        for _ in 0..50 {
            if confirm.pending_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let correlation_id = {
            let entry = confirm.pending.iter().next().expect("pending registered");
            *entry.key()
        };
        confirm.handle_reply(Reply {
            correlation_id: Some(correlation_id),
            text: "yes".into(),
            received_at: now(),
        });

        let outcome = submit.await.unwrap().unwrap();
        assert!(matches!(outcome, ConfirmationOutcome::Executed { .. }));
        assert_eq!(confirm.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_interactive_negative_rejects() {
        let (confirm, broker, _notifier, _dir) = fixture(5).await;
        let rec = recommendation("SIRI", 25.50);
        broker.set_price(&rec.ticker, 25.50);

        let submit = {
            let confirm = confirm.clone();
            let rec = rec.clone();
            tokio::spawn(async move {
                confirm
                    .submit(&rec, ConfirmationMode::Interactive, now())
                    .await
            })
        };
        for _ in 0..50 {
            if confirm.pending_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let correlation_id = *confirm.pending.iter().next().unwrap().key();
        confirm.handle_reply(Reply {
            correlation_id: Some(correlation_id),
            text: "no thanks".into(),
            received_at: now(),
        });

        let outcome = submit.await.unwrap().unwrap();
        assert!(matches!(outcome, ConfirmationOutcome::Rejected { .. }));
        // No order was placed
        assert!(broker.list_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_negated_affirmative_rejects() {
        let (confirm, broker, _notifier, _dir) = fixture(5).await;
        let rec = recommendation("SIRI", 25.50);
        broker.set_price(&rec.ticker, 25.50);

        let submit = {
            let confirm = confirm.clone();
            let rec = rec.clone();
            tokio::spawn(async move {
                confirm
                    .submit(&rec, ConfirmationMode::Interactive, now())
                    .await
            })
        };
        for _ in 0..50 {
            if confirm.pending_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let correlation_id = *confirm.pending.iter().next().unwrap().key();
        confirm.handle_reply(Reply {
            correlation_id: Some(correlation_id),
            text: "don't buy it".into(),
            received_at: now(),
        });

        let outcome = submit.await.unwrap().unwrap();
        assert!(matches!(outcome, ConfirmationOutcome::Rejected { .. }));
        // No order was placed
        assert!(broker.list_positions().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interactive_timeout_expires_and_late_reply_dropped() {
        let (confirm, broker, _notifier, _dir) = fixture(30).await;
        let rec = recommendation("AMC", 4.00);
        broker.set_price(&rec.ticker, 4.00);

        let submit = {
            let confirm = confirm.clone();
            let rec = rec.clone();
            tokio::spawn(async move {
                confirm
                    .submit(&rec, ConfirmationMode::Interactive, now())
                    .await
            })
        };
        // Let the submit task register and send, then pass the deadline
        for _ in 0..100 {
            if confirm.pending_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let correlation_id = *confirm.pending.iter().next().unwrap().key();
        tokio::time::advance(Duration::from_secs(31)).await;

        let outcome = submit.await.unwrap().unwrap();
        assert_eq!(outcome, ConfirmationOutcome::Expired);

        // A reply at T+45s is late: dropped, no order placed
        confirm.handle_reply(Reply {
            correlation_id: Some(correlation_id),
            text: "yes".into(),
            received_at: now() + chrono::Duration::seconds(45),
        });
        tokio::task::yield_now().await;
        assert!(broker.list_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notify_only_expires_immediately() {
        let (confirm, broker, _notifier, _dir) = fixture(30).await;
        let rec = recommendation("NOK", 3.85);
        broker.set_price(&rec.ticker, 3.85);

        let outcome = confirm
            .submit(&rec, ConfirmationMode::NotifyOnly, now())
            .await
            .unwrap();
        assert_eq!(outcome, ConfirmationOutcome::Expired);
        assert!(broker.list_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_matching_reply_keeps_waiting() {
        let (confirm, broker, _notifier, _dir) = fixture(5).await;
        let rec = recommendation("SIRI", 25.50);
        broker.set_price(&rec.ticker, 25.50);

        let submit = {
            let confirm = confirm.clone();
            let rec = rec.clone();
            tokio::spawn(async move {
                confirm
                    .submit(&rec, ConfirmationMode::Interactive, now())
                    .await
            })
        };
        for _ in 0..50 {
            if confirm.pending_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let correlation_id = *confirm.pending.iter().next().unwrap().key();

        // Chatter does not resolve the confirmation
        confirm.handle_reply(Reply {
            correlation_id: Some(correlation_id),
            text: "what's the float on this?".into(),
            received_at: now(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(confirm.pending_count(), 1);

        confirm.handle_reply(Reply {
            correlation_id: Some(correlation_id),
            text: "ok buy it".into(),
            received_at: now(),
        });
        let outcome = submit.await.unwrap().unwrap();
        assert!(matches!(outcome, ConfirmationOutcome::Executed { .. }));
    }
}
