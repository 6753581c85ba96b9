//! Notifier port
//!
//! Outbound formatted messages and inbound user replies. Replies carry an
//! optional correlation id that routes them to a pending confirmation;
//! uncorrelated replies are dropped by the confirmation broker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Identifier of a delivered message
pub type MessageId = Uuid;

/// An inbound user reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub correlation_id: Option<Uuid>,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Outbound message delivery
#[async_trait]
pub trait NotifierPort: Send + Sync {
    /// Deliver a message. Markdown-like formatting is allowed but
    /// non-essential. Identical texts sent within the dedup window may be
    /// suppressed; suppressed sends still return a message id.
    async fn send(&self, text: &str, correlation_id: Option<Uuid>) -> Result<MessageId>;
}

/// An outbound message captured by `ChannelNotifier`
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub id: MessageId,
    pub text: String,
    pub correlation_id: Option<Uuid>,
}

/// Channel-backed notifier used for paper mode and tests. Outbound messages
/// go to an mpsc channel; inbound replies are injected through
/// `reply_sender()`.
pub struct ChannelNotifier {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    reply_tx: mpsc::UnboundedSender<Reply>,
    dedup_window: Duration,
    last_sent: Mutex<Option<(String, Instant)>>,
}

impl ChannelNotifier {
    /// Returns the notifier plus the outbound message stream and the inbound
    /// reply stream (to be wired into the confirmation broker).
    pub fn new(
        dedup_window: Duration,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<OutboundMessage>,
        mpsc::UnboundedReceiver<Reply>,
    ) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound,
                reply_tx,
                dedup_window,
                last_sent: Mutex::new(None),
            },
            outbound_rx,
            reply_rx,
        )
    }

    /// Sender half for injecting user replies
    pub fn reply_sender(&self) -> mpsc::UnboundedSender<Reply> {
        self.reply_tx.clone()
    }
}

#[async_trait]
impl NotifierPort for ChannelNotifier {
    async fn send(&self, text: &str, correlation_id: Option<Uuid>) -> Result<MessageId> {
        let id = Uuid::new_v4();

        {
            let mut last = self.last_sent.lock().unwrap();
            if let Some((prev_text, at)) = last.as_ref() {
                if prev_text == text && at.elapsed() < self.dedup_window {
                    debug!("Deduplicated notifier message within window");
                    return Ok(id);
                }
            }
            *last = Some((text.to_string(), Instant::now()));
        }

        self.outbound
            .send(OutboundMessage {
                id,
                text: text.to_string(),
                correlation_id,
            })
            .map_err(|e| Error::NotifierSend(e.to_string()))?;
        Ok(id)
    }
}
