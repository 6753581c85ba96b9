//! Journal store
//!
//! Append-only persistence of every decision, prediction, outcome, and
//! system event, one JSON-lines log per record family. Appends are durable
//! before returning; queries read a consistent in-memory snapshot
//! newest-first. The single sanctioned in-place mutation is
//! `update_outcome`, which augments a finalized decision with its realized
//! outcome.

pub mod records;

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

pub use records::{
    DecisionAction, DecisionContext, DecisionRecord, ExitReason, Family, JournalRecord,
    LearningCycleRecord, Outcome, PredictedDirection, Prediction, ReasoningStep, SetupType,
    WatchlistRecord, SCHEMA_VERSION,
};

/// Filter for journal queries
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Restrict to records whose payload `ticker` field matches
    pub ticker: Option<String>,
    /// Restrict to records created at or after this instant
    pub since: Option<DateTime<Utc>>,
}

struct FamilyLog {
    records: Vec<JournalRecord>,
    path: PathBuf,
}

/// The journal store. Writers serialize per family through an async mutex
/// held across the file write; readers take a brief std lock on the
/// in-memory copy and never wait on writer IO.
pub struct JournalStore {
    families: HashMap<Family, RwLock<FamilyLog>>,
    write_locks: HashMap<Family, tokio::sync::Mutex<()>>,
    dir: PathBuf,
    retention: Duration,
}

impl JournalStore {
    /// Open (or create) the journal under `dir`, loading any existing logs.
    pub async fn open(dir: impl AsRef<Path>, retention_days: i64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::JournalAppend(format!("create {}: {e}", dir.display())))?;

        let mut families = HashMap::new();
        let mut write_locks = HashMap::new();
        for family in Family::all() {
            let path = dir.join(format!("{}.jsonl", family.file_stem()));
            let records = Self::load_log(&path).await?;
            if !records.is_empty() {
                debug!("Loaded {} {} records", records.len(), family);
            }
            families.insert(family, RwLock::new(FamilyLog { records, path }));
            write_locks.insert(family, tokio::sync::Mutex::new(()));
        }

        info!("Journal open at {}", dir.display());
        Ok(Self {
            families,
            write_locks,
            dir,
            retention: Duration::days(retention_days),
        })
    }

    async fn load_log(path: &Path) -> Result<Vec<JournalRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(path).await?;
        let mut records = Vec::new();
        for (lineno, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(r) => records.push(r),
                Err(e) => warn!(
                    "Skipping corrupt journal line {}:{}: {}",
                    path.display(),
                    lineno + 1,
                    e
                ),
            }
        }
        Ok(records)
    }

    fn log(&self, family: Family) -> &RwLock<FamilyLog> {
        self.families
            .get(&family)
            .expect("every family is registered at open")
    }

    fn write_lock(&self, family: Family) -> &tokio::sync::Mutex<()> {
        self.write_locks
            .get(&family)
            .expect("every family is registered at open")
    }

    /// Append a record. Durable before returning; failure is fatal to the
    /// engine.
    pub async fn append<T: serde::Serialize>(
        &self,
        family: Family,
        id: Uuid,
        created_at: DateTime<Utc>,
        payload: &T,
    ) -> Result<()> {
        let payload = serde_json::to_value(payload)?;
        let record = JournalRecord::new(id, created_at, payload);
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        // Exclusive append per family; the record reaches disk before it
        // becomes visible to readers.
        let _write = self.write_lock(family).lock().await;
        let path = {
            let guard = self.log(family).read().unwrap();
            guard.path.clone()
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::JournalAppend(format!("{}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::JournalAppend(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| Error::JournalAppend(e.to_string()))?;

        self.log(family).write().unwrap().records.push(record);
        Ok(())
    }

    /// Query records newest-first
    pub fn query(&self, family: Family, filter: &QueryFilter, limit: usize) -> Vec<JournalRecord> {
        let guard = self.log(family).read().unwrap();
        guard
            .records
            .iter()
            .rev()
            .filter(|r| {
                if let Some(since) = filter.since {
                    if r.created_at < since {
                        return false;
                    }
                }
                if let Some(ticker) = &filter.ticker {
                    let matches = r
                        .payload
                        .get("ticker")
                        .and_then(|v| v.as_str())
                        .map(|t| t == ticker)
                        .unwrap_or(false);
                    if !matches {
                        return false;
                    }
                }
                true
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// Fetch one record by id
    pub fn get(&self, family: Family, id: Uuid) -> Option<JournalRecord> {
        let guard = self.log(family).read().unwrap();
        guard.records.iter().find(|r| r.id == id).cloned()
    }

    /// Typed deserialization helper over `query`
    pub fn query_as<T: serde::de::DeserializeOwned>(
        &self,
        family: Family,
        filter: &QueryFilter,
        limit: usize,
    ) -> Vec<T> {
        self.query(family, filter, limit)
            .into_iter()
            .filter_map(|r| serde_json::from_value(r.payload).ok())
            .collect()
    }

    /// The one sanctioned in-place update: augment a finalized decision with
    /// its realized outcome. Rewrites the decisions log.
    pub async fn update_outcome(&self, decision_id: Uuid, outcome: &Outcome) -> Result<()> {
        {
            let mut guard = self.log(Family::Decisions).write().unwrap();
            let record = guard
                .records
                .iter_mut()
                .find(|r| r.id == decision_id)
                .ok_or_else(|| Error::JournalRecordNotFound {
                    family: Family::Decisions.to_string(),
                    id: decision_id.to_string(),
                })?;

            let mut decision: DecisionRecord = serde_json::from_value(record.payload.clone())?;
            decision.actual_move_pct = Some(outcome.realized_move_pct);
            decision.actual_duration_hours = Some(outcome.realized_duration_hours);
            decision.accuracy_score = Some(outcome.accuracy_score);
            decision.outcome_success = Some(outcome.success);
            record.payload = serde_json::to_value(&decision)?;
        }
        self.rewrite(Family::Decisions).await
    }

    /// Prune prunable families beyond the retention window
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.retention;
        let mut pruned = 0usize;
        for family in Family::all() {
            if !family.prunable() {
                continue;
            }
            let removed = {
                let mut guard = self.log(family).write().unwrap();
                let before = guard.records.len();
                guard.records.retain(|r| r.created_at >= cutoff);
                before - guard.records.len()
            };
            if removed > 0 {
                self.rewrite(family).await?;
                debug!("Pruned {} {} records", removed, family);
                pruned += removed;
            }
        }
        Ok(pruned)
    }

    /// Rewrite one family log from the in-memory copy (temp file + rename)
    async fn rewrite(&self, family: Family) -> Result<()> {
        let _write = self.write_lock(family).lock().await;
        let (lines, path) = {
            let guard = self.log(family).read().unwrap();
            let mut lines = String::new();
            for r in &guard.records {
                lines.push_str(&serde_json::to_string(r)?);
                lines.push('\n');
            }
            (lines, guard.path.clone())
        };
        let tmp = self.dir.join(format!(".{}.tmp", family.file_stem()));
        tokio::fs::write(&tmp, lines.as_bytes())
            .await
            .map_err(|e| Error::JournalAppend(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::JournalAppend(e.to_string()))?;
        Ok(())
    }

    /// Record counts per family (status surface)
    pub fn counts(&self) -> HashMap<Family, usize> {
        Family::all()
            .into_iter()
            .map(|f| (f, self.log(f).read().unwrap().records.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::Ticker;
    use serde_json::json;

    async fn store() -> (JournalStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(dir.path(), 90).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_append_and_query_newest_first() {
        let (store, _dir) = store().await;
        let t0 = Utc::now();
        for i in 0..5 {
            store
                .append(
                    Family::AgentLogs,
                    Uuid::new_v4(),
                    t0 + Duration::seconds(i),
                    &json!({"seq": i}),
                )
                .await
                .unwrap();
        }
        let out = store.query(Family::AgentLogs, &QueryFilter::default(), 3);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].payload["seq"], 4);
        assert_eq!(out[2].payload["seq"], 2);
    }

    #[tokio::test]
    async fn test_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        {
            let store = JournalStore::open(dir.path(), 90).await.unwrap();
            store
                .append(Family::Predictions, id, Utc::now(), &json!({"ticker": "SIRI"}))
                .await
                .unwrap();
        }
        let reloaded = JournalStore::open(dir.path(), 90).await.unwrap();
        let rec = reloaded.get(Family::Predictions, id).unwrap();
        assert_eq!(rec.payload["ticker"], "SIRI");
        assert_eq!(rec.schema_version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_ticker_filter() {
        let (store, _dir) = store().await;
        store
            .append(Family::Decisions, Uuid::new_v4(), Utc::now(), &json!({"ticker": "SIRI"}))
            .await
            .unwrap();
        store
            .append(Family::Decisions, Uuid::new_v4(), Utc::now(), &json!({"ticker": "PLUG"}))
            .await
            .unwrap();

        let filter = QueryFilter {
            ticker: Some("PLUG".into()),
            since: None,
        };
        let out = store.query(Family::Decisions, &filter, 10);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload["ticker"], "PLUG");
    }

    #[tokio::test]
    async fn test_update_outcome_in_place() {
        let (store, _dir) = store().await;
        let decision_id = Uuid::new_v4();

        let decision = DecisionRecord {
            id: decision_id,
            ticker: Ticker::new("SIRI").unwrap(),
            created_at: Utc::now(),
            context: DecisionContext {
                price: 25.50,
                day_change_pct: 0.04,
                session_volume: 1_000_000,
                regime: "trending_low_vol".into(),
                regime_confidence: 0.7,
                sentiment_score: 0.4,
                sentiment_confidence: 0.6,
                session_bucket: crate::clock::SessionBucket::Midday,
                open_positions: 0,
                daily_trades: 0,
                daily_pnl_pct: 0.0,
            },
            reasoning: vec![],
            confidence_breakdown: HashMap::new(),
            risk_factors: vec![],
            alternatives_considered: vec![],
            action: DecisionAction::Buy,
            final_confidence: 9.3,
            skip_reason: None,
            expected_move_pct: Some(0.06),
            prediction_id: Some(Uuid::new_v4()),
            actual_move_pct: None,
            actual_duration_hours: None,
            accuracy_score: None,
            outcome_success: None,
        };
        store
            .append(Family::Decisions, decision_id, decision.created_at, &decision)
            .await
            .unwrap();

        let outcome = Outcome {
            id: Uuid::new_v4(),
            prediction_id: decision.prediction_id.unwrap(),
            decision_id,
            ticker: Ticker::new("SIRI").unwrap(),
            entry_fill: 25.50,
            exit_fill: 28.00,
            realized_move_pct: 9.80,
            realized_duration_hours: 3.0,
            exit_reason: ExitReason::Target,
            max_favorable_pct: 9.9,
            max_adverse_pct: -0.8,
            accuracy_score: 0.9,
            success: true,
            closed_at: Utc::now(),
        };
        store.update_outcome(decision_id, &outcome).await.unwrap();

        let rec = store.get(Family::Decisions, decision_id).unwrap();
        let updated: DecisionRecord = serde_json::from_value(rec.payload).unwrap();
        assert_eq!(updated.actual_move_pct, Some(9.80));
        assert_eq!(updated.outcome_success, Some(true));

        // Unknown id is an error
        let missing = store.update_outcome(Uuid::new_v4(), &outcome).await;
        assert!(matches!(missing, Err(Error::JournalRecordNotFound { .. })));
    }

    #[tokio::test]
    async fn test_retention_spares_outcomes() {
        let (store, _dir) = store().await;
        let old = Utc::now() - Duration::days(120);
        store
            .append(Family::AgentLogs, Uuid::new_v4(), old, &json!({"old": true}))
            .await
            .unwrap();
        store
            .append(Family::Outcomes, Uuid::new_v4(), old, &json!({"old": true}))
            .await
            .unwrap();

        let pruned = store.prune(Utc::now()).await.unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.query(Family::AgentLogs, &QueryFilter::default(), 10).len(), 0);
        assert_eq!(store.query(Family::Outcomes, &QueryFilter::default(), 10).len(), 1);
    }
}
