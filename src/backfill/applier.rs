use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backfill::config::{BackfillConfig, BatchMode};
use crate::backfill::report::RunSummary;
use crate::backfill::selector::Candidate;
use crate::util::db::{is_unique_violation, Db};

/// One row destined for `customer_metadata`. `value` mirrors the candidate's
/// identifier; `created_at` is Unix epoch seconds shared by the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub customer_uuid: Uuid,
    pub metadata_uuid: Uuid,
    pub value: String,
    pub created_at: i64,
}

impl MetadataRecord {
    pub fn for_candidate(cand: &Candidate, metadata_uuid: Uuid, created_at: i64) -> Self {
        Self {
            customer_uuid: cand.customer_uuid,
            metadata_uuid,
            value: cand.identifier.clone(),
            created_at,
        }
    }
}

/// Insert failure classification; drives skip-vs-abort handling per batch mode.
#[derive(Debug)]
pub enum InsertError {
    /// The (customer_uuid, metadata_uuid) uniqueness constraint already holds a row.
    Duplicate,
    Storage(anyhow::Error),
}

impl std::fmt::Display for InsertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InsertError::Duplicate => write!(f, "duplicate metadata row"),
            InsertError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

/// Transaction seam between the insert loop and storage. The Postgres
/// implementation maps onto BEGIN/COMMIT/ROLLBACK; tests substitute a
/// scripted in-memory writer.
#[async_trait]
pub trait MetadataWriter: Send {
    async fn begin(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;
    /// Outside an open transaction each insert commits on its own.
    async fn insert(&mut self, rec: &MetadataRecord) -> Result<(), InsertError>;
}

pub struct PgWriter {
    db: Db,
    tx: Option<sqlx::Transaction<'static, sqlx::Postgres>>,
}

impl PgWriter {
    pub fn new(db: &Db) -> Self {
        Self {
            db: db.clone(),
            tx: None,
        }
    }
}

const INSERT_SQL: &str = "INSERT INTO customer_metadata \
    (customer_uuid, metadata_uuid, value, created_at) \
    VALUES ($1, $2, $3, $4)";

#[async_trait]
impl MetadataWriter for PgWriter {
    async fn begin(&mut self) -> Result<()> {
        self.tx = Some(self.db.pool.begin().await?);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Ok(()),
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Ok(()),
        }
    }

    async fn insert(&mut self, rec: &MetadataRecord) -> Result<(), InsertError> {
        let query = sqlx::query(INSERT_SQL)
            .bind(rec.customer_uuid)
            .bind(rec.metadata_uuid)
            .bind(&rec.value)
            .bind(rec.created_at)
            .persistent(false);
        let res = match self.tx.as_mut() {
            Some(tx) => query.execute(&mut **tx).await,
            None => query.execute(&self.db.pool).await,
        };
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(InsertError::Duplicate),
            Err(e) => Err(InsertError::Storage(e.into())),
        }
    }
}

/// Insert metadata for every candidate. Outcomes accumulate in `summary` so
/// the reporter can print even when this returns an error.
pub async fn apply<W: MetadataWriter>(
    writer: &mut W,
    cfg: &BackfillConfig,
    candidates: &[Candidate],
    summary: &mut RunSummary,
) -> Result<()> {
    let created_at = chrono::Utc::now().timestamp();
    match cfg.batch_mode {
        BatchMode::AllOrNothing => {
            apply_all_or_nothing(writer, cfg, candidates, created_at, summary).await
        }
        BatchMode::PerRecordBestEffort => {
            apply_best_effort(writer, cfg, candidates, created_at, summary).await
        }
    }
}

async fn apply_all_or_nothing<W: MetadataWriter>(
    writer: &mut W,
    cfg: &BackfillConfig,
    candidates: &[Candidate],
    created_at: i64,
    summary: &mut RunSummary,
) -> Result<()> {
    writer
        .begin()
        .await
        .context("failed to open batch transaction")?;
    for cand in candidates {
        let rec = MetadataRecord::for_candidate(cand, cfg.metadata_uuid, created_at);
        if let Err(e) = writer.insert(&rec).await {
            error!(
                customer_uuid = %cand.customer_uuid,
                identifier = %cand.identifier,
                error = %e,
                "insert failed; rolling back batch"
            );
            writer.rollback().await?;
            summary.inserted = 0;
            summary.aborted = true;
            return Err(anyhow::anyhow!(e).context(format!(
                "batch aborted at customer {} ({})",
                cand.customer_uuid, cand.identifier
            )));
        }
        summary.inserted += 1;
    }
    if let Err(e) = writer.commit().await {
        summary.inserted = 0;
        summary.aborted = true;
        return Err(e).context("failed to commit batch");
    }
    info!(inserted = summary.inserted, "batch committed");
    Ok(())
}

async fn apply_best_effort<W: MetadataWriter>(
    writer: &mut W,
    cfg: &BackfillConfig,
    candidates: &[Candidate],
    created_at: i64,
    summary: &mut RunSummary,
) -> Result<()> {
    for cand in candidates {
        let rec = MetadataRecord::for_candidate(cand, cfg.metadata_uuid, created_at);
        match writer.insert(&rec).await {
            Ok(()) => summary.inserted += 1,
            Err(InsertError::Duplicate) => {
                warn!(
                    customer_uuid = %cand.customer_uuid,
                    identifier = %cand.identifier,
                    "metadata already present; skipping"
                );
                summary.skipped.push(cand.clone());
            }
            Err(InsertError::Storage(e)) => {
                error!(
                    customer_uuid = %cand.customer_uuid,
                    identifier = %cand.identifier,
                    error = %e,
                    "insert failed; continuing"
                );
                summary.failed += 1;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::config::DEFAULT_METADATA_UUID;
    use std::collections::HashSet;

    #[derive(Default)]
    struct MockWriter {
        /// Customers already carrying the tag; inserts for them raise Duplicate.
        existing: HashSet<Uuid>,
        /// Customers whose insert raises a generic storage error.
        fail_on: HashSet<Uuid>,
        committed: Vec<MetadataRecord>,
        pending: Vec<MetadataRecord>,
        in_tx: bool,
        attempts: usize,
    }

    #[async_trait]
    impl MetadataWriter for MockWriter {
        async fn begin(&mut self) -> Result<()> {
            self.in_tx = true;
            Ok(())
        }

        async fn commit(&mut self) -> Result<()> {
            let mut pending = std::mem::take(&mut self.pending);
            self.committed.append(&mut pending);
            self.in_tx = false;
            Ok(())
        }

        async fn rollback(&mut self) -> Result<()> {
            self.pending.clear();
            self.in_tx = false;
            Ok(())
        }

        async fn insert(&mut self, rec: &MetadataRecord) -> Result<(), InsertError> {
            self.attempts += 1;
            if self.existing.contains(&rec.customer_uuid) {
                return Err(InsertError::Duplicate);
            }
            if self.fail_on.contains(&rec.customer_uuid) {
                return Err(InsertError::Storage(anyhow::anyhow!("disk on fire")));
            }
            if self.in_tx {
                self.pending.push(rec.clone());
            } else {
                self.committed.push(rec.clone());
            }
            Ok(())
        }
    }

    fn cfg(mode: BatchMode) -> BackfillConfig {
        let mut cfg = BackfillConfig::new(
            "postgresql://localhost/node".into(),
            "public".into(),
        );
        cfg.batch_mode = mode;
        cfg
    }

    fn cand(n: u128, identifier: &str) -> Candidate {
        Candidate {
            customer_uuid: Uuid::from_u128(n),
            identifier: identifier.to_string(),
        }
    }

    #[tokio::test]
    async fn best_effort_inserts_all_when_clean() {
        let mut writer = MockWriter::default();
        let candidates = vec![cand(1, "A"), cand(2, "B")];
        let mut summary = RunSummary::new(candidates.len());

        apply(&mut writer, &cfg(BatchMode::PerRecordBestEffort), &candidates, &mut summary)
            .await
            .unwrap();

        assert_eq!(summary.inserted, 2);
        assert!(summary.skipped.is_empty());
        assert_eq!(summary.failed, 0);
        let values: Vec<&str> = writer.committed.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, vec!["A", "B"]);
        assert!(writer
            .committed
            .iter()
            .all(|r| r.metadata_uuid == DEFAULT_METADATA_UUID));
    }

    #[tokio::test]
    async fn best_effort_skips_existing_duplicate() {
        let mut writer = MockWriter::default();
        writer.existing.insert(Uuid::from_u128(1));
        let candidates = vec![cand(1, "A"), cand(2, "B")];
        let mut summary = RunSummary::new(candidates.len());

        apply(&mut writer, &cfg(BatchMode::PerRecordBestEffort), &candidates, &mut summary)
            .await
            .unwrap();

        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.skipped, vec![cand(1, "A")]);
        assert_eq!(writer.committed.len(), 1);
        assert_eq!(writer.committed[0].value, "B");
    }

    #[tokio::test]
    async fn best_effort_storage_error_does_not_block_the_rest() {
        let mut writer = MockWriter::default();
        writer.fail_on.insert(Uuid::from_u128(2));
        let candidates = vec![cand(1, "A"), cand(2, "B"), cand(3, "C")];
        let mut summary = RunSummary::new(candidates.len());

        apply(&mut writer, &cfg(BatchMode::PerRecordBestEffort), &candidates, &mut summary)
            .await
            .unwrap();

        // Every candidate attempted exactly once; neighbours unaffected.
        assert_eq!(writer.attempts, 3);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.skipped.is_empty());
        let values: Vec<&str> = writer.committed.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, vec!["A", "C"]);
    }

    #[tokio::test]
    async fn all_or_nothing_commits_the_whole_batch() {
        let mut writer = MockWriter::default();
        let candidates = vec![cand(1, "A"), cand(2, "B"), cand(3, "C")];
        let mut summary = RunSummary::new(candidates.len());

        apply(&mut writer, &cfg(BatchMode::AllOrNothing), &candidates, &mut summary)
            .await
            .unwrap();

        assert_eq!(summary.inserted, 3);
        assert!(!summary.aborted);
        assert_eq!(writer.committed.len(), 3);
        assert!(!writer.in_tx);
    }

    #[tokio::test]
    async fn all_or_nothing_rolls_back_on_storage_error() {
        let mut writer = MockWriter::default();
        writer.fail_on.insert(Uuid::from_u128(2));
        let candidates = vec![cand(1, "A"), cand(2, "B"), cand(3, "C")];
        let mut summary = RunSummary::new(candidates.len());

        let outcome = apply(&mut writer, &cfg(BatchMode::AllOrNothing), &candidates, &mut summary)
            .await;

        assert!(outcome.is_err());
        assert!(writer.committed.is_empty());
        assert!(writer.pending.is_empty());
        assert_eq!(summary.inserted, 0);
        assert!(summary.aborted);
        // Processing stops at the failing record.
        assert_eq!(writer.attempts, 2);
    }

    #[tokio::test]
    async fn all_or_nothing_treats_duplicates_as_fatal() {
        let mut writer = MockWriter::default();
        writer.existing.insert(Uuid::from_u128(1));
        let candidates = vec![cand(1, "A"), cand(2, "B")];
        let mut summary = RunSummary::new(candidates.len());

        let outcome = apply(&mut writer, &cfg(BatchMode::AllOrNothing), &candidates, &mut summary)
            .await;

        assert!(outcome.is_err());
        assert!(writer.committed.is_empty());
        assert_eq!(summary.inserted, 0);
        assert!(summary.aborted);
    }
}
