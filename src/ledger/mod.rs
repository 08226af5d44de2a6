//! Append-only attempt ledger.
//!
//! The ledger is the durable record of every attempt and every phase
//! transition, plus the learned routing map. It is the only thing a resumed
//! run trusts; in-memory target state is always rebuilt from it.
//!
//! # Overview
//!
//! - [`Ledger`] - `SQLite`-backed store
//! - [`LedgerRepository`] - trait seam the orchestration layer depends on
//! - [`NewAttemptRecord`] / [`AttemptRecord`] - attempt payloads
//! - [`NewTransition`] / [`TransitionRecord`] - phase journal payloads
//! - [`replay`] - reconstructs where a target left off

mod error;
mod record;
mod replay;
mod repository;

pub use error::{LedgerDbErrorKind, LedgerError};
pub use record::{
    AttemptRecord, AttemptStatus, NewAttemptRecord, NewTransition, StrategyStats,
    TransitionRecord, from_unix_millis, unix_millis,
};
pub use replay::{Replayed, ResumePoint, replay};
pub use repository::LedgerRepository;

use std::time::SystemTime;

use sqlx::Row;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::target::{DownloadTarget, SourceHints, TargetId};
use record::{AttemptRow, TransitionRow};

/// `SQLite`-backed attempt ledger.
#[derive(Debug, Clone)]
pub struct Ledger {
    db: Database,
}

impl Ledger {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Records a target. Existing rows are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the insert fails.
    #[instrument(skip(self, target), fields(target_id = %target.id()))]
    pub async fn register_target(&self, target: &DownloadTarget) -> Result<bool, LedgerError> {
        let hints = serde_json::to_string(target.hints())
            .map_err(|e| LedgerError::corrupt("targets", e.to_string()))?;

        let result = sqlx::query(
            r"INSERT OR IGNORE INTO targets (id, label, primary_reference, hints)
              VALUES (?, ?, ?, ?)",
        )
        .bind(target.id().as_str())
        .bind(target.label())
        .bind(target.primary_reference())
        .bind(hints)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Loads a registered target.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure, or
    /// [`LedgerError::CorruptRow`] if the stored hints are not valid JSON.
    #[instrument(skip(self))]
    pub async fn get_target(&self, id: &TargetId) -> Result<Option<DownloadTarget>, LedgerError> {
        let row = sqlx::query(
            r"SELECT id, label, primary_reference, hints FROM targets WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let hints: SourceHints = serde_json::from_str(row.get::<&str, _>("hints"))
            .map_err(|e| LedgerError::corrupt("targets", e.to_string()))?;

        Ok(Some(
            DownloadTarget::new(
                TargetId::new(row.get::<String, _>("id")),
                row.get::<String, _>("label"),
                row.get::<String, _>("primary_reference"),
            )
            .with_hints(hints),
        ))
    }

    /// Appends a concluded attempt.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the insert fails.
    #[instrument(skip(self, record), fields(target_id = %record.target_id, strategy = %record.strategy, status = %record.status))]
    pub async fn append_attempt(&self, record: &NewAttemptRecord) -> Result<i64, LedgerError> {
        let result = sqlx::query(
            r"INSERT INTO attempts (
                target_id, pass, strategy, started_at, ended_at, outcome,
                category, message, bytes_transferred, destination_path, manual, sha256
              ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.target_id.as_str())
        .bind(i64::from(record.pass))
        .bind(&record.strategy)
        .bind(unix_millis(record.started_at))
        .bind(unix_millis(record.ended_at))
        .bind(record.status.as_str())
        .bind(record.category.map(|c| c.as_str()))
        .bind(record.message.as_deref())
        .bind(i64::try_from(record.bytes_transferred).unwrap_or(i64::MAX))
        .bind(
            record
                .destination_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        )
        .bind(record.manual)
        .bind(record.sha256.as_deref())
        .execute(self.db.pool())
        .await?;

        let id = result.last_insert_rowid();
        debug!(attempt_id = id, "attempt recorded");
        Ok(id)
    }

    /// Appends a phase transition.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the insert fails.
    #[instrument(skip(self, transition), fields(target_id = %transition.target_id, phase = %transition.phase))]
    pub async fn append_transition(&self, transition: &NewTransition) -> Result<i64, LedgerError> {
        let result = sqlx::query(
            r"INSERT INTO transitions (target_id, pass, phase, strategy, detail, recorded_at)
              VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(transition.target_id.as_str())
        .bind(i64::from(transition.pass))
        .bind(transition.phase.as_str())
        .bind(transition.phase.strategy())
        .bind(transition.detail.as_deref())
        .bind(unix_millis(SystemTime::now()))
        .execute(self.db.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// All attempts for a target, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on query or decode failure.
    #[instrument(skip(self))]
    pub async fn attempts_for(&self, target_id: &TargetId) -> Result<Vec<AttemptRecord>, LedgerError> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r"SELECT * FROM attempts WHERE target_id = ? ORDER BY id ASC",
        )
        .bind(target_id.as_str())
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter().map(AttemptRecord::try_from).collect()
    }

    /// All transitions for a target, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on query or decode failure.
    #[instrument(skip(self))]
    pub async fn transitions_for(
        &self,
        target_id: &TargetId,
    ) -> Result<Vec<TransitionRecord>, LedgerError> {
        let rows = sqlx::query_as::<_, TransitionRow>(
            r"SELECT * FROM transitions WHERE target_id = ? ORDER BY id ASC",
        )
        .bind(target_id.as_str())
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter().map(TransitionRecord::try_from).collect()
    }

    /// Learned `(source_key, strategy)` pairs, sorted by source key.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub async fn learned_routes(&self) -> Result<Vec<(String, String)>, LedgerError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r"SELECT source_key, strategy FROM learned_routes ORDER BY source_key ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    /// Replaces the learned strategy for `source_key`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the upsert fails.
    #[instrument(skip(self))]
    pub async fn upsert_learned_route(
        &self,
        source_key: &str,
        strategy: &str,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r"INSERT INTO learned_routes (source_key, strategy, updated_at)
              VALUES (?, ?, ?)
              ON CONFLICT(source_key) DO UPDATE
              SET strategy = excluded.strategy, updated_at = excluded.updated_at",
        )
        .bind(source_key)
        .bind(strategy)
        .bind(unix_millis(SystemTime::now()))
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Per-strategy counts across every recorded attempt.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub async fn strategy_stats(&self) -> Result<Vec<StrategyStats>, LedgerError> {
        let rows = sqlx::query_as::<_, StrategyStats>(
            r"SELECT strategy,
                     COUNT(*) AS attempts,
                     SUM(CASE WHEN outcome = 'success' THEN 1 ELSE 0 END) AS successes,
                     SUM(CASE WHEN outcome = 'failure' THEN 1 ELSE 0 END) AS failures
              FROM attempts
              GROUP BY strategy
              ORDER BY strategy ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }
}
