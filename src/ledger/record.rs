//! Ledger record types: attempts, transitions and aggregated strategy stats.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use sqlx::FromRow;

use super::LedgerError;
use crate::failure::FailureCategory;
use crate::machine::TargetPhase;
use crate::target::TargetId;

/// Outcome stored for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failure,
}

impl AttemptStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            _ => Err(format!("invalid attempt status: {s}")),
        }
    }
}

/// Insert payload for one concluded attempt.
#[derive(Debug, Clone)]
pub struct NewAttemptRecord {
    pub target_id: TargetId,
    pub pass: u32,
    pub strategy: String,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
    pub status: AttemptStatus,
    pub category: Option<FailureCategory>,
    pub message: Option<String>,
    pub bytes_transferred: u64,
    pub destination_path: Option<PathBuf>,
    /// Set for attempts driven by operator overrides.
    pub manual: bool,
    pub sha256: Option<String>,
}

impl NewAttemptRecord {
    /// Successful attempt that produced a validated artifact at `destination`.
    #[must_use]
    pub fn success(
        target_id: TargetId,
        pass: u32,
        strategy: impl Into<String>,
        started_at: SystemTime,
        destination: &Path,
        sha256: impl Into<String>,
    ) -> Self {
        Self {
            target_id,
            pass,
            strategy: strategy.into(),
            started_at,
            ended_at: SystemTime::now(),
            status: AttemptStatus::Success,
            category: None,
            message: None,
            bytes_transferred: 0,
            destination_path: Some(destination.to_path_buf()),
            manual: false,
            sha256: Some(sha256.into()),
        }
    }

    /// Failed attempt classified as `category`.
    #[must_use]
    pub fn failure(
        target_id: TargetId,
        pass: u32,
        strategy: impl Into<String>,
        started_at: SystemTime,
        category: FailureCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            target_id,
            pass,
            strategy: strategy.into(),
            started_at,
            ended_at: SystemTime::now(),
            status: AttemptStatus::Failure,
            category: Some(category),
            message: Some(message.into()),
            bytes_transferred: 0,
            destination_path: None,
            manual: false,
            sha256: None,
        }
    }

    #[must_use]
    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes_transferred = bytes;
        self
    }

    #[must_use]
    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }
}

/// A stored attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub id: i64,
    pub target_id: TargetId,
    pub pass: u32,
    pub strategy: String,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
    pub status: AttemptStatus,
    pub category: Option<FailureCategory>,
    pub message: Option<String>,
    pub bytes_transferred: u64,
    pub destination_path: Option<PathBuf>,
    pub manual: bool,
    pub sha256: Option<String>,
}

impl AttemptRecord {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == AttemptStatus::Success
    }

    /// Wall-clock time the attempt took.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.ended_at
            .duration_since(self.started_at)
            .unwrap_or_default()
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct AttemptRow {
    pub id: i64,
    pub target_id: String,
    pub pass: i64,
    pub strategy: String,
    pub started_at: i64,
    pub ended_at: i64,
    pub outcome: String,
    pub category: Option<String>,
    pub message: Option<String>,
    pub bytes_transferred: i64,
    pub destination_path: Option<String>,
    pub manual: bool,
    pub sha256: Option<String>,
}

impl TryFrom<AttemptRow> for AttemptRecord {
    type Error = LedgerError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let status = row
            .outcome
            .parse()
            .map_err(|reason| LedgerError::corrupt("attempts", reason))?;
        let category = row
            .category
            .as_deref()
            .map(str::parse::<FailureCategory>)
            .transpose()
            .map_err(|reason| LedgerError::corrupt("attempts", reason))?;

        Ok(Self {
            id: row.id,
            target_id: TargetId::new(row.target_id),
            pass: stored_pass(row.pass, "attempts")?,
            strategy: row.strategy,
            started_at: from_unix_millis(row.started_at),
            ended_at: from_unix_millis(row.ended_at),
            status,
            category,
            message: row.message,
            bytes_transferred: u64::try_from(row.bytes_transferred).unwrap_or_default(),
            destination_path: row.destination_path.map(PathBuf::from),
            manual: row.manual,
            sha256: row.sha256,
        })
    }
}

/// Insert payload for one phase transition.
#[derive(Debug, Clone)]
pub struct NewTransition {
    pub target_id: TargetId,
    pub pass: u32,
    pub phase: TargetPhase,
    pub detail: Option<String>,
}

/// A stored phase transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub id: i64,
    pub target_id: TargetId,
    pub pass: u32,
    pub phase: TargetPhase,
    pub detail: Option<String>,
    pub recorded_at: SystemTime,
}

#[derive(Debug, FromRow)]
pub(crate) struct TransitionRow {
    pub id: i64,
    pub target_id: String,
    pub pass: i64,
    pub phase: String,
    pub strategy: Option<String>,
    pub detail: Option<String>,
    pub recorded_at: i64,
}

impl TryFrom<TransitionRow> for TransitionRecord {
    type Error = LedgerError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        let phase = TargetPhase::from_parts(&row.phase, row.strategy.as_deref())
            .map_err(|reason| LedgerError::corrupt("transitions", reason))?;

        Ok(Self {
            id: row.id,
            target_id: TargetId::new(row.target_id),
            pass: stored_pass(row.pass, "transitions")?,
            phase,
            detail: row.detail,
            recorded_at: from_unix_millis(row.recorded_at),
        })
    }
}

/// Per-strategy attempt counts across the whole ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct StrategyStats {
    pub strategy: String,
    pub attempts: i64,
    pub successes: i64,
    pub failures: i64,
}

fn stored_pass(value: i64, table: &'static str) -> Result<u32, LedgerError> {
    u32::try_from(value).map_err(|_| LedgerError::corrupt(table, format!("invalid pass {value}")))
}

/// Milliseconds since the Unix epoch, saturating.
#[must_use]
pub fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[must_use]
pub fn from_unix_millis(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(u64::try_from(millis).unwrap_or_default())
}
