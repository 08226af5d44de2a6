//! Error types for ledger operations.

use std::fmt;

use thiserror::Error;

/// What kind of database failure a ledger operation hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerDbErrorKind {
    /// Another connection or process holds the database.
    BusyOrLocked,
    /// A unique, foreign-key or check constraint rejected the row.
    ConstraintViolation,
    /// The database file could not be read or written.
    Io,
    Other,
}

impl LedgerDbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::BusyOrLocked,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Database(database_error) => {
                let code = database_error.code();
                let message = database_error.message().to_ascii_lowercase();
                if matches!(code.as_deref(), Some("5" | "6" | "517"))
                    || message.contains("database is locked")
                    || message.contains("database is busy")
                {
                    Self::BusyOrLocked
                } else if database_error.is_unique_violation()
                    || database_error.is_foreign_key_violation()
                    || database_error.is_check_violation()
                    || message.contains("constraint failed")
                {
                    Self::ConstraintViolation
                } else if message.contains("disk i/o") || message.contains("database or disk is full")
                {
                    Self::Io
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }

    /// Operator advice shown when a write of this kind halts a batch.
    #[must_use]
    pub fn suggestion(self) -> &'static str {
        match self {
            Self::BusyOrLocked => {
                "Another process is using the ledger; stop it, then rerun to resume"
            }
            Self::ConstraintViolation => {
                "The ledger rejected a row; inspect the target with `acquirer history`, then rerun to resume"
            }
            Self::Io | Self::Other => {
                "Check disk space and permissions on the state directory, then rerun to resume"
            }
        }
    }
}

impl fmt::Display for LedgerDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::Io => "io",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

/// Errors that can occur while reading or appending ledger history.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// Database operation failed.
    #[error("ledger database error ({kind}): {message}")]
    Database {
        /// Typed classification of the underlying failure.
        kind: LedgerDbErrorKind,
        /// Human-readable database error text.
        message: String,
    },

    /// A stored row could not be decoded back into a record.
    #[error(
        "corrupt ledger row in {table}: {reason}\n  Suggestion: The ledger was written by an incompatible version or edited by hand"
    )]
    CorruptRow {
        /// Table the row came from.
        table: &'static str,
        /// What failed to decode.
        reason: String,
    },

    /// The target is not registered in the ledger.
    #[error("target not found in ledger: {0}")]
    UnknownTarget(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: LedgerDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl LedgerError {
    /// Creates a `CorruptRow` error.
    #[must_use]
    pub fn corrupt(table: &'static str, reason: impl Into<String>) -> Self {
        Self::CorruptRow {
            table,
            reason: reason.into(),
        }
    }

    /// Returns the typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<LedgerDbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::CorruptRow { .. } | Self::UnknownTarget(_) => None,
        }
    }

    /// Operator advice for a batch halted by this error.
    #[must_use]
    pub fn halt_suggestion(&self) -> &'static str {
        self.database_kind()
            .map_or(LedgerDbErrorKind::Other.suggestion(), LedgerDbErrorKind::suggestion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_error_database_message() {
        let err = LedgerError::Database {
            kind: LedgerDbErrorKind::Other,
            message: "disk I/O error".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ledger database error"));
        assert!(msg.contains("other"));
        assert!(msg.contains("disk I/O error"));
    }

    #[test]
    fn test_halt_suggestion_follows_kind() {
        let locked = LedgerError::Database {
            kind: LedgerDbErrorKind::BusyOrLocked,
            message: "database is locked".to_string(),
        };
        let disk = LedgerError::Database {
            kind: LedgerDbErrorKind::Io,
            message: "disk I/O error".to_string(),
        };
        assert!(locked.halt_suggestion().contains("Another process"));
        assert!(disk.halt_suggestion().contains("disk space"));
        assert_eq!(
            LedgerError::UnknownTarget("ep".to_string()).halt_suggestion(),
            LedgerDbErrorKind::Other.suggestion()
        );
    }

    #[test]
    fn test_ledger_error_corrupt_row_has_suggestion() {
        let err = LedgerError::corrupt("transitions", "unknown phase 'limbo'");
        let msg = err.to_string();
        assert!(msg.contains("transitions"));
        assert!(msg.contains("limbo"));
        assert!(msg.contains("Suggestion"));
        assert_eq!(err.database_kind(), None);
    }

    #[test]
    fn test_ledger_db_error_kind_from_transport_errors() {
        assert_eq!(
            LedgerDbErrorKind::from_sqlx(&sqlx::Error::PoolTimedOut),
            LedgerDbErrorKind::BusyOrLocked
        );
        assert_eq!(
            LedgerDbErrorKind::from_sqlx(&sqlx::Error::Io(std::io::Error::other("full"))),
            LedgerDbErrorKind::Io
        );
        assert_eq!(
            LedgerDbErrorKind::from_sqlx(&sqlx::Error::RowNotFound),
            LedgerDbErrorKind::Other
        );
    }
}
