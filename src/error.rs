//! Engine-level error taxonomy.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DbError;
use crate::ledger::LedgerError;
use crate::strategy::StrategyError;
use crate::target::TargetId;

/// Errors that stop a batch from starting or from continuing.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed configuration or routing table; raised before any target is admitted.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// A ledger append failed; the batch halted.
    #[error(
        "ledger write failed, batch halted: {0}\n  Suggestion: {suggestion}",
        suggestion = .0.halt_suggestion()
    )]
    LedgerWriteFailure(LedgerError),

    /// Ledger history could not be read at startup.
    #[error("failed to read ledger: {0}")]
    Ledger(LedgerError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    /// The same target id was submitted twice in one batch.
    #[error("target '{0}' submitted more than once")]
    DuplicateTarget(TargetId),

    /// Another orchestrator holds the state directory.
    #[error(
        "state directory {path} is in use by another process\n  Suggestion: Wait for the other run to finish or use --state-dir"
    )]
    StateLocked { path: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the errors that end a batch after it started.
    #[must_use]
    pub fn is_ledger_write_failure(&self) -> bool {
        matches!(self, Self::LedgerWriteFailure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerDbErrorKind;

    #[test]
    fn test_ledger_write_failure_has_suggestion() {
        let err = EngineError::LedgerWriteFailure(LedgerError::UnknownTarget("ep".to_string()));
        assert!(err.is_ledger_write_failure());
        assert!(err.to_string().contains("batch halted"));
        assert!(err.to_string().contains("Suggestion"));
    }

    #[test]
    fn test_ledger_write_failure_suggestion_names_locked_database() {
        let err = EngineError::LedgerWriteFailure(LedgerError::Database {
            kind: LedgerDbErrorKind::BusyOrLocked,
            message: "database is locked".to_string(),
        });
        let msg = err.to_string();
        assert!(msg.contains("Suggestion: Another process is using the ledger"));
        assert!(!msg.contains("disk space"));
    }

    #[test]
    fn test_configuration_error_wraps_config_error() {
        let err: EngineError = ConfigError::UnknownKey {
            key: "bogus".to_string(),
            line: 3,
        }
        .into();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(err.to_string().contains("bogus"));
    }
}
