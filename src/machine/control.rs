//! Batch-wide control signal shared by every target machine.

use std::sync::{Arc, OnceLock};

use tokio::sync::watch;
use tracing::{error, info};

use crate::ledger::LedgerError;

/// What the batch currently allows machines to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchControl {
    /// Normal operation.
    Running,
    /// Remaining pending and exhausted targets are failed with `reason`.
    Closing { reason: String },
    /// Parked machines exit and leave their targets exhausted.
    Suspended,
    /// A ledger write failed; no further transitions or attempts.
    Halted,
}

impl BatchControl {
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        matches!(self, Self::Halted)
    }

    #[must_use]
    pub fn closing_reason(&self) -> Option<&str> {
        match self {
            Self::Closing { reason } => Some(reason),
            _ => None,
        }
    }

    /// True for states that interrupt a backoff wait.
    #[must_use]
    pub fn interrupts_attempts(&self) -> bool {
        matches!(self, Self::Closing { .. } | Self::Halted)
    }
}

/// Sender side of [`BatchControl`] plus the first fatal ledger error.
#[derive(Debug, Clone)]
pub struct BatchSignal {
    tx: Arc<watch::Sender<BatchControl>>,
    fatal: Arc<OnceLock<LedgerError>>,
}

impl Default for BatchSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchSignal {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(BatchControl::Running);
        Self {
            tx: Arc::new(tx),
            fatal: Arc::new(OnceLock::new()),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BatchControl> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn current(&self) -> BatchControl {
        self.tx.borrow().clone()
    }

    /// Moves a running batch to `Closing`. Returns false if it was not running.
    pub fn close(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let changed = self.tx.send_if_modified(|control| {
            if control.is_running() {
                *control = BatchControl::Closing {
                    reason: reason.clone(),
                };
                true
            } else {
                false
            }
        });
        if changed {
            info!(reason, "batch closing");
        }
        changed
    }

    /// Moves a running batch to `Suspended`.
    pub fn suspend(&self) -> bool {
        self.tx.send_if_modified(|control| {
            if control.is_running() {
                *control = BatchControl::Suspended;
                true
            } else {
                false
            }
        })
    }

    /// Halts the batch after a ledger write failure. The first error is kept.
    pub fn halt(&self, cause: LedgerError) {
        error!(error = %cause, "ledger write failed; halting batch");
        let _ = self.fatal.set(cause);
        self.tx.send_if_modified(|control| {
            if control.is_halted() {
                false
            } else {
                *control = BatchControl::Halted;
                true
            }
        });
    }

    /// The error that halted the batch, if any.
    #[must_use]
    pub fn fatal(&self) -> Option<LedgerError> {
        self.fatal.get().cloned()
    }
}
