//! Exclusive ownership of a state directory.

use std::fs::File;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, instrument};

use crate::error::EngineError;

/// Lock file name inside the state directory.
pub const LOCK_FILE: &str = "ledger.lock";

/// Ledger database file name inside the state directory.
pub const LEDGER_FILE: &str = "ledger.db";

/// A state directory held under an advisory lock until dropped.
#[derive(Debug)]
pub struct StateDir {
    root: PathBuf,
    lock: File,
}

impl StateDir {
    /// Creates the directory if needed and takes the lock.
    ///
    /// # Errors
    ///
    /// [`EngineError::StateLocked`] when another process holds the lock,
    /// [`EngineError::Io`] when the directory or lock file cannot be created.
    #[instrument]
    pub fn open(root: &Path) -> Result<Self, EngineError> {
        std::fs::create_dir_all(root).map_err(|e| EngineError::io(root, e))?;
        let lock_path = root.join(LOCK_FILE);
        let lock = File::create(&lock_path).map_err(|e| EngineError::io(&lock_path, e))?;
        lock.try_lock_exclusive()
            .map_err(|_| EngineError::StateLocked {
                path: root.to_path_buf(),
            })?;
        debug!(state_dir = %root.display(), "state directory locked");
        Ok(Self {
            root: root.to_path_buf(),
            lock,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(LEDGER_FILE)
    }
}

impl Drop for StateDir {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock);
    }
}
