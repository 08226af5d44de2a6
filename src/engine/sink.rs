//! Output sinks receiving delivered artifacts.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::target::{DownloadTarget, TargetId};

/// Manifest file name inside the output directory.
pub const MANIFEST_FILE: &str = "manifest.jsonl";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode manifest entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Downstream consumer of `Done` artifacts.
///
/// Called once per target, after the `Done` transition is durable. A sink
/// failure is logged and does not change the target's phase.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn deliver(&self, target: &DownloadTarget, artifact: &Path) -> Result<(), SinkError>;
}

/// Discards deliveries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl ArtifactSink for NullSink {
    async fn deliver(&self, _target: &DownloadTarget, _artifact: &Path) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ManifestEntry<'a> {
    target_id: &'a TargetId,
    label: &'a str,
    source_key: String,
    artifact: &'a Path,
    delivered_at: String,
}

/// Appends one JSON line per delivered artifact to `manifest.jsonl`.
#[derive(Debug)]
pub struct ManifestSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ManifestSink {
    /// Manifest inside `output_dir`.
    #[must_use]
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join(MANIFEST_FILE),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ArtifactSink for ManifestSink {
    #[instrument(skip(self, target), fields(target_id = %target.id()))]
    async fn deliver(&self, target: &DownloadTarget, artifact: &Path) -> Result<(), SinkError> {
        let entry = ManifestEntry {
            target_id: target.id(),
            label: target.label(),
            source_key: target.source_key(),
            artifact,
            delivered_at: httpdate::fmt_http_date(SystemTime::now()),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let io_error = |source| SinkError::Io {
            path: self.path.clone(),
            source,
        };

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_error)?;
        file.write_all(line.as_bytes()).await.map_err(io_error)?;
        file.flush().await.map_err(io_error)?;

        debug!(manifest = %self.path.display(), "manifest entry appended");
        Ok(())
    }
}
