//! Artifact validation: size floor, audio format signature, checksum.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

/// Default minimum acceptable artifact size.
pub const DEFAULT_MIN_ARTIFACT_BYTES: u64 = 1024;

/// Bytes inspected for a format signature.
const SIGNATURE_LEN: usize = 16;

/// Audio container recognised from the leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Mp3,
    Mp4,
    Ogg,
    Wav,
    Flac,
}

impl ArtifactFormat {
    /// File extension for the delivered artifact.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Mp4 => "m4a",
            Self::Ogg => "ogg",
            Self::Wav => "wav",
            Self::Flac => "flac",
        }
    }

    /// Detects the container from the first bytes of a file.
    #[must_use]
    pub fn detect(head: &[u8]) -> Option<Self> {
        if head.starts_with(b"ID3") {
            return Some(Self::Mp3);
        }
        if head.len() >= 2 && head[0] == 0xFF && matches!(head[1], 0xFB | 0xF3 | 0xF2) {
            return Some(Self::Mp3);
        }
        if head.len() >= 8 && &head[4..8] == b"ftyp" {
            return Some(Self::Mp4);
        }
        if head.starts_with(b"OggS") {
            return Some(Self::Ogg);
        }
        if head.starts_with(b"RIFF") {
            return Some(Self::Wav);
        }
        if head.starts_with(b"fLaC") {
            return Some(Self::Flac);
        }
        None
    }
}

fn looks_like_html(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start().to_ascii_lowercase();
    trimmed.starts_with("<!doctype") || trimmed.starts_with("<html")
}

/// Why an artifact was rejected. Every variant classifies as `Corrupt`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("artifact not found at {path}")]
    Missing { path: PathBuf },

    #[error("artifact at {path} is {size} bytes, below the {min} byte minimum")]
    TooSmall { path: PathBuf, size: u64, min: u64 },

    #[error("artifact at {path} is an HTML page, not audio")]
    Html { path: PathBuf },

    #[error("artifact at {path} has no recognised audio signature")]
    UnknownSignature { path: PathBuf },

    #[error("failed to read artifact at {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

/// A file that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedArtifact {
    pub format: ArtifactFormat,
    pub size: u64,
    /// Lowercase hex SHA-256 of the whole file.
    pub sha256: String,
}

/// Checks that a file is a plausible audio artifact.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactValidator {
    min_bytes: u64,
}

impl Default for ArtifactValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_ARTIFACT_BYTES)
    }
}

impl ArtifactValidator {
    #[must_use]
    pub fn new(min_bytes: u64) -> Self {
        Self {
            min_bytes: min_bytes.max(1),
        }
    }

    /// Validates the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when the file is missing, too small, HTML,
    /// or carries no known audio signature.
    #[instrument(skip(self), fields(min_bytes = self.min_bytes))]
    pub async fn validate(&self, path: &Path) -> Result<ValidatedArtifact, ValidationError> {
        let unreadable = |e: std::io::Error| ValidationError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => {
                return Err(ValidationError::Missing {
                    path: path.to_path_buf(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ValidationError::Missing {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(unreadable(e)),
        };

        let size = metadata.len();
        if size < self.min_bytes {
            return Err(ValidationError::TooSmall {
                path: path.to_path_buf(),
                size,
                min: self.min_bytes,
            });
        }

        let mut file = File::open(path).await.map_err(unreadable)?;
        let mut hasher = Sha256::new();
        let mut head = Vec::with_capacity(SIGNATURE_LEN);
        let mut buffer = vec![0u8; 64 * 1024];

        loop {
            let read = file.read(&mut buffer).await.map_err(unreadable)?;
            if read == 0 {
                break;
            }
            if head.len() < SIGNATURE_LEN {
                let take = (SIGNATURE_LEN - head.len()).min(read);
                head.extend_from_slice(&buffer[..take]);
            }
            hasher.update(&buffer[..read]);
        }

        if looks_like_html(&head) {
            return Err(ValidationError::Html {
                path: path.to_path_buf(),
            });
        }

        let format = ArtifactFormat::detect(&head).ok_or_else(|| {
            ValidationError::UnknownSignature {
                path: path.to_path_buf(),
            }
        })?;

        let sha256 = hasher
            .finalize()
            .iter()
            .fold(String::with_capacity(64), |mut hex, byte| {
                let _ = write!(hex, "{byte:02x}");
                hex
            });

        debug!(?format, size, "artifact validated");
        Ok(ValidatedArtifact {
            format,
            size,
            sha256,
        })
    }
}
