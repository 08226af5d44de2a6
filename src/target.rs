//! Download targets: the immutable descriptions of episodes to acquire.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Routing key used when a target carries no catalog hint and no parseable host.
pub const DEFAULT_SOURCE_KEY: &str = "default";

/// Maximum length of a filesystem stem derived from a target id.
const MAX_FILE_STEM_LEN: usize = 120;

/// Hex digits of the id digest appended to every target stem.
const STEM_DIGEST_LEN: usize = 12;

/// Stable identifier of a target within and across batches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    /// Wraps an identifier string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Optional hints that let routing pick a better strategy order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceHints {
    /// Catalog / show key, e.g. `"tim-ferriss"`. Takes precedence for routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,
    /// Platform-specific identifiers, e.g. `{"youtube": "dQw4w9WgXcQ"}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub platform_ids: BTreeMap<String, String>,
}

/// Immutable description of one episode to acquire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTarget {
    id: TargetId,
    label: String,
    primary_reference: String,
    #[serde(default)]
    hints: SourceHints,
}

impl DownloadTarget {
    /// Creates a target without source hints.
    #[must_use]
    pub fn new(
        id: impl Into<TargetId>,
        label: impl Into<String>,
        primary_reference: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            primary_reference: primary_reference.into(),
            hints: SourceHints::default(),
        }
    }

    /// Sets the catalog hint.
    #[must_use]
    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.hints.catalog = Some(catalog.into());
        self
    }

    /// Adds a platform-specific identifier hint.
    #[must_use]
    pub fn with_platform_id(mut self, platform: impl Into<String>, id: impl Into<String>) -> Self {
        self.hints.platform_ids.insert(platform.into(), id.into());
        self
    }

    /// Replaces all hints.
    #[must_use]
    pub fn with_hints(mut self, hints: SourceHints) -> Self {
        self.hints = hints;
        self
    }

    /// Returns a copy of this target that points at a different reference.
    ///
    /// Used for operator-supplied sources; identity and hints are kept.
    #[must_use]
    pub fn with_reference(&self, reference: impl Into<String>) -> Self {
        Self {
            primary_reference: reference.into(),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn id(&self) -> &TargetId {
        &self.id
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn primary_reference(&self) -> &str {
        &self.primary_reference
    }

    #[must_use]
    pub fn hints(&self) -> &SourceHints {
        &self.hints
    }

    /// Key used for the static routing table and the learned map.
    ///
    /// The catalog hint wins; otherwise the reference host (without `www.`)
    /// is used, falling back to [`DEFAULT_SOURCE_KEY`].
    #[must_use]
    pub fn source_key(&self) -> String {
        if let Some(catalog) = self.hints.catalog.as_deref() {
            let catalog = catalog.trim();
            if !catalog.is_empty() {
                return catalog.to_ascii_lowercase();
            }
        }

        Url::parse(&self.primary_reference)
            .ok()
            .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
            .map(|host| host.strip_prefix("www.").map_or(host.clone(), str::to_string))
            .unwrap_or_else(|| DEFAULT_SOURCE_KEY.to_string())
    }

    /// Filesystem-safe stem unique to the target id.
    ///
    /// A readable prefix of the sanitized id followed by the leading hex digits
    /// of its SHA-256, so ids that sanitize alike still get distinct files.
    #[must_use]
    pub fn file_stem(&self) -> String {
        let mut stem = sanitize_file_stem(self.id.as_str());
        stem.truncate(MAX_FILE_STEM_LEN - STEM_DIGEST_LEN - 1);
        stem.push('-');
        for byte in &Sha256::digest(self.id.as_str().as_bytes())[..STEM_DIGEST_LEN / 2] {
            let _ = write!(stem, "{byte:02x}");
        }
        stem
    }
}

/// Replaces characters that are unsafe in file names and bounds the length.
#[must_use]
pub fn sanitize_file_stem(raw: &str) -> String {
    let mut stem: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILE_STEM_LEN)
        .collect();

    while stem.starts_with('.') {
        stem.remove(0);
    }
    if stem.is_empty() {
        stem.push_str("target");
    }
    stem
}
