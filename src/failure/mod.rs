//! Failure taxonomy and classification for acquisition attempts.
//!
//! Every failed attempt ends up in exactly one [`FailureCategory`]. Strategies
//! report a [`StrategyFailure`] carrying a coarse hint plus whatever response
//! metadata they observed; [`classify`] refines that into the final category.
//!
//! | Category | Typical cause | Next step |
//! |----------|---------------|-----------|
//! | `AccessDenied` | 401/403, anti-bot wall, login page | next strategy |
//! | `NotFound` | 404/410, removed or private media | next strategy |
//! | `Stalled` | no progress within the stall window | retry same strategy |
//! | `Timeout` | hard ceiling exceeded, 408/504 | retry same strategy |
//! | `Corrupt` | artifact failed format validation | next strategy |
//! | `Unknown` | anything else | next strategy |

mod retry;

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::instrument;

pub use retry::{
    DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_TRANSIENT_RETRIES, RetryDecision,
    RetryPolicy,
};

/// Closed taxonomy of attempt failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// The source refused access (auth wall, anti-bot block, geo block).
    AccessDenied,
    /// The source does not have the media.
    NotFound,
    /// The transfer stopped making progress.
    Stalled,
    /// The attempt exceeded its hard time ceiling.
    Timeout,
    /// Data arrived but is not a valid audio artifact.
    Corrupt,
    /// Unclassified failure.
    Unknown,
}

impl FailureCategory {
    /// All categories, in display order.
    pub const ALL: [Self; 6] = [
        Self::AccessDenied,
        Self::NotFound,
        Self::Stalled,
        Self::Timeout,
        Self::Corrupt,
        Self::Unknown,
    ];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessDenied => "access_denied",
            Self::NotFound => "not_found",
            Self::Stalled => "stalled",
            Self::Timeout => "timeout",
            Self::Corrupt => "corrupt",
            Self::Unknown => "unknown",
        }
    }

    /// Transient failures are retried with the same strategy before advancing.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Stalled | Self::Timeout)
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FailureCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access_denied" => Ok(Self::AccessDenied),
            "not_found" => Ok(Self::NotFound),
            "stalled" => Ok(Self::Stalled),
            "timeout" => Ok(Self::Timeout),
            "corrupt" => Ok(Self::Corrupt),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("invalid failure category: {s}")),
        }
    }
}

/// Response metadata a strategy observed before failing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMetadata {
    /// HTTP status code, when the source speaks HTTP.
    pub http_status: Option<u16>,
    /// Content type the source declared for the payload.
    pub content_type: Option<String>,
    /// Server-requested wait before trying again.
    pub retry_after: Option<Duration>,
}

/// A strategy's report of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFailure {
    /// The strategy's own guess at the category.
    pub hint: FailureCategory,
    /// Human-readable failure message.
    pub message: String,
    /// Observed response metadata.
    pub metadata: ResponseMetadata,
}

impl StrategyFailure {
    #[must_use]
    pub fn new(hint: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            hint,
            message: message.into(),
            metadata: ResponseMetadata::default(),
        }
    }

    /// Builds a failure from an HTTP status code; the classifier decides the category.
    #[must_use]
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            hint: FailureCategory::Unknown,
            message: message.into(),
            metadata: ResponseMetadata {
                http_status: Some(status),
                ..ResponseMetadata::default()
            },
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.metadata.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.metadata.retry_after = retry_after;
        self
    }
}

#[allow(clippy::expect_used)]
static ACCESS_DENIED_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(captcha|cloudflare|forbidden|unauthori[sz]ed|sign[ -]?in|log[ -]?in|bot detected|access denied|geo[- ]?blocked)\b")
        .expect("access denied pattern is valid")
});

#[allow(clippy::expect_used)]
static NOT_FOUND_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(not found|no such|does not exist|private video|video unavailable|been removed|no matching episode)")
        .expect("not found pattern is valid")
});

#[allow(clippy::expect_used)]
static TIMEOUT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(timed out|timeout)")
        .expect("timeout pattern is valid")
});

#[allow(clippy::expect_used)]
static CORRUPT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(corrupt|truncated|invalid (audio|data|format)|checksum mismatch)")
        .expect("corrupt pattern is valid")
});

/// Refines a strategy's report into a final [`FailureCategory`].
///
/// Precedence: HTTP status, then a declared HTML content type (a login or
/// error page served in place of audio), then the strategy's hint, and only
/// for `Unknown` hints, message patterns.
#[instrument(skip(failure), fields(hint = %failure.hint, status = ?failure.metadata.http_status))]
#[must_use]
pub fn classify(failure: &StrategyFailure) -> FailureCategory {
    if let Some(category) = failure.metadata.http_status.and_then(classify_http_status) {
        return category;
    }

    if failure
        .metadata
        .content_type
        .as_deref()
        .is_some_and(is_html_content_type)
        && matches!(failure.hint, FailureCategory::Unknown | FailureCategory::Corrupt)
    {
        return FailureCategory::AccessDenied;
    }

    if failure.hint != FailureCategory::Unknown {
        return failure.hint;
    }

    classify_message(&failure.message)
}

/// Maps HTTP status codes that carry a definite meaning.
///
/// | Status | Category |
/// |--------|----------|
/// | 401, 403, 407, 429, 451 | `AccessDenied` |
/// | 404, 410 | `NotFound` |
/// | 408, 504 | `Timeout` |
/// | other | no opinion |
#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> Option<FailureCategory> {
    match status {
        401 | 403 | 407 => Some(FailureCategory::AccessDenied),
        // Throttling is an anti-bot signal; a different path usually works.
        429 => Some(FailureCategory::AccessDenied),
        451 => Some(FailureCategory::AccessDenied),
        404 | 410 => Some(FailureCategory::NotFound),
        408 | 504 => Some(FailureCategory::Timeout),
        _ => None,
    }
}

fn classify_message(message: &str) -> FailureCategory {
    if ACCESS_DENIED_PATTERN.is_match(message) {
        FailureCategory::AccessDenied
    } else if NOT_FOUND_PATTERN.is_match(message) {
        FailureCategory::NotFound
    } else if TIMEOUT_PATTERN.is_match(message) {
        FailureCategory::Timeout
    } else if CORRUPT_PATTERN.is_match(message) {
        FailureCategory::Corrupt
    } else {
        FailureCategory::Unknown
    }
}

fn is_html_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "text/html" || essence == "application/xhtml+xml"
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== FailureCategory Tests ====================

    #[test]
    fn test_failure_category_round_trips_through_str() {
        for category in FailureCategory::ALL {
            assert_eq!(category.as_str().parse::<FailureCategory>(), Ok(category));
        }
        assert!("exploded".parse::<FailureCategory>().is_err());
    }

    #[test]
    fn test_failure_category_only_stalled_and_timeout_are_transient() {
        let transient: Vec<_> = FailureCategory::ALL
            .into_iter()
            .filter(|c| c.is_transient())
            .collect();
        assert_eq!(
            transient,
            vec![FailureCategory::Stalled, FailureCategory::Timeout]
        );
    }

    // ==================== classify Tests ====================

    #[test]
    fn test_classify_http_status_wins_over_hint() {
        let failure = StrategyFailure {
            hint: FailureCategory::Unknown,
            message: "server said no".to_string(),
            metadata: ResponseMetadata {
                http_status: Some(403),
                ..ResponseMetadata::default()
            },
        };
        assert_eq!(classify(&failure), FailureCategory::AccessDenied);

        let gone = StrategyFailure::http_status(410, "gone");
        assert_eq!(classify(&gone), FailureCategory::NotFound);

        let slow = StrategyFailure::http_status(504, "gateway");
        assert_eq!(classify(&slow), FailureCategory::Timeout);
    }

    #[test]
    fn test_classify_rate_limit_is_access_denied() {
        assert_eq!(
            classify(&StrategyFailure::http_status(429, "slow down")),
            FailureCategory::AccessDenied
        );
    }

    #[test]
    fn test_classify_server_error_falls_back_to_message() {
        let failure = StrategyFailure::http_status(503, "upstream timed out");
        assert_eq!(classify(&failure), FailureCategory::Timeout);

        let opaque = StrategyFailure::http_status(500, "internal error");
        assert_eq!(classify(&opaque), FailureCategory::Unknown);
    }

    #[test]
    fn test_classify_html_payload_is_access_denied() {
        let failure = StrategyFailure::new(FailureCategory::Corrupt, "expected audio")
            .with_content_type("text/html; charset=utf-8");
        assert_eq!(classify(&failure), FailureCategory::AccessDenied);
    }

    #[test]
    fn test_classify_keeps_specific_hint() {
        let failure = StrategyFailure::new(FailureCategory::NotFound, "captcha page");
        assert_eq!(classify(&failure), FailureCategory::NotFound);
    }

    #[test]
    fn test_classify_message_patterns_for_unknown_hint() {
        let cases = [
            ("Cloudflare challenge detected", FailureCategory::AccessDenied),
            ("Please sign in to confirm you're not a bot", FailureCategory::AccessDenied),
            ("Private video", FailureCategory::NotFound),
            ("episode does not exist", FailureCategory::NotFound),
            ("operation timed out", FailureCategory::Timeout),
            ("stream truncated at 40%", FailureCategory::Corrupt),
            ("something odd", FailureCategory::Unknown),
        ];
        for (message, expected) in cases {
            let failure = StrategyFailure::new(FailureCategory::Unknown, message);
            assert_eq!(classify(&failure), expected, "message: {message}");
        }
    }
}
