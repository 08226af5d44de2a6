//! Direct enclosure download over HTTP(S).
//!
//! Streams the response body of the target's primary reference into the
//! attempt destination. Non-2xx statuses and HTML bodies are reported as
//! failures with their response metadata so the classifier can tell an
//! access wall from a missing episode.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};
use url::Url;

use super::{AttemptContext, AttemptOutcome, ResourceClass, Strategy, StrategyError};
use crate::failure::{FailureCategory, StrategyFailure};
use crate::target::DownloadTarget;

/// Default strategy name.
pub const DIRECT_STRATEGY_NAME: &str = "direct";

/// Default HTTP connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum Retry-After value honoured.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Minimum bytes between progress reports.
const PROGRESS_REPORT_STEP: u64 = 64 * 1024;

fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("episode-acquirer/{version} (podcast-archiver)")
}

/// Downloads the primary reference as-is.
///
/// The client sets no read timeout; stall and hard ceilings come from the
/// engine's watchdog.
#[derive(Debug, Clone)]
pub struct HttpStrategy {
    name: String,
    class: ResourceClass,
    client: Client,
}

impl HttpStrategy {
    /// Creates the `"direct"` strategy in the long-transfer pool.
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError::Build`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self, StrategyError> {
        Self::with_options(DIRECT_STRATEGY_NAME, ResourceClass::LongTransfer, None)
    }

    /// Creates an HTTP strategy with a custom name, pool and User-Agent.
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError::Build`] if the HTTP client cannot be built.
    pub fn with_options(
        name: impl Into<String>,
        class: ResourceClass,
        user_agent: Option<&str>,
    ) -> Result<Self, StrategyError> {
        let name = name.into();
        let user_agent = user_agent.map_or_else(default_user_agent, str::to_string);
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(user_agent)
            .gzip(true)
            .build()
            .map_err(|e| StrategyError::Build {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            name,
            class,
            client,
        })
    }
}

#[async_trait]
impl Strategy for HttpStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn resource_class(&self) -> ResourceClass {
        self.class
    }

    fn can_handle(&self, target: &DownloadTarget) -> bool {
        Url::parse(target.primary_reference())
            .is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
    }

    #[instrument(skip(self, target, ctx), fields(strategy = %self.name, target_id = %target.id()))]
    async fn attempt(&self, target: &DownloadTarget, ctx: &AttemptContext) -> AttemptOutcome {
        let url = target.primary_reference();

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => return AttemptOutcome::Failure(request_failure(url, &e)),
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let mut failure =
                StrategyFailure::http_status(status.as_u16(), format!("HTTP {status} from {url}"))
                    .with_retry_after(retry_after);
            if let Some(content_type) = content_type {
                failure = failure.with_content_type(content_type);
            }
            return AttemptOutcome::Failure(failure);
        }

        if let Some(content_type) = content_type.as_deref().filter(|ct| is_html(ct)) {
            debug!(content_type, "HTML body where audio was expected");
            return AttemptOutcome::Failure(
                StrategyFailure::new(
                    FailureCategory::Unknown,
                    format!("{url} returned an HTML page instead of audio"),
                )
                .with_content_type(content_type),
            );
        }

        match stream_to_file(response, ctx).await {
            Ok(bytes_transferred) => {
                debug!(bytes_transferred, "transfer complete");
                AttemptOutcome::Success { bytes_transferred }
            }
            Err(failure) => {
                if let Err(e) = tokio::fs::remove_file(ctx.destination()).await {
                    debug!(error = %e, "no partial file to remove");
                }
                AttemptOutcome::Failure(failure)
            }
        }
    }
}

fn request_failure(url: &str, error: &reqwest::Error) -> StrategyFailure {
    let hint = if error.is_timeout() {
        FailureCategory::Timeout
    } else {
        FailureCategory::Unknown
    };
    StrategyFailure::new(hint, format!("request to {url} failed: {error}"))
}

/// Streams the response body into the attempt destination, reporting progress.
async fn stream_to_file(
    response: reqwest::Response,
    ctx: &AttemptContext,
) -> Result<u64, StrategyFailure> {
    let path = ctx.destination();
    let file = File::create(path).await.map_err(|e| {
        StrategyFailure::new(
            FailureCategory::Unknown,
            format!("cannot create {}: {e}", path.display()),
        )
    })?;

    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;
    let mut last_reported: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| {
            let hint = if e.is_timeout() {
                FailureCategory::Timeout
            } else {
                FailureCategory::Unknown
            };
            StrategyFailure::new(hint, format!("transfer interrupted: {e}"))
        })?;

        writer.write_all(&chunk).await.map_err(|e| {
            StrategyFailure::new(
                FailureCategory::Unknown,
                format!("write to {} failed: {e}", path.display()),
            )
        })?;

        bytes_written += chunk.len() as u64;
        if bytes_written - last_reported >= PROGRESS_REPORT_STEP || last_reported == 0 {
            ctx.report_progress(bytes_written);
            last_reported = bytes_written;
        }
    }

    writer.flush().await.map_err(|e| {
        StrategyFailure::new(
            FailureCategory::Unknown,
            format!("flush of {} failed: {e}", path.display()),
        )
    })?;
    ctx.report_progress(bytes_written);

    Ok(bytes_written)
}

fn is_html(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    essence.eq_ignore_ascii_case("text/html") || essence.eq_ignore_ascii_case("application/xhtml+xml")
}

/// Parses a `Retry-After` value: integer seconds or an HTTP-date.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    match httpdate::parse_http_date(header_value) {
        Ok(when) => Some(
            when.duration_since(SystemTime::now())
                .unwrap_or_default()
                .min(MAX_RETRY_AFTER),
        ),
        Err(_) => {
            warn!(header_value, "unparseable Retry-After header");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_http_strategy_defaults() {
        let strategy = HttpStrategy::new().unwrap();
        assert_eq!(strategy.name(), "direct");
        assert_eq!(strategy.resource_class(), ResourceClass::LongTransfer);
    }

    #[test]
    fn test_can_handle_only_http_references() {
        let strategy = HttpStrategy::new().unwrap();
        assert!(strategy.can_handle(&DownloadTarget::new("a", "A", "https://x.example/a.mp3")));
        assert!(strategy.can_handle(&DownloadTarget::new("b", "B", "http://x.example/b.mp3")));
        assert!(!strategy.can_handle(&DownloadTarget::new("c", "C", "ftp://x.example/c.mp3")));
        assert!(!strategy.can_handle(&DownloadTarget::new("d", "D", "apple:12345")));
    }

    #[test]
    fn test_parse_retry_after_seconds_and_cap() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("999999"), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_parse_retry_after_http_date_in_past_is_zero() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_parse_retry_after_garbage_is_none() {
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after("-5"), None);
    }

    #[test]
    fn test_is_html_ignores_parameters() {
        assert!(is_html("text/html; charset=utf-8"));
        assert!(is_html("TEXT/HTML"));
        assert!(!is_html("audio/mpeg"));
    }
}
