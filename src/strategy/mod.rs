//! Pluggable acquisition strategies.
//!
//! A [`Strategy`] is one way of obtaining audio for a target (direct
//! enclosure download, a platform API lookup, a browser-driven capture, ...).
//! Strategies are registered by name in a [`StrategyRegistry`]; routing decides
//! the order in which they are tried.
//!
//! # Architecture
//!
//! - [`Strategy`] - async trait individual strategies implement
//! - [`StrategyRegistry`] - name-keyed collection in registration order
//! - [`AttemptContext`] - per-attempt destination, run profile and progress signal
//! - [`AttemptOutcome`] - success, or a [`StrategyFailure`] for the classifier
//! - [`HttpStrategy`] - built-in direct download over HTTP(S)

mod http;
mod registry;

pub use http::{DIRECT_STRATEGY_NAME, HttpStrategy, parse_retry_after};
pub use registry::StrategyRegistry;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::failure::StrategyFailure;
use crate::target::DownloadTarget;

/// Which resource pool an attempt draws its token from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    /// Network/API-bound attempts.
    General,
    /// Large payload transfers; pool sized smaller.
    LongTransfer,
    /// Attempts that drive an interactive client (headless browser and similar).
    Interactive,
}

impl ResourceClass {
    pub const ALL: [Self; 3] = [Self::General, Self::LongTransfer, Self::Interactive];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::LongTransfer => "long_transfer",
            Self::Interactive => "interactive",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one strategy invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The strategy wrote its artifact to [`AttemptContext::destination`].
    Success {
        /// Bytes written.
        bytes_transferred: u64,
    },
    /// The strategy could not obtain the audio.
    Failure(StrategyFailure),
}

/// Everything a strategy needs for one attempt.
#[derive(Debug)]
pub struct AttemptContext {
    destination: PathBuf,
    profile: String,
    progress: watch::Sender<u64>,
}

impl AttemptContext {
    /// Creates a context and the receiver the watchdog observes.
    #[must_use]
    pub fn new(destination: PathBuf, profile: impl Into<String>) -> (Self, watch::Receiver<u64>) {
        let (progress, observer) = watch::channel(0);
        (
            Self {
                destination,
                profile: profile.into(),
                progress,
            },
            observer,
        )
    }

    /// Where the strategy must write the artifact on success.
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Run profile; strategies may adapt behavior (e.g. `"test"` runs).
    #[must_use]
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Reports forward progress; resets the stall timer.
    ///
    /// `bytes_so_far` is the running total for this attempt. Never blocks.
    pub fn report_progress(&self, bytes_so_far: u64) {
        self.progress.send_replace(bytes_so_far);
    }
}

/// Errors raised while building or registering strategies.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// A strategy with the same name is already registered.
    #[error("strategy '{0}' is already registered\n  Suggestion: Strategy names must be unique")]
    DuplicateName(String),

    /// The strategy could not be constructed.
    #[error("failed to build strategy '{name}': {reason}")]
    Build {
        /// Strategy name.
        name: String,
        /// What went wrong.
        reason: String,
    },
}

/// A named way of obtaining audio for a target.
///
/// Implementations never return an opaque error: every failure is reported as
/// [`AttemptOutcome::Failure`] with at least a coarse category hint. Attempts
/// may be cancelled at any `.await` point by the watchdog; the destination may
/// then hold a partial file, which the engine discards.
///
/// This trait uses `async_trait` to support dynamic dispatch via
/// `Arc<dyn Strategy>`.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Unique name used in routing tables and the ledger.
    fn name(&self) -> &str;

    /// Pool this strategy's attempts draw from.
    fn resource_class(&self) -> ResourceClass {
        ResourceClass::General
    }

    /// Returns false when this strategy cannot apply to the target at all.
    fn can_handle(&self, target: &DownloadTarget) -> bool;

    /// Attempts to acquire audio for `target`, writing it to `ctx.destination()`.
    async fn attempt(&self, target: &DownloadTarget, ctx: &AttemptContext) -> AttemptOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_class_as_str() {
        assert_eq!(ResourceClass::General.as_str(), "general");
        assert_eq!(ResourceClass::LongTransfer.to_string(), "long_transfer");
        assert_eq!(ResourceClass::Interactive.to_string(), "interactive");
    }

    #[test]
    fn test_attempt_context_progress_is_observable() {
        let (ctx, mut observer) = AttemptContext::new(PathBuf::from("/tmp/x.part"), "full");
        assert!(!observer.has_changed().unwrap_or(true));

        ctx.report_progress(512);
        assert!(observer.has_changed().unwrap_or(false));
        assert_eq!(*observer.borrow_and_update(), 512);
        assert_eq!(ctx.profile(), "full");
        assert_eq!(ctx.destination(), Path::new("/tmp/x.part"));
    }

    #[test]
    fn test_strategy_error_duplicate_message() {
        let err = StrategyError::DuplicateName("direct".to_string());
        assert!(err.to_string().contains("direct"));
        assert!(err.to_string().contains("Suggestion"));
    }
}
