//! Attempt watchdog: stall timer and hard ceiling around one strategy call.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::failure::{FailureCategory, StrategyFailure};
use crate::strategy::AttemptOutcome;

/// Default stall timeout: no reported progress for this long cancels the attempt.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default hard ceiling for one attempt.
pub const DEFAULT_HARD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Minimum spacing between progress events for one attempt.
pub const PROGRESS_EVENT_INTERVAL: Duration = Duration::from_secs(1);

/// Directory under the output dir where in-flight artifacts are written.
pub const PARTIAL_DIR: &str = ".partial";

/// The two per-attempt timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogLimits {
    pub stall_timeout: Duration,
    pub hard_timeout: Duration,
}

impl Default for WatchdogLimits {
    fn default() -> Self {
        Self {
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            hard_timeout: DEFAULT_HARD_TIMEOUT,
        }
    }
}

/// How a watched attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// The strategy returned on its own.
    Completed(AttemptOutcome),
    /// No progress for the stall timeout; the attempt was dropped.
    Stalled { idle: Duration },
    /// The hard ceiling fired; the attempt was dropped.
    TimedOut { elapsed: Duration },
}

impl WatchdogVerdict {
    /// Folds a cancellation into the strategy outcome space.
    #[must_use]
    pub fn into_outcome(self) -> AttemptOutcome {
        match self {
            Self::Completed(outcome) => outcome,
            Self::Stalled { idle } => AttemptOutcome::Failure(StrategyFailure::new(
                FailureCategory::Stalled,
                format!("no progress for {}s", idle.as_secs_f64()),
            )),
            Self::TimedOut { elapsed } => AttemptOutcome::Failure(StrategyFailure::new(
                FailureCategory::Timeout,
                format!("exceeded hard ceiling after {}s", elapsed.as_secs_f64()),
            )),
        }
    }
}

/// Verdict of a watched attempt plus the last byte count it reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedAttempt {
    pub verdict: WatchdogVerdict,
    pub last_progress: u64,
}

/// Runs `attempt` under the stall and hard timers.
///
/// Each value published on `progress` resets the stall timer. `on_progress`
/// is called with the running byte count at most once per
/// [`PROGRESS_EVENT_INTERVAL`]. The attempt future is dropped when either
/// timer fires.
pub async fn watch_attempt<F, P>(
    attempt: F,
    mut progress: watch::Receiver<u64>,
    limits: WatchdogLimits,
    on_progress: P,
) -> WatchedAttempt
where
    F: Future<Output = AttemptOutcome>,
    P: FnMut(u64),
{
    let verdict = watch_timers(attempt, &mut progress, limits, on_progress).await;
    let last_progress = *progress.borrow();
    WatchedAttempt {
        verdict,
        last_progress,
    }
}

async fn watch_timers<F, P>(
    attempt: F,
    progress: &mut watch::Receiver<u64>,
    limits: WatchdogLimits,
    mut on_progress: P,
) -> WatchdogVerdict
where
    F: Future<Output = AttemptOutcome>,
    P: FnMut(u64),
{
    let started = Instant::now();
    let hard = tokio::time::sleep(limits.hard_timeout);
    let stall = tokio::time::sleep(limits.stall_timeout);
    tokio::pin!(attempt, hard, stall);

    let mut progress_open = true;
    let mut last_event: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            outcome = &mut attempt => return WatchdogVerdict::Completed(outcome),
            () = &mut hard => {
                warn!(elapsed_ms = started.elapsed().as_millis(), "attempt hit hard ceiling");
                return WatchdogVerdict::TimedOut { elapsed: started.elapsed() };
            }
            () = &mut stall => {
                warn!(stall_secs = limits.stall_timeout.as_secs_f64(), "attempt stalled");
                return WatchdogVerdict::Stalled { idle: limits.stall_timeout };
            }
            changed = progress.changed(), if progress_open => {
                if changed.is_err() {
                    progress_open = false;
                    continue;
                }
                let bytes = *progress.borrow_and_update();
                stall.as_mut().reset(Instant::now() + limits.stall_timeout);
                if last_event.is_none_or(|at| at.elapsed() >= PROGRESS_EVENT_INTERVAL) {
                    on_progress(bytes);
                    last_event = Some(Instant::now());
                }
            }
        }
    }
}

/// Where a strategy writes its in-flight artifact.
#[must_use]
pub fn partial_path(output_dir: &Path, file_stem: &str, strategy: &str) -> PathBuf {
    output_dir
        .join(PARTIAL_DIR)
        .join(format!("{file_stem}.{}.part", crate::target::sanitize_file_stem(strategy)))
}

/// Removes a leftover partial file, ignoring absence.
pub async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "discarded partial artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to discard partial artifact"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    fn limits(stall_ms: u64, hard_ms: u64) -> WatchdogLimits {
        WatchdogLimits {
            stall_timeout: Duration::from_millis(stall_ms),
            hard_timeout: Duration::from_millis(hard_ms),
        }
    }

    #[tokio::test]
    async fn test_completed_attempt_passes_outcome_through() {
        let (_tx, rx) = watch::channel(0u64);
        let verdict = watch_attempt(
            async { AttemptOutcome::Success { bytes_transferred: 9 } },
            rx,
            limits(1_000, 5_000),
            |_| {},
        )
        .await
        .verdict;
        assert_eq!(
            verdict,
            WatchdogVerdict::Completed(AttemptOutcome::Success { bytes_transferred: 9 })
        );
    }

    #[tokio::test]
    async fn test_silent_attempt_stalls() {
        let (_tx, rx) = watch::channel(0u64);
        let verdict = watch_attempt(
            std::future::pending::<AttemptOutcome>(),
            rx,
            limits(30, 5_000),
            |_| {},
        )
        .await
        .verdict;
        assert!(matches!(verdict, WatchdogVerdict::Stalled { .. }));
        match verdict.into_outcome() {
            AttemptOutcome::Failure(failure) => assert_eq!(failure.hint, FailureCategory::Stalled),
            AttemptOutcome::Success { .. } => panic!("expected stall failure"),
        }
    }

    #[tokio::test]
    async fn test_progress_resets_stall_until_hard_ceiling() {
        let (tx, rx) = watch::channel(0u64);
        let seen = Arc::new(AtomicU64::new(0));
        let seen_in_callback = Arc::clone(&seen);

        let attempt = async move {
            let mut bytes = 0;
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                bytes += 100;
                tx.send_replace(bytes);
            }
        };

        let watched = watch_attempt(attempt, rx, limits(50, 200), move |bytes| {
            seen_in_callback.store(bytes, Ordering::SeqCst);
        })
        .await;

        assert!(matches!(watched.verdict, WatchdogVerdict::TimedOut { .. }));
        assert!(seen.load(Ordering::SeqCst) >= 100);
        assert!(watched.last_progress >= seen.load(Ordering::SeqCst));
        match watched.verdict.into_outcome() {
            AttemptOutcome::Failure(failure) => assert_eq!(failure.hint, FailureCategory::Timeout),
            AttemptOutcome::Success { .. } => panic!("expected timeout failure"),
        }
    }

    #[tokio::test]
    async fn test_progress_events_are_rate_limited() {
        let (tx, rx) = watch::channel(0u64);
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);

        let attempt = async move {
            for i in 1..=20u64 {
                tokio::time::sleep(Duration::from_millis(2)).await;
                tx.send_replace(i);
            }
            AttemptOutcome::Success { bytes_transferred: 20 }
        };

        let watched = watch_attempt(attempt, rx, limits(1_000, 5_000), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert!(matches!(watched.verdict, WatchdogVerdict::Completed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(watched.last_progress, 20);
    }

    #[tokio::test]
    async fn test_failed_attempt_keeps_last_progress() {
        let (tx, rx) = watch::channel(0u64);
        let attempt = async move {
            tx.send_replace(500_000);
            AttemptOutcome::Failure(StrategyFailure::new(FailureCategory::NotFound, "gone"))
        };

        let watched = watch_attempt(attempt, rx, limits(1_000, 5_000), |_| {}).await;

        assert_eq!(watched.last_progress, 500_000);
        assert!(matches!(
            watched.verdict,
            WatchdogVerdict::Completed(AttemptOutcome::Failure(_))
        ));
    }

    #[tokio::test]
    async fn test_stalled_attempt_keeps_last_progress() {
        let (tx, rx) = watch::channel(0u64);
        let attempt = async move {
            tx.send_replace(2_048);
            std::future::pending::<AttemptOutcome>().await
        };

        let watched = watch_attempt(attempt, rx, limits(30, 5_000), |_| {}).await;

        assert!(matches!(watched.verdict, WatchdogVerdict::Stalled { .. }));
        assert_eq!(watched.last_progress, 2_048);
    }

    #[test]
    fn test_partial_path_layout() {
        let path = partial_path(Path::new("/out"), "ep-1", "apple podcasts");
        assert_eq!(path, PathBuf::from("/out/.partial/ep-1.apple_podcasts.part"));
    }

    #[tokio::test]
    async fn test_discard_partial_ignores_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gone.part");
        discard_partial(&path).await;
        tokio::fs::write(&path, b"x").await.unwrap();
        discard_partial(&path).await;
        assert!(!path.exists());
    }
}
