//! Same-strategy retry policy for transient failures.
//!
//! Transient categories ([`FailureCategory::Stalled`], [`FailureCategory::Timeout`])
//! are re-tried with the same strategy a bounded number of times, with
//! exponential backoff and jitter. Every other category advances to the next
//! routed strategy immediately.
//!
//! # Example
//!
//! ```
//! use acquirer_core::failure::{FailureCategory, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! match policy.decide(FailureCategory::Stalled, 1, None) {
//!     RetryDecision::RetrySame { delay, attempt } => {
//!         println!("retrying in {delay:?} (attempt {attempt})");
//!     }
//!     RetryDecision::Advance { reason } => println!("moving on: {reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::FailureCategory;

/// Default number of same-strategy retries for a transient failure.
pub const DEFAULT_TRANSIENT_RETRIES: u32 = 2;

/// Default base delay for exponential backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Default maximum delay cap.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to delays.
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Decision after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Invoke the same strategy again after `delay`.
    RetrySame {
        /// How long to wait before retrying.
        delay: Duration,
        /// Attempt number of the retry (1-indexed, so the first retry is attempt 2).
        attempt: u32,
    },

    /// Move on to the next routed strategy.
    Advance {
        /// Human-readable reason.
        reason: String,
    },
}

/// Bounded retry with exponential backoff.
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
///
/// Jitter is bounded by the smaller of 500ms and `base_delay`, so a zero base
/// produces zero delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt for a transient failure.
    transient_retries: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt.
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            transient_retries: DEFAULT_TRANSIENT_RETRIES,
            base_delay: DEFAULT_BACKOFF_BASE,
            max_delay: DEFAULT_BACKOFF_MAX,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(transient_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            transient_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// Policy that never retries the same strategy.
    #[must_use]
    pub fn no_retries() -> Self {
        Self {
            transient_retries: 0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn transient_retries(&self) -> u32 {
        self.transient_retries
    }

    /// Decides what happens after attempt number `attempt` (1-indexed, counted
    /// per strategy) failed with `category`.
    ///
    /// A server-provided `retry_after` raises the delay, capped at `max_delay`.
    #[instrument(skip(self), fields(transient_retries = self.transient_retries))]
    pub fn decide(
        &self,
        category: FailureCategory,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if !category.is_transient() {
            return RetryDecision::Advance {
                reason: format!("{category} is not transient"),
            };
        }

        if attempt > self.transient_retries {
            debug!(attempt, "transient retries exhausted");
            return RetryDecision::Advance {
                reason: format!(
                    "transient retries ({}) exhausted",
                    self.transient_retries
                ),
            };
        }

        let mut delay = self.calculate_delay(attempt);
        if let Some(requested) = retry_after {
            delay = delay.max(requested.min(self.max_delay));
        }

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry same strategy"
        );

        RetryDecision::RetrySame {
            delay,
            attempt: attempt + 1,
        }
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let bound = MAX_JITTER.min(self.base_delay).as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=bound);
        Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== RetryPolicy Tests ====================

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.transient_retries(), 2);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_retry_policy_max_delay_never_below_base() {
        let policy = RetryPolicy::new(1, Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(5));
    }

    // ==================== Delay Calculation Tests ====================

    #[test]
    fn test_delay_calculation_first_attempt() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(32));
        let delay = policy.calculate_delay(1);
        assert!(delay >= Duration::from_secs(1));
        assert!(delay <= Duration::from_millis(1500));
    }

    #[test]
    fn test_delay_calculation_third_attempt() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(32));
        let delay = policy.calculate_delay(3);
        assert!(delay >= Duration::from_secs(4));
        assert!(delay <= Duration::from_millis(4500));
    }

    #[test]
    fn test_delay_calculation_respects_max_delay() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(5));
        let delay = policy.calculate_delay(8);
        assert!(delay <= Duration::from_millis(5500));
    }

    #[test]
    fn test_zero_base_delay_has_no_jitter() {
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO);
        for attempt in 1..=3 {
            assert_eq!(policy.calculate_delay(attempt), Duration::ZERO);
        }
    }

    // ==================== decide Tests ====================

    #[test]
    fn test_decide_non_transient_advances_immediately() {
        let policy = RetryPolicy::default();
        for category in [
            FailureCategory::AccessDenied,
            FailureCategory::NotFound,
            FailureCategory::Corrupt,
            FailureCategory::Unknown,
        ] {
            assert!(
                matches!(policy.decide(category, 1, None), RetryDecision::Advance { .. }),
                "{category} should advance"
            );
        }
    }

    #[test]
    fn test_decide_transient_retries_up_to_bound() {
        let policy = RetryPolicy::new(2, Duration::ZERO, Duration::ZERO);

        assert_eq!(
            policy.decide(FailureCategory::Stalled, 1, None),
            RetryDecision::RetrySame {
                delay: Duration::ZERO,
                attempt: 2
            }
        );
        assert!(matches!(
            policy.decide(FailureCategory::Timeout, 2, None),
            RetryDecision::RetrySame { attempt: 3, .. }
        ));
        assert!(matches!(
            policy.decide(FailureCategory::Stalled, 3, None),
            RetryDecision::Advance { .. }
        ));
    }

    #[test]
    fn test_decide_no_retries_policy_advances_on_transient() {
        let policy = RetryPolicy::no_retries();
        assert!(matches!(
            policy.decide(FailureCategory::Timeout, 1, None),
            RetryDecision::Advance { .. }
        ));
    }

    #[test]
    fn test_decide_honours_retry_after_within_cap() {
        let policy = RetryPolicy::new(2, Duration::ZERO, Duration::from_secs(10));

        let RetryDecision::RetrySame { delay, .. } =
            policy.decide(FailureCategory::Stalled, 1, Some(Duration::from_secs(3)))
        else {
            panic!("expected retry");
        };
        assert_eq!(delay, Duration::from_secs(3));

        let RetryDecision::RetrySame { delay, .. } =
            policy.decide(FailureCategory::Stalled, 1, Some(Duration::from_secs(600)))
        else {
            panic!("expected retry");
        };
        assert_eq!(delay, Duration::from_secs(10));
    }
}
