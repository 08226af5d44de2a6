//! Per-target lifecycle phases and the state snapshot readers observe.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::target::TargetId;

/// Lifecycle phase of one target.
///
/// ```text
/// Pending -> Attempting(s1) -> Attempting(s2) -> ... -> Succeeded -> Done
///                                            \-> Exhausted -> ManualPending -> Resolved -> Attempting / Done
/// Exhausted -> Pending (retry)      Exhausted | ManualPending -> Failed (abandon)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TargetPhase {
    /// Admitted; routing not yet computed or about to be recomputed.
    Pending,
    /// An attempt with the named strategy is in flight.
    Attempting {
        /// Strategy being invoked.
        strategy: String,
    },
    /// A validated artifact exists and is being handed downstream.
    Succeeded,
    /// Every routed strategy failed; waiting for an operator.
    Exhausted,
    /// An operator override has been accepted and is being applied.
    ManualPending,
    /// The override produced a route or artifact to act on.
    Resolved,
    /// Terminal: artifact delivered.
    Done,
    /// Terminal: abandoned or cut off by the batch deadline.
    Failed,
}

impl TargetPhase {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Attempting { .. } => "attempting",
            Self::Succeeded => "succeeded",
            Self::Exhausted => "exhausted",
            Self::ManualPending => "manual_pending",
            Self::Resolved => "resolved",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Rebuilds a phase from its stored name and strategy column.
    ///
    /// # Errors
    ///
    /// Returns a description when the name is unknown or an `attempting`
    /// row carries no strategy.
    pub fn from_parts(name: &str, strategy: Option<&str>) -> Result<Self, String> {
        match name {
            "pending" => Ok(Self::Pending),
            "attempting" => strategy
                .map(|s| Self::Attempting {
                    strategy: s.to_string(),
                })
                .ok_or_else(|| "attempting transition without strategy".to_string()),
            "succeeded" => Ok(Self::Succeeded),
            "exhausted" => Ok(Self::Exhausted),
            "manual_pending" => Ok(Self::ManualPending),
            "resolved" => Ok(Self::Resolved),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid target phase: {name}")),
        }
    }

    /// Strategy carried by an `Attempting` phase.
    #[must_use]
    pub fn strategy(&self) -> Option<&str> {
        match self {
            Self::Attempting { strategy } => Some(strategy),
            _ => None,
        }
    }

    /// `Done` and `Failed` never change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Settled phases need no further automated work.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Exhausted)
    }
}

impl fmt::Display for TargetPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attempting { strategy } => write!(f, "attempting({strategy})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Mutable lifecycle record of one target, owned by its machine.
#[derive(Debug, Clone, Serialize)]
pub struct TargetState {
    pub target_id: TargetId,
    pub label: String,
    pub phase: TargetPhase,
    /// Automated pass number; operator retries start a new pass.
    pub pass: u32,
    /// Strategy order computed for the current pass.
    pub route: Vec<String>,
    /// Ledger ids of every attempt recorded for this target.
    pub attempt_ids: Vec<i64>,
    /// Final artifact location once `Done`.
    pub artifact_path: Option<PathBuf>,
    /// Why the target last failed or exhausted.
    pub reason: Option<String>,
}

impl TargetState {
    #[must_use]
    pub fn new(target_id: TargetId, label: impl Into<String>) -> Self {
        Self {
            target_id,
            label: label.into(),
            phase: TargetPhase::Pending,
            pass: 1,
            route: Vec::new(),
            attempt_ids: Vec::new(),
            artifact_path: None,
            reason: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_from_parts_round_trips() {
        let phases = [
            TargetPhase::Pending,
            TargetPhase::Attempting {
                strategy: "direct".to_string(),
            },
            TargetPhase::Succeeded,
            TargetPhase::Exhausted,
            TargetPhase::ManualPending,
            TargetPhase::Resolved,
            TargetPhase::Done,
            TargetPhase::Failed,
        ];
        for phase in phases {
            let rebuilt = TargetPhase::from_parts(phase.as_str(), phase.strategy()).unwrap();
            assert_eq!(rebuilt, phase);
        }
    }

    #[test]
    fn test_phase_from_parts_rejects_bad_rows() {
        assert!(TargetPhase::from_parts("attempting", None).is_err());
        assert!(TargetPhase::from_parts("limbo", None).is_err());
    }

    #[test]
    fn test_phase_settled_and_terminal() {
        assert!(TargetPhase::Done.is_terminal());
        assert!(TargetPhase::Failed.is_terminal());
        assert!(!TargetPhase::Exhausted.is_terminal());
        assert!(TargetPhase::Exhausted.is_settled());
        assert!(!TargetPhase::ManualPending.is_settled());
        assert!(!TargetPhase::Pending.is_settled());
    }

    #[test]
    fn test_phase_display_includes_strategy() {
        let phase = TargetPhase::Attempting {
            strategy: "apple".to_string(),
        };
        assert_eq!(phase.to_string(), "attempting(apple)");
        assert_eq!(TargetPhase::ManualPending.to_string(), "manual_pending");
    }
}
