//! Reconstructs where a target left off from its ledger history.
//!
//! | Last recorded phase | Resumes as |
//! |---------------------|------------|
//! | none | `Fresh` |
//! | `done` | `Done` |
//! | `failed` | `Failed` |
//! | success attempt recorded, no `done` | `Succeeded` (artifact re-validated) |
//! | `exhausted`, `manual_pending`, `resolved` | `Exhausted` |
//! | `pending`, `attempting` during a manual pass | `Exhausted` |
//! | `pending`, `attempting` | `Pending`, skipping strategies already concluded this pass |
//!
//! A target caught mid-attempt during a manual-source pass resumes as
//! `Exhausted` rather than `Pending`. The operator's reference is not
//! persisted, so re-routing would retry the original reference; the target
//! waits for the operator to submit the source again instead.

use std::collections::BTreeSet;
use std::path::PathBuf;

use tracing::{debug, instrument};

use super::{AttemptRecord, LedgerError, LedgerRepository, TransitionRecord};
use crate::machine::TargetPhase;
use crate::target::TargetId;

/// Where a target's machine should pick up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    /// Never seen before.
    Fresh,
    /// Re-enter routing in `pass`, skipping `concluded` strategies.
    Pending {
        pass: u32,
        concluded: BTreeSet<String>,
    },
    /// A success was recorded but never reached `Done`.
    Succeeded { pass: u32, attempt: Box<AttemptRecord> },
    /// Waiting for an operator.
    Exhausted { pass: u32, reason: Option<String> },
    /// Already delivered.
    Done { pass: u32, artifact: Option<PathBuf> },
    /// Already abandoned.
    Failed { pass: u32, reason: Option<String> },
}

/// Result of replaying one target.
#[derive(Debug, Clone)]
pub struct Replayed {
    pub point: ResumePoint,
    pub attempt_ids: Vec<i64>,
}

/// Replays the ledger for `target_id`.
///
/// # Errors
///
/// Returns [`LedgerError`] if history cannot be read.
#[instrument(skip(ledger))]
pub async fn replay(
    ledger: &dyn LedgerRepository,
    target_id: &TargetId,
) -> Result<Replayed, LedgerError> {
    let transitions = ledger.transitions_for(target_id).await?;
    let attempts = ledger.attempts_for(target_id).await?;

    let point = resume_point(&transitions, &attempts);
    debug!(?point, "replayed target history");

    Ok(Replayed {
        point,
        attempt_ids: attempts.iter().map(|a| a.id).collect(),
    })
}

fn resume_point(transitions: &[TransitionRecord], attempts: &[AttemptRecord]) -> ResumePoint {
    let Some(last) = transitions.last() else {
        return ResumePoint::Fresh;
    };
    let pass = last.pass;

    match last.phase {
        TargetPhase::Done => {
            let artifact = attempts
                .iter()
                .rev()
                .find(|a| a.is_success())
                .and_then(|a| a.destination_path.clone());
            return ResumePoint::Done { pass, artifact };
        }
        TargetPhase::Failed => {
            return ResumePoint::Failed {
                pass,
                reason: last.detail.clone(),
            };
        }
        _ => {}
    }

    if let Some(success) = attempts
        .iter()
        .rev()
        .find(|a| a.pass == pass && a.is_success())
    {
        return ResumePoint::Succeeded {
            pass,
            attempt: Box::new(success.clone()),
        };
    }

    let exhausted_reason = || {
        transitions
            .iter()
            .rev()
            .find(|t| t.phase == TargetPhase::Exhausted)
            .and_then(|t| t.detail.clone())
    };

    match last.phase {
        TargetPhase::Exhausted | TargetPhase::ManualPending | TargetPhase::Resolved => {
            ResumePoint::Exhausted {
                pass,
                reason: exhausted_reason(),
            }
        }
        _ => {
            let pass_start = transitions
                .iter()
                .position(|t| t.pass == pass && t.phase == TargetPhase::Pending)
                .unwrap_or(0);
            let current = &transitions[pass_start..];

            // A manual-source pass changes the reference; the operator re-issues it.
            if current
                .iter()
                .any(|t| matches!(t.phase, TargetPhase::Resolved | TargetPhase::ManualPending))
            {
                return ResumePoint::Exhausted {
                    pass,
                    reason: exhausted_reason(),
                };
            }

            let in_flight = last.phase.strategy();
            let concluded = current
                .iter()
                .filter_map(|t| t.phase.strategy())
                .filter(|s| Some(*s) != in_flight)
                .map(str::to_string)
                .collect();

            ResumePoint::Pending { pass, concluded }
        }
    }
}
