//! Operator commands delivered to a target's machine.

use std::fmt;
use std::path::PathBuf;

use tokio::sync::oneshot;

use super::GatewayError;
use crate::machine::TargetPhase;

/// An operator override for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Try again from an alternate reference with a one-strategy route.
    ManualSource { reference: String },
    /// Validate and deliver a file the operator already has.
    ManualArtifact { path: PathBuf },
    /// Start a new automated pass.
    Retry,
    /// Give up on the target.
    Abandon,
}

impl OperatorCommand {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ManualSource { .. } => "submit_manual_source",
            Self::ManualArtifact { .. } => "submit_manual_artifact",
            Self::Retry => "retry_target",
            Self::Abandon => "abandon_target",
        }
    }

    /// Whether the command may be applied while the target is in `phase`.
    #[must_use]
    pub fn accepted_in(&self, phase: &TargetPhase) -> bool {
        match self {
            Self::ManualSource { .. } | Self::ManualArtifact { .. } | Self::Abandon => {
                matches!(phase, TargetPhase::Exhausted | TargetPhase::ManualPending)
            }
            Self::Retry => matches!(phase, TargetPhase::Exhausted),
        }
    }
}

impl fmt::Display for OperatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ManualSource { reference } => write!(f, "manual source {reference}"),
            Self::ManualArtifact { path } => write!(f, "manual artifact {}", path.display()),
            Self::Retry => f.write_str("retry"),
            Self::Abandon => f.write_str("abandon"),
        }
    }
}

/// A command plus the channel its outcome is reported on.
#[derive(Debug)]
pub struct CommandEnvelope {
    pub command: OperatorCommand,
    pub reply: oneshot::Sender<Result<(), GatewayError>>,
}
