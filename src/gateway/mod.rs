//! Progress/override gateway.
//!
//! The only path by which anything outside a target's machine influences it.
//! Outbound, machines publish [`ProgressEvent`]s on an [`EventBus`]. Inbound,
//! operator commands are checked against the target's current phase and then
//! sent to its machine, which checks them again before applying them.

mod commands;
mod events;

pub use commands::{CommandEnvelope, OperatorCommand};
pub use events::{EVENT_BUFFER, EventBus, EventKind, ProgressEvent, ProgressSubscriber};

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::ledger::{AttemptRecord, LedgerError, LedgerRepository};
use crate::machine::{TargetPhase, TargetState};
use crate::target::TargetId;

/// Errors returned to operators.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("unknown target: {0}")]
    UnknownTarget(TargetId),

    #[error(
        "{command} is not accepted while {target_id} is {phase}\n  Suggestion: Use `exhausted` to list targets waiting for an operator"
    )]
    InvalidPhase {
        target_id: TargetId,
        command: &'static str,
        phase: TargetPhase,
    },

    #[error("manual artifact rejected: {reason}")]
    ArtifactRejected { reason: String },

    #[error(
        "no registered strategy can handle '{reference}'\n  Suggestion: Supply an http(s) URL or a reference a registered strategy understands"
    )]
    NoApplicableStrategy { reference: String },

    #[error("the batch is no longer accepting commands")]
    Closed,

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Reader and command channel for one target.
#[derive(Debug, Clone)]
pub struct TargetHandle {
    state: watch::Receiver<TargetState>,
    commands: mpsc::Sender<CommandEnvelope>,
}

impl TargetHandle {
    #[must_use]
    pub fn new(
        state: watch::Receiver<TargetState>,
        commands: mpsc::Sender<CommandEnvelope>,
    ) -> Self {
        Self { state, commands }
    }

    #[must_use]
    pub fn snapshot(&self) -> TargetState {
        self.state.borrow().clone()
    }

    /// A fresh receiver for waiting on state changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<TargetState> {
        self.state.clone()
    }
}

/// An exhausted target with everything tried so far.
#[derive(Debug, Clone)]
pub struct ExhaustedTarget {
    pub state: TargetState,
    pub attempts: Vec<AttemptRecord>,
}

/// Operator-facing surface of a running batch.
#[derive(Clone)]
pub struct Gateway {
    targets: Arc<DashMap<TargetId, TargetHandle>>,
    events: EventBus,
    ledger: Arc<dyn LedgerRepository>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("targets", &self.targets.len())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    #[must_use]
    pub fn new(events: EventBus, ledger: Arc<dyn LedgerRepository>) -> Self {
        Self {
            targets: Arc::new(DashMap::new()),
            events,
            ledger,
        }
    }

    pub(crate) fn register(&self, target_id: TargetId, handle: TargetHandle) {
        self.targets.insert(target_id, handle);
    }

    fn handle(&self, target_id: &TargetId) -> Result<TargetHandle, GatewayError> {
        self.targets
            .get(target_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::UnknownTarget(target_id.clone()))
    }

    /// Target ids in this batch, sorted.
    #[must_use]
    pub fn target_ids(&self) -> Vec<TargetId> {
        let mut ids: Vec<_> = self.targets.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub(crate) fn handles(&self) -> Vec<TargetHandle> {
        self.targets.iter().map(|e| e.value().clone()).collect()
    }

    async fn dispatch(
        &self,
        target_id: &TargetId,
        command: OperatorCommand,
    ) -> Result<(), GatewayError> {
        let handle = self.handle(target_id)?;
        let name = command.name();

        let phase = handle.snapshot().phase;
        if !command.accepted_in(&phase) {
            return Err(GatewayError::InvalidPhase {
                target_id: target_id.clone(),
                command: name,
                phase,
            });
        }

        debug!(%target_id, %command, "dispatching operator command");
        let (reply, outcome) = oneshot::channel();
        if handle
            .commands
            .send(CommandEnvelope { command, reply })
            .await
            .is_err()
        {
            return Err(self.closed_error(target_id, name, &handle));
        }

        match outcome.await {
            Ok(result) => result,
            Err(_) => Err(self.closed_error(target_id, name, &handle)),
        }
    }

    fn closed_error(
        &self,
        target_id: &TargetId,
        command: &'static str,
        handle: &TargetHandle,
    ) -> GatewayError {
        let phase = handle.snapshot().phase;
        if phase.is_terminal() {
            GatewayError::InvalidPhase {
                target_id: target_id.clone(),
                command,
                phase,
            }
        } else {
            GatewayError::Closed
        }
    }

    /// Retries an exhausted target from an alternate reference.
    ///
    /// Resolves once a strategy has been chosen; the attempt itself is
    /// reported through progress events.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidPhase`] unless the target is `Exhausted` or
    /// `ManualPending`; [`GatewayError::NoApplicableStrategy`] when no
    /// registered strategy handles the reference.
    #[doc(alias = "provide_manual_source")]
    #[instrument(skip(self))]
    pub async fn submit_manual_source(
        &self,
        target_id: &TargetId,
        reference: impl Into<String> + std::fmt::Debug,
    ) -> Result<(), GatewayError> {
        self.dispatch(
            target_id,
            OperatorCommand::ManualSource {
                reference: reference.into(),
            },
        )
        .await
    }

    /// Delivers an operator-supplied file after validating it.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidPhase`] unless the target is `Exhausted` or
    /// `ManualPending`; [`GatewayError::ArtifactRejected`] when the file fails
    /// validation (the target returns to `Exhausted`).
    #[doc(alias = "provide_manual_artifact")]
    #[instrument(skip(self))]
    pub async fn submit_manual_artifact(
        &self,
        target_id: &TargetId,
        path: impl Into<PathBuf> + std::fmt::Debug,
    ) -> Result<(), GatewayError> {
        self.dispatch(
            target_id,
            OperatorCommand::ManualArtifact { path: path.into() },
        )
        .await
    }

    /// Starts a new automated pass for an exhausted target.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidPhase`] unless the target is `Exhausted`.
    #[doc(alias = "retry")]
    #[instrument(skip(self))]
    pub async fn retry_target(&self, target_id: &TargetId) -> Result<(), GatewayError> {
        self.dispatch(target_id, OperatorCommand::Retry).await
    }

    /// Fails an exhausted target.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidPhase`] unless the target is `Exhausted` or
    /// `ManualPending`.
    #[doc(alias = "abandon")]
    #[instrument(skip(self))]
    pub async fn abandon_target(&self, target_id: &TargetId) -> Result<(), GatewayError> {
        self.dispatch(target_id, OperatorCommand::Abandon).await
    }

    /// Current state of a target.
    ///
    /// # Errors
    ///
    /// [`GatewayError::UnknownTarget`] for ids outside this batch.
    pub fn get_target_status(&self, target_id: &TargetId) -> Result<TargetState, GatewayError> {
        Ok(self.handle(target_id)?.snapshot())
    }

    /// Every target currently `Exhausted`, with its full attempt history.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Ledger`] if attempt history cannot be read.
    pub async fn list_exhausted_targets(&self) -> Result<Vec<ExhaustedTarget>, GatewayError> {
        let mut exhausted: Vec<TargetState> = self
            .targets
            .iter()
            .map(|entry| entry.value().snapshot())
            .filter(|state| state.phase == TargetPhase::Exhausted)
            .collect();
        exhausted.sort_by(|a, b| a.target_id.cmp(&b.target_id));

        let mut listed = Vec::with_capacity(exhausted.len());
        for state in exhausted {
            let attempts = self.ledger.attempts_for(&state.target_id).await?;
            listed.push(ExhaustedTarget { state, attempts });
        }
        Ok(listed)
    }

    /// Receiver for the outbound event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Runs `subscriber` on its own task.
    pub fn attach(&self, subscriber: Arc<dyn ProgressSubscriber>) -> JoinHandle<()> {
        self.events.attach(subscriber)
    }
}
