//! Per-target state machine.
//!
//! One [`TargetMachine`] runs per target as its own task and is the only
//! writer of that target's [`TargetState`]. Every transition is appended to
//! the ledger before the new state is published to readers, so a resumed run
//! can rebuild the machine from history alone.
//!
//! # Flow
//!
//! ```text
//! Pending -> Attempting(s1) -retry-> Attempting(s1) -> Attempting(s2) -> Succeeded -> Done
//!                                                              \-> Exhausted (parked)
//! parked: manual artifact  -> ManualPending -> Resolved -> Done
//!         manual source    -> ManualPending -> Resolved -> Attempting(s) -> ...
//!         retry            -> Pending (new pass)
//!         abandon/deadline -> Failed
//! ```

mod attempt;
mod control;
mod state;
mod validate;

pub use attempt::{
    DEFAULT_HARD_TIMEOUT, DEFAULT_STALL_TIMEOUT, PARTIAL_DIR, PROGRESS_EVENT_INTERVAL,
    WatchdogLimits, WatchdogVerdict, WatchedAttempt, discard_partial, partial_path, watch_attempt,
};
pub use control::{BatchControl, BatchSignal};
pub use state::{TargetPhase, TargetState};
pub use validate::{
    ArtifactFormat, ArtifactValidator, DEFAULT_MIN_ARTIFACT_BYTES, ValidatedArtifact,
    ValidationError,
};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, instrument, warn};

use crate::engine::{ArtifactSink, BatchStats};
use crate::failure::{FailureCategory, RetryDecision, RetryPolicy, StrategyFailure, classify};
use crate::gateway::{CommandEnvelope, EventBus, GatewayError, OperatorCommand, ProgressEvent};
use crate::ledger::{
    LedgerError, LedgerRepository, NewAttemptRecord, NewTransition, Replayed, ResumePoint,
};
use crate::routing::RoutingPolicy;
use crate::scheduler::ResourceBudget;
use crate::strategy::{AttemptContext, AttemptOutcome, Strategy, StrategyRegistry};
use crate::target::DownloadTarget;

/// Strategy name recorded for operator-supplied artifacts.
pub const MANUAL_ARTIFACT_STRATEGY: &str = "manual-artifact";

/// Failure reason recorded for operator abandonment.
pub const ABANDONED_REASON: &str = "abandoned by operator";

/// Collaborators shared by every machine in a batch.
pub(crate) struct MachineEnv {
    pub ledger: Arc<dyn LedgerRepository>,
    pub registry: Arc<StrategyRegistry>,
    pub routing: Arc<RoutingPolicy>,
    pub budget: Arc<ResourceBudget>,
    pub retry: RetryPolicy,
    pub validator: ArtifactValidator,
    pub limits: WatchdogLimits,
    pub output_dir: PathBuf,
    pub profile: String,
    pub events: EventBus,
    pub sink: Arc<dyn ArtifactSink>,
    pub signal: BatchSignal,
    pub stats: Arc<BatchStats>,
}

/// Why a machine stopped early.
enum Stop {
    /// This machine's ledger write failed.
    Ledger(LedgerError),
    /// Another machine's ledger write failed.
    Halted,
}

impl From<LedgerError> for Stop {
    fn from(error: LedgerError) -> Self {
        Self::Ledger(error)
    }
}

enum Step {
    Route { skip: BTreeSet<String> },
    Park,
    Finished,
}

/// Result of running one strategy (with its same-strategy retries).
enum StrategyRun {
    Delivered,
    Failed { reason: String },
    Closing { reason: String },
}

pub(crate) struct TargetMachine {
    target: DownloadTarget,
    env: Arc<MachineEnv>,
    state: watch::Sender<TargetState>,
    commands: mpsc::Receiver<CommandEnvelope>,
    control: watch::Receiver<BatchControl>,
    pass: u32,
}

impl TargetMachine {
    pub(crate) fn new(
        target: DownloadTarget,
        env: Arc<MachineEnv>,
        state: watch::Sender<TargetState>,
        commands: mpsc::Receiver<CommandEnvelope>,
    ) -> Self {
        let control = env.signal.subscribe();
        Self {
            target,
            env,
            state,
            commands,
            control,
            pass: 1,
        }
    }

    /// Drives the target until it is terminal or the batch no longer needs it.
    #[instrument(skip_all, fields(target_id = %self.target.id()))]
    pub(crate) async fn run(mut self, resume: Replayed) {
        match self.drive(resume).await {
            Ok(()) => debug!(phase = %self.state.borrow().phase, "machine finished"),
            Err(Stop::Ledger(error)) => self.env.signal.halt(error),
            Err(Stop::Halted) => debug!("machine stopped by batch halt"),
        }
        self.reject_queued_commands();
    }

    async fn drive(&mut self, resume: Replayed) -> Result<(), Stop> {
        let attempt_ids = resume.attempt_ids;
        self.state.send_modify(|s| s.attempt_ids = attempt_ids);

        let mut step = match resume.point {
            ResumePoint::Fresh => {
                self.transition(TargetPhase::Pending, None).await?;
                Step::Route {
                    skip: BTreeSet::new(),
                }
            }
            ResumePoint::Pending { pass, concluded } => {
                self.pass = pass;
                info!(pass, skipped = concluded.len(), "resuming interrupted pass");
                self.transition(TargetPhase::Pending, Some("resumed".to_string()))
                    .await?;
                Step::Route { skip: concluded }
            }
            ResumePoint::Succeeded { pass, attempt } => {
                self.pass = pass;
                let attempt = *attempt;
                self.resume_succeeded(attempt.destination_path, attempt.strategy, attempt.manual)
                    .await?
            }
            ResumePoint::Exhausted { pass, reason } => {
                self.pass = pass;
                self.transition(TargetPhase::Exhausted, reason).await?;
                Step::Park
            }
            ResumePoint::Done { pass, artifact } => {
                self.state.send_modify(|s| {
                    s.phase = TargetPhase::Done;
                    s.pass = pass;
                    s.artifact_path = artifact;
                });
                Step::Finished
            }
            ResumePoint::Failed { pass, reason } => {
                self.state.send_modify(|s| {
                    s.phase = TargetPhase::Failed;
                    s.pass = pass;
                    s.reason = reason;
                });
                Step::Finished
            }
        };

        loop {
            step = match step {
                Step::Route { skip } => self.automated_pass(&skip).await?,
                Step::Park => self.park().await?,
                Step::Finished => return Ok(()),
            };
        }
    }

    /// A success was recorded but `Done` never was.
    async fn resume_succeeded(
        &mut self,
        artifact: Option<PathBuf>,
        strategy: String,
        manual: bool,
    ) -> Result<Step, Stop> {
        let validated = match artifact.as_deref() {
            Some(path) => self.env.validator.validate(path).await.ok(),
            None => None,
        };

        match (artifact, validated) {
            (Some(path), Some(validated)) => {
                info!(path = %path.display(), "recorded artifact still valid; completing");
                self.transition(TargetPhase::Succeeded, Some("recorded artifact".to_string()))
                    .await?;
                if !manual {
                    self.record_learned(&strategy).await?;
                }
                self.finish_done(path, validated.size).await?;
                Ok(Step::Finished)
            }
            _ => {
                warn!("recorded artifact missing or invalid; starting a new pass");
                self.pass += 1;
                self.transition(
                    TargetPhase::Pending,
                    Some("recorded artifact missing or invalid".to_string()),
                )
                .await?;
                Ok(Step::Route {
                    skip: BTreeSet::new(),
                })
            }
        }
    }

    // ==================== Automated pass ====================

    async fn automated_pass(&mut self, skip: &BTreeSet<String>) -> Result<Step, Stop> {
        let route = self.env.routing.route(&self.target);
        let published = route.clone();
        self.state.send_modify(|s| s.route = published);

        let target = self.target.clone();
        let mut last_failure = None;

        for name in &route {
            if skip.contains(name) {
                debug!(strategy = %name, "already concluded in this pass");
                continue;
            }
            let Some(strategy) = self.env.registry.get(name) else {
                warn!(strategy = %name, "routed strategy is not registered");
                continue;
            };
            if !strategy.can_handle(&target) {
                debug!(strategy = %name, "strategy cannot handle target; skipping");
                continue;
            }

            match self.run_strategy(&strategy, &target, false).await? {
                StrategyRun::Delivered => return Ok(Step::Finished),
                StrategyRun::Failed { reason } => last_failure = Some(reason),
                StrategyRun::Closing { reason } => {
                    self.transition(TargetPhase::Failed, Some(reason)).await?;
                    return Ok(Step::Finished);
                }
            }
        }

        let reason =
            last_failure.unwrap_or_else(|| "no routed strategy left to try".to_string());
        self.transition(TargetPhase::Exhausted, Some(reason)).await?;
        Ok(Step::Park)
    }

    /// Runs one strategy, retrying it in place after transient failures.
    #[instrument(skip_all, fields(strategy = %strategy.name(), manual = manual))]
    async fn run_strategy(
        &mut self,
        strategy: &Arc<dyn Strategy>,
        target: &DownloadTarget,
        manual: bool,
    ) -> Result<StrategyRun, Stop> {
        let name = strategy.name().to_string();
        let mut attempt_number = 1;

        loop {
            if let Some(reason) = self.closing_reason() {
                return Ok(StrategyRun::Closing { reason });
            }

            self.transition(
                TargetPhase::Attempting {
                    strategy: name.clone(),
                },
                None,
            )
            .await?;

            let started_at = SystemTime::now();
            let partial = partial_path(&self.env.output_dir, &self.target.file_stem(), &name);

            let acquired = tokio::select! {
                token = self.env.budget.acquire(strategy.resource_class()) => {
                    Some(token.map_err(|_| Stop::Halted)?)
                }
                _ = self.control.wait_for(BatchControl::interrupts_attempts) => None,
            };
            let Some(token) = acquired else {
                return match self.closing_reason() {
                    Some(reason) => Ok(StrategyRun::Closing { reason }),
                    None => Err(Stop::Halted),
                };
            };

            self.env.stats.record_attempt();
            debug!(attempt_number, class = %token.class(), "attempt started");

            let (ctx, progress) = AttemptContext::new(partial.clone(), self.env.profile.clone());
            let events = self.env.events.clone();
            let target_id = self.target.id().clone();
            let progress_strategy = name.clone();
            let watched = watch_attempt(
                strategy.attempt(target, &ctx),
                progress,
                self.env.limits,
                |bytes| {
                    events.publish(ProgressEvent::progress(
                        target_id.clone(),
                        progress_strategy.clone(),
                        bytes,
                    ));
                },
            )
            .await;
            drop(ctx);
            drop(token);

            let failure = match watched.verdict.into_outcome() {
                AttemptOutcome::Success { .. } => {
                    match self.env.validator.validate(&partial).await {
                        Ok(artifact) => {
                            match self
                                .deliver(&name, started_at, &partial, &artifact, manual)
                                .await?
                            {
                                None => return Ok(StrategyRun::Delivered),
                                Some(failure) => failure,
                            }
                        }
                        Err(e) => StrategyFailure::new(FailureCategory::Corrupt, e.to_string()),
                    }
                }
                AttemptOutcome::Failure(failure) => failure,
            };

            discard_partial(&partial).await;
            let category = classify(&failure);
            self.env.stats.record_failure();

            let mut record = NewAttemptRecord::failure(
                self.target.id().clone(),
                self.pass,
                &name,
                started_at,
                category,
                &failure.message,
            )
            .with_bytes(watched.last_progress);
            if manual {
                record = record.manual();
            }
            self.record_attempt(record).await?;

            match self
                .env
                .retry
                .decide(category, attempt_number, failure.metadata.retry_after)
            {
                RetryDecision::RetrySame { delay, attempt } => {
                    self.env.stats.record_retry();
                    info!(%category, delay_ms = delay.as_millis(), attempt, "retrying same strategy");
                    attempt_number = attempt;
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = self.control.wait_for(BatchControl::interrupts_attempts) => {}
                    }
                }
                RetryDecision::Advance { reason } => {
                    debug!(%category, reason, "advancing to next strategy");
                    return Ok(StrategyRun::Failed {
                        reason: format!("{name}: {category}: {}", failure.message),
                    });
                }
            }
        }
    }

    /// Moves a validated artifact into place and records the success.
    ///
    /// Returns a failure when the artifact cannot be moved.
    async fn deliver(
        &mut self,
        strategy: &str,
        started_at: SystemTime,
        partial: &Path,
        artifact: &ValidatedArtifact,
        manual: bool,
    ) -> Result<Option<StrategyFailure>, Stop> {
        let final_path = self.final_path(artifact.format);
        if let Err(e) = tokio::fs::rename(partial, &final_path).await {
            return Ok(Some(StrategyFailure::new(
                FailureCategory::Unknown,
                format!("cannot move artifact to {}: {e}", final_path.display()),
            )));
        }

        let mut record = NewAttemptRecord::success(
            self.target.id().clone(),
            self.pass,
            strategy,
            started_at,
            &final_path,
            &artifact.sha256,
        )
        .with_bytes(artifact.size);
        if manual {
            record = record.manual();
        }
        self.record_attempt(record).await?;
        self.transition(TargetPhase::Succeeded, None).await?;

        if !manual {
            self.record_learned(strategy).await?;
        }
        self.finish_done(final_path, artifact.size).await?;
        Ok(None)
    }

    async fn record_learned(&self, strategy: &str) -> Result<(), Stop> {
        self.env
            .routing
            .learned()
            .record_success(self.env.ledger.as_ref(), &self.target.source_key(), strategy)
            .await?;
        Ok(())
    }

    async fn finish_done(&mut self, artifact: PathBuf, size: u64) -> Result<(), Stop> {
        let published = artifact.clone();
        self.transition_with(TargetPhase::Done, None, |s| {
            s.artifact_path = Some(published);
            s.reason = None;
        })
        .await?;
        self.env.stats.record_delivery(size);

        if let Err(e) = self.env.sink.deliver(&self.target, &artifact).await {
            warn!(error = %e, "artifact sink failed");
        }
        Ok(())
    }

    fn final_path(&self, format: ArtifactFormat) -> PathBuf {
        self.env
            .output_dir
            .join(format!("{}.{}", self.target.file_stem(), format.extension()))
    }

    // ==================== Parked ====================

    async fn park(&mut self) -> Result<Step, Stop> {
        loop {
            let control = self.control.borrow_and_update().clone();
            match control {
                BatchControl::Running => {}
                BatchControl::Closing { reason } => {
                    self.transition(TargetPhase::Failed, Some(reason)).await?;
                    return Ok(Step::Finished);
                }
                BatchControl::Suspended => {
                    debug!("batch suspended; target stays exhausted");
                    return Ok(Step::Finished);
                }
                BatchControl::Halted => return Err(Stop::Halted),
            }

            tokio::select! {
                envelope = self.commands.recv() => match envelope {
                    Some(envelope) => {
                        if let Some(step) = self.apply_command(envelope).await? {
                            return Ok(step);
                        }
                    }
                    None => {
                        debug!("command channel closed");
                        return Ok(Step::Finished);
                    }
                },
                changed = self.control.changed() => {
                    if changed.is_err() {
                        return Ok(Step::Finished);
                    }
                }
            }
        }
    }

    async fn apply_command(&mut self, envelope: CommandEnvelope) -> Result<Option<Step>, Stop> {
        let CommandEnvelope { command, reply } = envelope;
        let phase = self.state.borrow().phase.clone();
        if !command.accepted_in(&phase) {
            let _ = reply.send(Err(GatewayError::InvalidPhase {
                target_id: self.target.id().clone(),
                command: command.name(),
                phase,
            }));
            return Ok(None);
        }

        info!(%command, "applying operator command");
        match command {
            OperatorCommand::Retry => {
                self.pass += 1;
                self.transition_with(
                    TargetPhase::Pending,
                    Some("operator retry".to_string()),
                    |s| s.route.clear(),
                )
                .await?;
                let _ = reply.send(Ok(()));
                Ok(Some(Step::Route {
                    skip: BTreeSet::new(),
                }))
            }
            OperatorCommand::Abandon => {
                self.transition(TargetPhase::Failed, Some(ABANDONED_REASON.to_string()))
                    .await?;
                let _ = reply.send(Ok(()));
                Ok(Some(Step::Finished))
            }
            OperatorCommand::ManualArtifact { path } => {
                self.apply_manual_artifact(&path, reply).await
            }
            OperatorCommand::ManualSource { reference } => {
                self.apply_manual_source(reference, reply).await
            }
        }
    }

    async fn apply_manual_artifact(
        &mut self,
        path: &Path,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    ) -> Result<Option<Step>, Stop> {
        let detail = format!("manual artifact {}", path.display());
        self.transition(TargetPhase::ManualPending, Some(detail.clone()))
            .await?;
        let started_at = SystemTime::now();

        let artifact = match self.env.validator.validate(path).await {
            Ok(artifact) => artifact,
            Err(e) => {
                return self
                    .reject_manual_artifact(started_at, FailureCategory::Corrupt, e.to_string(), reply)
                    .await;
            }
        };

        let final_path = self.final_path(artifact.format);
        if let Err(e) = copy_artifact(path, &final_path).await {
            let reason = format!("cannot copy artifact to {}: {e}", final_path.display());
            return self
                .reject_manual_artifact(started_at, FailureCategory::Unknown, reason, reply)
                .await;
        }

        let record = NewAttemptRecord::success(
            self.target.id().clone(),
            self.pass,
            MANUAL_ARTIFACT_STRATEGY,
            started_at,
            &final_path,
            &artifact.sha256,
        )
        .with_bytes(artifact.size)
        .manual();
        self.record_attempt(record).await?;
        self.transition(TargetPhase::Resolved, Some(detail)).await?;
        self.finish_done(final_path, artifact.size).await?;

        let _ = reply.send(Ok(()));
        Ok(Some(Step::Finished))
    }

    async fn reject_manual_artifact(
        &mut self,
        started_at: SystemTime,
        category: FailureCategory,
        reason: String,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    ) -> Result<Option<Step>, Stop> {
        warn!(%category, reason, "manual artifact rejected");
        self.env.stats.record_failure();
        let record = NewAttemptRecord::failure(
            self.target.id().clone(),
            self.pass,
            MANUAL_ARTIFACT_STRATEGY,
            started_at,
            category,
            &reason,
        )
        .manual();
        self.record_attempt(record).await?;
        self.transition(TargetPhase::Exhausted, Some(reason.clone()))
            .await?;

        let _ = reply.send(Err(GatewayError::ArtifactRejected { reason }));
        Ok(None)
    }

    async fn apply_manual_source(
        &mut self,
        reference: String,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    ) -> Result<Option<Step>, Stop> {
        let manual_target = self.target.with_reference(reference.clone());

        // Only strategies the routing table allows for this target's source.
        let strategy = self
            .env
            .routing
            .route(&self.target)
            .iter()
            .filter_map(|name| self.env.registry.get(name))
            .find(|s| s.can_handle(&manual_target));

        let Some(strategy) = strategy else {
            debug!(reference, "no routed strategy accepts the manual source");
            let _ = reply.send(Err(GatewayError::NoApplicableStrategy { reference }));
            return Ok(None);
        };

        let name = strategy.name().to_string();
        self.transition(
            TargetPhase::ManualPending,
            Some(format!("manual source {reference}")),
        )
        .await?;
        self.transition_with(
            TargetPhase::Resolved,
            Some(format!("{reference} via {name}")),
            |s| s.route = vec![name],
        )
        .await?;
        let _ = reply.send(Ok(()));

        match self.run_strategy(&strategy, &manual_target, true).await? {
            StrategyRun::Delivered => Ok(Some(Step::Finished)),
            StrategyRun::Failed { reason } => {
                self.transition(TargetPhase::Exhausted, Some(reason)).await?;
                Ok(None)
            }
            StrategyRun::Closing { reason } => {
                self.transition(TargetPhase::Failed, Some(reason)).await?;
                Ok(Some(Step::Finished))
            }
        }
    }

    fn reject_queued_commands(&mut self) {
        self.commands.close();
        while let Ok(envelope) = self.commands.try_recv() {
            let phase = self.state.borrow().phase.clone();
            let error = if phase.is_terminal() {
                GatewayError::InvalidPhase {
                    target_id: self.target.id().clone(),
                    command: envelope.command.name(),
                    phase,
                }
            } else {
                GatewayError::Closed
            };
            let _ = envelope.reply.send(Err(error));
        }
    }

    // ==================== Ledger-first writes ====================

    fn closing_reason(&self) -> Option<String> {
        self.control.borrow().closing_reason().map(str::to_string)
    }

    async fn transition(&mut self, phase: TargetPhase, detail: Option<String>) -> Result<(), Stop> {
        self.transition_with(phase, detail, |_| {}).await
    }

    async fn transition_with(
        &mut self,
        phase: TargetPhase,
        detail: Option<String>,
        update: impl FnOnce(&mut TargetState),
    ) -> Result<(), Stop> {
        if self.control.borrow().is_halted() {
            return Err(Stop::Halted);
        }

        self.env
            .ledger
            .append_transition(&NewTransition {
                target_id: self.target.id().clone(),
                pass: self.pass,
                phase: phase.clone(),
                detail: detail.clone(),
            })
            .await?;

        let pass = self.pass;
        let published = phase.clone();
        let reason = detail.clone();
        self.state.send_modify(|s| {
            if matches!(published, TargetPhase::Exhausted | TargetPhase::Failed) {
                s.reason = reason;
            }
            s.phase = published;
            s.pass = pass;
            update(s);
        });

        info!(%phase, pass, detail = detail.as_deref().unwrap_or(""), "target transition");
        let summary = detail.unwrap_or_else(|| phase.to_string());
        self.env.events.publish(ProgressEvent::transition(
            self.target.id().clone(),
            phase,
            summary,
        ));
        Ok(())
    }

    async fn record_attempt(&mut self, record: NewAttemptRecord) -> Result<i64, Stop> {
        if self.control.borrow().is_halted() {
            return Err(Stop::Halted);
        }

        let id = self.env.ledger.append_attempt(&record).await?;
        self.state.send_modify(|s| s.attempt_ids.push(id));

        let summary = match (&record.category, &record.message) {
            (Some(category), Some(message)) => {
                format!("{} failed ({category}): {message}", record.strategy)
            }
            _ => format!("{} succeeded", record.strategy),
        };
        let phase = self.state.borrow().phase.clone();
        self.env.events.publish(ProgressEvent::attempt_outcome(
            self.target.id().clone(),
            phase,
            record.strategy,
            record.category,
            summary,
        ));
        Ok(id)
    }
}

/// Copies an operator-supplied file into the output directory.
async fn copy_artifact(source: &Path, destination: &Path) -> std::io::Result<()> {
    if let (Ok(from), Ok(to)) = (
        tokio::fs::canonicalize(source).await,
        tokio::fs::canonicalize(destination).await,
    ) {
        if from == to {
            return Ok(());
        }
    }
    tokio::fs::copy(source, destination).await.map(|_| ())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_copy_artifact_copies_into_place() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("in.mp3");
        let destination = dir.path().join("out.mp3");
        tokio::fs::write(&source, b"ID3data").await.unwrap();

        copy_artifact(&source, &destination).await.unwrap();
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"ID3data");
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_copy_artifact_onto_itself_keeps_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("same.mp3");
        tokio::fs::write(&path, b"ID3data").await.unwrap();

        copy_artifact(&path, &path).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"ID3data");
    }
}
