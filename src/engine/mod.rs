//! Batch orchestration.
//!
//! [`Orchestrator`] validates configuration, resumes every target from the
//! ledger and spawns one [`TargetMachine`] per target. The returned
//! [`BatchHandle`] exposes the operator gateway and collects the
//! [`BatchReport`] once the batch is finished.
//!
//! # Lifecycle
//!
//! 1. [`Orchestrator::new`] - routing table checked against the registry
//! 2. [`Orchestrator::start`] - targets registered, replayed and spawned
//! 3. [`BatchHandle::wait_settled`] - every target `Done`, `Failed` or `Exhausted`
//! 4. [`BatchHandle::finish`] - parked machines released, report built

mod sink;
mod state_dir;
mod stats;

pub use sink::{ArtifactSink, MANIFEST_FILE, ManifestSink, NullSink, SinkError};
pub use state_dir::{LEDGER_FILE, LOCK_FILE, StateDir};
pub use stats::BatchStats;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::error::EngineError;
use crate::gateway::{EventBus, Gateway, ProgressEvent, ProgressSubscriber, TargetHandle};
use crate::ledger::{AttemptRecord, LedgerError, LedgerRepository, StrategyStats, replay};
use crate::machine::{
    BatchControl, BatchSignal, MachineEnv, PARTIAL_DIR, TargetMachine, TargetPhase, TargetState,
};
use crate::routing::{LearnedRoutes, RoutingPolicy};
use crate::scheduler::{HeadroomProbe, ResourceBudget, SystemProbe};
use crate::strategy::StrategyRegistry;
use crate::target::{DownloadTarget, TargetId};

/// Queued operator commands per target.
const COMMAND_BUFFER: usize = 16;

/// Reason recorded for targets failed by the batch deadline.
pub const DEADLINE_REASON: &str = "batch deadline";

/// Builds and starts batches.
pub struct Orchestrator {
    config: EngineConfig,
    ledger: Arc<dyn LedgerRepository>,
    registry: Arc<StrategyRegistry>,
    sink: Arc<dyn ArtifactSink>,
    probe: Arc<dyn HeadroomProbe>,
    events: EventBus,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("strategies", &self.registry.names())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator after validating `config` against `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for out-of-range values or a
    /// routing rule that names an unregistered strategy.
    #[instrument(skip_all, fields(strategies = registry.len()))]
    pub fn new(
        config: EngineConfig,
        ledger: Arc<dyn LedgerRepository>,
        registry: StrategyRegistry,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if let Some((source_key, strategy)) =
            config.routing.unknown_strategies(&registry).into_iter().next()
        {
            return Err(ConfigError::UnknownStrategy {
                source_key,
                strategy,
                registered: registry.names().join(", "),
            }
            .into());
        }

        Ok(Self {
            config,
            ledger,
            registry: Arc::new(registry),
            sink: Arc::new(NullSink),
            probe: Arc::new(SystemProbe),
            events: EventBus::default(),
        })
    }

    /// Receives every `Done` artifact.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Headroom source for pool sizing.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn HeadroomProbe>) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receiver for progress events; subscribe before [`Self::start`] to see
    /// the first transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Runs `subscriber` on its own task.
    pub fn attach(&self, subscriber: Arc<dyn ProgressSubscriber>) -> JoinHandle<()> {
        self.events.attach(subscriber)
    }

    /// Full attempt history of a target, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if history cannot be read.
    pub async fn attempts_for(
        &self,
        target_id: &TargetId,
    ) -> Result<Vec<AttemptRecord>, LedgerError> {
        self.ledger.attempts_for(target_id).await
    }

    /// Starts a batch.
    ///
    /// Every target is registered and replayed before any machine runs, so a
    /// ledger read failure leaves the batch unstarted.
    ///
    /// # Errors
    ///
    /// [`EngineError::DuplicateTarget`] when an id repeats,
    /// [`EngineError::Io`] when the output directory cannot be created,
    /// [`EngineError::LedgerWriteFailure`] when registration fails and
    /// [`EngineError::Ledger`] when history cannot be read.
    #[instrument(skip_all, fields(targets = targets.len()))]
    pub async fn start(&self, targets: Vec<DownloadTarget>) -> Result<BatchHandle, EngineError> {
        let mut seen = HashSet::new();
        for target in &targets {
            if !seen.insert(target.id().clone()) {
                return Err(EngineError::DuplicateTarget(target.id().clone()));
            }
        }

        let output_dir = &self.config.output_dir;
        let partial_dir = output_dir.join(PARTIAL_DIR);
        tokio::fs::create_dir_all(&partial_dir)
            .await
            .map_err(|e| EngineError::io(&partial_dir, e))?;

        let learned = LearnedRoutes::load(self.ledger.as_ref())
            .await
            .map_err(EngineError::Ledger)?;
        let routing = Arc::new(RoutingPolicy::new(
            self.config.routing.clone(),
            self.registry.names(),
            Arc::new(learned),
        ));

        let limits = self.config.pool_limits();
        let budget = Arc::new(ResourceBudget::new(limits.size_for(self.probe.as_ref())));
        let signal = BatchSignal::new();
        let stats = Arc::new(BatchStats::new());
        let gateway = Gateway::new(self.events.clone(), Arc::clone(&self.ledger));

        let mut resumed = Vec::with_capacity(targets.len());
        for target in targets {
            let created = self
                .ledger
                .register_target(&target)
                .await
                .map_err(EngineError::LedgerWriteFailure)?;
            let history = replay(self.ledger.as_ref(), target.id())
                .await
                .map_err(EngineError::Ledger)?;
            debug!(target_id = %target.id(), created, point = ?history.point, "target admitted");
            resumed.push((target, history));
        }

        let env = Arc::new(MachineEnv {
            ledger: Arc::clone(&self.ledger),
            registry: Arc::clone(&self.registry),
            routing: Arc::clone(&routing),
            budget: Arc::clone(&budget),
            retry: self.config.retry_policy(),
            validator: self.config.validator(),
            limits: self.config.watchdog_limits(),
            output_dir: output_dir.clone(),
            profile: self.config.run_profile.clone(),
            events: self.events.clone(),
            sink: Arc::clone(&self.sink),
            signal: signal.clone(),
            stats: Arc::clone(&stats),
        });

        let mut machines = Vec::with_capacity(resumed.len());
        for (target, history) in resumed {
            let (state_tx, state_rx) =
                watch::channel(TargetState::new(target.id().clone(), target.label()));
            let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
            gateway.register(target.id().clone(), TargetHandle::new(state_rx, command_tx));

            let machine = TargetMachine::new(target, Arc::clone(&env), state_tx, command_rx);
            machines.push(tokio::spawn(machine.run(history)));
        }

        let mut timers = Vec::new();
        if let Some(deadline) = self.config.batch_deadline {
            let signal = signal.clone();
            timers.push(tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if signal.close(DEADLINE_REASON) {
                    warn!(deadline_secs = deadline.as_secs(), "batch deadline reached");
                }
            }));
        }
        if let Some(every) = self.config.resize_interval {
            let budget = Arc::clone(&budget);
            let probe = Arc::clone(&self.probe);
            timers.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let sizes = limits.size_for(probe.as_ref());
                    if sizes != budget.sizes() {
                        info!(?sizes, "resizing resource pools");
                        budget.resize(sizes);
                    }
                }
            }));
        }

        info!(
            targets = machines.len(),
            general = budget.sizes().general,
            long_transfer = budget.sizes().long_transfer,
            interactive = budget.sizes().interactive,
            "batch started"
        );

        Ok(BatchHandle {
            gateway,
            signal,
            stats,
            budget,
            routing,
            ledger: Arc::clone(&self.ledger),
            machines,
            timers,
        })
    }

    /// Starts a batch and finishes it once every target has settled.
    ///
    /// # Errors
    ///
    /// See [`Self::start`] and [`BatchHandle::finish`].
    pub async fn run(&self, targets: Vec<DownloadTarget>) -> Result<BatchReport, EngineError> {
        let batch = self.start(targets).await?;
        batch.wait_settled().await?;
        batch.finish().await
    }
}

/// A running batch.
pub struct BatchHandle {
    gateway: Gateway,
    signal: BatchSignal,
    stats: Arc<BatchStats>,
    budget: Arc<ResourceBudget>,
    routing: Arc<RoutingPolicy>,
    ledger: Arc<dyn LedgerRepository>,
    machines: Vec<JoinHandle<()>>,
    timers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for BatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchHandle")
            .field("gateway", &self.gateway)
            .field("control", &self.signal.current())
            .finish_non_exhaustive()
    }
}

impl BatchHandle {
    /// Operator surface for this batch.
    #[must_use]
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    #[must_use]
    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }

    #[must_use]
    pub fn budget(&self) -> &ResourceBudget {
        &self.budget
    }

    #[must_use]
    pub fn control(&self) -> BatchControl {
        self.signal.current()
    }

    /// Fails every target not yet `Done` with `reason`.
    ///
    /// Returns false if the batch was already closing or halted.
    pub fn abandon(&self, reason: impl Into<String>) -> bool {
        self.signal.close(reason)
    }

    /// Waits until every target is `Done`, `Failed` or `Exhausted`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LedgerWriteFailure`] as soon as the batch halts.
    pub async fn wait_settled(&self) -> Result<(), EngineError> {
        let mut control = self.signal.subscribe();
        let mut watchers: Vec<watch::Receiver<TargetState>> =
            self.gateway.handles().iter().map(TargetHandle::watch).collect();

        loop {
            if let Some(cause) = self.signal.fatal() {
                return Err(EngineError::LedgerWriteFailure(cause));
            }
            watchers.retain_mut(|w| {
                let settled = w.borrow_and_update().phase.is_settled();
                !settled && w.has_changed().is_ok()
            });
            if watchers.is_empty() {
                return Ok(());
            }

            let changes = watchers.iter_mut().map(|w| Box::pin(w.changed()));
            tokio::select! {
                _ = futures_util::future::select_all(changes) => {}
                _ = control.changed() => {}
            }
        }
    }

    /// Releases parked machines, waits for every machine and builds the report.
    ///
    /// Targets still `Exhausted` are left that way in the ledger and resume
    /// as `Exhausted` next run.
    ///
    /// # Errors
    ///
    /// [`EngineError::LedgerWriteFailure`] if the batch halted;
    /// [`EngineError::Ledger`] if strategy statistics cannot be read.
    #[instrument(skip(self))]
    pub async fn finish(self) -> Result<BatchReport, EngineError> {
        self.signal.suspend();
        for machine in self.machines {
            if let Err(e) = machine.await {
                warn!(error = %e, "target machine panicked");
            }
        }
        for timer in &self.timers {
            timer.abort();
        }

        if let Some(cause) = self.signal.fatal() {
            return Err(EngineError::LedgerWriteFailure(cause));
        }

        let targets: Vec<TargetState> = self
            .gateway
            .target_ids()
            .iter()
            .filter_map(|id| self.gateway.get_target_status(id).ok())
            .collect();
        let strategy_stats = self
            .ledger
            .strategy_stats()
            .await
            .map_err(EngineError::Ledger)?;

        let report = BatchReport {
            targets,
            strategy_stats,
            learned_routes: self.routing.learned().snapshot(),
            attempts: self.stats.attempts(),
            failures: self.stats.failures(),
            retried: self.stats.retried(),
            delivered: self.stats.delivered(),
            bytes: self.stats.bytes(),
        };
        info!(
            done = report.count(&TargetPhase::Done),
            exhausted = report.count(&TargetPhase::Exhausted),
            failed = report.count(&TargetPhase::Failed),
            attempts = report.attempts,
            "batch finished"
        );
        Ok(report)
    }
}

/// Outcome of a finished batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// Final state of every target, sorted by id.
    pub targets: Vec<TargetState>,
    /// Per-strategy counts across the whole ledger.
    pub strategy_stats: Vec<StrategyStats>,
    pub learned_routes: BTreeMap<String, String>,
    pub attempts: usize,
    pub failures: usize,
    pub retried: usize,
    pub delivered: usize,
    pub bytes: u64,
}

impl BatchReport {
    /// Targets that ended in `phase`.
    #[must_use]
    pub fn count(&self, phase: &TargetPhase) -> usize {
        self.targets.iter().filter(|t| &t.phase == phase).count()
    }

    #[must_use]
    pub fn all_done(&self) -> bool {
        self.targets.iter().all(|t| t.phase == TargetPhase::Done)
    }

    /// Targets needing an operator next run.
    pub fn exhausted(&self) -> impl Iterator<Item = &TargetState> {
        self.targets
            .iter()
            .filter(|t| t.phase == TargetPhase::Exhausted)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::ledger::Ledger;
    use crate::routing::RoutingTable;

    async fn ledger() -> Arc<dyn LedgerRepository> {
        Arc::new(Ledger::new(Database::new_in_memory().await.unwrap()))
    }

    // ==================== Configuration Tests ====================

    #[tokio::test]
    async fn test_orchestrator_rejects_unknown_routing_strategy() {
        let config = EngineConfig {
            routing: RoutingTable::new().with_route("default", &["direct", "youtube"]),
            ..EngineConfig::default()
        };
        let err = Orchestrator::new(config, ledger().await, StrategyRegistry::new()).unwrap_err();
        match err {
            EngineError::Configuration(ConfigError::UnknownStrategy { strategy, .. }) => {
                assert_eq!(strategy, "direct");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_orchestrator_rejects_invalid_config() {
        let config = EngineConfig {
            max_workers: 0,
            ..EngineConfig::default()
        };
        let err = Orchestrator::new(config, ledger().await, StrategyRegistry::new()).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    // ==================== Admission Tests ====================

    #[tokio::test]
    async fn test_start_rejects_duplicate_targets() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = EngineConfig {
            output_dir: dir.path().join("out"),
            ..EngineConfig::default()
        };
        let orchestrator =
            Orchestrator::new(config, ledger().await, StrategyRegistry::new()).unwrap();
        let targets = vec![
            DownloadTarget::new("ep", "One", "https://a.example/1.mp3"),
            DownloadTarget::new("ep", "Again", "https://a.example/2.mp3"),
        ];
        let err = orchestrator.start(targets).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateTarget(_)));
    }

    #[tokio::test]
    async fn test_empty_registry_exhausts_targets() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = EngineConfig {
            output_dir: dir.path().join("out"),
            ..EngineConfig::default()
        };
        let orchestrator =
            Orchestrator::new(config, ledger().await, StrategyRegistry::new()).unwrap();
        let report = orchestrator
            .run(vec![DownloadTarget::new("ep", "One", "https://a.example/1.mp3")])
            .await
            .unwrap();

        assert_eq!(report.count(&TargetPhase::Exhausted), 1);
        assert!(!report.all_done());
        assert_eq!(report.attempts, 0);
        assert!(dir.path().join("out").join(PARTIAL_DIR).is_dir());
    }

    #[tokio::test]
    async fn test_empty_batch_settles_immediately() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = EngineConfig {
            output_dir: dir.path().join("out"),
            ..EngineConfig::default()
        };
        let orchestrator =
            Orchestrator::new(config, ledger().await, StrategyRegistry::new()).unwrap();
        let report = orchestrator.run(Vec::new()).await.unwrap();
        assert!(report.targets.is_empty());
        assert!(report.all_done());
    }
}
