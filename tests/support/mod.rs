//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acquirer_core::ledger::{LedgerDbErrorKind, NewAttemptRecord, NewTransition, StrategyStats};
use acquirer_core::{
    AttemptContext, AttemptOutcome, AttemptRecord, Database, DownloadTarget, EngineConfig,
    FailureCategory, FixedProbe, Gateway, Ledger, LedgerError, LedgerRepository, ResourceClass, Strategy,
    StrategyFailure, StrategyRegistry, TargetId, TargetPhase, TargetState, TransitionRecord,
};
use async_trait::async_trait;
use tempfile::TempDir;

/// Size of the fake MP3 payloads written by [`Step::Succeed`].
pub const ARTIFACT_BYTES: usize = 4096;

/// One scripted response.
#[derive(Debug, Clone)]
pub enum Step {
    /// Write a valid MP3 to the destination.
    Succeed,
    /// Report a failure with this category hint.
    Fail(FailureCategory),
    /// Write an HTML page and claim success.
    WriteHtml,
    /// Never report progress and never return.
    Hang,
    /// Report progress every 20ms forever.
    Trickle,
    /// Write a valid MP3 whose byte after `ID3` is the target label's first byte.
    SucceedMarked,
    /// Report this many bytes, then fail with the category.
    ProgressThenFail(u64, FailureCategory),
}

/// Strategy that replays a script, then repeats `fallback`.
pub struct ScriptedStrategy {
    name: String,
    class: ResourceClass,
    prefix: Option<String>,
    delay: Duration,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    references: Mutex<Vec<String>>,
}

impl ScriptedStrategy {
    pub fn new(name: &str, script: Vec<Step>) -> Self {
        Self {
            name: name.to_string(),
            class: ResourceClass::General,
            prefix: None,
            delay: Duration::ZERO,
            script: Mutex::new(script.into()),
            fallback: Step::Fail(FailureCategory::NotFound),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            references: Mutex::new(Vec::new()),
        }
    }

    /// Always succeeds.
    pub fn succeeding(name: &str) -> Self {
        Self::new(name, Vec::new()).with_fallback(Step::Succeed)
    }

    /// Always fails with `category`.
    pub fn failing(name: &str, category: FailureCategory) -> Self {
        Self::new(name, Vec::new()).with_fallback(Step::Fail(category))
    }

    pub fn with_fallback(mut self, step: Step) -> Self {
        self.fallback = step;
        self
    }

    pub fn with_class(mut self, class: ResourceClass) -> Self {
        self.class = class;
        self
    }

    /// Only handles references starting with `prefix`.
    pub fn handling(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.to_string());
        self
    }

    /// Holds every attempt open for `delay` before acting.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous attempts observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// References passed to each attempt, in call order.
    pub fn references(&self) -> Vec<String> {
        self.references.lock().expect("references lock").clone()
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Strategy for ScriptedStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn resource_class(&self) -> ResourceClass {
        self.class
    }

    fn can_handle(&self, target: &DownloadTarget) -> bool {
        self.prefix
            .as_deref()
            .is_none_or(|prefix| target.primary_reference().starts_with(prefix))
    }

    async fn attempt(&self, target: &DownloadTarget, ctx: &AttemptContext) -> AttemptOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.references
            .lock()
            .expect("references lock")
            .push(target.primary_reference().to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let outcome = self.act(target, ctx).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

impl ScriptedStrategy {
    async fn act(&self, target: &DownloadTarget, ctx: &AttemptContext) -> AttemptOutcome {
        let step = self.next_step();
        if !self.delay.is_zero() {
            ctx.report_progress(1);
            tokio::time::sleep(self.delay).await;
        }

        match step {
            Step::Succeed => {
                write_mp3(ctx.destination());
                ctx.report_progress(ARTIFACT_BYTES as u64);
                AttemptOutcome::Success {
                    bytes_transferred: ARTIFACT_BYTES as u64,
                }
            }
            Step::Fail(category) => AttemptOutcome::Failure(StrategyFailure::new(
                category,
                format!("{} failed", self.name),
            )),
            Step::WriteHtml => {
                write_html(ctx.destination());
                AttemptOutcome::Success {
                    bytes_transferred: 2048,
                }
            }
            Step::SucceedMarked => {
                write_mp3(ctx.destination());
                let mut body = std::fs::read(ctx.destination()).expect("read mp3 fixture");
                body[3] = target.label().as_bytes().first().copied().unwrap_or(b'?');
                std::fs::write(ctx.destination(), body).expect("mark mp3 fixture");
                ctx.report_progress(ARTIFACT_BYTES as u64);
                AttemptOutcome::Success {
                    bytes_transferred: ARTIFACT_BYTES as u64,
                }
            }
            Step::ProgressThenFail(bytes, category) => {
                ctx.report_progress(bytes);
                AttemptOutcome::Failure(StrategyFailure::new(
                    category,
                    format!("{} failed", self.name),
                ))
            }
            Step::Hang => std::future::pending().await,
            Step::Trickle => {
                let mut bytes = 0;
                loop {
                    bytes += 64;
                    ctx.report_progress(bytes);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }
    }
}

/// Writes a payload the validator accepts as MP3.
pub fn write_mp3(path: &Path) {
    let mut body = b"ID3\x04\x00\x00\x00\x00\x00\x00".to_vec();
    body.resize(ARTIFACT_BYTES, 0x55);
    std::fs::write(path, body).expect("write mp3 fixture");
}

/// Writes an HTML page large enough to pass the size floor.
pub fn write_html(path: &Path) {
    let mut body = b"<!DOCTYPE html><html><body>Please sign in</body></html>".to_vec();
    body.resize(2048, b' ');
    std::fs::write(path, body).expect("write html fixture");
}

/// File-backed ledger in a fresh temp dir.
pub async fn setup_ledger() -> (Arc<Ledger>, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let ledger = open_ledger(dir.path()).await;
    (ledger, dir)
}

/// Opens (or reopens) the ledger under `dir`.
pub async fn open_ledger(dir: &Path) -> Arc<Ledger> {
    let db = Database::new(&dir.join("ledger.db"))
        .await
        .expect("Failed to create test database");
    Arc::new(Ledger::new(db))
}

/// Short timeouts and no backoff so scenarios finish quickly.
pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        output_dir: dir.join("out"),
        state_dir: dir.join("state"),
        stall_timeout: Duration::from_millis(250),
        hard_timeout: Duration::from_secs(5),
        transient_retries: 1,
        backoff_base: Duration::ZERO,
        backoff_max: Duration::ZERO,
        run_profile: "test".to_string(),
        ..EngineConfig::default()
    }
}

/// Probe pinned to four CPUs and unknown memory.
pub fn fixed_probe() -> Arc<FixedProbe> {
    Arc::new(FixedProbe {
        available_memory: None,
        cpus: 4,
    })
}

pub fn registry(strategies: &[Arc<ScriptedStrategy>]) -> StrategyRegistry {
    let mut registry = StrategyRegistry::new();
    for strategy in strategies {
        registry
            .register(Arc::clone(strategy) as Arc<dyn Strategy>)
            .expect("register strategy");
    }
    registry
}

pub fn target(id: &str) -> DownloadTarget {
    DownloadTarget::new(
        TargetId::new(id),
        format!("Episode {id}"),
        format!("https://cdn.example.com/{id}.mp3"),
    )
}

/// A valid MP3 on disk outside the output dir.
pub fn mp3_fixture(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    write_mp3(&path);
    path
}

/// Polls the gateway until `id` reaches `phase`; panics after five seconds.
pub async fn wait_for_phase(gateway: &Gateway, id: &TargetId, phase: TargetPhase) -> TargetState {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = gateway.get_target_status(id).expect("known target");
            if state.phase == phase {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{id} never reached {phase}"))
}

/// Phases recorded for `id`, oldest first.
pub async fn phase_history(ledger: &dyn LedgerRepository, id: &TargetId) -> Vec<String> {
    ledger
        .transitions_for(id)
        .await
        .expect("read transitions")
        .iter()
        .map(|t| t.phase.as_str().to_string())
        .collect()
}

/// Ledger wrapper that starts failing writes on demand.
pub struct FailingLedger {
    inner: Arc<Ledger>,
    fail_attempts: AtomicBool,
}

impl FailingLedger {
    pub fn new(inner: Arc<Ledger>) -> Self {
        Self {
            inner,
            fail_attempts: AtomicBool::new(false),
        }
    }

    pub fn fail_attempt_writes(&self) {
        self.fail_attempts.store(true, Ordering::SeqCst);
    }

    fn unavailable() -> LedgerError {
        LedgerError::Database {
            kind: LedgerDbErrorKind::Io,
            message: "disk I/O error".to_string(),
        }
    }
}

#[async_trait]
impl LedgerRepository for FailingLedger {
    async fn register_target(&self, target: &DownloadTarget) -> Result<bool, LedgerError> {
        self.inner.register_target(target).await
    }

    async fn append_attempt(&self, record: &NewAttemptRecord) -> Result<i64, LedgerError> {
        if self.fail_attempts.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.append_attempt(record).await
    }

    async fn append_transition(&self, transition: &NewTransition) -> Result<i64, LedgerError> {
        self.inner.append_transition(transition).await
    }

    async fn attempts_for(&self, target_id: &TargetId) -> Result<Vec<AttemptRecord>, LedgerError> {
        self.inner.attempts_for(target_id).await
    }

    async fn transitions_for(
        &self,
        target_id: &TargetId,
    ) -> Result<Vec<TransitionRecord>, LedgerError> {
        self.inner.transitions_for(target_id).await
    }

    async fn learned_routes(&self) -> Result<Vec<(String, String)>, LedgerError> {
        self.inner.learned_routes().await
    }

    async fn upsert_learned_route(
        &self,
        source_key: &str,
        strategy: &str,
    ) -> Result<(), LedgerError> {
        self.inner.upsert_learned_route(source_key, strategy).await
    }

    async fn strategy_stats(&self) -> Result<Vec<StrategyStats>, LedgerError> {
        self.inner.strategy_stats().await
    }
}
