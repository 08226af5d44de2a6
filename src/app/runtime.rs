//! Subcommand dispatch and the `run` command.

use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use acquirer_core::{
    Database, DownloadTarget, EngineConfig, HttpStrategy, Ledger, LedgerRepository,
    ManifestSink, Orchestrator, ProgressSubscriber, StateDir, StrategyRegistry, load_config,
    load_default_config,
};
use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::ProcessExit;
use crate::app::{exit_handler, history, operator, output, progress};
use crate::cli::{Args, Command, RunArgs, StateArgs};

pub(crate) async fn dispatch(args: Args) -> Result<ProcessExit> {
    match args.command {
        Command::Run(run) => run_batch(run, args.quiet).await,
        Command::History { target_id, state } => history::print_history(&state, &target_id).await,
        Command::Routes { state } => history::print_routes(&state).await,
    }
}

/// Config file (explicit or default location) with `--state-dir` applied.
pub(crate) fn resolve_config(state: &StateArgs) -> Result<EngineConfig> {
    let mut config = if let Some(path) = &state.config {
        load_config(path).with_context(|| format!("loading config {}", path.display()))?
    } else {
        let loaded = load_default_config()?;
        if loaded.loaded_from_file {
            debug!(path = ?loaded.path, "loaded default config file");
        }
        loaded.config
    };
    if let Some(dir) = &state.state_dir {
        config.state_dir.clone_from(dir);
    }
    Ok(config)
}

fn load_targets(path: &Path) -> Result<Vec<DownloadTarget>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading targets {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing targets {}", path.display()))
}

async fn run_batch(run: RunArgs, quiet: bool) -> Result<ProcessExit> {
    let mut config = resolve_config(&run.state)?;
    if let Some(dir) = run.output_dir {
        config.output_dir = dir;
    }
    if let Some(workers) = run.max_workers {
        config.max_workers = usize::from(workers);
    }
    if let Some(secs) = run.deadline {
        config.batch_deadline = Some(Duration::from_secs(secs));
    }

    let targets = load_targets(&run.targets)?;
    info!(targets = targets.len(), "Acquirer starting");

    let state_dir = StateDir::open(&config.state_dir)?;
    let db = Database::new(&state_dir.ledger_path())
        .await
        .context("opening ledger")?;
    let ledger: Arc<dyn LedgerRepository> = Arc::new(Ledger::new(db));

    let mut registry = StrategyRegistry::new();
    registry.register(Arc::new(HttpStrategy::new()?))?;

    let sink = Arc::new(ManifestSink::new(&config.output_dir));
    let orchestrator = Orchestrator::new(config, ledger, registry)?.with_sink(sink);

    let show_progress = !quiet && !run.interactive && std::io::stderr().is_terminal();
    let display = Arc::new(progress::ProgressDisplay::new(targets.len(), show_progress));
    let subscriber: Arc<dyn ProgressSubscriber> = display.clone();
    let display_task = orchestrator.attach(subscriber);

    let batch = orchestrator.start(targets).await?;
    let settled = if run.interactive {
        operator::run_console(&batch).await
    } else {
        batch.wait_settled().await.map_err(Into::into)
    };
    if let Err(error) = settled {
        display.finish();
        display_task.abort();
        if let Err(finish_error) = batch.finish().await {
            warn!(error = %finish_error, "batch did not finish cleanly");
        }
        return Err(error);
    }

    let report = batch.finish().await?;
    display_task.abort();
    display.finish();

    output::print_summary(&report);
    let exhausted: Vec<_> = report.exhausted().cloned().collect();
    if !exhausted.is_empty() {
        println!("Exhausted (rerun with --interactive to resolve):");
        for state in &exhausted {
            println!("{}", output::format_state(state));
            for attempt in orchestrator.attempts_for(&state.target_id).await? {
                println!("{}", output::format_attempt(&attempt));
            }
        }
    }

    drop(state_dir);
    Ok(exit_handler::determine_exit_outcome(&report))
}
