//! `history` and `routes` subcommands: read-only views of the ledger.

use acquirer_core::{Database, Ledger, StateDir, TargetId};
use anyhow::{Context, Result, bail};

use crate::ProcessExit;
use crate::app::output::{format_attempt, format_transition};
use crate::app::runtime::resolve_config;
use crate::cli::StateArgs;

async fn open_ledger(state: &StateArgs) -> Result<(StateDir, Ledger)> {
    let config = resolve_config(state)?;
    let state_dir = StateDir::open(&config.state_dir)?;
    let ledger_path = state_dir.ledger_path();
    if !ledger_path.exists() {
        bail!(
            "no ledger at {}\n  Suggestion: Run a batch first or pass --state-dir",
            ledger_path.display()
        );
    }
    let db = Database::new(&ledger_path)
        .await
        .with_context(|| format!("opening ledger {}", ledger_path.display()))?;
    Ok((state_dir, Ledger::new(db)))
}

pub(crate) async fn print_history(state: &StateArgs, target_id: &str) -> Result<ProcessExit> {
    let (_lock, ledger) = open_ledger(state).await?;
    let id = TargetId::new(target_id);

    let Some(target) = ledger.get_target(&id).await? else {
        bail!("target not found in ledger: {target_id}");
    };
    println!("{} {}", target.id(), target.label());
    println!("  reference: {}", target.primary_reference());
    println!("  source: {}", target.source_key());

    println!("Transitions:");
    for transition in ledger.transitions_for(&id).await? {
        println!("{}", format_transition(&transition));
    }
    println!("Attempts:");
    for attempt in ledger.attempts_for(&id).await? {
        println!("{}", format_attempt(&attempt));
    }
    Ok(ProcessExit::Success)
}

pub(crate) async fn print_routes(state: &StateArgs) -> Result<ProcessExit> {
    let (_lock, ledger) = open_ledger(state).await?;
    let routes = ledger.learned_routes().await?;
    if routes.is_empty() {
        println!("No learned routes yet.");
    }
    for (source_key, strategy) in routes {
        println!("{source_key:<32} {strategy}");
    }
    Ok(ProcessExit::Success)
}
