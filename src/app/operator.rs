//! Line-oriented operator console for `run --interactive`.
//!
//! ```text
//! source <id> <reference>   retry from an alternate reference
//! artifact <id> <path>      deliver a local file
//! retry <id>                start a new automated pass
//! abandon <id>              fail the target
//! status <id>               show current state
//! exhausted                 list exhausted targets with their attempts
//! quit                      stop reading commands
//! ```

use std::path::PathBuf;

use acquirer_core::{BatchHandle, Gateway, TargetId, TargetPhase};
use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::app::output::{format_state, print_exhausted};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConsoleCommand {
    Source { target_id: TargetId, reference: String },
    Artifact { target_id: TargetId, path: PathBuf },
    Retry(TargetId),
    Abandon(TargetId),
    Status(TargetId),
    Exhausted,
    Help,
    Quit,
}

const HELP: &str = "commands: source <id> <reference> | artifact <id> <path> | retry <id> | abandon <id> | status <id> | exhausted | quit";

/// Parses one console line; blank lines yield `Ok(None)`.
pub(crate) fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (verb, rest) = line
        .split_once(char::is_whitespace)
        .map_or((line, ""), |(v, r)| (v, r.trim()));
    let (id, tail) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(i, t)| (i, t.trim()));

    let need_id = || {
        if id.is_empty() {
            Err(format!("`{verb}` needs a target id"))
        } else {
            Ok(TargetId::new(id))
        }
    };
    let need_tail = |what: &str| {
        if tail.is_empty() {
            Err(format!("`{verb}` needs a target id and a {what}"))
        } else {
            Ok(tail.to_string())
        }
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "source" => ConsoleCommand::Source {
            target_id: need_id()?,
            reference: need_tail("reference")?,
        },
        "artifact" => ConsoleCommand::Artifact {
            target_id: need_id()?,
            path: PathBuf::from(need_tail("path")?),
        },
        "retry" => ConsoleCommand::Retry(need_id()?),
        "abandon" => ConsoleCommand::Abandon(need_id()?),
        "status" => ConsoleCommand::Status(need_id()?),
        "exhausted" | "ls" => ConsoleCommand::Exhausted,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command `{other}`; {HELP}")),
    };
    Ok(Some(command))
}

/// Reads commands until `quit`, or until stdin closes and the batch settles.
///
/// Returns early when every target is `Done`.
pub(crate) async fn run_console(batch: &BatchHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut settled = false;
    println!("{HELP}");

    loop {
        tokio::select! {
            result = batch.wait_settled(), if !settled => {
                result?;
                settled = true;
                if all_done(batch.gateway()) {
                    return Ok(());
                }
                print_exhausted(&batch.gateway().list_exhausted_targets().await?);
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("operator input closed");
                    batch.wait_settled().await?;
                    return Ok(());
                };
                match parse_command(&line) {
                    Ok(None) => {}
                    Ok(Some(ConsoleCommand::Quit)) => return Ok(()),
                    Ok(Some(command)) => {
                        if execute(batch.gateway(), command).await {
                            settled = false;
                        }
                    }
                    Err(message) => eprintln!("{message}"),
                }
            }
        }
    }
}

fn all_done(gateway: &Gateway) -> bool {
    gateway.target_ids().iter().all(|id| {
        gateway
            .get_target_status(id)
            .is_ok_and(|s| s.phase == TargetPhase::Done)
    })
}

/// Runs one command; returns true when it may restart automated work.
async fn execute(gateway: &Gateway, command: ConsoleCommand) -> bool {
    let outcome = match command {
        ConsoleCommand::Source {
            target_id,
            reference,
        } => gateway.submit_manual_source(&target_id, reference).await,
        ConsoleCommand::Artifact { target_id, path } => {
            gateway.submit_manual_artifact(&target_id, path).await
        }
        ConsoleCommand::Retry(target_id) => gateway.retry_target(&target_id).await,
        ConsoleCommand::Abandon(target_id) => gateway.abandon_target(&target_id).await,
        ConsoleCommand::Status(target_id) => {
            match gateway.get_target_status(&target_id) {
                Ok(state) => println!("{}", format_state(&state)),
                Err(e) => eprintln!("{e}"),
            }
            return false;
        }
        ConsoleCommand::Exhausted => {
            match gateway.list_exhausted_targets().await {
                Ok(exhausted) => print_exhausted(&exhausted),
                Err(e) => eprintln!("{e}"),
            }
            return false;
        }
        ConsoleCommand::Help => {
            println!("{HELP}");
            return false;
        }
        ConsoleCommand::Quit => return false,
    };

    match outcome {
        Ok(()) => {
            println!("ok");
            true
        }
        Err(e) => {
            eprintln!("{e}");
            false
        }
    }
}
