//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Acquire podcast episode audio from many sources, resumably.
///
/// Each target is tried against an ordered list of strategies; targets no
/// strategy can fetch are parked for an operator.
#[derive(Parser, Debug)]
#[command(name = "acquirer")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run (or resume) a batch of targets
    Run(RunArgs),

    /// Print the ledger history of one target
    History {
        /// Target id
        target_id: String,

        #[command(flatten)]
        state: StateArgs,
    },

    /// Print the learned routing map
    Routes {
        #[command(flatten)]
        state: StateArgs,
    },
}

#[derive(ClapArgs, Debug)]
pub struct StateArgs {
    /// Directory holding the ledger (overrides config)
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Config file (defaults to $XDG_CONFIG_HOME/acquirer/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
pub struct RunArgs {
    /// JSON array of targets to acquire
    #[arg(long)]
    pub targets: PathBuf,

    #[command(flatten)]
    pub state: StateArgs,

    /// Directory for delivered artifacts (overrides config)
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Maximum concurrent general attempts (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub max_workers: Option<u8>,

    /// Fail every unfinished target after this many seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub deadline: Option<u64>,

    /// Read operator commands from stdin while the batch runs
    #[arg(long)]
    pub interactive: bool,
}
