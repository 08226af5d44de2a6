//! Episode Acquirer Core Library
//!
//! Acquisition orchestration for podcast episode audio: for each target the
//! engine picks an ordered list of strategies, runs them under memory-aware
//! concurrency limits, classifies failures to decide between retrying and
//! moving on, records every attempt durably so a crashed batch can resume,
//! and parks targets that no automated strategy could fetch until an operator
//! supplies a source or a local file.
//!
//! # Architecture
//!
//! - [`db`] - SQLite connection and schema management
//! - [`target`] - download targets and source-key derivation
//! - [`ledger`] - append-only attempt and transition history, resume replay
//! - [`failure`] - failure taxonomy, classifier and retry policy
//! - [`strategy`] - the `Strategy` contract, registry and built-in HTTP strategy
//! - [`routing`] - static routing table plus learned promotions
//! - [`scheduler`] - headroom-sized resource pools
//! - [`machine`] - per-target state machine, watchdog and artifact validation
//! - [`gateway`] - progress events out, operator commands in
//! - [`engine`] - batch orchestration and reporting
//! - [`config`] - engine configuration file

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod failure;
pub mod gateway;
pub mod ledger;
pub mod machine;
pub mod routing;
pub mod scheduler;
pub mod strategy;
pub mod target;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig, load_config, load_default_config, parse_config_str};
pub use db::Database;
pub use engine::{
    ArtifactSink, BatchHandle, BatchReport, BatchStats, ManifestSink, NullSink, Orchestrator,
    StateDir,
};
pub use error::EngineError;
pub use failure::{FailureCategory, RetryDecision, RetryPolicy, StrategyFailure, classify};
pub use gateway::{Gateway, GatewayError, ProgressEvent, ProgressSubscriber};
pub use ledger::{AttemptRecord, Ledger, LedgerError, LedgerRepository, TransitionRecord};
pub use machine::{TargetPhase, TargetState};
pub use routing::{LearnedRoutes, RoutingPolicy, RoutingTable};
pub use scheduler::{FixedProbe, HeadroomProbe, PoolLimits, PoolSizes, ResourceBudget};
pub use strategy::{
    AttemptContext, AttemptOutcome, HttpStrategy, ResourceClass, Strategy, StrategyRegistry,
};
pub use target::{DownloadTarget, SourceHints, TargetId};
