//! Repository seam for ledger persistence.
//!
//! Machines, routing and the gateway depend on this trait rather than on
//! [`Ledger`] directly, so the orchestration layer can run against any
//! append-only store.

use async_trait::async_trait;

use super::{
    AttemptRecord, Ledger, LedgerError, NewAttemptRecord, NewTransition, StrategyStats,
    TransitionRecord,
};
use crate::target::{DownloadTarget, TargetId};

/// Data-access contract for the attempt ledger.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Records a target; returns `false` when it was already known.
    async fn register_target(&self, target: &DownloadTarget) -> Result<bool, LedgerError>;

    /// Appends a concluded attempt and returns its id.
    async fn append_attempt(&self, record: &NewAttemptRecord) -> Result<i64, LedgerError>;

    /// Appends a phase transition and returns its id.
    async fn append_transition(&self, transition: &NewTransition) -> Result<i64, LedgerError>;

    /// All attempts for a target, oldest first.
    async fn attempts_for(&self, target_id: &TargetId) -> Result<Vec<AttemptRecord>, LedgerError>;

    /// All transitions for a target, oldest first.
    async fn transitions_for(
        &self,
        target_id: &TargetId,
    ) -> Result<Vec<TransitionRecord>, LedgerError>;

    /// Learned `(source_key, strategy)` pairs.
    async fn learned_routes(&self) -> Result<Vec<(String, String)>, LedgerError>;

    /// Replaces the learned strategy for a source.
    async fn upsert_learned_route(&self, source_key: &str, strategy: &str)
    -> Result<(), LedgerError>;

    /// Per-strategy success and failure counts.
    async fn strategy_stats(&self) -> Result<Vec<StrategyStats>, LedgerError>;
}

#[async_trait]
impl LedgerRepository for Ledger {
    async fn register_target(&self, target: &DownloadTarget) -> Result<bool, LedgerError> {
        Ledger::register_target(self, target).await
    }

    async fn append_attempt(&self, record: &NewAttemptRecord) -> Result<i64, LedgerError> {
        Ledger::append_attempt(self, record).await
    }

    async fn append_transition(&self, transition: &NewTransition) -> Result<i64, LedgerError> {
        Ledger::append_transition(self, transition).await
    }

    async fn attempts_for(&self, target_id: &TargetId) -> Result<Vec<AttemptRecord>, LedgerError> {
        Ledger::attempts_for(self, target_id).await
    }

    async fn transitions_for(
        &self,
        target_id: &TargetId,
    ) -> Result<Vec<TransitionRecord>, LedgerError> {
        Ledger::transitions_for(self, target_id).await
    }

    async fn learned_routes(&self) -> Result<Vec<(String, String)>, LedgerError> {
        Ledger::learned_routes(self).await
    }

    async fn upsert_learned_route(
        &self,
        source_key: &str,
        strategy: &str,
    ) -> Result<(), LedgerError> {
        Ledger::upsert_learned_route(self, source_key, strategy).await
    }

    async fn strategy_stats(&self) -> Result<Vec<StrategyStats>, LedgerError> {
        Ledger::strategy_stats(self).await
    }
}
