//! Strategy ordering per target.
//!
//! A static [`RoutingTable`] maps source keys to strategy lists. The
//! [`LearnedRoutes`] map remembers the strategy that most recently succeeded
//! for each source; [`RoutingPolicy::route`] moves that strategy to the front
//! when, and only when, the static list for the source already contains it.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::ledger::{LedgerError, LedgerRepository};
use crate::strategy::StrategyRegistry;
use crate::target::{DEFAULT_SOURCE_KEY, DownloadTarget};

/// Static source-key to strategy-list table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: BTreeMap<String, Vec<String>>,
}

impl RoutingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the strategy list for a source key (lowercased).
    pub fn insert(&mut self, source_key: impl Into<String>, strategies: Vec<String>) {
        self.routes
            .insert(source_key.into().to_ascii_lowercase(), strategies);
    }

    /// Builder-style [`Self::insert`].
    #[must_use]
    pub fn with_route(mut self, source_key: impl Into<String>, strategies: &[&str]) -> Self {
        self.insert(
            source_key,
            strategies.iter().map(|s| (*s).to_string()).collect(),
        );
        self
    }

    /// Strategy list for a source key, exactly as configured.
    #[must_use]
    pub fn get(&self, source_key: &str) -> Option<&[String]> {
        self.routes.get(source_key).map(Vec::as_slice)
    }

    /// Source keys and their lists, sorted by key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.routes.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Names referenced by the table that the registry does not know.
    #[must_use]
    pub fn unknown_strategies(&self, registry: &StrategyRegistry) -> Vec<(String, String)> {
        self.routes
            .iter()
            .flat_map(|(key, list)| {
                list.iter()
                    .filter(|name| !registry.contains(name))
                    .map(move |name| (key.clone(), name.clone()))
            })
            .collect()
    }
}

/// Concurrent learned map: source key to last successful strategy.
///
/// Reads are lock-free snapshots; writes go to the ledger first.
#[derive(Debug, Default)]
pub struct LearnedRoutes {
    map: DashMap<String, String>,
}

impl LearnedRoutes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the persisted map.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the ledger cannot be read.
    pub async fn load(ledger: &dyn LedgerRepository) -> Result<Self, LedgerError> {
        let learned = Self::new();
        for (source, strategy) in ledger.learned_routes().await? {
            learned.map.insert(source, strategy);
        }
        debug!(entries = learned.map.len(), "loaded learned routes");
        Ok(learned)
    }

    #[must_use]
    pub fn get(&self, source_key: &str) -> Option<String> {
        self.map.get(source_key).map(|entry| entry.value().clone())
    }

    /// Records a success: persisted, then visible.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the ledger write fails; the in-memory map
    /// is left unchanged in that case.
    #[instrument(skip(self, ledger))]
    pub async fn record_success(
        &self,
        ledger: &dyn LedgerRepository,
        source_key: &str,
        strategy: &str,
    ) -> Result<(), LedgerError> {
        if self.get(source_key).as_deref() == Some(strategy) {
            return Ok(());
        }
        ledger.upsert_learned_route(source_key, strategy).await?;
        self.map.insert(source_key.to_string(), strategy.to_string());
        debug!("learned route updated");
        Ok(())
    }

    /// Sorted copy of the map.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Computes the strategy order for a target.
#[derive(Debug)]
pub struct RoutingPolicy {
    table: RoutingTable,
    fallback: Vec<String>,
    learned: Arc<LearnedRoutes>,
}

impl RoutingPolicy {
    /// `fallback` is used when neither the source key nor `default` has a rule;
    /// normally the registry's registration order.
    #[must_use]
    pub fn new(table: RoutingTable, fallback: Vec<String>, learned: Arc<LearnedRoutes>) -> Self {
        Self {
            table,
            fallback,
            learned,
        }
    }

    #[must_use]
    pub fn learned(&self) -> &Arc<LearnedRoutes> {
        &self.learned
    }

    /// Static list for the target's source, before learning is applied.
    #[must_use]
    pub fn static_route(&self, target: &DownloadTarget) -> &[String] {
        let key = target.source_key();
        self.table
            .get(&key)
            .or_else(|| self.table.get(DEFAULT_SOURCE_KEY))
            .unwrap_or(self.fallback.as_slice())
    }

    /// Ordered strategy names for the target.
    ///
    /// A learned strategy is promoted to the front only if the static list
    /// contains it; otherwise the static order is returned unchanged.
    #[must_use]
    #[instrument(skip(self, target), fields(target_id = %target.id()))]
    pub fn route(&self, target: &DownloadTarget) -> Vec<String> {
        let mut route = self.static_route(target).to_vec();
        let source_key = target.source_key();

        if let Some(learned) = self.learned.get(&source_key) {
            if let Some(position) = route.iter().position(|s| *s == learned) {
                let promoted = route.remove(position);
                route.insert(0, promoted);
                debug!(source_key, strategy = %learned, "promoted learned strategy");
            } else {
                debug!(source_key, strategy = %learned, "learned strategy not in static route; ignored");
            }
        }

        route
    }
}
