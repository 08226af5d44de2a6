//! Strategy registry: the set of strategies available to a batch.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::{Strategy, StrategyError};
use crate::target::DownloadTarget;

/// Name-keyed strategies in registration order.
///
/// Registration order is the fallback route when no routing rule matches.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a strategy.
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError::DuplicateName`] if the name is taken.
    #[tracing::instrument(skip(self, strategy), fields(strategy_name = strategy.name()))]
    pub fn register(&mut self, strategy: Arc<dyn Strategy>) -> Result<(), StrategyError> {
        if self.contains(strategy.name()) {
            return Err(StrategyError::DuplicateName(strategy.name().to_string()));
        }
        debug!(
            name = strategy.name(),
            class = %strategy.resource_class(),
            "Registering strategy"
        );
        self.strategies.push(strategy);
        Ok(())
    }

    /// Looks up a strategy by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        self.strategies
            .iter()
            .find(|s| s.name() == name)
            .map(Arc::clone)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.strategies.iter().any(|s| s.name() == name)
    }

    /// Names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name().to_string()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Strategies whose `can_handle` accepts the target, in registration order.
    #[must_use]
    #[tracing::instrument(skip(self, target), fields(target_id = %target.id()))]
    pub fn applicable_strategies(&self, target: &DownloadTarget) -> Vec<Arc<dyn Strategy>> {
        self.strategies
            .iter()
            .filter(|s| s.can_handle(target))
            .map(Arc::clone)
            .collect()
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.names())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::strategy::{AttemptContext, AttemptOutcome, ResourceClass};

    struct Named {
        name: &'static str,
        handles: bool,
    }

    #[async_trait]
    impl Strategy for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn resource_class(&self) -> ResourceClass {
            ResourceClass::LongTransfer
        }

        fn can_handle(&self, _target: &DownloadTarget) -> bool {
            self.handles
        }

        async fn attempt(&self, _target: &DownloadTarget, _ctx: &AttemptContext) -> AttemptOutcome {
            AttemptOutcome::Success {
                bytes_transferred: 0,
            }
        }
    }

    fn named(name: &'static str, handles: bool) -> Arc<dyn Strategy> {
        Arc::new(Named { name, handles })
    }

    #[test]
    fn test_registry_preserves_registration_order() {
        let mut registry = StrategyRegistry::new();
        registry.register(named("apple", true)).unwrap();
        registry.register(named("direct", true)).unwrap();
        registry.register(named("youtube", true)).unwrap();

        assert_eq!(registry.names(), vec!["apple", "direct", "youtube"]);
        assert_eq!(registry.len(), 3);
        assert!(registry.get("direct").is_some());
        assert!(registry.get("browser").is_none());
    }

    #[test]
    fn test_registry_rejects_duplicate_names() {
        let mut registry = StrategyRegistry::new();
        registry.register(named("direct", true)).unwrap();
        let err = registry.register(named("direct", false)).unwrap_err();
        assert!(matches!(err, StrategyError::DuplicateName(name) if name == "direct"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_applicable_strategies_filters_by_can_handle() {
        let mut registry = StrategyRegistry::new();
        registry.register(named("apple", false)).unwrap();
        registry.register(named("direct", true)).unwrap();
        registry.register(named("youtube", true)).unwrap();

        let target = DownloadTarget::new("t", "T", "https://x.example/a.mp3");
        let names: Vec<_> = registry
            .applicable_strategies(&target)
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["direct", "youtube"]);
    }

    #[test]
    fn test_registry_debug_lists_names() {
        let mut registry = StrategyRegistry::new();
        registry.register(named("direct", true)).unwrap();
        assert!(format!("{registry:?}").contains("direct"));
    }
}
