//! Building interceptors from definitions.

use std::sync::Arc;

use crate::cache::StatementCache;
use crate::chain::{Connection, InterceptorChain, Interceptor};
use crate::config::{InterceptorDefinition, QueryStatsConfig, StatementCacheConfig};
use crate::error::{Error, Result};
use crate::lifecycle::StatementDecorator;
use crate::stats::{QueryStatsRecorder, QueryStatsRegistry};
use crate::tracker::LeakedStatementTracker;

/// Creates interceptors by name.
///
/// Every query statistics recorder the factory creates reports into the
/// factory's registry, so one factory should serve one set of pools.
///
/// # Example
///
/// ```rust,ignore
/// use sqlpool_interceptor::{InterceptorDefinition, InterceptorFactory};
///
/// let factory = InterceptorFactory::new();
/// let defs = InterceptorDefinition::parse_list(
///     "QueryStatsRecorder(threshold=100);StatementCache(max=50);LeakedStatementTracker",
/// )?;
/// let conn = factory.build_chain(&defs)?;
/// ```
#[derive(Debug, Clone)]
pub struct InterceptorFactory {
    stats_registry: Arc<QueryStatsRegistry>,
}

impl InterceptorFactory {
    /// Create a factory with its own statistics registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_registry(QueryStatsRegistry::new())
    }

    /// Create a factory reporting statistics into `registry`.
    #[must_use]
    pub fn with_registry(registry: Arc<QueryStatsRegistry>) -> Self {
        Self {
            stats_registry: registry,
        }
    }

    /// Get the statistics registry.
    #[must_use]
    pub fn stats_registry(&self) -> &Arc<QueryStatsRegistry> {
        &self.stats_registry
    }

    /// Create the interceptor a definition names.
    pub fn create(&self, definition: &InterceptorDefinition) -> Result<Arc<dyn Interceptor>> {
        let props = &definition.properties;

        let interceptor: Arc<dyn Interceptor> = match definition.short_name() {
            "StatementDecorator" => Arc::new(StatementDecorator::new()),
            "StatementCache" => Arc::new(StatementCache::new(
                StatementCacheConfig::from_properties(props)?,
            )),
            "LeakedStatementTracker" | "StatementFinalizer" => {
                Arc::new(LeakedStatementTracker::new())
            }
            "QueryStatsRecorder" | "SlowQueryReport" => Arc::new(QueryStatsRecorder::new(
                QueryStatsConfig::from_properties(props)?,
                Arc::clone(&self.stats_registry),
            )),
            _ => return Err(Error::UnknownInterceptor(definition.name.clone())),
        };

        tracing::trace!(
            name = %definition.name,
            properties = props.len(),
            "created interceptor"
        );
        Ok(interceptor)
    }

    /// Build a connection whose chain holds the defined interceptors in
    /// order, followed by the terminal link.
    pub fn build_chain(&self, definitions: &[InterceptorDefinition]) -> Result<Connection> {
        definitions
            .iter()
            .try_fold(InterceptorChain::builder(), |builder, definition| {
                Ok(builder.link_shared(self.create(definition)?))
            })
            .map(|builder| builder.build())
    }

    /// Parse a definition string and build its chain.
    pub fn build_chain_from_str(&self, definitions: &str) -> Result<Connection> {
        self.build_chain(&InterceptorDefinition::parse_list(definitions)?)
    }
}

impl Default for InterceptorFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_build_chain_in_definition_order() {
        let factory = InterceptorFactory::new();
        let conn = factory
            .build_chain_from_str(
                "SlowQueryReport(threshold=-1);org.pool.StatementCache(max=5);StatementFinalizer",
            )
            .unwrap();

        let names: Vec<_> = conn.chain().names().collect();
        assert_eq!(
            names,
            vec![
                "QueryStatsRecorder",
                "StatementCache",
                "LeakedStatementTracker",
                "TerminalInterceptor"
            ]
        );

        let cache = conn.handler::<StatementCache>().unwrap();
        assert_eq!(cache.config().max, 5);
        let recorder = conn.handler::<QueryStatsRecorder>().unwrap();
        assert_eq!(recorder.config().threshold, -1);
        assert!(Arc::ptr_eq(recorder.registry(), factory.stats_registry()));
    }

    #[test]
    fn test_unknown_interceptor() {
        let def = InterceptorDefinition::new("ConnectionState").unwrap();
        let err = InterceptorFactory::new().create(&def).err().unwrap();
        assert!(matches!(err, Error::UnknownInterceptor(name) if name == "ConnectionState"));
    }

    #[test]
    fn test_invalid_properties_rejected() {
        let factory = InterceptorFactory::new();
        assert!(matches!(
            factory.build_chain_from_str("StatementCache(max=lots)"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            factory.build_chain_from_str("QueryStatsRecorder(threshold=-5)"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_empty_definition_list() {
        let conn = InterceptorFactory::new().build_chain(&[]).unwrap();
        assert_eq!(conn.chain().len(), 1);
    }
}
