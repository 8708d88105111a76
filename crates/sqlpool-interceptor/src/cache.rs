//! Per-connection statement cache.
//!
//! Closing a cacheable statement does not close the driver's statement.
//! Instead the cache parks a fresh facade around the same delegate, keyed by
//! the SQL text, and hands it out again on the next prepare of that text.
//! The caller's closed handle stays closed. A facade is either checked out
//! or parked, never both.
//!
//! Entries are evicted least-recently-used first once the cache holds `max`
//! statements; an evicted statement is closed. A statement whose execution
//! failed because the server invalidated its plan is marked broken and is
//! closed instead of parked.
//!
//! Discarding the physical connection starts a new generation. A statement
//! created before that is closed when its caller closes it, never parked.

use std::any::Any;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;

use crate::chain::{Connection, Interceptor, Next};
use crate::config::StatementCacheConfig;
use crate::error::{Error, Resource, Result};
use crate::lifecycle::{StatementInterceptor, intercept_creation};
use crate::operation::{ConnectionOp, ConnectionReply, StatementKind, StatementKinds};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::statement::{FacadeHooks, Statement, StatementFacade, StatementHandle};

type CachedFacade = Arc<StatementFacade<CachedHooks>>;

struct CacheStore {
    entries: Mutex<LruCache<String, CachedFacade>>,
    // Bumped under the entries lock on every drain.
    generation: AtomicU64,
}

/// Outcome of offering a closed statement to the store.
enum Parked {
    Stored(Option<CachedFacade>),
    Duplicate(CachedFacade),
    Stale(CachedFacade),
}

impl CacheStore {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            generation: AtomicU64::new(0),
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Remove and return the entry for `sql` if it has the requested shape.
    fn checkout(&self, sql: &str, kind: StatementKind) -> Option<CachedFacade> {
        let mut entries = self.entries.lock();
        if entries.peek(sql).is_some_and(|facade| facade.kind() == kind) {
            entries.pop(sql)
        } else {
            None
        }
    }

    /// Insert `facade` unless `sql` is already cached or the connection it
    /// was prepared on has been discarded since.
    ///
    /// A stored entry may push out the least recently used one.
    fn park(&self, sql: &str, facade: CachedFacade) -> Parked {
        let mut entries = self.entries.lock();
        if facade.hooks().generation != self.generation() {
            return Parked::Stale(facade);
        }
        if entries.contains(sql) {
            return Parked::Duplicate(facade);
        }
        let evicted = entries.push(sql.to_owned(), facade);
        Parked::Stored(evicted.map(|(_, evicted)| evicted))
    }

    fn remove(&self, sql: &str) -> Option<CachedFacade> {
        self.entries.lock().pop(sql)
    }

    fn drain(&self) -> Vec<CachedFacade> {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut drained = Vec::with_capacity(entries.len());
        while let Some((_, facade)) = entries.pop_lru() {
            drained.push(facade);
        }
        drained
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn keys(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(k, _)| k.clone()).collect()
    }
}

/// Physically close a facade that will never be handed out again.
fn discard(facade: &StatementFacade<CachedHooks>) {
    let Some(delegate) = facade.retire() else {
        return;
    };
    if let Err(e) = delegate.close() {
        tracing::warn!(
            sql = facade.sql().unwrap_or_default(),
            error = %e,
            "failed to close cached statement"
        );
    }
}

/// Facade hooks of a cacheable statement.
pub struct CachedHooks {
    store: Weak<CacheStore>,
    generation: u64,
    broken: AtomicBool,
    cached: AtomicBool,
}

impl CachedHooks {
    fn new(store: &Arc<CacheStore>, generation: u64, cached: bool) -> Self {
        Self {
            store: Arc::downgrade(store),
            generation,
            broken: AtomicBool::new(false),
            cached: AtomicBool::new(cached),
        }
    }

    /// Check whether a permanent failure ruled the statement out of reuse.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Check whether the facade is parked in the cache.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.cached.load(Ordering::Acquire)
    }
}

impl FacadeHooks for CachedHooks {
    fn close_invoked(&self, facade: &StatementFacade<Self>, delegate: Statement) -> Result<()> {
        if self.is_broken() {
            tracing::debug!(
                sql = facade.sql().unwrap_or_default(),
                "closing broken statement instead of caching it"
            );
            return delegate.close();
        }
        if delegate.is_closed() {
            return Ok(());
        }

        let (Some(store), Some(sql)) = (self.store.upgrade(), facade.sql()) else {
            return delegate.close();
        };

        let twin = StatementFacade::new(
            delegate,
            Some(sql.to_owned()),
            facade.kind(),
            facade.connection_ref().clone(),
            CachedHooks::new(&store, self.generation, true),
        );

        match store.park(sql, twin) {
            Parked::Stored(evicted) => {
                tracing::trace!(sql = sql, "statement parked in cache");
                if let Some(evicted) = evicted {
                    tracing::debug!(
                        sql = evicted.sql().unwrap_or_default(),
                        "evicting least recently used statement"
                    );
                    discard(&evicted);
                }
                Ok(())
            }
            Parked::Duplicate(twin) => {
                tracing::debug!(sql = sql, "statement already cached, closing duplicate");
                twin.retire().map_or(Ok(()), |delegate| delegate.close())
            }
            Parked::Stale(twin) => {
                tracing::debug!(sql = sql, "closing statement of a discarded connection");
                twin.retire().map_or(Ok(()), |delegate| delegate.close())
            }
        }
    }

    fn exception_reported(&self, facade: &StatementFacade<Self>, error: &Error) {
        if error.is_permanent_statement_failure() {
            tracing::debug!(
                sql = facade.sql().unwrap_or_default(),
                "statement plan invalidated, it will not be cached"
            );
            self.broken.store(true, Ordering::Release);
        }
    }
}

/// Reuses prepared statements across close and prepare on one connection.
///
/// The cache belongs to the physical connection: it survives check-in and
/// checkout, and is emptied only when the pool discards the connection.
pub struct StatementCache {
    config: StatementCacheConfig,
    kinds: StatementKinds,
    store: Option<Arc<CacheStore>>,
}

impl StatementCache {
    /// Create a cache.
    ///
    /// With `max` zero or no cacheable kind enabled, the cache passes every
    /// operation through.
    #[must_use]
    pub fn new(config: StatementCacheConfig) -> Self {
        let kinds = config.kinds();
        let store = NonZeroUsize::new(config.max)
            .filter(|_| !kinds.is_empty())
            .map(|capacity| Arc::new(CacheStore::new(capacity)));

        Self {
            config,
            kinds,
            store,
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &StatementCacheConfig {
        &self.config
    }

    /// Check whether any statement kind is cached.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Number of parked statements.
    #[must_use]
    pub fn cache_size(&self) -> usize {
        self.store.as_ref().map_or(0, |store| store.len())
    }

    /// SQL texts of parked statements, most recently used first.
    #[must_use]
    pub fn cached_sql(&self) -> Vec<String> {
        self.store.as_ref().map_or_else(Vec::new, |store| store.keys())
    }

    /// Remove the entry for `sql` and close its statement.
    ///
    /// Returns `true` if an entry was removed.
    pub fn force_close(&self, sql: &str) -> bool {
        match self.store.as_ref().and_then(|store| store.remove(sql)) {
            Some(facade) => {
                discard(&facade);
                true
            }
            None => false,
        }
    }

    fn checkout(
        &self,
        proxy: &Connection,
        kind: StatementKind,
        sql: &str,
        next: Next<'_>,
    ) -> Result<Option<Statement>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };

        // A hit never reaches the terminal, so its closed check is made here.
        if next.invoke(proxy, ConnectionOp::IsClosed)?.into_bool("is_closed")? {
            return Err(Error::ResourceClosed(Resource::Connection));
        }

        match store.checkout(sql, kind) {
            Some(facade) if facade.is_closed() => {
                tracing::debug!(sql = sql, "dropping cached statement closed out of band");
                discard(&facade);
                Ok(None)
            }
            Some(facade) => {
                tracing::trace!(sql = sql, "statement cache hit");
                facade.hooks().cached.store(false, Ordering::Release);
                Ok(Some(facade.into_statement()))
            }
            None => {
                tracing::trace!(sql = sql, "statement cache miss");
                Ok(None)
            }
        }
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(StatementCacheConfig::default())
    }
}

impl Interceptor for StatementCache {
    fn invoke(
        &self,
        proxy: &Connection,
        op: ConnectionOp<'_>,
        next: Next<'_>,
    ) -> Result<ConnectionReply> {
        if let (Some(kind), Some(sql)) = (op.statement_kind(), op.sql()) {
            if self.kinds.contains(&kind) {
                if let Some(statement) = self.checkout(proxy, kind, sql, next)? {
                    return Ok(ConnectionReply::Statement(statement));
                }
            }
        }
        intercept_creation(self, proxy, op, next)
    }

    fn disconnected(
        &self,
        _pool: Option<&Arc<dyn ConnectionPool>>,
        connection: &Arc<PooledConnection>,
        _finalizing: bool,
    ) {
        let Some(store) = &self.store else {
            return;
        };

        let drained = store.drain();
        tracing::debug!(
            connection_id = connection.id(),
            count = drained.len(),
            "closing cached statements of discarded connection"
        );
        for facade in &drained {
            discard(facade);
        }
    }

    fn name(&self) -> &'static str {
        "StatementCache"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl StatementInterceptor for StatementCache {
    fn creation_kinds(&self) -> &[StatementKind] {
        &self.kinds
    }

    fn create_decorator(
        &self,
        proxy: &Connection,
        kind: StatementKind,
        statement: Statement,
        sql: Option<&str>,
    ) -> Result<Statement> {
        let (Some(store), Some(sql)) = (&self.store, sql) else {
            return Ok(statement);
        };

        Ok(StatementFacade::new(
            statement,
            Some(sql.to_owned()),
            kind,
            proxy.downgrade(),
            CachedHooks::new(store, store.generation(), false),
        )
        .into_statement())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_configurations() {
        assert!(StatementCache::default().is_enabled());
        assert!(!StatementCache::new(StatementCacheConfig::new().max(0)).is_enabled());
        assert!(
            !StatementCache::new(StatementCacheConfig::new().prepared(false).callable(false))
                .is_enabled()
        );
    }

    #[test]
    fn test_creation_kinds_follow_config() {
        let cache = StatementCache::new(StatementCacheConfig::new().callable(true));
        assert_eq!(
            cache.creation_kinds(),
            &[StatementKind::Prepared, StatementKind::Callable]
        );

        let disabled = StatementCache::new(StatementCacheConfig::new().max(0));
        assert!(disabled.creation_kinds().is_empty());
        assert_eq!(disabled.cache_size(), 0);
        assert!(disabled.cached_sql().is_empty());
        assert!(!disabled.force_close("select 1"));
    }
}
