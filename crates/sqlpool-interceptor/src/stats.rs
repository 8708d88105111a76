//! Per-pool query statistics.
//!
//! [`QueryStatsRecorder`] times every statement execution and, when it took
//! longer than the configured threshold, adds it to the accumulator for its
//! SQL text. Accumulators live in a [`QueryStatsTable`] shared by every
//! connection of one pool; tables are kept in a [`QueryStatsRegistry`] keyed
//! by pool identity and dropped when the pool closes.
//!
//! Accumulator fields are independent relaxed atomics updated without a
//! lock. Concurrent executions of the same SQL text can leave a record
//! briefly inconsistent, for example a maximum whose timestamp belongs to a
//! different execution. Treat the numbers as a best-effort statistic, not an
//! exact count.

use std::any::Any;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::chain::{Connection, Interceptor, Next};
use crate::config::QueryStatsConfig;
use crate::error::Result;
use crate::instrumentation::{ExecutionTimer, StatementMetrics};
use crate::lifecycle::{StatementInterceptor, intercept_creation};
use crate::operation::{ConnectionOp, ConnectionReply, StatementKind, StatementOp, StatementReply};
use crate::pool::{ConnectionPool, PoolCloseListener, PoolId, PooledConnection};
use crate::statement::{FacadeHooks, Statement, StatementFacade, StatementHandle};

/// Key under which batch executions without SQL text are recorded.
pub const BATCH_KEY: &str = "batch";

/// Timing accumulator for one SQL text.
#[derive(Debug)]
pub struct QueryStats {
    sql: String,
    seq: u64,
    count: AtomicU64,
    total_ms: AtomicU64,
    min_ms: AtomicU64,
    min_at: AtomicI64,
    max_ms: AtomicU64,
    max_at: AtomicI64,
}

impl QueryStats {
    fn new(sql: &str, seq: u64) -> Self {
        Self {
            sql: sql.to_owned(),
            seq,
            count: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            min_at: AtomicI64::new(0),
            max_ms: AtomicU64::new(0),
            max_at: AtomicI64::new(0),
        }
    }

    /// SQL text this accumulator belongs to.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Add one execution.
    pub fn add(&self, elapsed_ms: u64, at: DateTime<Utc>) {
        let at = at.timestamp_millis();

        if self.max_ms.fetch_max(elapsed_ms, Ordering::Relaxed) <= elapsed_ms {
            self.max_at.store(at, Ordering::Relaxed);
        }
        if self.min_ms.fetch_min(elapsed_ms, Ordering::Relaxed) >= elapsed_ms {
            self.min_at.store(at, Ordering::Relaxed);
        }
        self.total_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values.
    #[must_use]
    pub fn snapshot(&self) -> QueryStatsSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let timestamp = |millis: &AtomicI64| {
            (count > 0)
                .then(|| DateTime::from_timestamp_millis(millis.load(Ordering::Relaxed)))
                .flatten()
        };

        QueryStatsSnapshot {
            sql: self.sql.clone(),
            count,
            total_ms: self.total_ms.load(Ordering::Relaxed),
            min_ms: if count > 0 {
                self.min_ms.load(Ordering::Relaxed)
            } else {
                0
            },
            min_at: timestamp(&self.min_at),
            max_ms: self.max_ms.load(Ordering::Relaxed),
            max_at: timestamp(&self.max_at),
        }
    }
}

/// Point-in-time copy of a [`QueryStats`] accumulator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryStatsSnapshot {
    /// SQL text.
    pub sql: String,
    /// Number of recorded executions.
    pub count: u64,
    /// Sum of recorded execution times.
    pub total_ms: u64,
    /// Fastest recorded execution.
    pub min_ms: u64,
    /// When the fastest execution started.
    pub min_at: Option<DateTime<Utc>>,
    /// Slowest recorded execution.
    pub max_ms: u64,
    /// When the slowest execution started.
    pub max_at: Option<DateTime<Utc>>,
}

impl QueryStatsSnapshot {
    /// Mean execution time, zero when nothing was recorded.
    #[must_use]
    pub fn average_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_ms as f64 / self.count as f64
    }
}

impl fmt::Display for QueryStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = |t: Option<DateTime<Utc>>| t.map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
        write!(
            f,
            "QueryStats[query: {}, count: {}, max_ms: {}, max_at: {}, min_ms: {}, min_at: {}, total_ms: {}, avg_ms: {:.2}]",
            self.sql,
            self.count,
            self.max_ms,
            at(self.max_at),
            self.min_ms,
            at(self.min_at),
            self.total_ms,
            self.average_ms()
        )
    }
}

/// Accumulators of one pool, keyed by SQL text.
///
/// Holds at most `max_queries` entries; adding another evicts the entry that
/// was registered first.
#[derive(Debug)]
pub struct QueryStatsTable {
    pool: PoolId,
    max_queries: usize,
    entries: RwLock<HashMap<String, Arc<QueryStats>>>,
    next_seq: AtomicU64,
}

impl QueryStatsTable {
    fn new(pool: PoolId, max_queries: usize) -> Self {
        Self {
            pool,
            max_queries: max_queries.max(1),
            entries: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Pool this table belongs to.
    #[must_use]
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    /// Record one execution of `sql`.
    pub fn record(&self, sql: &str, elapsed_ms: u64, at: DateTime<Utc>) {
        self.accumulator(sql).add(elapsed_ms, at);
    }

    fn accumulator(&self, sql: &str) -> Arc<QueryStats> {
        if let Some(stats) = self.entries.read().get(sql) {
            return Arc::clone(stats);
        }

        let mut entries = self.entries.write();
        if let Some(stats) = entries.get(sql) {
            return Arc::clone(stats);
        }

        if entries.len() >= self.max_queries {
            let oldest = entries
                .values()
                .min_by_key(|stats| stats.seq)
                .map(|stats| stats.sql.clone());
            if let Some(oldest) = oldest {
                tracing::trace!(sql = %oldest, "query stats table full, dropping oldest entry");
                entries.remove(&oldest);
            }
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::new(QueryStats::new(sql, seq));
        entries.insert(sql.to_owned(), Arc::clone(&stats));
        stats
    }

    /// Get the accumulator for `sql`.
    #[must_use]
    pub fn get(&self, sql: &str) -> Option<QueryStatsSnapshot> {
        self.entries.read().get(sql).map(|stats| stats.snapshot())
    }

    /// Copy every accumulator, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueryStatsSnapshot> {
        let mut stats: Vec<_> = self.entries.read().values().cloned().collect();
        stats.sort_by_key(|stats| stats.seq);
        stats.iter().map(|stats| stats.snapshot()).collect()
    }

    /// Number of distinct SQL texts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Statistics tables of every pool, keyed by pool identity.
#[derive(Debug, Default)]
pub struct QueryStatsRegistry {
    tables: RwLock<HashMap<PoolId, Arc<QueryStatsTable>>>,
}

impl QueryStatsRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the table for `pool`, creating it on first use.
    ///
    /// Creating a table registers a close listener with the pool that drops
    /// the table when the pool closes.
    pub fn register(
        self: &Arc<Self>,
        pool: &Arc<dyn ConnectionPool>,
        max_queries: usize,
    ) -> Arc<QueryStatsTable> {
        let id = pool.id();
        if let Some(table) = self.tables.read().get(&id) {
            return Arc::clone(table);
        }

        let table = match self.tables.write().entry(id) {
            Entry::Occupied(entry) => return Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                Arc::clone(entry.insert(Arc::new(QueryStatsTable::new(id, max_queries))))
            }
        };

        tracing::info!(pool = %id, max_queries = max_queries, "registered query statistics table");
        pool.add_close_listener(Arc::new(DeregisterOnClose {
            registry: Arc::downgrade(self),
        }));
        table
    }

    /// Drop the table for `pool`.
    pub fn deregister(&self, pool: PoolId) -> Option<Arc<QueryStatsTable>> {
        let removed = self.tables.write().remove(&pool);
        if removed.is_some() {
            tracing::debug!(pool = %pool, "dropped query statistics table");
        }
        removed
    }

    /// Get the table for `pool`.
    #[must_use]
    pub fn table(&self, pool: PoolId) -> Option<Arc<QueryStatsTable>> {
        self.tables.read().get(&pool).cloned()
    }

    /// Copy the statistics of `pool`, keyed by SQL text.
    #[must_use]
    pub fn snapshot(&self, pool: PoolId) -> Option<HashMap<String, QueryStatsSnapshot>> {
        self.table(pool).map(|table| {
            table
                .snapshot()
                .into_iter()
                .map(|stats| (stats.sql.clone(), stats))
                .collect()
        })
    }

    /// Pools that currently have a table.
    #[must_use]
    pub fn pools(&self) -> Vec<PoolId> {
        let mut pools: Vec<_> = self.tables.read().keys().copied().collect();
        pools.sort();
        pools
    }
}

struct DeregisterOnClose {
    registry: Weak<QueryStatsRegistry>,
}

impl PoolCloseListener for DeregisterOnClose {
    fn pool_closed(&self, pool: PoolId) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(pool);
        }
    }
}

/// Facade hooks that time executions.
pub struct RecorderHooks {
    table: Arc<QueryStatsTable>,
    config: Arc<QueryStatsConfig>,
    metrics: Arc<StatementMetrics>,
}

impl RecorderHooks {
    fn key(facade: &StatementFacade<Self>, op: &StatementOp<'_>) -> Option<String> {
        facade
            .sql()
            .or_else(|| op.sql())
            .map(str::to_owned)
            .or_else(|| matches!(op, StatementOp::ExecuteBatch).then(|| BATCH_KEY.to_owned()))
    }
}

impl FacadeHooks for RecorderHooks {
    fn invoke(
        &self,
        facade: &StatementFacade<Self>,
        op: StatementOp<'_>,
    ) -> Result<StatementReply> {
        if !op.is_execution() {
            return facade.forward(op);
        }

        let call = op.name();
        let key = Self::key(facade, &op);
        let timer = ExecutionTimer::start();
        let result = facade.forward(op);
        let elapsed_ms = timer.elapsed_ms();

        self.metrics
            .record_execution(call, key.as_deref(), timer.elapsed_seconds(), result.is_ok());

        if let (Ok(_), Some(sql)) = (&result, key) {
            if self.config.records(elapsed_ms) {
                self.table.record(&sql, elapsed_ms, timer.started_at());
                self.metrics.record_slow_query(&sql);

                if self.config.log_slow && self.config.threshold >= 0 {
                    tracing::warn!(
                        pool = %self.table.pool(),
                        sql = %self.config.sanitization.sanitize(&sql),
                        elapsed_ms = elapsed_ms,
                        threshold_ms = self.config.threshold,
                        "slow query"
                    );
                }
            }
        }

        result
    }
}

/// Records execution times of slow statements per pool.
pub struct QueryStatsRecorder {
    config: Arc<QueryStatsConfig>,
    registry: Arc<QueryStatsRegistry>,
    table: Mutex<Option<Arc<QueryStatsTable>>>,
    metrics: Arc<StatementMetrics>,
}

impl QueryStatsRecorder {
    /// Create a recorder reporting into `registry`.
    #[must_use]
    pub fn new(config: QueryStatsConfig, registry: Arc<QueryStatsRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            table: Mutex::new(None),
            metrics: Arc::new(StatementMetrics::new(None)),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &QueryStatsConfig {
        &self.config
    }

    /// Get the registry this recorder reports into.
    #[must_use]
    pub fn registry(&self) -> &Arc<QueryStatsRegistry> {
        &self.registry
    }

    /// The table of the pool the connection currently belongs to.
    #[must_use]
    pub fn table(&self) -> Option<Arc<QueryStatsTable>> {
        self.table.lock().clone()
    }
}

impl Interceptor for QueryStatsRecorder {
    fn invoke(
        &self,
        proxy: &Connection,
        op: ConnectionOp<'_>,
        next: Next<'_>,
    ) -> Result<ConnectionReply> {
        intercept_creation(self, proxy, op, next)
    }

    fn initialize(
        &self,
        pool: Option<&Arc<dyn ConnectionPool>>,
        _connection: Option<&Arc<PooledConnection>>,
    ) {
        let table = pool.map(|pool| self.registry.register(pool, self.config.max_queries));
        *self.table.lock() = table;
    }

    fn pool_closed(&self, pool: &Arc<dyn ConnectionPool>) {
        self.registry.deregister(pool.id());
        let mut table = self.table.lock();
        if table.as_ref().is_some_and(|t| t.pool() == pool.id()) {
            *table = None;
        }
    }

    fn name(&self) -> &'static str {
        "QueryStatsRecorder"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl StatementInterceptor for QueryStatsRecorder {
    fn create_decorator(
        &self,
        proxy: &Connection,
        kind: StatementKind,
        statement: Statement,
        sql: Option<&str>,
    ) -> Result<Statement> {
        let Some(table) = self.table() else {
            return Ok(statement);
        };

        Ok(StatementFacade::new(
            statement,
            sql.map(str::to_owned),
            kind,
            proxy.downgrade(),
            RecorderHooks {
                table,
                config: Arc::clone(&self.config),
                metrics: Arc::clone(&self.metrics),
            },
        )
        .into_statement())
    }
}
