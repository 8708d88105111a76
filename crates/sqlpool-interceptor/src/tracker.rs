//! Closes statements the caller left open when the connection closes.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::chain::{Connection, Interceptor, Next};
use crate::error::Result;
use crate::lifecycle::{StatementInterceptor, intercept_creation};
use crate::operation::{ConnectionOp, ConnectionReply, StatementKind};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::statement::{FacadeHooks, Statement, StatementFacade, StatementHandle};

#[derive(Default)]
struct Registry {
    entries: Mutex<BTreeMap<u64, Weak<dyn StatementHandle>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn reserve_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, id: u64, statement: Weak<dyn StatementHandle>) {
        self.entries.lock().insert(id, statement);
    }

    fn unregister(&self, id: u64) {
        self.entries.lock().remove(&id);
    }

    fn take_all(&self) -> BTreeMap<u64, Weak<dyn StatementHandle>> {
        std::mem::take(&mut *self.entries.lock())
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Facade hooks that drop the registry entry when the caller closes.
pub struct TrackedHooks {
    registry: Weak<Registry>,
    id: u64,
}

impl FacadeHooks for TrackedHooks {
    fn close_invoked(&self, _facade: &StatementFacade<Self>, delegate: Statement) -> Result<()> {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
        delegate.close()
    }
}

/// Records every statement created on the connection and closes the ones
/// still open when the connection closes.
///
/// Statements are held weakly: a statement the caller dropped is not kept
/// alive by the tracker.
#[derive(Default)]
pub struct LeakedStatementTracker {
    registry: Arc<Registry>,
}

impl LeakedStatementTracker {
    /// Create a tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked statements that are still open.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.registry
            .entries
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|statement| !statement.is_closed())
            .count()
    }

    fn close_leaked(&self) {
        let leaked = self.registry.take_all();

        for statement in leaked.values().filter_map(Weak::upgrade) {
            if statement.is_closed() {
                continue;
            }
            tracing::debug!(
                sql = statement.sql().unwrap_or_default(),
                "closing statement left open at connection close"
            );
            if let Err(e) = Statement::from_handle(statement).close() {
                tracing::debug!(error = %e, "unable to close leaked statement");
            }
        }
    }
}

impl Interceptor for LeakedStatementTracker {
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
        _pool: Option<&Arc<dyn ConnectionPool>>,
        _connection: Option<&Arc<PooledConnection>>,
    ) {
        self.registry.clear();
    }

    fn cleanup(&self) {
        self.registry.clear();
    }

    fn disconnected(
        &self,
        _pool: Option<&Arc<dyn ConnectionPool>>,
        _connection: &Arc<PooledConnection>,
        _finalizing: bool,
    ) {
        self.registry.clear();
    }

    fn name(&self) -> &'static str {
        "LeakedStatementTracker"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl StatementInterceptor for LeakedStatementTracker {
    fn create_decorator(
        &self,
        proxy: &Connection,
        kind: StatementKind,
        statement: Statement,
        sql: Option<&str>,
    ) -> Result<Statement> {
        // The hooks carry the id, so it is reserved before the facade exists.
        let id = self.registry.reserve_id();
        let facade = StatementFacade::new(
            statement,
            sql.map(str::to_owned),
            kind,
            proxy.downgrade(),
            TrackedHooks {
                registry: Arc::downgrade(&self.registry),
                id,
            },
        );

        let handle: Arc<dyn StatementHandle> = facade.clone();
        self.registry.register(id, Arc::downgrade(&handle));

        Ok(facade.into_statement())
    }

    fn close_invoked(&self) {
        self.close_leaked();
    }
}
