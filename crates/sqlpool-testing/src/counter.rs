//! Interceptor counting statement facades.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sqlpool_interceptor::{
    Connection, ConnectionOp, ConnectionReply, FacadeHooks, Interceptor, Next, Result, Statement,
    StatementFacade, StatementInterceptor, StatementKind, intercept_creation,
};

#[derive(Debug, Default)]
struct Counts {
    created: AtomicUsize,
    closed: AtomicUsize,
}

/// Hooks that count the caller's closes.
pub struct CountingHooks {
    counts: Arc<Counts>,
}

impl FacadeHooks for CountingHooks {
    fn close_invoked(&self, _facade: &StatementFacade<Self>, delegate: Statement) -> Result<()> {
        self.counts.closed.fetch_add(1, Ordering::SeqCst);
        delegate.close()
    }
}

/// Counts statements created through the chain and how many the caller
/// closed.
#[derive(Debug, Default)]
pub struct StatementCounter {
    counts: Arc<Counts>,
}

impl StatementCounter {
    /// Create a counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Statements created.
    #[must_use]
    pub fn created(&self) -> usize {
        self.counts.created.load(Ordering::SeqCst)
    }

    /// Statements the caller closed.
    #[must_use]
    pub fn closed(&self) -> usize {
        self.counts.closed.load(Ordering::SeqCst)
    }

    /// Statements not yet closed by the caller.
    #[must_use]
    pub fn open(&self) -> usize {
        self.created().saturating_sub(self.closed())
    }
}

impl Interceptor for StatementCounter {
    fn invoke(
        &self,
        proxy: &Connection,
        op: ConnectionOp<'_>,
        next: Next<'_>,
    ) -> Result<ConnectionReply> {
        intercept_creation(self, proxy, op, next)
    }

    fn name(&self) -> &'static str {
        "StatementCounter"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl StatementInterceptor for StatementCounter {
    fn create_decorator(
        &self,
        proxy: &Connection,
        kind: StatementKind,
        statement: Statement,
        sql: Option<&str>,
    ) -> Result<Statement> {
        self.counts.created.fetch_add(1, Ordering::SeqCst);
        Ok(StatementFacade::new(
            statement,
            sql.map(str::to_owned),
            kind,
            proxy.downgrade(),
            CountingHooks {
                counts: Arc::clone(&self.counts),
            },
        )
        .into_statement())
    }
}
