//! Statements as seen by callers of a pooled connection.
//!
//! A [`Statement`] is a cheap, clonable handle to something implementing
//! [`StatementHandle`]. At the bottom sits the [`NativeStatementHandle`]
//! created by the terminal interceptor around the driver's statement; above
//! it, statement interceptors stack [`StatementFacade`]s whose behavior is
//! customized through [`FacadeHooks`].
//!
//! Callers only ever hold the outermost facade. Closing it clears its
//! delegate, so a stale handle kept after close can never reach the driver.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use sqlpool_driver::{DriverError, NativeStatement, Rows, Value};

use crate::chain::{Connection, WeakConnection};
use crate::error::{Error, Resource, Result};
use crate::operation::{StatementKind, StatementOp, StatementReply};

/// Operation surface shared by every statement layer.
pub trait StatementHandle: Send + Sync {
    /// Dispatch an operation to this layer.
    fn dispatch(&self, op: StatementOp<'_>) -> Result<StatementReply>;

    /// Check whether this layer, or anything beneath it, is closed.
    fn is_closed(&self) -> bool;

    /// SQL text the statement was prepared with, if any.
    fn sql(&self) -> Option<&str>;

    /// Shape of the statement.
    fn kind(&self) -> StatementKind;

    /// The pooled connection proxy the statement was created from.
    fn connection(&self) -> Option<Connection>;
}

/// A statement obtained from a pooled connection.
#[derive(Clone)]
pub struct Statement(Arc<dyn StatementHandle>);

impl Statement {
    /// Wrap a statement layer.
    #[must_use]
    pub fn from_handle(handle: Arc<dyn StatementHandle>) -> Self {
        Self(handle)
    }

    /// Get the underlying handle.
    #[must_use]
    pub fn handle(&self) -> &Arc<dyn StatementHandle> {
        &self.0
    }

    /// Create a weak reference that does not keep the statement alive.
    #[must_use]
    pub fn downgrade(&self) -> Weak<dyn StatementHandle> {
        Arc::downgrade(&self.0)
    }

    /// Check whether two handles refer to the same statement layer.
    #[must_use]
    pub fn ptr_eq(a: &Statement, b: &Statement) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&a.0), Arc::as_ptr(&b.0))
    }

    /// Dispatch a raw operation.
    pub fn dispatch(&self, op: StatementOp<'_>) -> Result<StatementReply> {
        self.0.dispatch(op)
    }

    /// Execute a prepared or callable statement.
    pub fn execute(&self) -> Result<bool> {
        self.execute_op(None)
    }

    /// Execute SQL text on a plain statement.
    pub fn execute_sql(&self, sql: &str) -> Result<bool> {
        self.execute_op(Some(sql))
    }

    fn execute_op(&self, sql: Option<&str>) -> Result<bool> {
        match self.dispatch(StatementOp::Execute { sql })? {
            StatementReply::Bool(b) => Ok(b),
            _ => Err(Error::UnexpectedReply { operation: "execute" }),
        }
    }

    /// Run a prepared or callable query.
    pub fn execute_query(&self) -> Result<ResultSet> {
        self.query_op(None)
    }

    /// Run a query on a plain statement.
    pub fn execute_query_sql(&self, sql: &str) -> Result<ResultSet> {
        self.query_op(Some(sql))
    }

    fn query_op(&self, sql: Option<&str>) -> Result<ResultSet> {
        match self.dispatch(StatementOp::ExecuteQuery { sql })? {
            StatementReply::Rows(rs) => Ok(rs),
            _ => Err(Error::UnexpectedReply {
                operation: "execute_query",
            }),
        }
    }

    /// Run a prepared or callable update.
    pub fn execute_update(&self) -> Result<u64> {
        self.update_op(None)
    }

    /// Run an update on a plain statement.
    pub fn execute_update_sql(&self, sql: &str) -> Result<u64> {
        self.update_op(Some(sql))
    }

    fn update_op(&self, sql: Option<&str>) -> Result<u64> {
        match self.dispatch(StatementOp::ExecuteUpdate { sql })? {
            StatementReply::Count(n) => Ok(n),
            _ => Err(Error::UnexpectedReply {
                operation: "execute_update",
            }),
        }
    }

    /// Add the current parameter set to the batch.
    pub fn add_batch(&self) -> Result<()> {
        self.dispatch(StatementOp::AddBatch { sql: None }).map(drop)
    }

    /// Add SQL text to the batch of a plain statement.
    pub fn add_batch_sql(&self, sql: &str) -> Result<()> {
        self.dispatch(StatementOp::AddBatch { sql: Some(sql) })
            .map(drop)
    }

    /// Execute the batch.
    pub fn execute_batch(&self) -> Result<Vec<u64>> {
        match self.dispatch(StatementOp::ExecuteBatch)? {
            StatementReply::Counts(counts) => Ok(counts),
            _ => Err(Error::UnexpectedReply {
                operation: "execute_batch",
            }),
        }
    }

    /// Bind a parameter (1-based index).
    pub fn bind(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        self.dispatch(StatementOp::SetParameter {
            index,
            value: value.into(),
        })
        .map(drop)
    }

    /// Clear all bound parameters.
    pub fn clear_parameters(&self) -> Result<()> {
        self.dispatch(StatementOp::ClearParameters).map(drop)
    }

    /// Close the statement. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        self.dispatch(StatementOp::Close).map(drop)
    }

    /// Check whether the statement is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    /// SQL text the statement was prepared with.
    #[must_use]
    pub fn sql(&self) -> Option<&str> {
        self.0.sql()
    }

    /// Shape of the statement.
    #[must_use]
    pub fn kind(&self) -> StatementKind {
        self.0.kind()
    }

    /// The pooled connection proxy the statement belongs to.
    #[must_use]
    pub fn connection(&self) -> Option<Connection> {
        self.0.connection()
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("kind", &self.kind())
            .field("sql", &self.sql())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Rows returned by a query, remembering the statement that produced them.
#[derive(Debug)]
pub struct ResultSet {
    rows: Rows,
    statement: Option<Statement>,
}

impl ResultSet {
    /// Create a result set not yet tied to a statement.
    #[must_use]
    pub fn new(rows: Rows) -> Self {
        Self {
            rows,
            statement: None,
        }
    }

    /// The rows.
    #[must_use]
    pub fn rows(&self) -> &Rows {
        &self.rows
    }

    /// Take the rows, dropping the statement reference.
    #[must_use]
    pub fn into_rows(self) -> Rows {
        self.rows
    }

    /// The statement that produced these rows, as the caller sees it.
    #[must_use]
    pub fn statement(&self) -> Option<&Statement> {
        self.statement.as_ref()
    }

    pub(crate) fn with_statement(mut self, statement: Statement) -> Self {
        self.statement = Some(statement);
        self
    }
}

/// Bottom statement layer owning the driver's statement.
pub(crate) struct NativeStatementHandle {
    native: Mutex<Option<Box<dyn NativeStatement>>>,
    sql: Option<String>,
    kind: StatementKind,
    connection: WeakConnection,
}

impl NativeStatementHandle {
    pub(crate) fn new(
        native: Box<dyn NativeStatement>,
        sql: Option<&str>,
        kind: StatementKind,
        connection: WeakConnection,
    ) -> Statement {
        Statement::from_handle(Arc::new(Self {
            native: Mutex::new(Some(native)),
            sql: sql.map(str::to_owned),
            kind,
            connection,
        }))
    }
}

impl Drop for NativeStatementHandle {
    fn drop(&mut self) {
        let Some(mut native) = self.native.get_mut().take() else {
            return;
        };
        tracing::trace!(sql = self.sql.as_deref().unwrap_or_default(), "closing dropped statement");
        if let Err(e) = native.close() {
            tracing::debug!(error = %e, "failed to close dropped statement");
        }
    }
}

fn run_native(
    native: &mut dyn NativeStatement,
    op: StatementOp<'_>,
) -> std::result::Result<StatementReply, DriverError> {
    match op {
        StatementOp::Execute { sql } => native.execute(sql).map(StatementReply::Bool),
        StatementOp::ExecuteQuery { sql } => native
            .execute_query(sql)
            .map(|rows| StatementReply::Rows(ResultSet::new(rows))),
        StatementOp::ExecuteUpdate { sql } => native.execute_update(sql).map(StatementReply::Count),
        StatementOp::AddBatch { sql } => native.add_batch(sql).map(|()| StatementReply::Unit),
        StatementOp::ExecuteBatch => native.execute_batch().map(StatementReply::Counts),
        StatementOp::SetParameter { index, value } => native
            .set_parameter(index, value)
            .map(|()| StatementReply::Unit),
        StatementOp::ClearParameters => native.clear_parameters().map(|()| StatementReply::Unit),
        StatementOp::Close => native.close().map(|()| StatementReply::Unit),
        StatementOp::IsClosed => Ok(StatementReply::Bool(false)),
    }
}

impl StatementHandle for NativeStatementHandle {
    fn dispatch(&self, op: StatementOp<'_>) -> Result<StatementReply> {
        let mut guard = self.native.lock();

        match op {
            StatementOp::Close => match guard.take() {
                Some(mut native) => run_native(&mut *native, op),
                None => Ok(StatementReply::Unit),
            },
            StatementOp::IsClosed => Ok(StatementReply::Bool(guard.is_none())),
            op => {
                let native = guard
                    .as_mut()
                    .ok_or(Error::ResourceClosed(Resource::Statement))?;
                run_native(&mut **native, op)
            }
        }
        .map_err(|e| Error::Driver(e.unwrap_invocation()))
    }

    fn is_closed(&self) -> bool {
        self.native.lock().is_none()
    }

    fn sql(&self) -> Option<&str> {
        self.sql.as_deref()
    }

    fn kind(&self) -> StatementKind {
        self.kind
    }

    fn connection(&self) -> Option<Connection> {
        self.connection.upgrade()
    }
}

/// Behavior plugged into a [`StatementFacade`] by a statement interceptor.
///
/// Every method has a default that behaves like a transparent wrapper.
pub trait FacadeHooks: Send + Sync + Sized + 'static {
    /// Handle an operation on an open facade.
    ///
    /// The default forwards it to the delegate.
    fn invoke(
        &self,
        facade: &StatementFacade<Self>,
        op: StatementOp<'_>,
    ) -> Result<StatementReply> {
        facade.forward(op)
    }

    /// Called once when the caller closes the facade, with the delegate the
    /// facade held.
    ///
    /// The default physically closes the delegate.
    fn close_invoked(&self, facade: &StatementFacade<Self>, delegate: Statement) -> Result<()> {
        let _ = facade;
        delegate.close()
    }

    /// Called with every failure an operation raised, before it is returned
    /// to the caller.
    fn exception_reported(&self, facade: &StatementFacade<Self>, error: &Error) {
        let _ = (facade, error);
    }
}

/// Hooks of a facade that adds nothing but the closed-state guard.
impl FacadeHooks for () {}

/// A statement layer wrapping a delegate statement.
pub struct StatementFacade<H: FacadeHooks> {
    this: Weak<Self>,
    delegate: Mutex<Option<Statement>>,
    sql: Option<String>,
    kind: StatementKind,
    connection: WeakConnection,
    closed: AtomicBool,
    hooks: H,
}

impl<H: FacadeHooks> StatementFacade<H> {
    /// Create a facade around `delegate`.
    #[must_use]
    pub fn new(
        delegate: Statement,
        sql: Option<String>,
        kind: StatementKind,
        connection: WeakConnection,
        hooks: H,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            delegate: Mutex::new(Some(delegate)),
            sql,
            kind,
            connection,
            closed: AtomicBool::new(false),
            hooks,
        })
    }

    /// Get the hooks.
    #[must_use]
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Get the delegate, if the facade is still open.
    #[must_use]
    pub fn delegate(&self) -> Option<Statement> {
        self.delegate.lock().clone()
    }

    /// Get the back-reference to the owning connection.
    #[must_use]
    pub fn connection_ref(&self) -> &WeakConnection {
        &self.connection
    }

    /// Forward an operation to the delegate.
    pub fn forward(&self, op: StatementOp<'_>) -> Result<StatementReply> {
        self.delegate()
            .ok_or(Error::ResourceClosed(Resource::Statement))?
            .dispatch(op)
    }

    /// Mark the facade closed and take its delegate without running
    /// [`FacadeHooks::close_invoked`].
    pub fn retire(&self) -> Option<Statement> {
        self.closed.store(true, Ordering::Release);
        self.delegate.lock().take()
    }

    /// This facade as a caller-facing statement.
    #[must_use]
    pub fn statement(&self) -> Option<Statement> {
        self.this.upgrade().map(Self::into_statement)
    }

    /// Convert a shared facade into a caller-facing statement.
    #[must_use]
    pub fn into_statement(self: Arc<Self>) -> Statement {
        Statement::from_handle(self)
    }

    fn close(&self) -> Result<StatementReply> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(StatementReply::Unit);
        }

        let delegate = self.delegate.lock().take();
        match delegate {
            Some(delegate) => self
                .hooks
                .close_invoked(self, delegate)
                .map(|()| StatementReply::Unit),
            None => Ok(StatementReply::Unit),
        }
    }
}

impl<H: FacadeHooks> StatementHandle for StatementFacade<H> {
    fn dispatch(&self, op: StatementOp<'_>) -> Result<StatementReply> {
        match op {
            StatementOp::Close => self.close(),
            StatementOp::IsClosed => Ok(StatementReply::Bool(self.is_closed())),
            _ if self.closed.load(Ordering::Acquire) => {
                Err(Error::ResourceClosed(Resource::Statement))
            }
            op => match self.hooks.invoke(self, op) {
                Ok(StatementReply::Rows(rs)) => Ok(StatementReply::Rows(match self.statement() {
                    Some(me) => rs.with_statement(me),
                    None => rs,
                })),
                Ok(reply) => Ok(reply),
                Err(e) => {
                    self.hooks.exception_reported(self, &e);
                    Err(e)
                }
            },
        }
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return true;
        }
        self.delegate().is_none_or(|d| d.is_closed())
    }

    fn sql(&self) -> Option<&str> {
        self.sql.as_deref()
    }

    fn kind(&self) -> StatementKind {
        self.kind
    }

    fn connection(&self) -> Option<Connection> {
        self.connection.upgrade()
    }
}
