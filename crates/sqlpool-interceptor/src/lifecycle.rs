//! Interceptors that wrap the statements a connection creates.
//!
//! A [`StatementInterceptor`] names the statement kinds it cares about and
//! builds a decorator around each statement of those kinds. Its
//! [`Interceptor::invoke`] delegates to [`intercept_creation`], which detects
//! the creation operations, forwards them, and swaps the returned statement
//! for the decorated one.

use std::any::Any;

use crate::chain::{Connection, Interceptor, Next};
use crate::error::Result;
use crate::operation::{ConnectionOp, ConnectionReply, StatementKind};
use crate::statement::{Statement, StatementFacade};

/// An interceptor that decorates statements created on the connection.
pub trait StatementInterceptor: Interceptor {
    /// Statement kinds this interceptor decorates. Defaults to all of them.
    fn creation_kinds(&self) -> &[StatementKind] {
        &StatementKind::ALL
    }

    /// Wrap a statement returned by the rest of the chain.
    ///
    /// `sql` is the text the statement was prepared with; it is `None` for
    /// plain statements.
    fn create_decorator(
        &self,
        proxy: &Connection,
        kind: StatementKind,
        statement: Statement,
        sql: Option<&str>,
    ) -> Result<Statement>;

    /// The connection itself is being closed.
    fn close_invoked(&self) {}
}

/// Dispatch a connection operation on behalf of a [`StatementInterceptor`].
///
/// Creation operations of a matching kind are forwarded and their result
/// decorated. A connection close runs [`StatementInterceptor::close_invoked`]
/// before it is forwarded. Everything else passes through unchanged.
pub fn intercept_creation<I>(
    interceptor: &I,
    proxy: &Connection,
    op: ConnectionOp<'_>,
    next: Next<'_>,
) -> Result<ConnectionReply>
where
    I: StatementInterceptor + ?Sized,
{
    if let ConnectionOp::Close = op {
        interceptor.close_invoked();
        return next.invoke(proxy, op);
    }

    match op.statement_kind() {
        Some(kind) if interceptor.creation_kinds().contains(&kind) => {
            let statement = next.invoke(proxy, op)?.into_statement(op.name())?;
            interceptor
                .create_decorator(proxy, kind, statement, op.sql())
                .map(ConnectionReply::Statement)
        }
        _ => next.invoke(proxy, op),
    }
}

/// Wraps every created statement in a plain facade.
///
/// Callers then hold a handle that turns stale once closed, independent of
/// what the layers below do with the underlying statement.
#[derive(Debug, Default)]
pub struct StatementDecorator;

impl StatementDecorator {
    /// Create the decorator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Interceptor for StatementDecorator {
    fn invoke(
        &self,
        proxy: &Connection,
        op: ConnectionOp<'_>,
        next: Next<'_>,
    ) -> Result<ConnectionReply> {
        intercept_creation(self, proxy, op, next)
    }

    fn name(&self) -> &'static str {
        "StatementDecorator"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl StatementInterceptor for StatementDecorator {
    fn create_decorator(
        &self,
        proxy: &Connection,
        kind: StatementKind,
        statement: Statement,
        sql: Option<&str>,
    ) -> Result<Statement> {
        Ok(
            StatementFacade::new(statement, sql.map(str::to_owned), kind, proxy.downgrade(), ())
                .into_statement(),
        )
    }
}
