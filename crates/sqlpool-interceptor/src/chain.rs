//! The interceptor chain and the connection proxy callers hold.
//!
//! A chain is an ordered list of [`Interceptor`]s ending in the
//! [`TerminalInterceptor`]. Every operation on a [`Connection`] enters at
//! the head; each link either answers it or passes it on through [`Next`].
//! Topology is fixed once the chain is built. Only the interceptors' internal
//! state changes between checkouts.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::operation::{ConnectionOp, ConnectionReply, WrapperTarget};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::statement::Statement;
use crate::terminal::TerminalInterceptor;

/// A link in the interceptor chain.
///
/// Only [`Interceptor::name`] and [`Interceptor::as_any`] are required. The
/// default [`Interceptor::invoke`] forwards every operation unchanged, and
/// implementations that override it must still forward anything they do not
/// handle.
pub trait Interceptor: Any + Send + Sync {
    /// Handle an operation invoked on the connection proxy.
    fn invoke(
        &self,
        proxy: &Connection,
        op: ConnectionOp<'_>,
        next: Next<'_>,
    ) -> Result<ConnectionReply> {
        next.invoke(proxy, op)
    }

    /// Called at checkout, before the connection reaches a caller.
    ///
    /// Must reset all per-checkout state. Both arguments may be `None` when
    /// the chain is being torn down.
    fn initialize(
        &self,
        _pool: Option<&Arc<dyn ConnectionPool>>,
        _connection: Option<&Arc<PooledConnection>>,
    ) {
    }

    /// Called at check-in; releases what [`Interceptor::initialize`] acquired.
    fn cleanup(&self) {}

    /// The physical connection was discarded by the pool.
    ///
    /// Derived state tied to the connection must be dropped here. Failures
    /// are logged, never returned.
    fn disconnected(
        &self,
        _pool: Option<&Arc<dyn ConnectionPool>>,
        _connection: &Arc<PooledConnection>,
        _finalizing: bool,
    ) {
    }

    /// The pool started. Fired once per pool.
    fn pool_started(&self, _pool: &Arc<dyn ConnectionPool>) {}

    /// The pool closed. Fired once per pool.
    fn pool_closed(&self, _pool: &Arc<dyn ConnectionPool>) {}

    /// Interceptor name, used in logs.
    fn name(&self) -> &'static str;

    /// Get this interceptor as [`Any`] for type lookups.
    fn as_any(&self) -> &dyn Any;
}

/// The rest of the chain after the current link.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
    terminal: &'a TerminalInterceptor,
}

impl Next<'_> {
    /// Pass an operation to the next link.
    pub fn invoke(self, proxy: &Connection, op: ConnectionOp<'_>) -> Result<ConnectionReply> {
        match self.rest.split_first() {
            Some((link, rest)) => link.invoke(
                proxy,
                op,
                Next {
                    rest,
                    terminal: self.terminal,
                },
            ),
            None => self.terminal.handle(proxy, op),
        }
    }
}

/// The links of one logical connection.
pub struct InterceptorChain {
    links: Vec<Arc<dyn Interceptor>>,
    terminal: TerminalInterceptor,
}

impl InterceptorChain {
    /// Start building a chain.
    #[must_use]
    pub fn builder() -> ChainBuilder {
        ChainBuilder::default()
    }

    /// Number of links, the terminal included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len() + 1
    }

    /// A chain always holds the terminal link.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Find the first link of type `T`.
    #[must_use]
    pub fn handler<T: Interceptor>(&self) -> Option<&T> {
        self.links
            .iter()
            .find_map(|link| link.as_any().downcast_ref::<T>())
    }

    /// Get the terminal link.
    #[must_use]
    pub fn terminal(&self) -> &TerminalInterceptor {
        &self.terminal
    }

    /// Names of the links in order, the terminal last.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.links
            .iter()
            .map(|link| link.name())
            .chain(std::iter::once(self.terminal.name()))
    }

    fn each(&self, mut f: impl FnMut(&dyn Interceptor)) {
        for link in &self.links {
            f(&**link);
        }
        f(&self.terminal);
    }
}

/// Builder for an [`InterceptorChain`].
#[derive(Default)]
pub struct ChainBuilder {
    links: Vec<Arc<dyn Interceptor>>,
}

impl ChainBuilder {
    /// Append a link.
    #[must_use]
    pub fn link(self, interceptor: impl Interceptor) -> Self {
        self.link_shared(Arc::new(interceptor))
    }

    /// Append a shared link.
    #[must_use]
    pub fn link_shared(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.links.push(interceptor);
        self
    }

    /// Finish the chain with the terminal link and wrap it in a connection
    /// proxy.
    #[must_use]
    pub fn build(self) -> Connection {
        Connection {
            chain: Arc::new(InterceptorChain {
                links: self.links,
                terminal: TerminalInterceptor::new(),
            }),
        }
    }
}

/// A pooled connection as the caller sees it.
///
/// Cloning yields another handle to the same chain.
#[derive(Clone)]
pub struct Connection {
    chain: Arc<InterceptorChain>,
}

impl Connection {
    /// Get the chain behind this proxy.
    #[must_use]
    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    /// Find the chain's first link of type `T`.
    #[must_use]
    pub fn handler<T: Interceptor>(&self) -> Option<&T> {
        self.chain.handler::<T>()
    }

    /// Create a weak reference that does not keep the chain alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.chain))
    }

    /// Check whether two proxies share one chain.
    #[must_use]
    pub fn ptr_eq(a: &Connection, b: &Connection) -> bool {
        Arc::ptr_eq(&a.chain, &b.chain)
    }

    /// Dispatch a raw operation from the head of the chain.
    pub fn invoke(&self, op: ConnectionOp<'_>) -> Result<ConnectionReply> {
        Next {
            rest: &self.chain.links,
            terminal: &self.chain.terminal,
        }
        .invoke(self, op)
    }

    // Pool-facing lifecycle

    /// Attach the chain to a pooled connection at checkout.
    pub fn initialize(&self, pool: &Arc<dyn ConnectionPool>, connection: &Arc<PooledConnection>) {
        tracing::trace!(
            connection_id = connection.id(),
            links = self.chain.len(),
            "initializing interceptor chain"
        );
        connection.record_checkout();
        self.chain
            .each(|link| link.initialize(Some(pool), Some(connection)));
    }

    /// Release the chain at check-in.
    pub fn cleanup(&self) {
        self.chain.each(|link| link.cleanup());
    }

    /// Tell the chain the physical connection was discarded.
    pub fn disconnected(
        &self,
        pool: Option<&Arc<dyn ConnectionPool>>,
        connection: &Arc<PooledConnection>,
        finalizing: bool,
    ) {
        tracing::debug!(
            connection_id = connection.id(),
            finalizing = finalizing,
            "pooled connection disconnected"
        );
        self.chain
            .each(|link| link.disconnected(pool, connection, finalizing));
    }

    /// Forward the pool-started notification to every link.
    pub fn pool_started(&self, pool: &Arc<dyn ConnectionPool>) {
        self.chain.each(|link| link.pool_started(pool));
    }

    /// Forward the pool-closed notification to every link.
    pub fn pool_closed(&self, pool: &Arc<dyn ConnectionPool>) {
        self.chain.each(|link| link.pool_closed(pool));
    }

    // Caller-facing operations

    /// Create a plain statement.
    pub fn create_statement(&self) -> Result<Statement> {
        let op = ConnectionOp::CreateStatement;
        self.invoke(op)?.into_statement(op.name())
    }

    /// Prepare a parameterized statement.
    pub fn prepare_statement(&self, sql: &str) -> Result<Statement> {
        let op = ConnectionOp::PrepareStatement { sql };
        self.invoke(op)?.into_statement(op.name())
    }

    /// Prepare a stored procedure call.
    pub fn prepare_call(&self, sql: &str) -> Result<Statement> {
        let op = ConnectionOp::PrepareCall { sql };
        self.invoke(op)?.into_statement(op.name())
    }

    /// Close the connection, returning it to the pool. Closing twice is a
    /// no-op.
    pub fn close(&self) -> Result<()> {
        self.invoke(ConnectionOp::Close).map(drop)
    }

    /// Check whether the connection is closed, either by the caller or
    /// because the pool discarded it.
    pub fn is_closed(&self) -> Result<bool> {
        self.invoke(ConnectionOp::IsClosed)?.into_bool("is_closed")
    }

    /// Validate the physical connection.
    pub fn is_valid(&self, timeout: Duration) -> Result<bool> {
        self.invoke(ConnectionOp::IsValid { timeout })?
            .into_bool("is_valid")
    }

    /// Commit the current transaction.
    pub fn commit(&self) -> Result<()> {
        self.invoke(ConnectionOp::Commit).map(drop)
    }

    /// Roll back the current transaction.
    pub fn rollback(&self) -> Result<()> {
        self.invoke(ConnectionOp::Rollback).map(drop)
    }

    /// Set auto-commit mode.
    pub fn set_auto_commit(&self, enabled: bool) -> Result<()> {
        self.invoke(ConnectionOp::SetAutoCommit(enabled)).map(drop)
    }

    /// Get auto-commit mode.
    pub fn auto_commit(&self) -> Result<bool> {
        self.invoke(ConnectionOp::AutoCommit)?
            .into_bool("auto_commit")
    }

    /// Translate SQL to the backend's native grammar.
    pub fn native_sql(&self, sql: &str) -> Result<String> {
        self.invoke(ConnectionOp::NativeSql { sql })?
            .into_text("native_sql")
    }

    /// Get the pooled handle behind the connection, if it wraps `target`.
    pub fn unwrap(&self, target: WrapperTarget) -> Result<Arc<PooledConnection>> {
        self.invoke(ConnectionOp::Unwrap(target))?
            .into_pooled("unwrap")
    }

    /// Check whether the connection wraps `target`.
    pub fn is_wrapper_for(&self, target: WrapperTarget) -> Result<bool> {
        self.invoke(ConnectionOp::IsWrapperFor(target))?
            .into_bool("is_wrapper_for")
    }

    /// Run `f` against the native connection as its driver type `T`.
    pub fn with_native<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let target = WrapperTarget::native::<T>();
        self.unwrap(target)?
            .with_native_as::<T, R>(f)
            .ok_or(Error::NotAWrapper(target.type_name()))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("links", &self.chain.names().collect::<Vec<_>>())
            .field("closed", &self.chain.terminal.is_closed())
            .finish()
    }
}

/// A non-owning reference to a [`Connection`].
///
/// Statements hold one so they can report their connection without keeping
/// the chain alive.
#[derive(Clone, Default)]
pub struct WeakConnection(Weak<InterceptorChain>);

impl WeakConnection {
    /// Get the connection, if its chain still exists.
    #[must_use]
    pub fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|chain| Connection { chain })
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakConnection")
            .field(&(self.0.strong_count() > 0))
            .finish()
    }
}
