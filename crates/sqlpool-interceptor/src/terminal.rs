//! The last link of every chain.
//!
//! The terminal owns the attachment to the pooled connection. It returns the
//! connection to the pool exactly once on close, rejects use after close, and
//! forwards everything else to the native connection.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use sqlpool_driver::DriverError;

use crate::chain::{Connection, Interceptor, Next};
use crate::error::{Error, Resource, Result};
use crate::operation::{ConnectionOp, ConnectionReply, StatementKind, WrapperTarget};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::statement::NativeStatementHandle;

#[derive(Clone)]
struct Attachment {
    pool: Option<Arc<dyn ConnectionPool>>,
    connection: Arc<PooledConnection>,
}

/// Bottom link of the chain.
///
/// A fresh terminal is closed; [`Interceptor::initialize`] with a connection
/// opens it.
pub struct TerminalInterceptor {
    attached: Mutex<Option<Attachment>>,
    closed: AtomicBool,
}

impl TerminalInterceptor {
    pub(crate) fn new() -> Self {
        Self {
            attached: Mutex::new(None),
            closed: AtomicBool::new(true),
        }
    }

    /// Check whether the connection is closed, locally or because the pool
    /// discarded the physical connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
            || self
                .attached
                .lock()
                .as_ref()
                .is_none_or(|a| a.connection.is_discarded())
    }

    /// The pooled connection currently attached, if any.
    #[must_use]
    pub fn pooled(&self) -> Option<Arc<PooledConnection>> {
        self.attached.lock().as_ref().map(|a| Arc::clone(&a.connection))
    }

    fn attachment(&self) -> Result<Attachment> {
        self.attached.lock().clone().ok_or(Error::Detached)
    }

    fn detach(&self) {
        self.closed.store(true, Ordering::Release);
        self.attached.lock().take();
    }

    fn close(&self) -> Result<ConnectionReply> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(ConnectionReply::Unit);
        }

        // The pool may call back into the chain, so no lock is held here.
        let attachment = self.attached.lock().clone();
        if let Some(Attachment {
            pool: Some(pool),
            connection,
        }) = attachment
        {
            tracing::trace!(
                connection_id = connection.id(),
                pool = %pool.id(),
                "returning connection to pool"
            );
            pool.return_connection(&connection);
        }
        Ok(ConnectionReply::Unit)
    }

    fn wraps(connection: &PooledConnection, target: WrapperTarget) -> bool {
        match target {
            WrapperTarget::PooledConnection => true,
            WrapperTarget::Native { type_id, .. } => connection.native_is(type_id),
        }
    }

    pub(crate) fn handle(
        &self,
        proxy: &Connection,
        op: ConnectionOp<'_>,
    ) -> Result<ConnectionReply> {
        match op {
            ConnectionOp::Close => return self.close(),
            ConnectionOp::IsClosed => return Ok(ConnectionReply::Bool(self.is_closed())),
            _ if self.is_closed() => return Err(Error::ResourceClosed(Resource::Connection)),
            _ => {}
        }

        let connection = self.attachment()?.connection;

        match op {
            ConnectionOp::Unwrap(target) => {
                return if Self::wraps(&connection, target) {
                    Ok(ConnectionReply::Pooled(connection))
                } else {
                    Err(Error::NotAWrapper(target.type_name()))
                };
            }
            ConnectionOp::IsWrapperFor(target) => {
                return Ok(ConnectionReply::Bool(Self::wraps(&connection, target)));
            }
            _ => {}
        }

        let reply = connection.with_native(|native| -> std::result::Result<_, DriverError> {
            let (statement, kind) = match op {
                ConnectionOp::CreateStatement => (native.create_statement()?, StatementKind::Plain),
                ConnectionOp::PrepareStatement { sql } => {
                    (native.prepare_statement(sql)?, StatementKind::Prepared)
                }
                ConnectionOp::PrepareCall { sql } => {
                    (native.prepare_call(sql)?, StatementKind::Callable)
                }
                ConnectionOp::IsValid { timeout } => {
                    return native.is_valid(timeout).map(ConnectionReply::Bool);
                }
                ConnectionOp::Commit => return native.commit().map(|()| ConnectionReply::Unit),
                ConnectionOp::Rollback => return native.rollback().map(|()| ConnectionReply::Unit),
                ConnectionOp::SetAutoCommit(enabled) => {
                    return native.set_auto_commit(enabled).map(|()| ConnectionReply::Unit);
                }
                ConnectionOp::AutoCommit => return native.auto_commit().map(ConnectionReply::Bool),
                ConnectionOp::NativeSql { sql } => {
                    return native.native_sql(sql).map(ConnectionReply::Text);
                }
                ConnectionOp::Close
                | ConnectionOp::IsClosed
                | ConnectionOp::Unwrap(_)
                | ConnectionOp::IsWrapperFor(_) => return Err(DriverError::Unsupported(op.name())),
            };

            Ok(ConnectionReply::Statement(NativeStatementHandle::new(
                statement,
                op.sql(),
                kind,
                proxy.downgrade(),
            )))
        });

        reply.map_err(|e| Error::Driver(e.unwrap_invocation()))
    }
}

impl Interceptor for TerminalInterceptor {
    fn invoke(
        &self,
        proxy: &Connection,
        op: ConnectionOp<'_>,
        _next: Next<'_>,
    ) -> Result<ConnectionReply> {
        self.handle(proxy, op)
    }

    fn initialize(
        &self,
        pool: Option<&Arc<dyn ConnectionPool>>,
        connection: Option<&Arc<PooledConnection>>,
    ) {
        match connection {
            Some(connection) => {
                *self.attached.lock() = Some(Attachment {
                    pool: pool.cloned(),
                    connection: Arc::clone(connection),
                });
                self.closed.store(false, Ordering::Release);
            }
            None => self.detach(),
        }
    }

    fn cleanup(&self) {
        self.detach();
    }

    fn disconnected(
        &self,
        _pool: Option<&Arc<dyn ConnectionPool>>,
        _connection: &Arc<PooledConnection>,
        _finalizing: bool,
    ) {
        self.detach();
    }

    fn name(&self) -> &'static str {
        "TerminalInterceptor"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::chain::InterceptorChain;
    use crate::error::{Error, Resource};

    #[test]
    fn test_fresh_terminal_is_closed() {
        let conn = InterceptorChain::builder().build();
        assert!(conn.chain().terminal().is_closed());
        assert!(conn.chain().terminal().pooled().is_none());
        assert!(matches!(
            conn.prepare_statement("select 1"),
            Err(Error::ResourceClosed(Resource::Connection))
        ));
    }

    #[test]
    fn test_close_on_detached_terminal_is_noop() {
        let conn = InterceptorChain::builder().build();
        conn.close().unwrap();
        conn.close().unwrap();
        assert!(conn.is_closed().unwrap());
    }
}
