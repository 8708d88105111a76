//! A pool stand-in that records what the chain asks of it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use sqlpool_interceptor::{
    Connection, ConnectionPool, PoolCloseListener, PoolId, PooledConnection,
};

use crate::driver::MockDriver;

/// Pool that counts returned connections and fires close listeners.
pub struct MockPool {
    id: PoolId,
    returned: Mutex<Vec<u64>>,
    listeners: Mutex<Vec<Arc<dyn PoolCloseListener>>>,
    closed: AtomicBool,
}

impl MockPool {
    /// Create an open pool.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: PoolId::next(),
            returned: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Identity of this pool.
    #[must_use]
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// This pool behind the chain-facing interface.
    #[must_use]
    pub fn handle(self: &Arc<Self>) -> Arc<dyn ConnectionPool> {
        Arc::clone(self) as Arc<dyn ConnectionPool>
    }

    /// Number of times a connection was returned.
    #[must_use]
    pub fn returns(&self) -> usize {
        self.returned.lock().len()
    }

    /// Ids of returned connections, in order.
    #[must_use]
    pub fn returned_ids(&self) -> Vec<u64> {
        self.returned.lock().clone()
    }

    /// Number of registered close listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Check whether [`MockPool::close`] ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the pool.
    ///
    /// Sends `pool_closed` to the given chains, then fires every close
    /// listener once.
    pub fn close(self: &Arc<Self>, chains: &[&Connection]) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let handle = self.handle();
        for chain in chains {
            chain.pool_closed(&handle);
        }

        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener.pool_closed(self.id);
        }
    }
}

impl ConnectionPool for MockPool {
    fn id(&self) -> PoolId {
        self.id
    }

    fn return_connection(&self, connection: &Arc<PooledConnection>) {
        tracing::trace!(connection_id = connection.id(), "mock pool took connection back");
        self.returned.lock().push(connection.id());
    }

    fn add_close_listener(&self, listener: Arc<dyn PoolCloseListener>) {
        self.listeners.lock().push(listener);
    }
}

/// A driver, a pool and one pooled connection checked out through `conn`.
pub struct Fixture {
    /// Driver behind the pooled connection.
    pub driver: MockDriver,
    /// The pool.
    pub pool: Arc<MockPool>,
    /// The physical connection.
    pub pooled: Arc<PooledConnection>,
    /// Caller-facing proxy.
    pub conn: Connection,
}

impl Fixture {
    /// Attach `conn` to a fresh mock connection and pool.
    #[must_use]
    pub fn new(conn: Connection) -> Self {
        Self::with_driver(MockDriver::new(), conn)
    }

    /// Attach `conn` to a connection of `driver` and a fresh pool.
    #[must_use]
    pub fn with_driver(driver: MockDriver, conn: Connection) -> Self {
        let fixture = Self {
            pooled: driver.pooled(),
            driver,
            pool: MockPool::new(),
            conn,
        };
        fixture.checkout();
        fixture
    }

    /// Run the pool's checkout sequence on the chain.
    pub fn checkout(&self) {
        self.conn.initialize(&self.pool.handle(), &self.pooled);
    }

    /// Run the pool's check-in sequence on the chain.
    pub fn checkin(&self) {
        self.conn.cleanup();
    }

    /// Run the pool's discard sequence: notify the chain, then close the
    /// physical connection.
    pub fn discard(&self) {
        self.conn
            .disconnected(Some(&self.pool.handle()), &self.pooled, false);
        if let Err(e) = self.pooled.discard() {
            tracing::debug!(error = %e, "mock connection failed to close");
        }
    }
}
