//! The pool side of the chain.
//!
//! Pool sizing, validation and eviction live outside this crate. The chain
//! only needs the narrow interface below: a way to hand a connection back, a
//! way to learn that the pool closed, and the pooled handle that owns the
//! native connection.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sqlpool_driver::{DriverError, NativeConnection};

/// Stable identity of a pool instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(u64);

impl PoolId {
    /// Allocate a new process-unique pool identity.
    #[must_use]
    pub fn next() -> Self {
        static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw identifier.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool-{}", self.0)
    }
}

/// Notified once when a pool closes.
pub trait PoolCloseListener: Send + Sync {
    /// The pool with the given identity has closed.
    fn pool_closed(&self, pool: PoolId);
}

/// The connection pool as seen from the interceptor chain.
pub trait ConnectionPool: Send + Sync {
    /// Identity of this pool.
    fn id(&self) -> PoolId;

    /// Take back a connection whose logical handle was closed.
    fn return_connection(&self, connection: &Arc<PooledConnection>);

    /// Register a listener fired when the pool closes.
    fn add_close_listener(&self, listener: Arc<dyn PoolCloseListener>);
}

/// Metadata about a pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Connection identifier, unique within the process.
    pub id: u64,
    /// When the physical connection was established.
    pub created_at: Instant,
}

impl ConnectionMetadata {
    /// Age of the physical connection.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// A physical connection owned by the pool.
///
/// The pool lends it to exactly one interceptor chain at a time. Once
/// discarded it is never handed out again, and chains attached to it report
/// themselves closed.
pub struct PooledConnection {
    metadata: ConnectionMetadata,
    native: Mutex<Box<dyn NativeConnection>>,
    discarded: AtomicBool,
    checkouts: AtomicU64,
}

impl PooledConnection {
    /// Wrap a freshly established native connection.
    #[must_use]
    pub fn new(native: Box<dyn NativeConnection>) -> Arc<Self> {
        static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

        Arc::new(Self {
            metadata: ConnectionMetadata {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                created_at: Instant::now(),
            },
            native: Mutex::new(native),
            discarded: AtomicBool::new(false),
            checkouts: AtomicU64::new(0),
        })
    }

    /// Get the connection metadata.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    /// Get the connection identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.metadata.id
    }

    /// Check whether the pool discarded this connection.
    #[must_use]
    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    /// Number of times the connection was checked out.
    #[must_use]
    pub fn checkouts(&self) -> u64 {
        self.checkouts.load(Ordering::Relaxed)
    }

    pub(crate) fn record_checkout(&self) {
        self.checkouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Run `f` with exclusive access to the native connection.
    pub fn with_native<R>(&self, f: impl FnOnce(&mut dyn NativeConnection) -> R) -> R {
        let mut native = self.native.lock();
        f(&mut **native)
    }

    /// Run `f` against the native connection downcast to its driver type.
    ///
    /// Returns `None` if the native connection is not a `T`.
    pub fn with_native_as<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut native = self.native.lock();
        native.as_any_mut().downcast_mut::<T>().map(f)
    }

    /// Check whether the native connection has the given type.
    #[must_use]
    pub fn native_is(&self, type_id: std::any::TypeId) -> bool {
        self.native.lock().as_any().type_id() == type_id
    }

    /// Name of the native connection's type.
    #[must_use]
    pub fn native_type_name(&self) -> &'static str {
        self.native.lock().type_name()
    }

    /// Mark the connection discarded and physically close it.
    ///
    /// The caller must have run `disconnected` on the attached chain first so
    /// that cached and leaked statements are closed before the connection
    /// goes away. Closing twice is a no-op.
    pub fn discard(&self) -> Result<(), DriverError> {
        if self.discarded.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        tracing::debug!(connection_id = self.metadata.id, "discarding pooled connection");
        self.native.lock().close()
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.metadata.id)
            .field("discarded", &self.is_discarded())
            .field("checkouts", &self.checkouts())
            .finish()
    }
}
