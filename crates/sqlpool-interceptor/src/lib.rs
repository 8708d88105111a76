//! # sqlpool-interceptor
//!
//! Interceptor chain for pooled database connections.
//!
//! Every operation a caller makes on a pooled connection travels through an
//! ordered chain of interceptors before it reaches the native driver. Each
//! link may handle the operation, rewrite it, or forward it to the next link.
//! The last link, [`TerminalInterceptor`], owns the pooled handle: closing the
//! connection returns it to the pool instead of closing it.
//!
//! ## Features
//!
//! - **Statement facades**: statements handed to callers turn stale on close,
//!   whatever the lower layers do with the driver's statement
//! - **Statement cache**: prepared statements are reused across close and
//!   prepare, with LRU eviction per physical connection
//! - **Leak tracking**: statements left open when the connection closes are
//!   closed for the caller
//! - **Query statistics**: slow executions are timed into a per-pool table
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlpool_interceptor::{InterceptorFactory, StatementCache};
//!
//! let factory = InterceptorFactory::new();
//! let conn = factory.build_chain_from_str(
//!     "QueryStatsRecorder(threshold=100);StatementCache(max=50);LeakedStatementTracker",
//! )?;
//! conn.initialize(&pool, &pooled);
//!
//! let stmt = conn.prepare_statement("SELECT name FROM users WHERE id = ?")?;
//! stmt.bind(1, 42_i64)?;
//! let rows = stmt.execute_query()?;
//! stmt.close()?; // parked in the cache
//!
//! let cached = conn.handler::<StatementCache>().map(|c| c.cache_size());
//! conn.close()?; // back to the pool
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cache;
pub mod chain;
pub mod config;
pub mod error;
pub mod factory;
pub mod instrumentation;
pub mod lifecycle;
pub mod operation;
pub mod pool;
pub mod statement;
pub mod stats;
pub mod terminal;
pub mod tracker;

// Re-export commonly used types
pub use cache::StatementCache;
pub use chain::{ChainBuilder, Connection, Interceptor, InterceptorChain, Next, WeakConnection};
pub use config::{
    InterceptorDefinition, InterceptorProperties, QueryStatsConfig, StatementCacheConfig,
};
pub use error::{Error, Resource, Result};
pub use factory::InterceptorFactory;
pub use instrumentation::SanitizationConfig;
pub use lifecycle::{StatementDecorator, StatementInterceptor, intercept_creation};
pub use operation::{
    ConnectionOp, ConnectionReply, OperationKind, StatementKind, StatementOp, StatementReply,
    WrapperTarget,
};
pub use pool::{ConnectionPool, PoolCloseListener, PoolId, PooledConnection};
pub use statement::{FacadeHooks, ResultSet, Statement, StatementFacade, StatementHandle};
pub use stats::{QueryStatsRecorder, QueryStatsRegistry, QueryStatsSnapshot, QueryStatsTable};
pub use terminal::TerminalInterceptor;
pub use tracker::LeakedStatementTracker;

pub use sqlpool_driver::{DriverError, Rows, Value};
