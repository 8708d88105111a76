//! # sqlpool-testing
//!
//! Test infrastructure for the sqlpool interceptor chain.
//!
//! - [`MockDriver`]: in-memory native driver with shared counters, scripted
//!   failures and scripted latency
//! - [`MockPool`]: pool stand-in recording returned connections and firing
//!   close listeners
//! - [`Fixture`]: a checked-out connection wired to both
//! - [`StatementCounter`]: interceptor counting statements created and closed
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlpool_interceptor::{InterceptorChain, StatementCache};
//! use sqlpool_testing::Fixture;
//!
//! let fx = Fixture::new(InterceptorChain::builder().link(StatementCache::default()).build());
//! let stmt = fx.conn.prepare_statement("select 1")?;
//! stmt.close()?;
//! assert_eq!(fx.driver.native_closes(), 0);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod counter;
pub mod driver;
pub mod pool;

pub use counter::StatementCounter;
pub use driver::{MockConnection, MockDriver, MockStatement, PLAN_INVALIDATED};
pub use pool::{Fixture, MockPool};

/// Install a test-writer tracing subscriber once per process.
///
/// Later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}
