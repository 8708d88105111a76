//! # sqlpool-driver
//!
//! The native driver surface that the sqlpool interceptor chain wraps.
//!
//! A driver exposes a live connection through [`NativeConnection`] and the
//! statements created from it through [`NativeStatement`]. The interceptor
//! chain never inspects what sits behind these traits: it only forwards
//! operations to them, observes their results, and decides when to close
//! them.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlpool_driver::{DriverError, NativeConnection, NativeStatement};
//!
//! fn prepare_twice(conn: &mut dyn NativeConnection) -> Result<(), DriverError> {
//!     let mut first = conn.prepare_statement("SELECT 1")?;
//!     first.execute_query(None)?;
//!     first.close()
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod native;
pub mod value;

pub use error::{DriverError, SQLSTATE_FEATURE_NOT_SUPPORTED};
pub use native::{NativeConnection, NativeStatement};
pub use value::{Rows, Value};
