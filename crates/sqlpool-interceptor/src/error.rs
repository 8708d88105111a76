//! Interceptor error types.

use std::fmt;

use sqlpool_driver::{DriverError, SQLSTATE_FEATURE_NOT_SUPPORTED};
use thiserror::Error;

/// Message fragment a server reports when a prepared plan was invalidated by
/// a concurrent schema change.
const CACHED_PLAN_INVALIDATED: &str = "cached plan must not change result type";

/// Result type for interceptor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The kind of pooled resource an operation targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// A pooled connection.
    Connection,
    /// A statement created from a pooled connection.
    Statement,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => f.write_str("connection"),
            Self::Statement => f.write_str("statement"),
        }
    }
}

/// Errors surfaced by the interceptor chain.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Operation attempted after the resource was logically closed.
    #[error("{0} has already been closed")]
    ResourceClosed(Resource),

    /// Unwrap requested for a type the connection does not wrap.
    #[error("not a wrapper of {0}")]
    NotAWrapper(&'static str),

    /// Failure raised by the native driver, passed through unchanged.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Invalid interceptor configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Interceptor definition names no known interceptor.
    #[error("unknown interceptor: {0}")]
    UnknownInterceptor(String),

    /// A link answered an operation with a reply of the wrong shape.
    #[error("unexpected reply to {operation}")]
    UnexpectedReply {
        /// Operation that received the reply.
        operation: &'static str,
    },

    /// The chain is not attached to a pooled connection.
    #[error("connection is not attached to a pooled handle")]
    Detached,
}

impl Error {
    /// Check if this error reports use of a closed resource.
    #[must_use]
    pub fn is_resource_closed(&self) -> bool {
        matches!(self, Self::ResourceClosed(_))
    }

    /// Get the driver error, if this error came from the driver.
    #[must_use]
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Self::Driver(e) => Some(e),
            _ => None,
        }
    }

    /// Check whether this failure means a prepared statement can never be
    /// executed successfully again.
    ///
    /// Searches the whole driver cause chain for a server error reporting that
    /// its cached plan was invalidated by a schema change.
    #[must_use]
    pub fn is_permanent_statement_failure(&self) -> bool {
        self.driver_error().is_some_and(|err| {
            err.chain().any(|e| match e {
                DriverError::Database {
                    sql_state, message, ..
                } => {
                    sql_state == SQLSTATE_FEATURE_NOT_SUPPORTED
                        && message.contains(CACHED_PLAN_INVALIDATED)
                }
                _ => false,
            })
        })
    }
}
