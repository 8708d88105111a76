//! Driver-level error types.

use thiserror::Error;

/// SQLSTATE class `0A000` ("feature not supported").
///
/// Some backends report an invalidated cached execution plan under this code.
pub const SQLSTATE_FEATURE_NOT_SUPPORTED: &str = "0A000";

/// Errors raised by a native driver.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DriverError {
    /// Error reported by the database server.
    #[error("{message} (SQLSTATE {sql_state})")]
    Database {
        /// Five character SQLSTATE code.
        sql_state: String,
        /// Server message text.
        message: String,
        /// Vendor specific error number.
        vendor_code: i32,
        /// Underlying error, if the server error wraps another one.
        #[source]
        cause: Option<Box<DriverError>>,
    },

    /// IO error talking to the server.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error raised by an indirection layer between the caller and the driver.
    ///
    /// Pooling layers peel this wrapper off so callers see the original cause.
    #[error("invocation failed: {0}")]
    Invocation(#[source] Box<DriverError>),

    /// The driver does not implement the requested operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Any other driver failure.
    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// Create a database error without a nested cause.
    #[must_use]
    pub fn database(sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            sql_state: sql_state.into(),
            message: message.into(),
            vendor_code: 0,
            cause: None,
        }
    }

    /// Wrap this error in an [`DriverError::Invocation`] layer.
    #[must_use]
    pub fn into_invocation(self) -> Self {
        Self::Invocation(Box::new(self))
    }

    /// Remove every [`DriverError::Invocation`] layer, returning the original cause.
    #[must_use]
    pub fn unwrap_invocation(self) -> Self {
        let mut current = self;
        while let Self::Invocation(inner) = current {
            current = *inner;
        }
        current
    }

    /// Iterate over this error and every nested driver error beneath it.
    ///
    /// Follows [`DriverError::Database`] causes and [`DriverError::Invocation`]
    /// layers, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &DriverError> {
        std::iter::successors(Some(self), |&err| match err {
            Self::Database { cause, .. } => cause.as_deref(),
            Self::Invocation(inner) => Some(inner.as_ref()),
            _ => None,
        })
    }

    /// Get the SQLSTATE code if this is a database error.
    #[must_use]
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } => Some(sql_state),
            _ => None,
        }
    }
}
