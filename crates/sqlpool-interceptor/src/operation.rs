//! Operations dispatched through the interceptor chain.
//!
//! Every call made on a pooled connection or on a statement obtained from it
//! is represented as a value of [`ConnectionOp`] or [`StatementOp`].
//! Interceptors match on these values to decide whether to handle an
//! operation or forward it; anything they do not recognize must be forwarded.

use std::any::TypeId;
use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;
use sqlpool_driver::Value;

use crate::error::{Error, Result};
use crate::pool::PooledConnection;
use crate::statement::{ResultSet, Statement};

/// The shape of a statement, fixed when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Plain statement; SQL text is supplied at execution time.
    Plain,
    /// Parameterized statement prepared from SQL text.
    Prepared,
    /// Stored procedure call prepared from SQL text.
    Callable,
}

impl StatementKind {
    /// All statement kinds.
    pub const ALL: [StatementKind; 3] = [Self::Plain, Self::Prepared, Self::Callable];

    /// Name of the connection operation that creates this kind.
    #[must_use]
    pub fn creation_name(self) -> &'static str {
        match self {
            Self::Plain => "create_statement",
            Self::Prepared => "prepare_statement",
            Self::Callable => "prepare_call",
        }
    }
}

/// Set of statement kinds an interceptor acts on.
pub type StatementKinds = SmallVec<[StatementKind; 3]>;

/// Type that an unwrap or is-wrapper-for request asks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperTarget {
    /// The pool's handle for the physical connection.
    PooledConnection,
    /// The driver's concrete connection type.
    Native {
        /// Type identity of the requested type.
        type_id: TypeId,
        /// Type name, used in errors.
        type_name: &'static str,
    },
}

impl WrapperTarget {
    /// Target the driver connection type `T`.
    #[must_use]
    pub fn native<T: 'static>() -> Self {
        Self::Native {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Name of the requested type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::PooledConnection => std::any::type_name::<PooledConnection>(),
            Self::Native { type_name, .. } => type_name,
        }
    }
}

/// Discriminant of a [`ConnectionOp`], compared by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// See [`ConnectionOp::CreateStatement`].
    CreateStatement,
    /// See [`ConnectionOp::PrepareStatement`].
    PrepareStatement,
    /// See [`ConnectionOp::PrepareCall`].
    PrepareCall,
    /// See [`ConnectionOp::Close`].
    Close,
    /// See [`ConnectionOp::IsClosed`].
    IsClosed,
    /// See [`ConnectionOp::IsValid`].
    IsValid,
    /// See [`ConnectionOp::Commit`].
    Commit,
    /// See [`ConnectionOp::Rollback`].
    Rollback,
    /// See [`ConnectionOp::SetAutoCommit`].
    SetAutoCommit,
    /// See [`ConnectionOp::AutoCommit`].
    AutoCommit,
    /// See [`ConnectionOp::NativeSql`].
    NativeSql,
    /// See [`ConnectionOp::Unwrap`].
    Unwrap,
    /// See [`ConnectionOp::IsWrapperFor`].
    IsWrapperFor,
}

/// An operation invoked on a pooled connection.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub enum ConnectionOp<'a> {
    /// Create a plain statement.
    CreateStatement,
    /// Prepare a parameterized statement.
    PrepareStatement {
        /// SQL text to prepare.
        sql: &'a str,
    },
    /// Prepare a stored procedure call.
    PrepareCall {
        /// SQL text to prepare.
        sql: &'a str,
    },
    /// Logically close the connection, returning it to the pool.
    Close,
    /// Query the closed state.
    IsClosed,
    /// Validate the physical connection.
    IsValid {
        /// Validation timeout.
        timeout: Duration,
    },
    /// Commit the current transaction.
    Commit,
    /// Roll back the current transaction.
    Rollback,
    /// Set auto-commit mode.
    SetAutoCommit(bool),
    /// Get auto-commit mode.
    AutoCommit,
    /// Translate SQL to the backend's native grammar.
    NativeSql {
        /// SQL text to translate.
        sql: &'a str,
    },
    /// Retrieve the pooled handle behind the connection.
    Unwrap(WrapperTarget),
    /// Check whether the connection wraps the given type.
    IsWrapperFor(WrapperTarget),
}

impl<'a> ConnectionOp<'a> {
    /// Get the discriminant of this operation.
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::CreateStatement => OperationKind::CreateStatement,
            Self::PrepareStatement { .. } => OperationKind::PrepareStatement,
            Self::PrepareCall { .. } => OperationKind::PrepareCall,
            Self::Close => OperationKind::Close,
            Self::IsClosed => OperationKind::IsClosed,
            Self::IsValid { .. } => OperationKind::IsValid,
            Self::Commit => OperationKind::Commit,
            Self::Rollback => OperationKind::Rollback,
            Self::SetAutoCommit(_) => OperationKind::SetAutoCommit,
            Self::AutoCommit => OperationKind::AutoCommit,
            Self::NativeSql { .. } => OperationKind::NativeSql,
            Self::Unwrap(_) => OperationKind::Unwrap,
            Self::IsWrapperFor(_) => OperationKind::IsWrapperFor,
        }
    }

    /// Operation name, used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateStatement => "create_statement",
            Self::PrepareStatement { .. } => "prepare_statement",
            Self::PrepareCall { .. } => "prepare_call",
            Self::Close => "close",
            Self::IsClosed => "is_closed",
            Self::IsValid { .. } => "is_valid",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::SetAutoCommit(_) => "set_auto_commit",
            Self::AutoCommit => "auto_commit",
            Self::NativeSql { .. } => "native_sql",
            Self::Unwrap(_) => "unwrap",
            Self::IsWrapperFor(_) => "is_wrapper_for",
        }
    }

    /// The statement kind this operation creates, if it is a creation operation.
    #[must_use]
    pub fn statement_kind(&self) -> Option<StatementKind> {
        match self {
            Self::CreateStatement => Some(StatementKind::Plain),
            Self::PrepareStatement { .. } => Some(StatementKind::Prepared),
            Self::PrepareCall { .. } => Some(StatementKind::Callable),
            _ => None,
        }
    }

    /// SQL text carried by a creation operation.
    #[must_use]
    pub fn sql(&self) -> Option<&'a str> {
        match *self {
            Self::PrepareStatement { sql } | Self::PrepareCall { sql } => Some(sql),
            _ => None,
        }
    }
}

/// Reply to a [`ConnectionOp`].
#[derive(Debug)]
pub enum ConnectionReply {
    /// Operation completed without a value.
    Unit,
    /// Boolean result.
    Bool(bool),
    /// Text result.
    Text(String),
    /// A newly created (or reused) statement.
    Statement(Statement),
    /// The pooled handle behind the connection.
    Pooled(Arc<PooledConnection>),
}

impl ConnectionReply {
    /// Extract a statement reply.
    pub fn into_statement(self, operation: &'static str) -> Result<Statement> {
        match self {
            Self::Statement(s) => Ok(s),
            _ => Err(Error::UnexpectedReply { operation }),
        }
    }

    /// Extract a boolean reply.
    pub fn into_bool(self, operation: &'static str) -> Result<bool> {
        match self {
            Self::Bool(b) => Ok(b),
            _ => Err(Error::UnexpectedReply { operation }),
        }
    }

    /// Extract a text reply.
    pub fn into_text(self, operation: &'static str) -> Result<String> {
        match self {
            Self::Text(t) => Ok(t),
            _ => Err(Error::UnexpectedReply { operation }),
        }
    }

    /// Extract a pooled handle reply.
    pub fn into_pooled(self, operation: &'static str) -> Result<Arc<PooledConnection>> {
        match self {
            Self::Pooled(p) => Ok(p),
            _ => Err(Error::UnexpectedReply { operation }),
        }
    }
}

/// An operation invoked on a statement.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum StatementOp<'a> {
    /// Execute, reporting whether a row set was produced.
    Execute {
        /// SQL text for plain statements.
        sql: Option<&'a str>,
    },
    /// Execute a query returning rows.
    ExecuteQuery {
        /// SQL text for plain statements.
        sql: Option<&'a str>,
    },
    /// Execute a statement returning an update count.
    ExecuteUpdate {
        /// SQL text for plain statements.
        sql: Option<&'a str>,
    },
    /// Add a command or parameter set to the batch.
    AddBatch {
        /// SQL text for plain statements.
        sql: Option<&'a str>,
    },
    /// Execute the batch.
    ExecuteBatch,
    /// Bind a parameter (1-based index).
    SetParameter {
        /// Parameter index.
        index: usize,
        /// Value to bind.
        value: Value,
    },
    /// Clear all bound parameters.
    ClearParameters,
    /// Close the statement.
    Close,
    /// Query the closed state.
    IsClosed,
}

impl StatementOp<'_> {
    /// Operation name, used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Execute { .. } => "execute",
            Self::ExecuteQuery { .. } => "execute_query",
            Self::ExecuteUpdate { .. } => "execute_update",
            Self::AddBatch { .. } => "add_batch",
            Self::ExecuteBatch => "execute_batch",
            Self::SetParameter { .. } => "set_parameter",
            Self::ClearParameters => "clear_parameters",
            Self::Close => "close",
            Self::IsClosed => "is_closed",
        }
    }

    /// Check whether this operation executes SQL against the server.
    #[must_use]
    pub fn is_execution(&self) -> bool {
        matches!(
            self,
            Self::Execute { .. }
                | Self::ExecuteQuery { .. }
                | Self::ExecuteUpdate { .. }
                | Self::ExecuteBatch
        )
    }

    /// SQL text passed with the operation, if any.
    #[must_use]
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Execute { sql }
            | Self::ExecuteQuery { sql }
            | Self::ExecuteUpdate { sql }
            | Self::AddBatch { sql } => *sql,
            _ => None,
        }
    }
}

/// Reply to a [`StatementOp`].
#[derive(Debug)]
pub enum StatementReply {
    /// Operation completed without a value.
    Unit,
    /// Boolean result.
    Bool(bool),
    /// Row set.
    Rows(ResultSet),
    /// Update count.
    Count(u64),
    /// Batch update counts.
    Counts(Vec<u64>),
}
