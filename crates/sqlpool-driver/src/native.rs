//! Native connection and statement traits.
//!
//! These are the operation surfaces a driver implements. Methods take
//! `&mut self`: a native handle is used by one caller at a time, and the
//! pooling layer serializes access to it.

use std::any::Any;
use std::time::Duration;

use crate::error::DriverError;
use crate::value::{Rows, Value};

/// A live physical connection.
pub trait NativeConnection: Any + Send {
    /// Create a plain statement (SQL text supplied at execution time).
    fn create_statement(&mut self) -> Result<Box<dyn NativeStatement>, DriverError>;

    /// Prepare a parameterized statement.
    fn prepare_statement(&mut self, sql: &str) -> Result<Box<dyn NativeStatement>, DriverError>;

    /// Prepare a stored procedure call.
    fn prepare_call(&mut self, sql: &str) -> Result<Box<dyn NativeStatement>, DriverError>;

    /// Commit the current transaction.
    fn commit(&mut self) -> Result<(), DriverError>;

    /// Roll back the current transaction.
    fn rollback(&mut self) -> Result<(), DriverError>;

    /// Enable or disable auto-commit.
    fn set_auto_commit(&mut self, enabled: bool) -> Result<(), DriverError>;

    /// Get the auto-commit mode.
    fn auto_commit(&mut self) -> Result<bool, DriverError>;

    /// Check that the connection is still usable.
    fn is_valid(&mut self, timeout: Duration) -> Result<bool, DriverError>;

    /// Translate SQL into the backend's native grammar.
    fn native_sql(&mut self, sql: &str) -> Result<String, DriverError> {
        Ok(sql.to_string())
    }

    /// Physically close the connection.
    fn close(&mut self) -> Result<(), DriverError>;

    /// Get this connection as [`Any`] for downcasting to the driver type.
    fn as_any(&self) -> &dyn Any;

    /// Get this connection as mutable [`Any`] for downcasting to the driver type.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Name of the concrete driver type, used in diagnostics.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A statement created from a [`NativeConnection`].
///
/// `sql` arguments carry the SQL text for plain statements; prepared and
/// callable statements receive `None` and run the text they were prepared
/// with.
pub trait NativeStatement: Send {
    /// Execute, returning `true` if the first result is a row set.
    fn execute(&mut self, sql: Option<&str>) -> Result<bool, DriverError>;

    /// Execute a query returning rows.
    fn execute_query(&mut self, sql: Option<&str>) -> Result<Rows, DriverError>;

    /// Execute a statement returning an update count.
    fn execute_update(&mut self, sql: Option<&str>) -> Result<u64, DriverError>;

    /// Add a command (or the current parameter set) to the batch.
    fn add_batch(&mut self, sql: Option<&str>) -> Result<(), DriverError>;

    /// Execute the batch, returning one update count per command.
    fn execute_batch(&mut self) -> Result<Vec<u64>, DriverError>;

    /// Bind a parameter (1-based index).
    fn set_parameter(&mut self, index: usize, value: Value) -> Result<(), DriverError>;

    /// Clear all bound parameters.
    fn clear_parameters(&mut self) -> Result<(), DriverError>;

    /// Physically close the statement and release server-side resources.
    fn close(&mut self) -> Result<(), DriverError>;
}
