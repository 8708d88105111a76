//! Scriptable in-memory driver.
//!
//! Every [`MockConnection`] created by one [`MockDriver`] shares its
//! counters and scripted behavior, so a test can inspect what reached the
//! native layer no matter how many interceptors sit on top.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use sqlpool_driver::{DriverError, NativeConnection, NativeStatement, Rows, Value};
use sqlpool_interceptor::PooledConnection;

/// Message a server reports when a prepared plan was invalidated.
pub const PLAN_INVALIDATED: &str = "cached plan must not change result type";

#[derive(Debug, Clone)]
struct ScriptedFailure {
    sql_state: String,
    message: String,
    wrapped: bool,
}

impl ScriptedFailure {
    fn raise(&self) -> DriverError {
        let err = DriverError::database(self.sql_state.clone(), self.message.clone());
        if self.wrapped {
            err.into_invocation()
        } else {
            err
        }
    }
}

#[derive(Default)]
struct DriverState {
    connections: AtomicUsize,
    creates: AtomicUsize,
    prepares: AtomicUsize,
    executions: AtomicUsize,
    native_closes: AtomicUsize,
    open_statements: AtomicUsize,
    connection_closes: AtomicUsize,
    prepared_sql: Mutex<Vec<String>>,
    prepare_failures: Mutex<HashSet<String>>,
    execution_failures: Mutex<HashMap<String, ScriptedFailure>>,
    latency: Mutex<HashMap<String, Duration>>,
}

impl DriverState {
    fn statement_opened(&self) {
        self.open_statements.fetch_add(1, Ordering::SeqCst);
    }

    fn statement_closed(&self) {
        self.native_closes.fetch_add(1, Ordering::SeqCst);
        self.open_statements.fetch_sub(1, Ordering::SeqCst);
    }

    fn execute(&self, sql: &str) -> Result<(), DriverError> {
        let delay = self.latency.lock().get(sql).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        self.executions.fetch_add(1, Ordering::SeqCst);

        let failure = self.execution_failures.lock().get(sql).cloned();
        match failure {
            Some(failure) => Err(failure.raise()),
            None => Ok(()),
        }
    }
}

/// Factory and control surface for mock connections.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<DriverState>,
}

impl MockDriver {
    /// Create a driver with no scripted behavior.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a native connection.
    #[must_use]
    pub fn connect(&self) -> MockConnection {
        let id = self.state.connections.fetch_add(1, Ordering::SeqCst) + 1;
        MockConnection {
            state: Arc::clone(&self.state),
            id,
            auto_commit: true,
            closed: false,
        }
    }

    /// Open a native connection and hand it to the pool.
    #[must_use]
    pub fn pooled(&self) -> Arc<PooledConnection> {
        PooledConnection::new(Box::new(self.connect()))
    }

    /// Fail every prepare of `sql`.
    pub fn fail_prepare(&self, sql: &str) {
        self.state.prepare_failures.lock().insert(sql.to_owned());
    }

    /// Fail every execution of `sql` with the given server error.
    pub fn fail_execution(&self, sql: &str, sql_state: &str, message: &str) {
        self.script_failure(sql, sql_state, message, false);
    }

    /// Fail every execution of `sql` with an invalidated-plan error, wrapped
    /// in an invocation layer the way an indirection layer reports it.
    pub fn fail_permanently(&self, sql: &str) {
        self.script_failure(sql, "0A000", PLAN_INVALIDATED, true);
    }

    fn script_failure(&self, sql: &str, sql_state: &str, message: &str, wrapped: bool) {
        self.state.execution_failures.lock().insert(
            sql.to_owned(),
            ScriptedFailure {
                sql_state: sql_state.to_owned(),
                message: message.to_owned(),
                wrapped,
            },
        );
    }

    /// Remove every scripted failure.
    pub fn clear_failures(&self) {
        self.state.prepare_failures.lock().clear();
        self.state.execution_failures.lock().clear();
    }

    /// Delay every execution of `sql`.
    pub fn set_latency(&self, sql: &str, delay: Duration) {
        self.state.latency.lock().insert(sql.to_owned(), delay);
    }

    /// Number of native connections opened.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Number of plain statements created.
    #[must_use]
    pub fn creates(&self) -> usize {
        self.state.creates.load(Ordering::SeqCst)
    }

    /// Number of prepares, prepared and callable together.
    #[must_use]
    pub fn prepares(&self) -> usize {
        self.state.prepares.load(Ordering::SeqCst)
    }

    /// SQL texts prepared so far, in order.
    #[must_use]
    pub fn prepared_sql(&self) -> Vec<String> {
        self.state.prepared_sql.lock().clone()
    }

    /// Number of executions that reached the driver.
    #[must_use]
    pub fn executions(&self) -> usize {
        self.state.executions.load(Ordering::SeqCst)
    }

    /// Number of statements physically closed.
    #[must_use]
    pub fn native_closes(&self) -> usize {
        self.state.native_closes.load(Ordering::SeqCst)
    }

    /// Number of statements created and not yet physically closed.
    #[must_use]
    pub fn open_statements(&self) -> usize {
        self.state.open_statements.load(Ordering::SeqCst)
    }

    /// Number of connections physically closed.
    #[must_use]
    pub fn connection_closes(&self) -> usize {
        self.state.connection_closes.load(Ordering::SeqCst)
    }
}

/// Native connection backed by a [`MockDriver`].
pub struct MockConnection {
    state: Arc<DriverState>,
    id: usize,
    auto_commit: bool,
    closed: bool,
}

impl MockConnection {
    /// Connection number within its driver, starting at 1.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    fn check_open(&self) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Other("connection is closed".into()));
        }
        Ok(())
    }

    fn prepare(&mut self, sql: &str) -> Result<Box<dyn NativeStatement>, DriverError> {
        self.check_open()?;
        if self.state.prepare_failures.lock().contains(sql) {
            return Err(DriverError::database("42000", format!("cannot prepare: {sql}")));
        }

        self.state.prepares.fetch_add(1, Ordering::SeqCst);
        self.state.prepared_sql.lock().push(sql.to_owned());
        Ok(Box::new(MockStatement::new(Arc::clone(&self.state), Some(sql))))
    }
}

impl NativeConnection for MockConnection {
    fn create_statement(&mut self) -> Result<Box<dyn NativeStatement>, DriverError> {
        self.check_open()?;
        self.state.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockStatement::new(Arc::clone(&self.state), None)))
    }

    fn prepare_statement(&mut self, sql: &str) -> Result<Box<dyn NativeStatement>, DriverError> {
        self.prepare(sql)
    }

    fn prepare_call(&mut self, sql: &str) -> Result<Box<dyn NativeStatement>, DriverError> {
        self.prepare(sql)
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.check_open()
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.check_open()
    }

    fn set_auto_commit(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.check_open()?;
        self.auto_commit = enabled;
        Ok(())
    }

    fn auto_commit(&mut self) -> Result<bool, DriverError> {
        self.check_open()?;
        Ok(self.auto_commit)
    }

    fn is_valid(&mut self, _timeout: Duration) -> Result<bool, DriverError> {
        Ok(!self.closed)
    }

    fn native_sql(&mut self, sql: &str) -> Result<String, DriverError> {
        Ok(sql.replace('?', "$"))
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            self.state.connection_closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Native statement backed by a [`MockDriver`].
pub struct MockStatement {
    state: Arc<DriverState>,
    sql: Option<String>,
    params: Vec<Value>,
    batch: Vec<String>,
    closed: bool,
}

impl MockStatement {
    fn new(state: Arc<DriverState>, sql: Option<&str>) -> Self {
        state.statement_opened();
        Self {
            state,
            sql: sql.map(str::to_owned),
            params: Vec::new(),
            batch: Vec::new(),
            closed: false,
        }
    }

    fn run(&self, sql: Option<&str>) -> Result<String, DriverError> {
        if self.closed {
            return Err(DriverError::Other("statement is closed".into()));
        }
        let text = sql
            .or(self.sql.as_deref())
            .ok_or_else(|| DriverError::Other("no SQL text to execute".into()))?;
        self.state.execute(text)?;
        Ok(text.to_owned())
    }
}

impl NativeStatement for MockStatement {
    fn execute(&mut self, sql: Option<&str>) -> Result<bool, DriverError> {
        let text = self.run(sql)?;
        Ok(text.trim_start().to_ascii_lowercase().starts_with("select"))
    }

    fn execute_query(&mut self, sql: Option<&str>) -> Result<Rows, DriverError> {
        self.run(sql)?;
        let mut rows = Rows::new(vec!["value".into()]).with_row(vec![Value::Int(1)]);
        for param in &self.params {
            rows = rows.with_row(vec![param.clone()]);
        }
        Ok(rows)
    }

    fn execute_update(&mut self, sql: Option<&str>) -> Result<u64, DriverError> {
        self.run(sql)?;
        Ok(1)
    }

    fn add_batch(&mut self, sql: Option<&str>) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Other("statement is closed".into()));
        }
        let text = sql.or(self.sql.as_deref()).unwrap_or_default();
        self.batch.push(text.to_owned());
        Ok(())
    }

    fn execute_batch(&mut self) -> Result<Vec<u64>, DriverError> {
        if self.closed {
            return Err(DriverError::Other("statement is closed".into()));
        }
        let batch = std::mem::take(&mut self.batch);
        for text in &batch {
            self.state.execute(text)?;
        }
        Ok(vec![1; batch.len()])
    }

    fn set_parameter(&mut self, index: usize, value: Value) -> Result<(), DriverError> {
        if index == 0 {
            return Err(DriverError::Other("parameter indexes start at 1".into()));
        }
        if self.params.len() < index {
            self.params.resize(index, Value::Null);
        }
        self.params[index - 1] = value;
        Ok(())
    }

    fn clear_parameters(&mut self) -> Result<(), DriverError> {
        self.params.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            self.state.statement_closed();
        }
        Ok(())
    }
}

impl Drop for MockStatement {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.open_statements.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
