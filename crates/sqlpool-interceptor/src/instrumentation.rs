//! Instrumentation helpers for statement execution.
//!
//! SQL text is sanitized before it reaches a log line, so literal values
//! (which may carry user data) are replaced with placeholders.
//!
//! When the `otel` feature is enabled, [`StatementMetrics`] records execution
//! durations through OpenTelemetry following the database client semantic
//! conventions:
//! - `db.client.operation.duration`: histogram, seconds
//! - `db.client.operations.total`: counter
//! - `db.client.errors.total`: counter
//! - `db.client.slow_queries.total`: counter of executions over the
//!   recording threshold
//!
//! Without the feature the collector is a no-op.

use std::time::Instant;

use chrono::{DateTime, Utc};

/// Attribute keys following OpenTelemetry semantic conventions.
pub mod attributes {
    /// Database operation type (SELECT, INSERT, ...).
    pub const DB_OPERATION: &str = "db.operation";
    /// Statement API call (execute, execute_query, ...).
    pub const DB_STATEMENT_CALL: &str = "db.statement.call";
    /// Pool identity.
    pub const DB_POOL: &str = "db.client.pool.name";
    /// Whether the operation succeeded.
    pub const DB_OPERATION_SUCCESS: &str = "db.operation.success";
}

/// Metric names.
pub mod metric_names {
    /// Histogram: duration of statement executions.
    pub const DB_CLIENT_OPERATION_DURATION: &str = "db.client.operation.duration";
    /// Counter: total statement executions.
    pub const DB_CLIENT_OPERATIONS_TOTAL: &str = "db.client.operations.total";
    /// Counter: failed statement executions.
    pub const DB_CLIENT_ERRORS_TOTAL: &str = "db.client.errors.total";
    /// Counter: executions slower than the recording threshold.
    pub const DB_CLIENT_SLOW_QUERIES_TOTAL: &str = "db.client.slow_queries.total";
}

/// Configuration for SQL statement sanitization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizationConfig {
    /// Whether to sanitize SQL statements.
    pub enabled: bool,
    /// Maximum length of statement to record.
    pub max_length: usize,
    /// Placeholder to use for sanitized values.
    pub placeholder: String,
}

impl Default for SanitizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_length: 2048,
            placeholder: "?".to_string(),
        }
    }
}

impl SanitizationConfig {
    /// Create a configuration that doesn't sanitize statements.
    #[must_use]
    pub fn no_sanitization() -> Self {
        Self {
            enabled: false,
            max_length: usize::MAX,
            placeholder: String::new(),
        }
    }

    /// Sanitize a SQL statement according to the configuration.
    #[must_use]
    pub fn sanitize(&self, sql: &str) -> String {
        if !self.enabled {
            return truncate_string(sql, self.max_length);
        }

        truncate_string(&sanitize_sql(sql, &self.placeholder), self.max_length)
    }
}

/// Replace string and numeric literals with `placeholder`.
fn sanitize_sql(sql: &str, placeholder: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if c == q {
                // Doubled quote is an escaped quote inside the literal
                if chars.peek() == Some(&q) {
                    chars.next();
                    continue;
                }
                quote = None;
                result.push_str(placeholder);
            }
            continue;
        }

        if c == '\'' || c == '"' {
            quote = Some(c);
            continue;
        }

        let inside_word = result.ends_with(|ch: char| ch.is_alphanumeric() || ch == '_');
        if c.is_ascii_digit() && !inside_word {
            while chars
                .peek()
                .is_some_and(|ch| ch.is_ascii_digit() || *ch == '.')
            {
                chars.next();
            }
            result.push_str(placeholder);
            continue;
        }

        result.push(c);
    }

    // Unterminated literal
    if quote.is_some() {
        result.push_str(placeholder);
    }

    result
}

/// Truncate to at most `max_len` bytes on a character boundary, marking the
/// cut with `...`.
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }

    let limit = max_len.saturating_sub(3);
    let end = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= limit)
        .last()
        .unwrap_or(0);
    format!("{}...", &s[..end])
}

/// Extract the operation type from a SQL statement.
#[must_use]
pub fn extract_operation(sql: &str) -> &'static str {
    const OPERATIONS: [(&str, &str); 12] = [
        ("SELECT", "SELECT"),
        ("INSERT", "INSERT"),
        ("UPDATE", "UPDATE"),
        ("DELETE", "DELETE"),
        ("MERGE", "MERGE"),
        ("{CALL", "CALL"),
        ("CALL", "CALL"),
        ("EXEC", "EXECUTE"),
        ("WITH", "SELECT"),
        ("CREATE", "CREATE"),
        ("ALTER", "ALTER"),
        ("DROP", "DROP"),
    ];

    let head: String = sql
        .trim_start()
        .chars()
        .take(8)
        .flat_map(char::to_uppercase)
        .collect();

    OPERATIONS
        .iter()
        .find(|(prefix, _)| head.starts_with(*prefix))
        .map_or("OTHER", |&(_, op)| op)
}

/// Measures one statement execution.
#[derive(Debug, Clone)]
pub struct ExecutionTimer {
    started: Instant,
    started_at: DateTime<Utc>,
}

impl ExecutionTimer {
    /// Start timing.
    #[must_use]
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Wall-clock time the execution started.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Elapsed whole milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Elapsed seconds.
    #[must_use]
    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Statement execution metrics collector using OpenTelemetry.
#[cfg(feature = "otel")]
pub struct StatementMetrics {
    operation_duration: opentelemetry::metrics::Histogram<f64>,
    operations_total: opentelemetry::metrics::Counter<u64>,
    errors_total: opentelemetry::metrics::Counter<u64>,
    slow_queries_total: opentelemetry::metrics::Counter<u64>,
    base_attributes: Vec<opentelemetry::KeyValue>,
}

#[cfg(feature = "otel")]
impl StatementMetrics {
    /// Create a collector, labelled with the pool name when given.
    #[must_use]
    pub fn new(pool_name: Option<&str>) -> Self {
        use opentelemetry::{KeyValue, global};

        let meter = global::meter("sqlpool-interceptor");

        let operation_duration = meter
            .f64_histogram(metric_names::DB_CLIENT_OPERATION_DURATION)
            .with_description("Duration of statement executions")
            .with_unit("s")
            .build();

        let operations_total = meter
            .u64_counter(metric_names::DB_CLIENT_OPERATIONS_TOTAL)
            .with_description("Total number of statement executions")
            .with_unit("operations")
            .build();

        let errors_total = meter
            .u64_counter(metric_names::DB_CLIENT_ERRORS_TOTAL)
            .with_description("Total number of failed statement executions")
            .with_unit("errors")
            .build();

        let slow_queries_total = meter
            .u64_counter(metric_names::DB_CLIENT_SLOW_QUERIES_TOTAL)
            .with_description("Executions slower than the recording threshold")
            .with_unit("operations")
            .build();

        let base_attributes = pool_name
            .map(|name| vec![KeyValue::new(attributes::DB_POOL, name.to_string())])
            .unwrap_or_default();

        Self {
            operation_duration,
            operations_total,
            errors_total,
            slow_queries_total,
            base_attributes,
        }
    }

    /// Record one execution.
    pub fn record_execution(
        &self,
        call: &'static str,
        sql: Option<&str>,
        seconds: f64,
        success: bool,
    ) {
        use opentelemetry::KeyValue;

        let mut attrs = self.base_attributes.clone();
        attrs.push(KeyValue::new(attributes::DB_STATEMENT_CALL, call));
        attrs.push(KeyValue::new(
            attributes::DB_OPERATION,
            sql.map_or("OTHER", extract_operation),
        ));
        attrs.push(KeyValue::new(attributes::DB_OPERATION_SUCCESS, success));

        self.operations_total.add(1, &attrs);
        self.operation_duration.record(seconds, &attrs);
        if !success {
            self.errors_total.add(1, &attrs);
        }
    }

    /// Record an execution that crossed the recording threshold.
    pub fn record_slow_query(&self, sql: &str) {
        use opentelemetry::KeyValue;

        let mut attrs = self.base_attributes.clone();
        attrs.push(KeyValue::new(attributes::DB_OPERATION, extract_operation(sql)));
        self.slow_queries_total.add(1, &attrs);
    }
}

#[cfg(feature = "otel")]
impl std::fmt::Debug for StatementMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementMetrics").finish_non_exhaustive()
    }
}

/// No-op metrics collector when the otel feature is disabled.
#[cfg(not(feature = "otel"))]
#[derive(Debug, Clone, Default)]
pub struct StatementMetrics;

#[cfg(not(feature = "otel"))]
impl StatementMetrics {
    /// Create a no-op collector.
    #[must_use]
    pub fn new(_pool_name: Option<&str>) -> Self {
        Self
    }

    /// Record one execution (no-op).
    pub fn record_execution(
        &self,
        _call: &'static str,
        _sql: Option<&str>,
        _seconds: f64,
        _success: bool,
    ) {}

    /// Record a slow execution (no-op).
    pub fn record_slow_query(&self, _sql: &str) {}
}
