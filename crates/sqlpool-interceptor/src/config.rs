//! Interceptor configuration.
//!
//! Interceptors are configured from a definition string naming each link and
//! its properties:
//!
//! ```text
//! QueryStatsRecorder(threshold=100);StatementCache(prepared=true,max=50);LeakedStatementTracker
//! ```
//!
//! Each entry parses into an [`InterceptorDefinition`]; the typed configs
//! below read the properties they understand and ignore the rest.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};
use crate::instrumentation::SanitizationConfig;
use crate::operation::{StatementKind, StatementKinds};

/// Ordered key/value properties of one interceptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterceptorProperties {
    entries: Vec<(String, String)>,
}

impl InterceptorProperties {
    /// Create an empty property list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value,key=value`.
    ///
    /// Whitespace around keys and values is trimmed and empty entries are
    /// skipped. Keys are case-sensitive; a repeated key keeps its last value.
    pub fn parse(input: &str) -> Result<Self> {
        let mut props = Self::new();

        for part in input.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim();
            if key.is_empty() {
                return Err(Error::Config(format!("missing property name: {part}")));
            }
            props = props.with(key, value.trim());
        }

        Ok(props)
    }

    /// Set a property.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    /// Get a raw property value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Number of properties.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no properties.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over properties in definition order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Get a boolean property, or `default` if it is absent.
    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(v) if v.eq_ignore_ascii_case("true") => Ok(true),
            Some(v) if v.eq_ignore_ascii_case("false") => Ok(false),
            Some(v) => Err(Error::Config(format!("invalid boolean for {key}: {v}"))),
        }
    }

    /// Get an integer property, or `default` if it is absent.
    pub fn int_or(&self, key: &str, default: i64) -> Result<i64> {
        self.get(key).map_or(Ok(default), |v| {
            v.parse()
                .map_err(|_| Error::Config(format!("invalid integer for {key}: {v}")))
        })
    }

    /// Get a string property, or `default` if it is absent.
    #[must_use]
    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    fn usize_or(&self, key: &str, default: usize) -> Result<usize> {
        let value = self.int_or(key, i64::try_from(default).unwrap_or(i64::MAX))?;
        usize::try_from(value)
            .map_err(|_| Error::Config(format!("{key} must not be negative: {value}")))
    }
}

/// One entry of an interceptor definition string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptorDefinition {
    /// Interceptor name. Dotted names are allowed; the last segment selects
    /// the interceptor.
    pub name: String,
    /// Properties given in parentheses.
    pub properties: InterceptorProperties,
}

impl InterceptorDefinition {
    /// Create a definition without properties.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            properties: InterceptorProperties::new(),
        })
    }

    /// Set the properties.
    #[must_use]
    pub fn with_properties(mut self, properties: InterceptorProperties) -> Self {
        self.properties = properties;
        self
    }

    /// The last segment of the name.
    #[must_use]
    pub fn short_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    /// Parse one `Name` or `Name(key=value,...)` entry.
    pub fn parse(entry: &str) -> Result<Self> {
        let entry = entry.trim();

        let (name, properties) = match entry.split_once('(') {
            Some((name, rest)) => {
                let props = rest
                    .trim_end()
                    .strip_suffix(')')
                    .ok_or_else(|| Error::Config(format!("unbalanced parentheses: {entry}")))?;
                (name.trim(), InterceptorProperties::parse(props)?)
            }
            None => (entry, InterceptorProperties::new()),
        };

        Ok(Self::new(name)?.with_properties(properties))
    }

    /// Parse a `;`-separated definition list, skipping empty entries.
    pub fn parse_list(input: &str) -> Result<Vec<Self>> {
        input
            .split(';')
            .filter(|entry| !entry.trim().is_empty())
            .map(Self::parse)
            .collect()
    }
}

/// Validate an interceptor name.
fn validate_name(name: &str) -> Result<()> {
    #[allow(clippy::unwrap_used)]
    static NAME_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").unwrap()
    });

    if name.is_empty() {
        return Err(Error::Config("interceptor name cannot be empty".into()));
    }

    if !NAME_RE.is_match(name) {
        return Err(Error::Config(format!(
            "invalid interceptor name '{name}': must be dot-separated identifiers"
        )));
    }

    Ok(())
}

/// Configuration of the statement cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementCacheConfig {
    /// Cache prepared statements.
    pub prepared: bool,
    /// Cache callable statements.
    pub callable: bool,
    /// Maximum cached statements per connection. Zero disables caching.
    pub max: usize,
}

impl Default for StatementCacheConfig {
    fn default() -> Self {
        Self {
            prepared: true,
            callable: false,
            max: 50,
        }
    }
}

impl StatementCacheConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `prepared`, `callable` and `max`.
    pub fn from_properties(props: &InterceptorProperties) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            prepared: props.bool_or("prepared", defaults.prepared)?,
            callable: props.bool_or("callable", defaults.callable)?,
            max: props.usize_or("max", defaults.max)?,
        })
    }

    /// Set whether prepared statements are cached.
    #[must_use]
    pub fn prepared(mut self, enabled: bool) -> Self {
        self.prepared = enabled;
        self
    }

    /// Set whether callable statements are cached.
    #[must_use]
    pub fn callable(mut self, enabled: bool) -> Self {
        self.callable = enabled;
        self
    }

    /// Set the per-connection capacity.
    #[must_use]
    pub fn max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    /// Statement kinds eligible for caching.
    #[must_use]
    pub fn kinds(&self) -> StatementKinds {
        let mut kinds = StatementKinds::new();
        if self.max == 0 {
            return kinds;
        }
        if self.prepared {
            kinds.push(StatementKind::Prepared);
        }
        if self.callable {
            kinds.push(StatementKind::Callable);
        }
        kinds
    }
}

/// Configuration of the query statistics recorder.
#[derive(Debug, Clone)]
pub struct QueryStatsConfig {
    /// Minimum elapsed milliseconds for an execution to be recorded.
    /// `-1` records everything.
    pub threshold: i64,
    /// Maximum distinct SQL texts tracked per pool.
    pub max_queries: usize,
    /// Log a warning for every recorded execution.
    pub log_slow: bool,
    /// Sanitization applied to SQL text before it is logged.
    pub sanitization: SanitizationConfig,
}

impl Default for QueryStatsConfig {
    fn default() -> Self {
        Self {
            threshold: 100,
            max_queries: 1000,
            log_slow: true,
            sanitization: SanitizationConfig::default(),
        }
    }
}

impl QueryStatsConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `threshold`, `maxQueries`, `logSlow` and `sanitize`.
    pub fn from_properties(props: &InterceptorProperties) -> Result<Self> {
        let defaults = Self::default();
        let sanitization = if props.bool_or("sanitize", true)? {
            defaults.sanitization
        } else {
            SanitizationConfig::no_sanitization()
        };

        let config = Self {
            threshold: props.int_or("threshold", defaults.threshold)?,
            max_queries: props.usize_or("maxQueries", defaults.max_queries)?,
            log_slow: props.bool_or("logSlow", defaults.log_slow)?,
            sanitization,
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the recording threshold in milliseconds.
    #[must_use]
    pub fn threshold(mut self, millis: i64) -> Self {
        self.threshold = millis;
        self
    }

    /// Record every execution regardless of duration.
    #[must_use]
    pub fn record_all(self) -> Self {
        self.threshold(-1)
    }

    /// Set the per-pool limit on distinct SQL texts.
    #[must_use]
    pub fn max_queries(mut self, max: usize) -> Self {
        self.max_queries = max;
        self
    }

    /// Enable or disable slow query warnings.
    #[must_use]
    pub fn log_slow(mut self, enabled: bool) -> Self {
        self.log_slow = enabled;
        self
    }

    /// Set the sanitization applied before logging.
    #[must_use]
    pub fn sanitization(mut self, config: SanitizationConfig) -> Self {
        self.sanitization = config;
        self
    }

    /// Check the configuration for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.threshold < -1 {
            return Err(Error::Config(format!(
                "threshold must be -1 or a duration in milliseconds, got {}",
                self.threshold
            )));
        }
        if self.max_queries == 0 {
            return Err(Error::Config("maxQueries must be at least 1".into()));
        }
        Ok(())
    }

    /// Check whether an execution taking `elapsed_ms` is recorded.
    #[must_use]
    pub fn records(&self, elapsed_ms: u64) -> bool {
        i128::from(elapsed_ms) > i128::from(self.threshold)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_parsing() {
        let props =
            InterceptorProperties::parse(" prepared = true ,max=40,, callable=false").unwrap();
        assert_eq!(props.len(), 3);
        assert_eq!(props.get("max"), Some("40"));
        assert_eq!(props.get("Max"), None);
        assert!(props.bool_or("prepared", false).unwrap());
        assert_eq!(props.int_or("max", 50).unwrap(), 40);
        assert_eq!(props.int_or("threshold", 100).unwrap(), 100);
        assert_eq!(props.str_or("mode", "lru"), "lru");
    }

    #[test]
    fn test_properties_errors() {
        assert!(InterceptorProperties::parse("prepared").is_err());
        assert!(InterceptorProperties::parse("=true").is_err());

        let props = InterceptorProperties::parse("max=lots,prepared=yes").unwrap();
        assert!(matches!(props.int_or("max", 1), Err(Error::Config(_))));
        assert!(matches!(props.bool_or("prepared", true), Err(Error::Config(_))));
    }

    #[test]
    fn test_repeated_key_keeps_last_value() {
        let props = InterceptorProperties::parse("max=1,max=2").unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props.get("max"), Some("2"));
    }

    #[test]
    fn test_definition_list() {
        let defs = InterceptorDefinition::parse_list(
            "QueryStatsRecorder(threshold=-1); org.example.StatementCache(prepared=true,max=40);;LeakedStatementTracker",
        )
        .unwrap();

        assert_eq!(defs.len(), 3);
        assert_eq!(defs[0].name, "QueryStatsRecorder");
        assert_eq!(defs[0].properties.int_or("threshold", 100).unwrap(), -1);
        assert_eq!(defs[1].short_name(), "StatementCache");
        assert_eq!(defs[1].properties.get("max"), Some("40"));
        assert!(defs[2].properties.is_empty());
    }

    #[test]
    fn test_definition_errors() {
        assert!(InterceptorDefinition::parse("StatementCache(max=1").is_err());
        assert!(InterceptorDefinition::parse("Statement Cache").is_err());
        assert!(InterceptorDefinition::parse("1Cache").is_err());
        assert!(InterceptorDefinition::parse("(max=1)").is_err());
        assert!(InterceptorDefinition::new("").is_err());
    }

    #[test]
    fn test_cache_config_kinds() {
        assert_eq!(
            StatementCacheConfig::default().kinds().as_slice(),
            &[StatementKind::Prepared]
        );

        let both = StatementCacheConfig::new().callable(true);
        assert_eq!(both.kinds().len(), 2);

        assert!(StatementCacheConfig::new().prepared(false).kinds().is_empty());
        assert!(StatementCacheConfig::new().max(0).kinds().is_empty());
    }

    #[test]
    fn test_cache_config_from_properties() {
        let props = InterceptorProperties::parse("callable=true,max=40").unwrap();
        let config = StatementCacheConfig::from_properties(&props).unwrap();
        assert!(config.prepared);
        assert!(config.callable);
        assert_eq!(config.max, 40);

        let props = InterceptorProperties::parse("max=-5").unwrap();
        assert!(StatementCacheConfig::from_properties(&props).is_err());
    }

    #[test]
    fn test_stats_config_threshold() {
        let config = QueryStatsConfig::default();
        assert!(!config.records(100));
        assert!(config.records(101));

        let all = QueryStatsConfig::new().record_all();
        assert!(all.records(0));

        let props = InterceptorProperties::parse("threshold=-2").unwrap();
        assert!(QueryStatsConfig::from_properties(&props).is_err());

        let props =
            InterceptorProperties::parse("maxQueries=10,logSlow=false,sanitize=false").unwrap();
        let config = QueryStatsConfig::from_properties(&props).unwrap();
        assert_eq!(config.max_queries, 10);
        assert!(!config.log_slow);
        assert!(!config.sanitization.enabled);
    }
}
