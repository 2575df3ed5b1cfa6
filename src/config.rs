//! Dispatcher configuration.
//!
//! A [`DispatchConfig`] is built once at startup, from defaults, a YAML file,
//! environment variables or CLI flags (in increasing precedence, the CLI
//! applies its own overrides), and passed to the coordinator.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::broker::redis::DEFAULT_KEY_PREFIX;
use crate::dispatch::{RetryPolicy, RoutingTable, TaskType};
use crate::error::ConfigError;

/// Default ceiling for one logical task, retries included.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for dispatching and waiting on tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Redis URL; `None` selects the in-memory broker.
    pub broker_url: Option<String>,
    /// Prefix for every Redis key.
    pub key_prefix: String,
    pub routing: RoutingTable,
    pub retry: RetryPolicy,
    /// Ceiling timeout per logical task.
    pub task_timeout: Duration,
    /// Workers started per queue by the in-memory broker.
    pub workers_per_queue: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            broker_url: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            routing: RoutingTable::default(),
            retry: RetryPolicy::default(),
            task_timeout: DEFAULT_TASK_TIMEOUT,
            workers_per_queue: 1,
        }
    }
}

/// On-disk YAML shape. Every field is optional and falls back to the default.
///
/// ```yaml
/// broker_url: redis://localhost:6379
/// task_timeout_secs: 30
/// retry:
///   max_attempts: 3
///   base_delay_ms: 1000
///   max_delay_ms: 60000
///   jitter: true
/// task_routing:
///   task_a: queue_a
///   task_b: queue_b
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    broker_url: Option<String>,
    key_prefix: Option<String>,
    task_timeout_secs: Option<u64>,
    workers_per_queue: Option<usize>,
    retry: Option<RetryPolicy>,
    task_routing: Option<BTreeMap<String, String>>,
}

impl DispatchConfig {
    /// Loads configuration from environment variables on top of the defaults.
    ///
    /// - `DISPATCH_BROKER_URL`: Redis URL (default: in-memory broker)
    /// - `DISPATCH_KEY_PREFIX`: Redis key prefix (default: `task_dispatch`)
    /// - `DISPATCH_TASK_TIMEOUT_SECS`: ceiling timeout (default: 30)
    /// - `DISPATCH_MAX_ATTEMPTS`: retries after the first attempt (default: 3)
    /// - `DISPATCH_BASE_DELAY_MS`: first retry delay (default: 1000)
    /// - `DISPATCH_MAX_DELAY_MS`: retry delay cap (default: 60000)
    /// - `DISPATCH_JITTER`: randomize retry delays (default: true)
    /// - `DISPATCH_WORKERS_PER_QUEUE`: in-memory workers per queue (default: 1)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, names an
    /// unknown task type, or fails validation.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = serde_yaml::from_str(raw)?;
        let mut config = Self::default();

        if let Some(url) = file.broker_url {
            config.broker_url = Some(url);
        }
        if let Some(prefix) = file.key_prefix {
            config.key_prefix = prefix;
        }
        if let Some(secs) = file.task_timeout_secs {
            config.task_timeout = Duration::from_secs(secs);
        }
        if let Some(workers) = file.workers_per_queue {
            config.workers_per_queue = workers;
        }
        if let Some(retry) = file.retry {
            config.retry = retry;
        }
        if let Some(routes) = file.task_routing {
            let mut parsed = Vec::with_capacity(routes.len());
            for (task_type, queue) in routes {
                let task_type =
                    TaskType::from_str(&task_type).map_err(|message| ConfigError::InvalidValue {
                        key: format!("task_routing.{}", task_type),
                        message,
                    })?;
                parsed.push((task_type, queue));
            }
            config.routing = RoutingTable::new(parsed);
        }

        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from `lookup`, which maps a variable name to its value.
    pub(crate) fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("DISPATCH_BROKER_URL") {
            let val = val.trim();
            self.broker_url = if val.is_empty() || val == "memory" {
                None
            } else {
                Some(val.to_string())
            };
        }

        if let Some(val) = lookup("DISPATCH_KEY_PREFIX") {
            self.key_prefix = val;
        }

        if let Some(val) = lookup("DISPATCH_TASK_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "DISPATCH_TASK_TIMEOUT_SECS")?;
            self.task_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("DISPATCH_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env_value(&val, "DISPATCH_MAX_ATTEMPTS")?;
        }

        if let Some(val) = lookup("DISPATCH_BASE_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "DISPATCH_BASE_DELAY_MS")?;
            self.retry.base_delay = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("DISPATCH_MAX_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "DISPATCH_MAX_DELAY_MS")?;
            self.retry.max_delay = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("DISPATCH_JITTER") {
            self.retry.jitter = parse_env_bool(&val, "DISPATCH_JITTER")?;
        }

        if let Some(val) = lookup("DISPATCH_WORKERS_PER_QUEUE") {
            self.workers_per_queue = parse_env_value(&val, "DISPATCH_WORKERS_PER_QUEUE")?;
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "task_timeout must be greater than 0".to_string(),
            ));
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::ValidationFailed(
                "retry base_delay cannot exceed max_delay".to_string(),
            ));
        }

        if self.routing.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "routing table must contain at least one route".to_string(),
            ));
        }

        if self.routing.routes().any(|(_, queue)| queue.trim().is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "queue names cannot be empty".to_string(),
            ));
        }

        if self.key_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "key_prefix cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = Some(url.into());
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_routing(mut self, routing: RoutingTable) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_workers_per_queue(mut self, workers: usize) -> Self {
        self.workers_per_queue = workers;
        self
    }
}

/// Parse an environment variable value into the target type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
