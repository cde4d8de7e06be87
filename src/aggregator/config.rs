//! Aggregation policies and aggregator settings.

use crate::protocol::Priority;
use crate::resilience::retry::RetryConfig;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// A method a policy declares as a member of its batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodDescriptor {
    pub method: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cacheable: bool,
    /// Per-call deadline in milliseconds, forwarded on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl MethodDescriptor {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            description: String::new(),
            cacheable: false,
            timeout: None,
        }
    }
    pub fn with_description(mut self, d: impl Into<String>) -> Self {
        self.description = d.into();
        self
    }
    pub fn cacheable(mut self, c: bool) -> Self {
        self.cacheable = c;
        self
    }
    pub fn with_timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t.as_millis() as u64);
        self
    }
}

/// Named aggregation policy that callers opt into through a batch key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    pub name: String,
    pub max_batch_size: usize,
    /// Milliseconds a queue may accumulate before it is flushed anyway.
    pub max_wait_time: u64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub requests: Vec<MethodDescriptor>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_batch_size: 10,
            max_wait_time: 50,
            priority: Priority::Medium,
            requests: Vec::new(),
        }
    }
}

impl BatchConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
    pub fn with_max_batch_size(mut self, s: usize) -> Self {
        self.max_batch_size = s;
        self
    }
    pub fn with_max_wait_time(mut self, wait: Duration) -> Self {
        self.max_wait_time = wait.as_millis() as u64;
        self
    }
    pub fn with_priority(mut self, p: Priority) -> Self {
        self.priority = p;
        self
    }
    pub fn with_method(mut self, descriptor: MethodDescriptor) -> Self {
        self.requests.push(descriptor);
        self
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_time)
    }

    pub fn descriptor(&self, method: &str) -> Option<&MethodDescriptor> {
        self.requests.iter().find(|d| d.method == method)
    }

    pub fn is_cacheable(&self, method: &str) -> bool {
        self.descriptor(method).map(|d| d.cacheable).unwrap_or(false)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::configuration_with_context(
                "maxBatchSize must be a positive integer",
                ErrorContext::new()
                    .with_field_path("maxBatchSize")
                    .with_source(self.name.clone()),
            ));
        }
        Ok(())
    }
}

/// A file of policies, e.g.
///
/// ```yaml
/// batches:
///   - name: dashboard
///     maxBatchSize: 6
///     maxWaitTime: 25
///     priority: high
///     requests:
///       - method: get_metrics
///         cacheable: true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchConfigSet {
    #[serde(default)]
    pub batches: Vec<BatchConfig>,
}

impl BatchConfigSet {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let set: BatchConfigSet = serde_yaml::from_str(s)?;
        for cfg in &set.batches {
            cfg.validate()?;
        }
        Ok(set)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Policy applied to batch keys without an explicit [`BatchConfig`].
    pub default_policy: BatchConfig,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    /// Round-trip estimate for one unbatched call, used for `timesSaved`.
    pub estimated_request_latency: Duration,
    pub retry: RetryConfig,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            default_policy: BatchConfig::default(),
            cache_ttl: Duration::from_secs(5),
            cache_capacity: 256,
            estimated_request_latency: Duration::from_millis(50),
            retry: RetryConfig::default(),
        }
    }
}

impl AggregatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden from the environment:
    /// - `IPC_BATCH_MAX_BATCH_SIZE`
    /// - `IPC_BATCH_MAX_WAIT_MS`
    /// - `IPC_BATCH_CACHE_TTL_MS`
    /// - `IPC_BATCH_REQUEST_LATENCY_MS`
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
        }

        let mut cfg = Self::default();
        if let Some(n) = var::<usize>("IPC_BATCH_MAX_BATCH_SIZE").filter(|v| *v > 0) {
            cfg.default_policy.max_batch_size = n;
        }
        if let Some(ms) = var::<u64>("IPC_BATCH_MAX_WAIT_MS") {
            cfg.default_policy.max_wait_time = ms;
        }
        if let Some(ms) = var::<u64>("IPC_BATCH_CACHE_TTL_MS") {
            cfg.cache_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = var::<u64>("IPC_BATCH_REQUEST_LATENCY_MS") {
            cfg.estimated_request_latency = Duration::from_millis(ms);
        }
        cfg
    }

    pub fn with_default_policy(mut self, policy: BatchConfig) -> Self {
        self.default_policy = policy;
        self
    }
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
    pub fn with_cache_capacity(mut self, n: usize) -> Self {
        self.cache_capacity = n.max(1);
        self
    }
    pub fn with_estimated_request_latency(mut self, d: Duration) -> Self {
        self.estimated_request_latency = d;
        self
    }
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_config_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.max_batch_size, 10);
        assert_eq!(config.max_wait(), Duration::from_millis(50));
        assert_eq!(config.priority, Priority::Medium);
    }

    #[test]
    fn test_batch_config_builder() {
        let config = BatchConfig::new("kb")
            .with_max_batch_size(5)
            .with_max_wait_time(Duration::from_millis(20))
            .with_method(MethodDescriptor::new("get_kb_stats").cacheable(true));
        assert_eq!(config.name, "kb");
        assert_eq!(config.max_batch_size, 5);
        assert!(config.is_cacheable("get_kb_stats"));
        assert!(!config.is_cacheable("other"));
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let err = BatchConfig::new("x").with_max_batch_size(0).validate().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_yaml_policy_set() {
        let yaml = r#"
batches:
  - name: dashboard
    maxBatchSize: 6
    maxWaitTime: 25
    priority: high
    requests:
      - method: get_metrics
        description: system metrics
        cacheable: true
        timeout: 2000
      - method: get_health_status
"#;
        let set = BatchConfigSet::from_yaml_str(yaml).unwrap();
        assert_eq!(set.batches.len(), 1);
        let cfg = &set.batches[0];
        assert_eq!(cfg.priority, Priority::High);
        assert_eq!(cfg.descriptor("get_metrics").and_then(|d| d.timeout), Some(2000));
        assert!(!cfg.is_cacheable("get_health_status"));
    }

    #[test]
    fn test_yaml_rejects_invalid_policy() {
        let yaml = "batches:\n  - name: bad\n    maxBatchSize: 0\n    maxWaitTime: 5\n";
        assert!(matches!(
            BatchConfigSet::from_yaml_str(yaml),
            Err(Error::Configuration { .. })
        ));
        assert!(matches!(
            BatchConfigSet::from_yaml_str("batches: [1, 2"),
            Err(Error::Yaml(_))
        ));
    }
}
