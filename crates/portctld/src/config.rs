//! Engine configuration.
//!
//! Loads and validates portctld configuration from YAML files.
//! Default location: /etc/portctl/portctld.yaml

use crate::error::ConfigError;
use crate::model::BatchPolicy;
use portctl_orch_common::RetryPolicy;
use portctl_types::parse_port_range;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/portctl/portctld.yaml";

/// Driver calls one attempt can make: a read, up to three changes and a
/// read back.
pub const CALLS_PER_ATTEMPT: u64 = 5;

/// Intent validation rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Lowest VLAN id an intent may request
    #[serde(default = "default_vlan_min")]
    pub vlan_min: u16,

    /// Highest VLAN id an intent may request
    #[serde(default = "default_vlan_max")]
    pub vlan_max: u16,

    /// VLAN ids reserved by policy, in range syntax (`[1,4000-4094]`)
    #[serde(default)]
    pub reserved_vlans: Option<String>,

    /// Maximum number of intents in one request
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

/// Driver call concurrency and deadlines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Driver calls in flight across the whole fleet
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,

    /// Driver calls in flight against one device
    #[serde(default = "default_per_device_concurrency")]
    pub per_device_concurrency: usize,

    /// Deadline of a single driver call in milliseconds
    #[serde(default = "default_call_deadline")]
    pub call_deadline_ms: u64,
}

/// Retry policy for transient failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per job, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Growth factor between consecutive delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound on a single delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Random extra delay as a fraction of the nominal delay
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

/// Per-port lease settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease lifetime in milliseconds; renewed in the background while held
    #[serde(default = "default_lease_ttl")]
    pub ttl_ms: u64,

    /// How long a job waits for its lease in milliseconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
}

/// Per-endpoint circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive transient failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open breaker waits before a trial call, in milliseconds
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
}

/// Batch defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Policy applied when a request does not name one
    #[serde(default)]
    pub default_policy: BatchPolicy,
}

/// Complete portctld configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub lease: LeaseConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub batch: BatchConfig,
}

// Default functions
fn default_vlan_min() -> u16 {
    1
}

fn default_vlan_max() -> u16 {
    4094
}

fn default_max_batch_size() -> usize {
    5000
}

fn default_global_concurrency() -> usize {
    64
}

fn default_per_device_concurrency() -> usize {
    4
}

fn default_call_deadline() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    200
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    10_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_lease_ttl() -> u64 {
    120_000
}

fn default_acquire_timeout() -> u64 {
    300_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> u64 {
    30_000
}

// Default implementations
impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            vlan_min: default_vlan_min(),
            vlan_max: default_vlan_max(),
            reserved_vlans: None,
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            global_concurrency: default_global_concurrency(),
            per_device_concurrency: default_per_device_concurrency(),
            call_deadline_ms: default_call_deadline(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_lease_ttl(),
            acquire_timeout_ms: default_acquire_timeout(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_yaml(&content).map_err(|e| match e {
                ConfigError::Parse { message, .. } => {
                    ConfigError::parse(path.display().to_string(), message)
                }
                other => other,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::parse("engine config", e))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.max_attempts, Duration::from_millis(self.retry.base_delay_ms))
            .with_multiplier(self.retry.multiplier)
            .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .with_jitter(self.retry.jitter)
    }

    pub fn call_deadline(&self) -> Duration {
        Duration::from_millis(self.dispatch.call_deadline_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease.ttl_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease.acquire_timeout_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker.cooldown_ms)
    }

    /// Parsed reserved VLAN ids.
    pub fn reserved_vlans(&self) -> Result<BTreeSet<u16>, ConfigError> {
        let Some(spec) = self.validation.reserved_vlans.as_deref() else {
            return Ok(BTreeSet::new());
        };
        let ids = parse_port_range(spec).map_err(|e| ConfigError::parse("reserved_vlans", e))?;
        ids.into_iter()
            .map(|id| {
                u16::try_from(id)
                    .ok()
                    .filter(|id| *id <= 4094)
                    .ok_or_else(|| ConfigError::invalid(format!("reserved VLAN {} is out of range", id)))
            })
            .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let v = &self.validation;
        if v.vlan_min == 0 || v.vlan_max > 4094 || v.vlan_min > v.vlan_max {
            return Err(ConfigError::invalid(format!(
                "VLAN window {}-{} must lie within 1-4094",
                v.vlan_min, v.vlan_max
            )));
        }
        if v.max_batch_size == 0 {
            return Err(ConfigError::invalid("max_batch_size must be > 0"));
        }
        self.reserved_vlans()?;

        if self.dispatch.global_concurrency == 0 || self.dispatch.per_device_concurrency == 0 {
            return Err(ConfigError::invalid("concurrency limits must be > 0"));
        }
        if self.dispatch.call_deadline_ms == 0 {
            return Err(ConfigError::invalid("call_deadline_ms must be > 0"));
        }

        self.retry_policy()
            .validate()
            .map_err(|e| ConfigError::invalid(e.to_string()))?;

        let attempt_ms = self.dispatch.call_deadline_ms.saturating_mul(CALLS_PER_ATTEMPT);
        if self.lease.ttl_ms <= attempt_ms {
            return Err(ConfigError::invalid(format!(
                "lease ttl_ms ({}) must exceed one attempt of {} calls ({} ms)",
                self.lease.ttl_ms, CALLS_PER_ATTEMPT, attempt_ms
            )));
        }
        if self.lease.acquire_timeout_ms == 0 {
            return Err(ConfigError::invalid("acquire_timeout_ms must be > 0"));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be > 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.validation.vlan_min, 1);
        assert_eq!(config.validation.vlan_max, 4094);
        assert_eq!(config.dispatch.global_concurrency, 64);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.batch.default_policy, BatchPolicy::BestEffort);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_accessors() {
        let config = EngineConfig::default();
        assert_eq!(config.call_deadline(), Duration::from_secs(10));
        assert_eq!(config.lease_ttl(), Duration::from_secs(120));
        assert_eq!(config.breaker_cooldown(), Duration::from_secs(30));
        assert_eq!(config.retry_policy().max_attempts(), 3);
    }

    #[test]
    fn test_yaml_deserialization() {
        let yaml = r#"
validation:
  vlan_max: 3000
  reserved_vlans: "[1,1002-1005]"
retry:
  max_attempts: 5
batch:
  default_policy: fail_fast
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.validation.vlan_max, 3000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.batch.default_policy, BatchPolicy::FailFast);
        // Unspecified values should use defaults
        assert_eq!(config.retry.base_delay_ms, 200);
        assert_eq!(
            config.reserved_vlans().unwrap().into_iter().collect::<Vec<_>>(),
            vec![1, 1002, 1003, 1004, 1005]
        );
    }

    #[test]
    fn test_validate_vlan_window() {
        let mut config = EngineConfig::default();
        config.validation.vlan_min = 100;
        config.validation.vlan_max = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_non_increasing_backoff() {
        let mut config = EngineConfig::default();
        config.retry.multiplier = 1.1;
        config.retry.jitter = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_lease_covers_attempt() {
        let mut config = EngineConfig::default();
        config.dispatch.call_deadline_ms = 100;
        config.lease.ttl_ms = 150;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("one attempt"));

        config.lease.ttl_ms = 100 * CALLS_PER_ATTEMPT + 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_reserved_out_of_range() {
        let mut config = EngineConfig::default();
        config.validation.reserved_vlans = Some("[4090-4096]".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let mut config = EngineConfig::default();
        config.dispatch.per_device_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "dispatch:\n  per_device_concurrency: 2").unwrap();
        let config = EngineConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.dispatch.per_device_concurrency, 2);
    }

    #[test]
    fn test_load_bad_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "retry: [not, a, mapping]").unwrap();
        let err = EngineConfig::load_or_default(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = EngineConfig::load_or_default("/nonexistent/portctld.yaml").unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
