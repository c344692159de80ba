//! Pool and worker configuration

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use muxpool_protocol::READY_MARKER;
use serde::{Deserialize, Serialize};

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// A value is out of range or inconsistent with another value
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How to launch one worker process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerSpec {
    /// Executable to spawn
    pub program: PathBuf,

    /// Arguments passed to every worker
    pub args: Vec<String>,

    /// Environment overrides (applied on top of the inherited environment)
    pub env: BTreeMap<String, String>,

    /// Start from an empty environment instead of inheriting
    pub env_clear: bool,

    /// Marker the worker writes to stderr once it accepts requests
    pub ready_marker: String,

    /// Side-effect-free method used by health probes
    pub health_check_method: String,
}

impl Default for WorkerSpec {
    fn default() -> Self {
        Self {
            program: PathBuf::new(),
            args: vec![],
            env: BTreeMap::new(),
            env_clear: false,
            ready_marker: READY_MARKER.to_string(),
            health_check_method: "ping".to_string(),
        }
    }
}

impl WorkerSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Append an argument
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for the worker
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_env_clear(mut self, clear: bool) -> Self {
        self.env_clear = clear;
        self
    }

    pub fn with_ready_marker(mut self, marker: impl Into<String>) -> Self {
        self.ready_marker = marker.into();
        self
    }

    pub fn with_health_check_method(mut self, method: impl Into<String>) -> Self {
        self.health_check_method = method.into();
        self
    }
}

/// Worker pool configuration
///
/// Durations serialize as milliseconds.
///
/// # Example
///
/// ```
/// use muxpool_pool::{PoolConfig, WorkerSpec};
/// use std::time::Duration;
///
/// let config = PoolConfig::new(WorkerSpec::new("/usr/local/bin/router-worker"))
///     .with_instances(2, 8)
///     .with_max_concurrent_requests_per_worker(4)
///     .with_request_timeout(Duration::from_secs(60));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Worker launch description
    pub worker: WorkerSpec,

    /// Lower bound on pool size
    pub min_instances: usize,

    /// Upper bound on pool size
    pub max_instances: usize,

    /// In-flight request cap per worker
    pub max_concurrent_requests_per_worker: usize,

    /// Deadline for a single dispatched request
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,

    /// Period between health probe rounds
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,

    /// Deadline for a single health probe
    #[serde(with = "duration_millis")]
    pub health_check_timeout: Duration,

    /// Failures tolerated before an unhealthy worker is stopped
    pub health_failure_threshold: u32,

    /// Load ratio at which an extra worker is started in the background
    pub scale_up_load_ratio: f64,

    /// Start extra workers in the background when load reaches
    /// `scale_up_load_ratio`. When off, workers are only added on demand.
    pub proactive_scale_up: bool,

    /// Load ratio below which one idle worker is retired
    pub scale_down_load_ratio: f64,

    /// Grace period between graceful termination and a forced kill
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// How long a new worker has to emit its readiness marker
    #[serde(with = "duration_millis")]
    pub startup_timeout: Duration,

    /// How long dispatch waits for a worker when the pool is saturated
    #[serde(with = "duration_millis")]
    pub acquire_timeout: Duration,

    /// Polling period while waiting for a worker
    #[serde(with = "duration_millis")]
    pub acquire_poll_interval: Duration,

    /// Delay before a crashed worker is replaced
    #[serde(with = "duration_millis")]
    pub replacement_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker: WorkerSpec::default(),
            min_instances: 1,
            max_instances: 4,
            max_concurrent_requests_per_worker: 10,
            request_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            health_failure_threshold: 3,
            scale_up_load_ratio: 0.8,
            proactive_scale_up: true,
            scale_down_load_ratio: 0.2,
            shutdown_timeout: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(10),
            acquire_poll_interval: Duration::from_millis(100),
            replacement_delay: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    /// Create a configuration for the given worker
    pub fn new(worker: WorkerSpec) -> Self {
        Self {
            worker,
            ..Default::default()
        }
    }

    /// Set pool size bounds
    pub fn with_instances(mut self, min: usize, max: usize) -> Self {
        self.min_instances = min;
        self.max_instances = max;
        self
    }

    pub fn with_max_concurrent_requests_per_worker(mut self, max: usize) -> Self {
        self.max_concurrent_requests_per_worker = max;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    pub fn with_health_failure_threshold(mut self, threshold: u32) -> Self {
        self.health_failure_threshold = threshold;
        self
    }

    /// Set the scale-up and scale-down load ratios
    pub fn with_load_ratios(mut self, scale_up: f64, scale_down: f64) -> Self {
        self.scale_up_load_ratio = scale_up;
        self.scale_down_load_ratio = scale_down;
        self
    }

    pub fn with_proactive_scale_up(mut self, enabled: bool) -> Self {
        self.proactive_scale_up = enabled;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_replacement_delay(mut self, delay: Duration) -> Self {
        self.replacement_delay = delay;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.program.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("worker program must be set".into()));
        }
        if self.worker.ready_marker.is_empty() {
            return Err(ConfigError::Invalid("ready_marker must not be empty".into()));
        }
        if self.min_instances < 1 {
            return Err(ConfigError::Invalid("min_instances must be at least 1".into()));
        }
        if self.max_instances < self.min_instances {
            return Err(ConfigError::Invalid(format!(
                "max_instances ({}) must be >= min_instances ({})",
                self.max_instances, self.min_instances
            )));
        }
        if self.max_concurrent_requests_per_worker < 1 {
            return Err(ConfigError::Invalid(
                "max_concurrent_requests_per_worker must be at least 1".into(),
            ));
        }
        for (name, ratio) in [
            ("scale_up_load_ratio", self.scale_up_load_ratio),
            ("scale_down_load_ratio", self.scale_down_load_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within 0.0..=1.0, got {ratio}"
                )));
            }
        }
        if self.scale_down_load_ratio >= self.scale_up_load_ratio {
            return Err(ConfigError::Invalid(
                "scale_down_load_ratio must be less than scale_up_load_ratio".into(),
            ));
        }
        for (name, value) in [
            ("request_timeout", self.request_timeout),
            ("health_check_interval", self.health_check_interval),
            ("health_check_timeout", self.health_check_timeout),
            ("startup_timeout", self.startup_timeout),
            ("acquire_poll_interval", self.acquire_poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> PoolConfig {
        PoolConfig::new(WorkerSpec::new("/bin/worker"))
    }

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.min_instances, 1);
        assert_eq!(config.max_instances, 4);
        assert_eq!(config.acquire_poll_interval, Duration::from_millis(100));
        assert_eq!(config.worker.ready_marker, READY_MARKER);
        assert_eq!(config.worker.health_check_method, "ping");
    }

    #[test]
    fn test_config_builder() {
        let config = valid()
            .with_instances(2, 6)
            .with_max_concurrent_requests_per_worker(3)
            .with_request_timeout(Duration::from_secs(5))
            .with_load_ratios(0.9, 0.1);

        assert_eq!(config.min_instances, 2);
        assert_eq!(config.max_instances, 6);
        assert_eq!(config.max_concurrent_requests_per_worker, 3);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_bounds() {
        assert!(PoolConfig::default().validate().is_err());
        assert!(valid().with_instances(0, 2).validate().is_err());
        assert!(valid().with_instances(3, 2).validate().is_err());
        assert!(valid()
            .with_max_concurrent_requests_per_worker(0)
            .validate()
            .is_err());
        assert!(valid().with_load_ratios(0.5, 0.5).validate().is_err());
        assert!(valid().with_load_ratios(1.5, 0.2).validate().is_err());
        assert!(valid()
            .with_request_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_serialization() {
        let config = valid()
            .with_instances(2, 3)
            .with_request_timeout(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["request_timeout"], 1500);

        let parsed: PoolConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed: PoolConfig = serde_json::from_str(
            r#"{"worker": {"program": "/bin/w", "env": {"A": "1"}}, "max_instances": 9}"#,
        )
        .unwrap();
        assert_eq!(parsed.max_instances, 9);
        assert_eq!(parsed.min_instances, 1);
        assert_eq!(parsed.worker.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(parsed.worker.health_check_method, "ping");
        assert!(parsed.proactive_scale_up);

        let parsed: PoolConfig = serde_json::from_str(
            r#"{"worker": {"program": "/bin/w"}, "proactive_scale_up": false}"#,
        )
        .unwrap();
        assert!(!parsed.proactive_scale_up);
    }
}
