// Gateway configuration
//
// Decision: JSON file is the base layer; CLI flags and MUXPOOL_* env vars override it
// Decision: Every section has defaults so a config file may name only what it changes

use std::path::Path;

use muxpool_pool::{CircuitBreakerConfig, ConfigError, PoolConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::error::ConfigLoadError;

/// Accepted `retry.jitter_factor` values
const JITTER_RANGE: std::ops::RangeInclusive<f64> = 0.10..=0.25;

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub pool: PoolConfig,
    pub breaker: CircuitBreakerConfig,
    /// Applied to warm-up and replacement spawns, never to user requests
    pub retry: RetryPolicy,
}

impl GatewayConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigLoadError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigLoadError::Parse {
            path: display,
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;

        if self.breaker.failure_threshold < 1 {
            return Err(ConfigError::Invalid(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts < 1 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !JITTER_RANGE.contains(&self.retry.jitter_factor) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter_factor must be within 0.10..=0.25, got {}",
                self.retry.jitter_factor
            )));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muxpool_pool::WorkerSpec;
    use std::time::Duration;

    fn valid() -> GatewayConfig {
        GatewayConfig {
            pool: PoolConfig::new(WorkerSpec::new("/usr/bin/worker")),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_validate_once_worker_is_set() {
        assert!(GatewayConfig::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{"pool": {"worker": {"program": "/bin/w"}, "max_instances": 8},
                "breaker": {"recovery_time": 2500}}"#,
        )
        .unwrap();

        assert_eq!(config.pool.max_instances, 8);
        assert_eq!(config.pool.min_instances, PoolConfig::default().min_instances);
        assert_eq!(config.breaker.recovery_time, Duration::from_millis(2500));
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_rejects_bad_breaker_and_retry() {
        let mut config = valid();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.retry.jitter_factor = 1.5;
        assert!(config.validate().is_err());

        for jitter in [0.0, 0.05, 0.3, 1.0] {
            let mut config = valid();
            config.retry.jitter_factor = jitter;
            assert!(config.validate().is_err(), "jitter {jitter} accepted");
        }
        for jitter in [0.1, 0.2, 0.25] {
            let mut config = valid();
            config.retry.jitter_factor = jitter;
            assert!(config.validate().is_ok(), "jitter {jitter} rejected");
        }

        let mut config = valid();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
