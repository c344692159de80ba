// Command-line interface for the muxpool binary
//
// Decision: clap derive with env fallbacks, all overrides optional so the config file stays authoritative

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::GatewayConfig;
use crate::error::ConfigLoadError;
use crate::telemetry::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "muxpool")]
#[command(about = "Multiplex JSON-RPC requests over a pool of stdio worker processes")]
#[command(version)]
pub struct Cli {
    /// JSON configuration file
    #[arg(long, short, env = "MUXPOOL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Worker program to launch
    #[arg(long, env = "MUXPOOL_WORKER_PROGRAM")]
    pub worker: Option<PathBuf>,

    /// Arguments passed to every worker (after `--`)
    #[arg(last = true)]
    pub worker_args: Vec<String>,

    #[arg(long, env = "MUXPOOL_MIN_INSTANCES")]
    pub min_instances: Option<usize>,

    #[arg(long, env = "MUXPOOL_MAX_INSTANCES")]
    pub max_instances: Option<usize>,

    #[arg(long, env = "MUXPOOL_MAX_CONCURRENT_REQUESTS")]
    pub max_concurrent_requests: Option<usize>,

    /// Per-request timeout in milliseconds
    #[arg(long, env = "MUXPOOL_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,

    /// Health probe interval in milliseconds
    #[arg(long, env = "MUXPOOL_HEALTH_CHECK_INTERVAL_MS")]
    pub health_check_interval_ms: Option<u64>,

    /// Worker readiness timeout in milliseconds
    #[arg(long, env = "MUXPOOL_STARTUP_TIMEOUT_MS")]
    pub startup_timeout_ms: Option<u64>,

    /// Graceful stop timeout in milliseconds
    #[arg(long, env = "MUXPOOL_SHUTDOWN_TIMEOUT_MS")]
    pub shutdown_timeout_ms: Option<u64>,

    /// Consecutive failures that open the circuit breaker
    #[arg(long, env = "MUXPOOL_BREAKER_FAILURE_THRESHOLD")]
    pub breaker_failure_threshold: Option<u32>,

    /// Time the breaker stays open, in milliseconds
    #[arg(long, env = "MUXPOOL_BREAKER_RECOVERY_MS")]
    pub breaker_recovery_ms: Option<u64>,

    /// Log output format (logs always go to stderr)
    #[arg(long, value_enum, env = "MUXPOOL_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,
}

impl Cli {
    /// Load the config file (if any) and apply flag and env overrides on top
    pub fn load_config(&self) -> Result<GatewayConfig, ConfigLoadError> {
        let base = match &self.config {
            Some(path) => GatewayConfig::from_file(path)?,
            None => GatewayConfig::default(),
        };
        Ok(self.apply(base))
    }

    /// Apply overrides to an existing configuration
    pub fn apply(&self, mut config: GatewayConfig) -> GatewayConfig {
        let pool = &mut config.pool;
        if let Some(program) = &self.worker {
            pool.worker.program = program.clone();
        }
        if !self.worker_args.is_empty() {
            pool.worker.args = self.worker_args.clone();
        }
        if let Some(min) = self.min_instances {
            pool.min_instances = min;
        }
        if let Some(max) = self.max_instances {
            pool.max_instances = max;
        }
        if let Some(max) = self.max_concurrent_requests {
            pool.max_concurrent_requests_per_worker = max;
        }
        if let Some(ms) = self.request_timeout_ms {
            pool.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.health_check_interval_ms {
            pool.health_check_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.startup_timeout_ms {
            pool.startup_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.shutdown_timeout_ms {
            pool.shutdown_timeout = Duration::from_millis(ms);
        }
        if let Some(threshold) = self.breaker_failure_threshold {
            config.breaker.failure_threshold = threshold;
        }
        if let Some(ms) = self.breaker_recovery_ms {
            config.breaker.recovery_time = Duration::from_millis(ms);
        }
        config
    }
}
