//! Shared helpers for pool integration tests
#![allow(dead_code)]

use std::time::Duration;

use muxpool_pool::{PoolConfig, WorkerSpec};
use tokio::time::Instant;

/// Launch description for the simulated worker built alongside these tests
pub fn sim_worker() -> WorkerSpec {
    WorkerSpec::new(env!("CARGO_BIN_EXE_muxpool-sim-worker"))
}

/// Configuration with short timeouts and the periodic health monitor out of the way
pub fn test_config(spec: WorkerSpec) -> PoolConfig {
    PoolConfig::new(spec)
        .with_instances(1, 2)
        .with_request_timeout(Duration::from_secs(5))
        .with_startup_timeout(Duration::from_secs(5))
        .with_shutdown_timeout(Duration::from_secs(1))
        .with_health_check_interval(Duration::from_secs(3600))
        .with_health_check_timeout(Duration::from_millis(200))
        .with_acquire_timeout(Duration::from_secs(2))
        .with_replacement_delay(Duration::from_millis(50))
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
