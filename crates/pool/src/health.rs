//! Periodic health probing
//!
//! Each round probes every active worker concurrently on the probe lane.
//! Workers whose failure count exceeds the threshold are stopped; their exit
//! event drives replacement.

use std::sync::Arc;

use futures::future::join_all;
use muxpool_protocol::{error_codes, Response};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::pool::PoolShared;
use crate::worker::WorkerHandle;

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProbeOutcome {
    Healthy,
    Failed(String),
}

/// Classify a probe result.
///
/// A result, or "method not found", proves the worker is serving requests.
pub(crate) fn classify(result: &Result<Response, WorkerError>) -> ProbeOutcome {
    match result {
        Ok(response) => match response.error_code() {
            None => ProbeOutcome::Healthy,
            Some(error_codes::METHOD_NOT_FOUND) => ProbeOutcome::Healthy,
            Some(code) => ProbeOutcome::Failed(format!("probe returned error code {code}")),
        },
        Err(e) => ProbeOutcome::Failed(e.to_string()),
    }
}

/// Background loop: one probe round per interval until shutdown
pub(crate) async fn monitor(shared: Arc<PoolShared>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = shared.config.health_check_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(?interval, "Health monitor started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                probe_round(&shared).await;
            }
            _ = shutdown_rx.changed() => {
                debug!("Health monitor received shutdown signal");
                break;
            }
        }
    }
}

/// Probe every active worker once and act on the results
pub(crate) async fn probe_round(shared: &Arc<PoolShared>) {
    let workers = shared.active_workers();
    if workers.is_empty() {
        return;
    }

    let method = shared.config.worker.health_check_method.as_str();
    let timeout = shared.config.health_check_timeout;
    let threshold = shared.config.health_failure_threshold;

    let results = join_all(workers.iter().map(|worker| async move {
        let outcome = classify(&worker.probe(method, timeout).await);
        (Arc::clone(worker), outcome)
    }))
    .await;

    let mut to_stop: Vec<Arc<WorkerHandle>> = Vec::new();
    for (worker, outcome) in results {
        match outcome {
            ProbeOutcome::Healthy => {
                if worker.record_probe_success() {
                    info!(worker_id = %worker.id(), "Worker recovered");
                }
            }
            ProbeOutcome::Failed(reason) => {
                let unhealthy = worker.record_probe_failure(threshold);
                warn!(
                    worker_id = %worker.id(),
                    failures = worker.failure_count(),
                    reason = %reason,
                    "Health probe failed"
                );
                if unhealthy {
                    to_stop.push(worker);
                }
            }
        }
    }

    if to_stop.is_empty() {
        return;
    }

    let grace = shared.config.shutdown_timeout;
    join_all(to_stop.iter().map(|worker| async move {
        warn!(worker_id = %worker.id(), "Stopping unhealthy worker");
        worker.stop(grace).await;
    }))
    .await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use muxpool_protocol::RpcError;
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn test_result_is_healthy() {
        let response = Response::success(json!(1), json!("pong"));
        assert_eq!(classify(&Ok(response)), ProbeOutcome::Healthy);
    }

    #[test]
    fn test_method_not_found_proves_liveness() {
        let response = Response::failure(Value::Null, RpcError::method_not_found("ping"));
        assert_eq!(classify(&Ok(response)), ProbeOutcome::Healthy);
    }

    #[test]
    fn test_other_errors_fail() {
        let response = Response::failure(json!(1), RpcError::internal("boom"));
        assert!(matches!(
            classify(&Ok(response)),
            ProbeOutcome::Failed(_)
        ));
        assert!(matches!(
            classify(&Err(WorkerError::Timeout(Duration::from_secs(5)))),
            ProbeOutcome::Failed(_)
        ));
        assert!(matches!(
            classify(&Err(WorkerError::Terminated)),
            ProbeOutcome::Failed(_)
        ));
    }
}
