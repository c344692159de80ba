//! Integration tests for WorkerHandle against the simulated worker

mod common;

use std::sync::Arc;
use std::time::Duration;

use muxpool_pool::{
    PoolConfig, WorkerError, WorkerEvent, WorkerHandle, WorkerHealth, WorkerSpec, WorkerStatus,
};
use muxpool_protocol::Request;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

use common::{sim_worker, test_config, wait_until};

async fn spawn_worker(
    config: &PoolConfig,
) -> (Arc<WorkerHandle>, mpsc::UnboundedReceiver<WorkerEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let worker = WorkerHandle::spawn("worker-test".to_string(), config, events_tx)
        .await
        .expect("sim worker should start");
    (Arc::new(worker), events_rx)
}

#[test_log::test(tokio::test)]
async fn test_spawned_worker_is_ready() {
    let (worker, _events) = spawn_worker(&test_config(sim_worker())).await;

    assert_eq!(worker.status(), WorkerStatus::Ready);
    assert_eq!(worker.health(), WorkerHealth::Unknown);
    assert_eq!(worker.active_requests(), 0);
    assert!(worker.pid().is_some());

    worker.stop(Duration::from_secs(1)).await;
}

#[test_log::test(tokio::test)]
async fn test_caller_id_round_trips() {
    let (worker, _events) = spawn_worker(&test_config(sim_worker())).await;

    for id in [json!("req-abc"), json!(42), json!(null)] {
        let response = worker
            .send(Request::new(id.clone(), "echo", Some(json!({"k": [1, 2]}))))
            .await
            .unwrap();
        assert_eq!(response.id, id);
        assert_eq!(response.result, Some(json!({"k": [1, 2]})));
    }

    let snapshot = worker.snapshot();
    assert_eq!(snapshot.total_requests, 3);
    assert_eq!(snapshot.active_requests, 0);
    assert!(snapshot.avg_response_time_ms.is_some());

    worker.stop(Duration::from_secs(1)).await;
}

#[test_log::test(tokio::test)]
async fn test_out_of_order_responses_are_correlated() {
    let (worker, _events) = spawn_worker(&test_config(sim_worker())).await;

    let slow = worker.send(Request::new("slow", "sleep", Some(json!({"ms": 400}))));
    let fast = worker.send(Request::new("fast", "sleep", Some(json!({"ms": 10}))));
    let (slow, fast) = tokio::join!(slow, fast);

    let slow = slow.unwrap();
    let fast = fast.unwrap();
    assert_eq!(slow.id, json!("slow"));
    assert_eq!(slow.result, Some(json!({"slept_ms": 400})));
    assert_eq!(fast.id, json!("fast"));
    assert_eq!(fast.result, Some(json!({"slept_ms": 10})));

    worker.stop(Duration::from_secs(1)).await;
}

#[test_log::test(tokio::test)]
async fn test_request_times_out() {
    let config = test_config(sim_worker()).with_request_timeout(Duration::from_millis(300));
    let (worker, _events) = spawn_worker(&config).await;

    let start = Instant::now();
    let result = worker.send(Request::new(1, "hang", None)).await;
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(WorkerError::Timeout(_))));
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(2), "timed out late: {elapsed:?}");
    assert_eq!(worker.active_requests(), 0);
    assert_eq!(worker.failure_count(), 1);
    assert_eq!(worker.status(), WorkerStatus::Ready);

    // still usable afterwards
    let response = worker.send(Request::new(2, "ping", None)).await.unwrap();
    assert_eq!(response.result, Some(json!("pong")));

    worker.stop(Duration::from_secs(1)).await;
}

#[test_log::test(tokio::test)]
async fn test_missing_ready_marker_is_startup_error() {
    let spec = sim_worker().with_env("SIM_WORKER_SKIP_READY", "1");
    let config = test_config(spec).with_startup_timeout(Duration::from_millis(300));
    let (events_tx, _events_rx) = mpsc::unbounded_channel();

    let result = WorkerHandle::spawn("worker-silent".to_string(), &config, events_tx).await;
    match result {
        Err(WorkerError::Startup { worker_id, reason }) => {
            assert_eq!(worker_id, "worker-silent");
            assert!(reason.contains("readiness"), "unexpected reason: {reason}");
        }
        other => panic!("expected startup error, got {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn test_missing_program_is_startup_error() {
    let config = test_config(WorkerSpec::new("/nonexistent/muxpool-worker"));
    let (events_tx, _events_rx) = mpsc::unbounded_channel();

    let result = WorkerHandle::spawn("worker-missing".to_string(), &config, events_tx).await;
    assert!(matches!(result, Err(WorkerError::Startup { .. })));
}

#[test_log::test(tokio::test)]
async fn test_garbage_lines_are_dropped() {
    let spec = sim_worker().with_env("SIM_WORKER_EMIT_GARBAGE", "1");
    let (worker, _events) = spawn_worker(&test_config(spec)).await;

    for i in 0..3 {
        let response = worker
            .send(Request::new(i, "echo", Some(json!(i))))
            .await
            .unwrap();
        assert_eq!(response.id, json!(i));
        assert_eq!(response.result, Some(json!(i)));
    }

    worker.stop(Duration::from_secs(1)).await;
}

#[test_log::test(tokio::test)]
async fn test_crash_rejects_pending_requests() {
    let (worker, mut events) = spawn_worker(&test_config(sim_worker())).await;

    let pending = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.send(Request::new("waiting", "hang", None)).await })
    };
    assert!(wait_until(Duration::from_secs(2), || worker.active_requests() == 1).await);

    let crash = worker
        .send(Request::new("crash", "crash", Some(json!({"code": 3}))))
        .await;
    assert!(matches!(crash, Err(WorkerError::Terminated)));

    let pending = pending.await.unwrap();
    assert!(matches!(pending, Err(WorkerError::Terminated)));

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        WorkerEvent::Exited {
            worker_id: "worker-test".to_string(),
            clean: false,
        }
    );
    assert_eq!(worker.status(), WorkerStatus::Stopped);
    assert_eq!(worker.health(), WorkerHealth::Unhealthy);
    assert_eq!(worker.exit_code(), Some(3));
    assert_eq!(worker.active_requests(), 0);
}

#[test_log::test(tokio::test)]
async fn test_capacity_limit() {
    let config = test_config(sim_worker()).with_max_concurrent_requests_per_worker(1);
    let (worker, _events) = spawn_worker(&config).await;

    let held = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            worker
                .send(Request::new(1, "sleep", Some(json!({"ms": 300}))))
                .await
        })
    };
    assert!(wait_until(Duration::from_secs(2), || worker.active_requests() == 1).await);
    assert_eq!(worker.status(), WorkerStatus::Busy);

    let rejected = worker.send(Request::new(2, "ping", None)).await;
    assert!(matches!(rejected, Err(WorkerError::AtCapacity)));

    // probes use their own lane
    let probe = worker.probe("ping", Duration::from_secs(1)).await.unwrap();
    assert_eq!(probe.result, Some(json!("pong")));

    held.await.unwrap().unwrap();
    assert_eq!(worker.status(), WorkerStatus::Ready);
    assert_eq!(worker.active_requests(), 0);

    worker.stop(Duration::from_secs(1)).await;
}

#[test_log::test(tokio::test)]
async fn test_stop_rejects_pending_and_is_idempotent() {
    let (worker, mut events) = spawn_worker(&test_config(sim_worker())).await;

    let pending = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.send(Request::new(1, "hang", None)).await })
    };
    assert!(wait_until(Duration::from_secs(2), || worker.active_requests() == 1).await);

    worker.stop(Duration::from_secs(1)).await;
    assert!(matches!(pending.await.unwrap(), Err(WorkerError::Terminated)));
    assert_eq!(worker.status(), WorkerStatus::Stopped);

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, WorkerEvent::Exited { clean: true, .. }));

    worker.stop(Duration::from_secs(1)).await;
    assert!(matches!(
        worker.send(Request::new(2, "ping", None)).await,
        Err(WorkerError::NotAccepting(WorkerStatus::Stopped))
    ));
}

#[cfg(unix)]
#[test_log::test(tokio::test)]
async fn test_closed_stdout_kills_live_process() {
    let spec = WorkerSpec::new("/bin/sh")
        .with_arg("-c")
        .with_arg("echo MUXPOOL_WORKER_READY >&2; exec 1>&-; exec sleep 30");
    let (worker, mut events) = spawn_worker(&test_config(spec)).await;

    // the process never exits on its own; only the kill ends it
    let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("worker with a broken stdout should be killed")
        .unwrap();
    assert_eq!(
        event,
        WorkerEvent::Exited {
            worker_id: "worker-test".to_string(),
            clean: false,
        }
    );
    assert_eq!(worker.status(), WorkerStatus::Stopped);
    assert_eq!(worker.health(), WorkerHealth::Unhealthy);
    assert!(matches!(
        worker.send(Request::new(1, "ping", None)).await,
        Err(WorkerError::NotAccepting(WorkerStatus::Stopped))
    ));
}
