// Gateway front end
//
// Reads JSON-RPC lines, guards dispatch with the circuit breaker and writes
// one response line per request. Requests run concurrently; responses are
// serialized through a single writer task so lines never interleave.

use std::future::Future;
use std::sync::Arc;

use muxpool_pool::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, PoolStatus, WorkerHealth,
};
use muxpool_protocol::{
    error_codes, write_line, LineReader, ProtocolError, Request, Response, RpcError,
};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;

/// Methods under this prefix are answered by the gateway itself
pub const MANAGEMENT_PREFIX: &str = "muxpool/";

/// Worker health counts reported by `muxpool/health`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthCounts {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

impl HealthCounts {
    fn from_status(status: &PoolStatus) -> Self {
        let mut counts = Self::default();
        for worker in &status.workers {
            match worker.health {
                WorkerHealth::Healthy => counts.healthy += 1,
                WorkerHealth::Degraded => counts.degraded += 1,
                WorkerHealth::Unhealthy => counts.unhealthy += 1,
                WorkerHealth::Unknown => counts.unknown += 1,
            }
        }
        counts
    }
}

/// Body of the `muxpool/health` result
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub breaker: CircuitBreakerSnapshot,
    pub workers: HealthCounts,
}

/// Breaker-guarded front end over a [`Dispatcher`]
pub struct Gateway {
    dispatcher: Arc<dyn Dispatcher>,
    breaker: CircuitBreaker,
}

impl Gateway {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, breaker: CircuitBreakerConfig) -> Self {
        Self {
            dispatcher,
            breaker: CircuitBreaker::new(breaker),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Handle one raw input line.
    ///
    /// Returns `None` for notifications, which get no response.
    pub async fn handle_line(&self, line: &str) -> Option<Response> {
        match Request::parse(line) {
            Ok(request) => self.handle_request(request).await,
            Err(ProtocolError::InvalidMessage { id, reason }) => {
                warn!(reason = %reason, "Rejecting invalid request");
                Some(Response::failure(
                    id.unwrap_or(Value::Null),
                    RpcError::invalid_request(reason),
                ))
            }
            Err(e) => {
                warn!(error = %e, "Rejecting unparseable line");
                Some(Response::failure(
                    Value::Null,
                    RpcError::parse_error(e.to_string()),
                ))
            }
        }
    }

    /// Handle one parsed request
    #[instrument(skip(self, request), fields(method = %request.method))]
    pub async fn handle_request(&self, request: Request) -> Option<Response> {
        let Some(id) = request.id.clone() else {
            debug!("Ignoring notification");
            return None;
        };

        if let Some(command) = request.method.strip_prefix(MANAGEMENT_PREFIX) {
            return Some(self.management(id, command, &request.method));
        }

        let response = match self.forward(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "Request failed");
                Response::failure(id, e.to_rpc_error())
            }
        };
        Some(response)
    }

    /// Dispatch through the breaker.
    ///
    /// Pool errors and worker server errors count against the breaker;
    /// client errors returned by a worker do not.
    async fn forward(&self, request: Request) -> Result<Response, GatewayError> {
        let permit = self.breaker.allow()?;

        match self.dispatcher.dispatch(request).await {
            Ok(response) => {
                if response
                    .error_code()
                    .is_some_and(error_codes::is_server_error)
                {
                    permit.failure();
                } else {
                    permit.success();
                }
                Ok(response)
            }
            Err(e) => {
                permit.failure();
                Err(e.into())
            }
        }
    }

    fn management(&self, id: Value, command: &str, method: &str) -> Response {
        let result = match command {
            "status" => serde_json::to_value(self.dispatcher.status()),
            "health" => {
                let status = self.dispatcher.status();
                serde_json::to_value(HealthReport {
                    breaker: self.breaker.snapshot(),
                    workers: HealthCounts::from_status(&status),
                })
            }
            _ => return Response::failure(id, RpcError::method_not_found(method)),
        };

        match result {
            Ok(value) => Response::success(id, value),
            Err(e) => Response::failure(id, RpcError::internal(e.to_string())),
        }
    }

    /// Serve requests from `reader` until EOF, writing responses to `writer`.
    ///
    /// Returns once every in-flight request has been answered.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<(), GatewayError>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.serve_until(reader, writer, std::future::pending())
            .await
    }

    /// Like [`Gateway::serve`], but stop reading input once `shutdown`
    /// resolves.
    ///
    /// The dispatcher is then shut down while in-flight requests drain, so
    /// every request already read still gets a response line, an error one
    /// if its worker went away.
    pub async fn serve_until<R, W, S>(
        self: Arc<Self>,
        reader: R,
        writer: W,
        shutdown: S,
    ) -> Result<(), GatewayError>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
        S: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(response) = rx.recv().await {
                write_line(&mut writer, &response).await?;
            }
            Ok::<(), ProtocolError>(())
        });

        info!("Gateway serving requests");
        tokio::pin!(shutdown);
        let mut lines = LineReader::new(reader);
        let mut in_flight = JoinSet::new();
        let mut stopping = false;
        let read_result = loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer reading input");
                    stopping = true;
                    break Ok(());
                }
                next = lines.next_line() => next,
            };

            match next {
                Ok(Some(Ok(line))) => {
                    let gateway = Arc::clone(&self);
                    let tx = tx.clone();
                    in_flight.spawn(async move {
                        if let Some(response) = gateway.handle_line(&line).await {
                            let _ = tx.send(response);
                        }
                    });
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "Rejecting undecodable line");
                    let _ = tx.send(Response::failure(
                        Value::Null,
                        RpcError::parse_error(e.to_string()),
                    ));
                }
                Ok(None) => break Ok(()),
                Err(e) => {
                    error!(error = %e, "Input stream failed");
                    break Err(e);
                }
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Request task failed");
                }
            }
        };

        debug!(pending = in_flight.len(), "Input closed, draining in-flight requests");
        let drain = async {
            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Request task failed");
                }
            }
        };
        if stopping {
            tokio::join!(self.dispatcher.shutdown(), drain);
        } else {
            drain.await;
        }
        drop(tx);

        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Output stream failed");
                return Err(e.into());
            }
            Err(e) => error!(error = %e, "Writer task failed"),
        }

        read_result?;
        info!("Gateway input closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use muxpool_pool::{PoolError, WorkerError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Answers by method name: `ok`, `server_error`, `bad_params`, `terminated`
    #[derive(Default)]
    struct ScriptedDispatcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Dispatcher for ScriptedDispatcher {
        async fn dispatch(&self, request: Request) -> Result<Response, PoolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let id = request.id.unwrap_or(Value::Null);
            match request.method.as_str() {
                "server_error" => Ok(Response::failure(
                    id,
                    RpcError::new(error_codes::SERVER_ERROR, "boom"),
                )),
                "bad_params" => Ok(Response::failure(
                    id,
                    RpcError::new(error_codes::INVALID_PARAMS, "bad params"),
                )),
                "terminated" => Err(WorkerError::Terminated.into()),
                _ => Ok(Response::success(id, json!("ok"))),
            }
        }

        fn status(&self) -> PoolStatus {
            PoolStatus {
                total_workers: 0,
                starting_workers: 0,
                ready_workers: 0,
                busy_workers: 0,
                healthy_workers: 0,
                degraded_workers: 0,
                unhealthy_workers: 0,
                active_requests: 0,
                load_ratio: 0.0,
                total_requests: 0,
                failed_requests: 0,
                shutting_down: false,
                workers: vec![],
            }
        }
    }

    fn gateway(threshold: u32) -> (Gateway, Arc<ScriptedDispatcher>) {
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(threshold)
            .with_recovery_time(Duration::from_secs(1));
        (Gateway::new(dispatcher.clone(), config), dispatcher)
    }

    fn code(response: &Response) -> Option<i64> {
        response.error_code()
    }

    #[tokio::test]
    async fn test_parse_error_has_null_id() {
        let (gateway, dispatcher) = gateway(5);
        let response = gateway.handle_line("{oops").await.unwrap();
        assert_eq!(response.id, Value::Null);
        assert_eq!(code(&response), Some(error_codes::PARSE_ERROR));
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_keeps_id() {
        let (gateway, _) = gateway(5);
        let response = gateway
            .handle_line(r#"{"jsonrpc":"2.0","id":"r1"}"#)
            .await
            .unwrap();
        assert_eq!(response.id, json!("r1"));
        assert_eq!(code(&response), Some(error_codes::INVALID_REQUEST));
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let (gateway, dispatcher) = gateway(5);
        let response = gateway
            .handle_line(r#"{"jsonrpc":"2.0","method":"ok"}"#)
            .await;
        assert!(response.is_none());
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_management_methods_are_local() {
        let (gateway, dispatcher) = gateway(5);

        let status = gateway
            .handle_request(Request::new(1, "muxpool/status", None))
            .await
            .unwrap();
        assert_eq!(status.result.unwrap()["total_workers"], json!(0));

        let health = gateway
            .handle_request(Request::new(2, "muxpool/health", None))
            .await
            .unwrap();
        let health = health.result.unwrap();
        assert_eq!(health["breaker"]["state"], json!("closed"));
        assert_eq!(health["workers"]["healthy"], json!(0));

        let unknown = gateway
            .handle_request(Request::new(3, "muxpool/restart", None))
            .await
            .unwrap();
        assert_eq!(code(&unknown), Some(error_codes::METHOD_NOT_FOUND));

        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_client_errors_do_not_trip_breaker() {
        let (gateway, _) = gateway(2);
        for i in 0..5 {
            let response = gateway
                .handle_request(Request::new(i, "bad_params", None))
                .await
                .unwrap();
            assert_eq!(code(&response), Some(error_codes::INVALID_PARAMS));
        }
        assert_eq!(gateway.breaker().snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_pool_errors_carry_caller_id() {
        let (gateway, _) = gateway(5);
        let response = gateway
            .handle_request(Request::new("abc", "terminated", None))
            .await
            .unwrap();
        assert_eq!(response.id, json!("abc"));
        assert_eq!(code(&response), Some(error_codes::WORKER_TERMINATED));
        assert_eq!(gateway.breaker().snapshot().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_recovers() {
        let (gateway, dispatcher) = gateway(2);

        for i in 0..2 {
            let response = gateway
                .handle_request(Request::new(i, "server_error", None))
                .await
                .unwrap();
            assert_eq!(code(&response), Some(error_codes::SERVER_ERROR));
        }

        let rejected = gateway
            .handle_request(Request::new(2, "ok", None))
            .await
            .unwrap();
        assert_eq!(code(&rejected), Some(error_codes::CIRCUIT_OPEN));
        assert_eq!(rejected.id, json!(2));
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_millis(1001)).await;

        let trial = gateway
            .handle_request(Request::new(3, "ok", None))
            .await
            .unwrap();
        assert_eq!(trial.result, Some(json!("ok")));
        let snapshot = gateway.breaker().snapshot();
        assert_eq!(snapshot.state.to_string(), "closed");
        assert_eq!(snapshot.failure_count, 0);
    }
}
