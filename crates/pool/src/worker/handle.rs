//! Worker process handle
//!
//! Owns one child process and multiplexes concurrent requests over its
//! stdio pair. Each request gets a fresh correlation id; the caller's id is
//! restored on the way back out.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use muxpool_protocol::{write_line, LineReader, Request, Response};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

use super::state::{Lane, PendingRequest, WorkerState};
use super::{WorkerEvent, WorkerHealth, WorkerSnapshot, WorkerStatus};
use crate::config::PoolConfig;
use crate::error::WorkerError;

/// How long to wait for the process to disappear after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

enum WriterCommand {
    Send(Request),
    Close,
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy)]
struct ExitInfo {
    code: Option<i32>,
}

/// Handle to one worker process
pub struct WorkerHandle {
    id: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    request_timeout: Duration,
    state: Arc<Mutex<WorkerState>>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    control_tx: mpsc::UnboundedSender<Control>,
    exited: watch::Receiver<Option<ExitInfo>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("status", &self.status())
            .finish()
    }
}

impl WorkerHandle {
    /// Spawn a worker and wait for its readiness marker.
    ///
    /// The returned worker is `ready`. On failure the child is killed and
    /// [`WorkerError::Startup`] is returned.
    #[instrument(skip_all, fields(worker_id = %id))]
    pub async fn spawn(
        id: String,
        config: &PoolConfig,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Self, WorkerError> {
        let spec = &config.worker;
        let startup_error = |reason: String| WorkerError::Startup {
            worker_id: id.clone(),
            reason,
        };

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if spec.env_clear {
            command.env_clear();
        }
        command.envs(&spec.env);

        let mut child = command.spawn().map_err(|e| {
            startup_error(format!("failed to spawn {}: {e}", spec.program.display()))
        })?;
        let pid = child.id();

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill().await;
            return Err(startup_error("stdio pipes unavailable".into()));
        };

        debug!(?pid, program = %spec.program.display(), "Worker process spawned");

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(stderr_loop(
            id.clone(),
            stderr,
            spec.ready_marker.clone(),
            ready_tx,
        ));

        match tokio::time::timeout(config.startup_timeout, ready_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                let _ = child.kill().await;
                return Err(startup_error(
                    "process closed stderr before signalling readiness".into(),
                ));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(startup_error(format!(
                    "no readiness marker within {:?}",
                    config.startup_timeout
                )));
            }
        }

        let mut state = WorkerState::new(config.max_concurrent_requests_per_worker);
        state.mark_ready();
        let state = Arc::new(Mutex::new(state));

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(writer_loop(
            id.clone(),
            stdin,
            writer_rx,
            Arc::clone(&state),
            control_tx.clone(),
        ));
        tokio::spawn(reader_loop(
            id.clone(),
            stdout,
            Arc::clone(&state),
            control_tx.clone(),
        ));
        tokio::spawn(supervise(
            id.clone(),
            child,
            control_rx,
            Arc::clone(&state),
            exit_tx,
            events,
        ));

        info!(?pid, "Worker ready");

        Ok(Self {
            id,
            pid,
            started_at: Utc::now(),
            request_timeout: config.request_timeout,
            state,
            writer_tx,
            control_tx,
            exited: exit_rx,
        })
    }

    /// Send a request and wait for its correlated response.
    ///
    /// The response carries the caller's original id.
    #[instrument(skip(self, request), fields(worker_id = %self.id, method = %request.method))]
    pub async fn send(&self, request: Request) -> Result<Response, WorkerError> {
        self.submit(request, Lane::Request, self.request_timeout)
            .await
    }

    /// Issue a health probe on the separate probe lane
    pub async fn probe(&self, method: &str, timeout: Duration) -> Result<Response, WorkerError> {
        let request = Request::new(Value::Null, method, None);
        self.submit(request, Lane::Probe, timeout).await
    }

    async fn submit(
        &self,
        mut request: Request,
        lane: Lane,
        timeout: Duration,
    ) -> Result<Response, WorkerError> {
        let caller_id = request.id.take().unwrap_or(Value::Null);
        let (reply_tx, mut reply_rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;

        let correlation_id = self.state.lock().begin(caller_id, lane, reply_tx)?;
        request.id = Some(Value::from(correlation_id));
        trace!(correlation_id, ?lane, "Request submitted");

        if self.writer_tx.send(WriterCommand::Send(request)).is_err() {
            let mut state = self.state.lock();
            state.abandon(correlation_id);
            state.mark_error();
            return Err(WorkerError::Terminated);
        }

        match tokio::time::timeout_at(deadline, &mut reply_rx).await {
            Ok(reply) => reply.unwrap_or(Err(WorkerError::Terminated)),
            Err(_) => {
                if self.state.lock().abandon(correlation_id) {
                    warn!(correlation_id, ?timeout, "Request timed out");
                    Err(WorkerError::Timeout(timeout))
                } else {
                    // resolved between the deadline and the lock
                    reply_rx.await.unwrap_or(Err(WorkerError::Terminated))
                }
            }
        }
    }

    /// Stop the worker: reject pending requests, SIGTERM, then SIGKILL after `grace`.
    #[instrument(skip(self), fields(worker_id = %self.id))]
    pub async fn stop(&self, grace: Duration) {
        let drained = {
            let mut state = self.state.lock();
            if state.status == WorkerStatus::Stopped {
                return;
            }
            state.status = WorkerStatus::Stopping;
            state.drain()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "Rejecting pending requests");
        }
        for pending in drained {
            let _ = pending.reply.send(Err(WorkerError::Terminated));
        }

        let _ = self.writer_tx.send(WriterCommand::Close);
        let _ = self.control_tx.send(Control::Terminate);

        let mut exited = self.exited.clone();
        if tokio::time::timeout(grace, exited.wait_for(Option::is_some))
            .await
            .is_err()
        {
            warn!(?grace, "Worker did not exit in time, killing");
            self.kill().await;
        }
    }

    /// Forcefully kill the process and wait briefly for it to exit
    pub async fn kill(&self) {
        let _ = self.control_tx.send(Control::Kill);
        let mut exited = self.exited.clone();
        if tokio::time::timeout(KILL_WAIT, exited.wait_for(Option::is_some))
            .await
            .is_err()
        {
            error!(worker_id = %self.id, "Worker process did not exit after SIGKILL");
        }
    }

    /// Request a forced kill without waiting for the exit
    pub(crate) fn start_kill(&self) {
        let _ = self.control_tx.send(Control::Kill);
    }

    /// Move an idle worker to `stopping` so no new request lands on it
    pub(crate) fn try_retire(&self) -> bool {
        self.state.lock().try_retire()
    }

    /// Record a successful probe; true when the worker fully recovered
    pub(crate) fn record_probe_success(&self) -> bool {
        self.state.lock().probe_succeeded()
    }

    /// Record a failed probe; true when the worker should be stopped
    pub(crate) fn record_probe_failure(&self, threshold: u32) -> bool {
        self.state.lock().probe_failed(threshold)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> WorkerStatus {
        self.state.lock().status
    }

    pub fn health(&self) -> WorkerHealth {
        self.state.lock().health
    }

    pub fn active_requests(&self) -> usize {
        self.state.lock().active_requests()
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count()
    }

    /// Exit code, once the process has exited
    pub fn exit_code(&self) -> Option<i32> {
        self.exited.borrow().and_then(|info| info.code)
    }

    /// Status, load and last activity read under one lock
    pub(crate) fn load(&self) -> (WorkerStatus, usize, Instant) {
        let state = self.state.lock();
        (state.status, state.active_requests(), state.last_activity())
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let state = self.state.lock();
        WorkerSnapshot {
            id: self.id.clone(),
            pid: self.pid,
            status: state.status,
            health: state.health,
            active_requests: state.active_requests(),
            probes_in_flight: state.probes_in_flight(),
            total_requests: state.total_requests(),
            failure_count: state.failure_count(),
            avg_response_time_ms: state
                .average_response_time()
                .map(|d| d.as_secs_f64() * 1000.0),
            started_at: self.started_at,
            idle_ms: state.last_activity().elapsed().as_millis() as u64,
        }
    }
}

/// Forward diagnostics to tracing and report the readiness marker
async fn stderr_loop(
    worker_id: String,
    stderr: ChildStderr,
    marker: String,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if ready_tx.is_some() && line.contains(&marker) {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(());
                    }
                    continue;
                }
                debug!(worker_id = %worker_id, "worker stderr: {}", line);
            }
            Ok(None) => break,
            Err(e) => {
                // non-UTF-8 diagnostics; keep the pipe drained
                debug!(worker_id = %worker_id, error = %e, "Unreadable stderr line");
                if matches!(e.kind(), std::io::ErrorKind::InvalidData) {
                    continue;
                }
                break;
            }
        }
    }
}

/// Move a worker whose protocol channel broke to `error` and have the
/// supervisor kill it, so the exit drives replacement.
///
/// A worker already stopping is left to its own shutdown.
fn abort_broken_channel(
    worker_id: &str,
    state: &Mutex<WorkerState>,
    control_tx: &mpsc::UnboundedSender<Control>,
) -> Vec<PendingRequest> {
    let (stopping, drained) = {
        let mut state = state.lock();
        let stopping = matches!(state.status, WorkerStatus::Stopping | WorkerStatus::Stopped);
        state.mark_error();
        (stopping, state.drain())
    };
    if !stopping {
        warn!(worker_id, "Protocol channel broken, killing worker");
        let _ = control_tx.send(Control::Kill);
    }
    drained
}

async fn writer_loop(
    worker_id: String,
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    state: Arc<Mutex<WorkerState>>,
    control_tx: mpsc::UnboundedSender<Control>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Send(request) => {
                if let Err(e) = write_line(&mut stdin, &request).await {
                    warn!(worker_id = %worker_id, error = %e, "Failed to write to worker stdin");
                    for pending in abort_broken_channel(&worker_id, &state, &control_tx) {
                        let _ = pending.reply.send(Err(WorkerError::Terminated));
                    }
                    break;
                }
            }
            WriterCommand::Close => break,
        }
    }
    trace!(worker_id = %worker_id, "Writer loop exited, closing stdin");
}

async fn reader_loop(
    worker_id: String,
    stdout: ChildStdout,
    state: Arc<Mutex<WorkerState>>,
    control_tx: mpsc::UnboundedSender<Control>,
) {
    let mut lines = LineReader::new(BufReader::new(stdout));
    loop {
        match lines.next_line().await {
            Ok(Some(Ok(line))) => route_response(&worker_id, &state, &line),
            Ok(Some(Err(e))) => {
                warn!(worker_id = %worker_id, error = %e, "Dropping undecodable line from worker");
            }
            Ok(None) => break,
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Worker stdout failed");
                break;
            }
        }
    }

    debug!(worker_id = %worker_id, "Worker stdout closed");
    for pending in abort_broken_channel(&worker_id, &state, &control_tx) {
        let _ = pending.reply.send(Err(WorkerError::Terminated));
    }
}

fn route_response(worker_id: &str, state: &Mutex<WorkerState>, line: &str) {
    let mut response = match Response::parse(line) {
        Ok(response) => response,
        Err(e) => {
            warn!(worker_id, error = %e, "Dropping malformed line from worker");
            return;
        }
    };

    let Some(correlation_id) = response.id.as_u64() else {
        warn!(worker_id, id = %response.id, "Dropping response with foreign id");
        return;
    };

    let Some(pending) = state.lock().complete(correlation_id) else {
        debug!(worker_id, correlation_id, "Dropping late or unknown response");
        return;
    };

    response.id = pending.caller_id;
    let _ = pending.reply.send(Ok(response));
}

async fn supervise(
    worker_id: String,
    mut child: Child,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    state: Arc<Mutex<WorkerState>>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let pid = child.id();
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(control) = control_rx.recv() => match control {
                Control::Terminate => terminate(&worker_id, pid),
                Control::Kill => {
                    if let Err(e) = child.start_kill() {
                        debug!(worker_id = %worker_id, error = %e, "start_kill failed");
                    }
                }
            },
        }
    };

    let code = status.as_ref().ok().and_then(|s| s.code());
    let success = status.as_ref().map(|s| s.success()).unwrap_or(false);

    let (requested, drained) = {
        let mut state = state.lock();
        let requested = state.status == WorkerStatus::Stopping;
        state.status = WorkerStatus::Stopped;
        if !success && !requested {
            state.health = WorkerHealth::Unhealthy;
        }
        (requested, state.drain())
    };
    for pending in drained {
        let _ = pending.reply.send(Err(WorkerError::Terminated));
    }

    if requested || success {
        info!(worker_id = %worker_id, ?code, "Worker exited");
    } else {
        warn!(worker_id = %worker_id, ?code, ?status, "Worker exited unexpectedly");
    }

    exit_tx.send_replace(Some(ExitInfo { code }));
    let _ = events.send(WorkerEvent::Exited {
        worker_id,
        clean: requested || success,
    });
}

#[cfg(unix)]
fn terminate(worker_id: &str, pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(worker_id, pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn terminate(_worker_id: &str, _pid: Option<u32>) {
    // closing stdin is the only graceful signal available
}
