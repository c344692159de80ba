//! Worker pool
//!
//! Owns the worker processes, places requests on the least-loaded worker,
//! scales between the configured bounds and replaces workers that exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use indexmap::IndexMap;
use muxpool_protocol::{Request, Response};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::{PoolError, WorkerError};
use crate::health;
use crate::reliability::RetryPolicy;
use crate::scaling::{self, LoadSample};
use crate::worker::{WorkerEvent, WorkerHandle, WorkerHealth, WorkerSnapshot, WorkerStatus};

/// Pool status snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolStatus {
    pub total_workers: usize,
    pub starting_workers: usize,
    pub ready_workers: usize,
    pub busy_workers: usize,
    pub healthy_workers: usize,
    pub degraded_workers: usize,
    pub unhealthy_workers: usize,
    pub active_requests: usize,
    pub load_ratio: f64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub shutting_down: bool,
    pub workers: Vec<WorkerSnapshot>,
}

struct PoolInner {
    workers: IndexMap<String, Arc<WorkerHandle>>,
    /// Spawns in flight, reserved against `max_instances`
    starting: usize,
    background_scale_up: bool,
    started: bool,
    shutting_down: bool,
}

impl PoolInner {
    fn samples(&self) -> Vec<LoadSample> {
        self.workers
            .values()
            .map(|worker| {
                let (status, active_requests, last_activity) = worker.load();
                LoadSample {
                    status,
                    active_requests,
                    last_activity,
                }
            })
            .collect()
    }

    fn headroom(&self, limit: usize) -> bool {
        self.workers.len() + self.starting < limit
    }
}

/// State shared between the pool handle and its background tasks
pub(crate) struct PoolShared {
    pub(crate) config: PoolConfig,
    retry: RetryPolicy,
    inner: Mutex<PoolInner>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    shutdown_tx: watch::Sender<bool>,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
}

/// A reserved spawn slot, released on drop
///
/// Must not be dropped while `inner` is locked.
struct SpawnSlot {
    shared: Arc<PoolShared>,
}

impl SpawnSlot {
    /// Reserve a slot; caller holds the lock and has checked headroom
    fn reserve(shared: &Arc<PoolShared>, inner: &mut PoolInner) -> Self {
        inner.starting += 1;
        Self {
            shared: Arc::clone(shared),
        }
    }
}

impl Drop for SpawnSlot {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.starting = inner.starting.saturating_sub(1);
    }
}

async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

enum Placement {
    Worker(Arc<WorkerHandle>),
    Spawn(SpawnSlot),
    Wait,
}

impl PoolShared {
    fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Workers currently accepting requests
    pub(crate) fn active_workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.inner
            .lock()
            .workers
            .values()
            .filter(|worker| worker.status().is_active())
            .cloned()
            .collect()
    }

    /// Spawn one worker into a reserved slot and add it to the map
    async fn start_worker(&self) -> Result<Arc<WorkerHandle>, PoolError> {
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }

        let id = format!("worker-{}", Uuid::now_v7());
        let worker = Arc::new(
            WorkerHandle::spawn(id.clone(), &self.config, self.events_tx.clone()).await?,
        );

        let rejected = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                Some(PoolError::ShuttingDown)
            } else if !worker.status().is_active() {
                // exited before joining; its exit event found nothing to remove
                Some(PoolError::Worker(WorkerError::Terminated))
            } else {
                inner.workers.insert(id, Arc::clone(&worker));
                None
            }
        };
        if let Some(e) = rejected {
            worker.stop(self.config.shutdown_timeout).await;
            return Err(e);
        }

        Ok(worker)
    }

    /// Start a worker for a slot, retrying per the retry policy
    async fn start_worker_with_retry(
        self: &Arc<Self>,
        slot: SpawnSlot,
        label: &str,
    ) -> Result<Arc<WorkerHandle>, PoolError> {
        let result = self
            .retry
            .retry(label, |_attempt| {
                let shared = Arc::clone(self);
                async move { shared.start_worker().await }
            })
            .await;
        drop(slot);
        result
    }

    /// Find a worker for one request, spawning or waiting as needed
    async fn acquire(self: &Arc<Self>, deadline: Instant) -> Result<Arc<WorkerHandle>, PoolError> {
        loop {
            let placement = {
                let mut inner = self.inner.lock();
                if inner.shutting_down {
                    return Err(PoolError::ShuttingDown);
                }
                let samples = inner.samples();
                match scaling::least_loaded(
                    &samples,
                    self.config.max_concurrent_requests_per_worker,
                ) {
                    Some(index) => match inner.workers.get_index(index) {
                        Some((_, worker)) => Placement::Worker(Arc::clone(worker)),
                        None => Placement::Wait,
                    },
                    None if inner.headroom(self.config.max_instances) => {
                        Placement::Spawn(SpawnSlot::reserve(self, &mut inner))
                    }
                    None => Placement::Wait,
                }
            };

            match placement {
                Placement::Worker(worker) => return Ok(worker),
                Placement::Spawn(slot) => {
                    debug!("No worker with spare capacity, scaling up on demand");
                    let result = self.start_worker().await;
                    drop(slot);
                    return result;
                }
                Placement::Wait => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::NoAvailableWorker(self.config.acquire_timeout));
                    }
                    let wait = self.config.acquire_poll_interval.min(deadline - now);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Start one extra worker in the background when load is high
    fn maybe_scale_up(self: &Arc<Self>) {
        if !self.config.proactive_scale_up {
            return;
        }
        let slot = {
            let mut inner = self.inner.lock();
            if inner.shutting_down
                || inner.background_scale_up
                || !inner.headroom(self.config.max_instances)
            {
                return;
            }
            let samples = inner.samples();
            if !scaling::should_scale_up(
                &samples,
                self.config.max_concurrent_requests_per_worker,
                self.config.scale_up_load_ratio,
                1,
            ) {
                return;
            }
            inner.background_scale_up = true;
            SpawnSlot::reserve(self, &mut inner)
        };

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            info!("Load above scale-up ratio, starting an extra worker");
            let result = shared.start_worker().await;
            drop(slot);
            shared.inner.lock().background_scale_up = false;
            match result {
                Ok(worker) => info!(worker_id = %worker.id(), "Scaled up"),
                Err(e) => warn!(error = %e, "Background scale-up failed"),
            }
        });
    }

    /// Retire one idle worker when load is low
    fn scale_down_check(&self) {
        let retired = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return;
            }
            let samples = inner.samples();
            let Some(index) = scaling::scale_down_candidate(
                &samples,
                self.config.max_concurrent_requests_per_worker,
                self.config.min_instances,
                self.config.scale_down_load_ratio,
            ) else {
                return;
            };
            let Some((id, worker)) = inner.workers.get_index(index) else {
                return;
            };
            if !worker.try_retire() {
                return;
            }
            let id = id.clone();
            inner.workers.shift_remove(&id)
        };

        if let Some(worker) = retired {
            info!(worker_id = %worker.id(), "Scaling down idle worker");
            let grace = self.config.shutdown_timeout;
            tokio::spawn(async move { worker.stop(grace).await });
        }
    }

    async fn dispatch(self: &Arc<Self>, request: Request) -> Result<Response, PoolError> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            let worker = self.acquire(deadline).await?;
            self.maybe_scale_up();

            match worker.send(request.clone()).await {
                Err(WorkerError::AtCapacity | WorkerError::NotAccepting(_)) => {
                    // lost the race for this worker; pick again
                    if Instant::now() >= deadline {
                        return Err(PoolError::NoAvailableWorker(self.config.acquire_timeout));
                    }
                    debug!(worker_id = %worker.id(), "Worker no longer accepting, reselecting");
                    tokio::task::yield_now().await;
                }
                other => return other.map_err(PoolError::from),
            }
        }
    }

    fn handle_event(self: &Arc<Self>, event: WorkerEvent) {
        match event {
            WorkerEvent::Exited { worker_id, clean } => {
                let slot = {
                    let mut inner = self.inner.lock();
                    if inner.workers.shift_remove(&worker_id).is_none() {
                        debug!(worker_id = %worker_id, "Exit of worker already removed from pool");
                        return;
                    }
                    if clean {
                        info!(worker_id = %worker_id, "Worker left the pool");
                    } else {
                        warn!(worker_id = %worker_id, "Worker exited unexpectedly, removed from pool");
                    }
                    if inner.shutting_down || !inner.headroom(self.config.min_instances) {
                        return;
                    }
                    SpawnSlot::reserve(self, &mut inner)
                };

                let shared = Arc::clone(self);
                let mut shutdown_rx = self.shutdown_tx.subscribe();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(shared.config.replacement_delay) => {}
                        _ = shutdown_signalled(&mut shutdown_rx) => return,
                    }
                    info!(replacing = %worker_id, "Starting replacement worker");
                    tokio::select! {
                        result = shared.start_worker_with_retry(slot, "replace worker") => match result {
                            Ok(worker) => info!(worker_id = %worker.id(), "Replacement worker ready"),
                            Err(e) => error!(error = %e, "Failed to replace worker"),
                        },
                        _ = shutdown_signalled(&mut shutdown_rx) => {
                            debug!("Replacement abandoned on shutdown");
                        }
                    }
                });
            }
        }
    }

    fn status(&self) -> PoolStatus {
        let inner = self.inner.lock();
        let workers: Vec<WorkerSnapshot> = inner.workers.values().map(|w| w.snapshot()).collect();
        let count_status =
            |status: WorkerStatus| workers.iter().filter(|w| w.status == status).count();
        let count_health =
            |health: WorkerHealth| workers.iter().filter(|w| w.health == health).count();

        PoolStatus {
            total_workers: workers.len(),
            starting_workers: inner.starting,
            ready_workers: count_status(WorkerStatus::Ready),
            busy_workers: count_status(WorkerStatus::Busy),
            healthy_workers: count_health(WorkerHealth::Healthy),
            degraded_workers: count_health(WorkerHealth::Degraded),
            unhealthy_workers: count_health(WorkerHealth::Unhealthy),
            active_requests: workers.iter().map(|w| w.active_requests).sum(),
            load_ratio: scaling::load_ratio(
                &inner.samples(),
                self.config.max_concurrent_requests_per_worker,
            ),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            shutting_down: inner.shutting_down,
            workers,
        }
    }
}

/// Pool of worker processes
///
/// # Example
///
/// ```ignore
/// use muxpool_pool::{Pool, PoolConfig, WorkerSpec};
/// use muxpool_protocol::Request;
///
/// let pool = Pool::new(PoolConfig::new(WorkerSpec::new("/usr/local/bin/router-worker")))?;
/// pool.start().await?;
///
/// let response = pool.dispatch(Request::new(1, "route", None)).await?;
///
/// pool.shutdown().await;
/// ```
pub struct Pool {
    shared: Arc<PoolShared>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Create a pool with the default retry policy
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        Self::with_retry_policy(config, RetryPolicy::default())
    }

    /// Create a pool whose warm-up and replacement spawns use `retry`
    pub fn with_retry_policy(config: PoolConfig, retry: RetryPolicy) -> Result<Self, PoolError> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                retry,
                inner: Mutex::new(PoolInner {
                    workers: IndexMap::new(),
                    starting: 0,
                    background_scale_up: false,
                    started: false,
                    shutting_down: false,
                }),
                events_tx,
                shutdown_tx,
                total_requests: AtomicU64::new(0),
                failed_requests: AtomicU64::new(0),
            }),
            events_rx: Mutex::new(Some(events_rx)),
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Start background tasks and fill the pool to `min_instances`
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), PoolError> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.shutting_down {
                return Err(PoolError::ShuttingDown);
            }
            if inner.started {
                return Err(PoolError::AlreadyRunning);
            }
            inner.started = true;
        }

        info!(
            min_instances = self.shared.config.min_instances,
            max_instances = self.shared.config.max_instances,
            program = %self.shared.config.worker.program.display(),
            "Starting worker pool"
        );

        self.start_event_loop();
        self.start_health_monitor();

        self.warm_up().await
    }

    /// Spawn workers until the pool holds `min_instances`
    ///
    /// Safe to call repeatedly; a full pool spawns nothing.
    #[instrument(skip(self))]
    pub async fn warm_up(&self) -> Result<(), PoolError> {
        let slots: Vec<SpawnSlot> = {
            let mut inner = self.shared.inner.lock();
            if inner.shutting_down {
                return Err(PoolError::ShuttingDown);
            }
            let present = inner.workers.len() + inner.starting;
            let needed = self.shared.config.min_instances.saturating_sub(present);
            (0..needed)
                .map(|_| SpawnSlot::reserve(&self.shared, &mut inner))
                .collect()
        };

        if slots.is_empty() {
            return Ok(());
        }
        debug!(count = slots.len(), "Warming up workers");

        let results = join_all(
            slots
                .into_iter()
                .map(|slot| self.shared.start_worker_with_retry(slot, "warm up worker")),
        )
        .await;

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                error!(error = %e, "Warm-up spawn failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Dispatch one request to the least-loaded worker
    ///
    /// The response carries the request's id.
    #[instrument(skip(self, request), fields(method = %request.method))]
    pub async fn dispatch(&self, request: Request) -> Result<Response, PoolError> {
        if self.shared.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }
        self.shared.total_requests.fetch_add(1, Ordering::Relaxed);

        let result = self.shared.dispatch(request).await;
        if let Err(e) = &result {
            self.shared.failed_requests.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "Dispatch failed");
        }

        self.shared.scale_down_check();
        result
    }

    /// Run one health probe round immediately
    pub async fn run_health_checks(&self) {
        health::probe_round(&self.shared).await;
    }

    /// Current pool status
    pub fn status(&self) -> PoolStatus {
        self.shared.status()
    }

    /// Handles of the workers currently in the pool
    pub fn workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.shared.inner.lock().workers.values().cloned().collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// Stop background tasks and every worker
    ///
    /// In-flight requests fail with `Terminated`; later dispatches fail with
    /// `ShuttingDown`.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let workers: Vec<Arc<WorkerHandle>> = {
            let mut inner = self.shared.inner.lock();
            if inner.shutting_down {
                return;
            }
            inner.shutting_down = true;
            inner.workers.drain(..).map(|(_, worker)| worker).collect()
        };

        info!(workers = workers.len(), "Shutting down worker pool");
        let _ = self.shared.shutdown_tx.send(true);

        let grace = self.shared.config.shutdown_timeout;
        join_all(workers.iter().map(|worker| worker.stop(grace))).await;

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        info!("Worker pool stopped");
    }

    fn start_event_loop(&self) {
        let Some(mut events_rx) = self.events_rx.lock().take() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = events_rx.recv() => shared.handle_event(event),
                    _ = shutdown_rx.changed() => {
                        debug!("Event loop: shutdown requested");
                        break;
                    }
                }
            }
            debug!("Event loop exited");
        });

        self.tasks.lock().push(handle);
    }

    fn start_health_monitor(&self) {
        let handle = tokio::spawn(health::monitor(
            Arc::clone(&self.shared),
            self.shutdown_rx.clone(),
        ));
        self.tasks.lock().push(handle);
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let _ = self.shared.shutdown_tx.send(true);
        let workers: Vec<Arc<WorkerHandle>> = {
            let mut inner = self.shared.inner.lock();
            inner.shutting_down = true;
            inner.workers.drain(..).map(|(_, worker)| worker).collect()
        };
        for worker in workers {
            worker.start_kill();
        }
    }
}
