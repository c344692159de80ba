//! Per-worker bookkeeping: pending requests, slot accounting, health counters
//!
//! Pure state, no IO. The handle holds it behind a mutex and never awaits
//! while the lock is held.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use muxpool_protocol::Response;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{WorkerHealth, WorkerStatus};
use crate::error::WorkerError;

/// Number of latency samples kept for the rolling average
const RESPONSE_TIME_SAMPLES: usize = 100;

pub(crate) type Reply = oneshot::Sender<Result<Response, WorkerError>>;

/// Accounting lane of a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    /// Caller traffic, counted against the concurrency cap
    Request,
    /// Health probes, tracked separately
    Probe,
}

pub(crate) struct PendingRequest {
    pub caller_id: Value,
    pub lane: Lane,
    pub started_at: Instant,
    pub reply: Reply,
}

pub(crate) struct WorkerState {
    pub status: WorkerStatus,
    pub health: WorkerHealth,
    max_concurrent: usize,
    active_requests: usize,
    probes_in_flight: usize,
    next_correlation_id: u64,
    pending: HashMap<u64, PendingRequest>,
    total_requests: u64,
    failure_count: u32,
    response_times: VecDeque<Duration>,
    last_activity: Instant,
}

impl WorkerState {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            status: WorkerStatus::Starting,
            health: WorkerHealth::Unknown,
            max_concurrent: max_concurrent.max(1),
            active_requests: 0,
            probes_in_flight: 0,
            next_correlation_id: 1,
            pending: HashMap::new(),
            total_requests: 0,
            failure_count: 0,
            response_times: VecDeque::with_capacity(RESPONSE_TIME_SAMPLES),
            last_activity: Instant::now(),
        }
    }

    pub fn mark_ready(&mut self) {
        self.status = WorkerStatus::Ready;
        self.recompute_status();
    }

    /// Mark the protocol channel broken unless a stop is already underway
    pub fn mark_error(&mut self) {
        if !matches!(self.status, WorkerStatus::Stopping | WorkerStatus::Stopped) {
            self.status = WorkerStatus::Error;
        }
    }

    /// Register a new pending request and return its correlation id
    pub fn begin(&mut self, caller_id: Value, lane: Lane, reply: Reply) -> Result<u64, WorkerError> {
        if !self.status.is_active() {
            return Err(WorkerError::NotAccepting(self.status));
        }
        match lane {
            Lane::Request => {
                if self.active_requests >= self.max_concurrent {
                    return Err(WorkerError::AtCapacity);
                }
                self.active_requests += 1;
                self.total_requests += 1;
            }
            Lane::Probe => self.probes_in_flight += 1,
        }

        let correlation_id = self.next_correlation_id;
        self.next_correlation_id += 1;
        self.pending.insert(
            correlation_id,
            PendingRequest {
                caller_id,
                lane,
                started_at: Instant::now(),
                reply,
            },
        );
        self.recompute_status();
        Ok(correlation_id)
    }

    /// A correlated response arrived; returns the entry to reply to
    pub fn complete(&mut self, correlation_id: u64) -> Option<PendingRequest> {
        let pending = self.pending.remove(&correlation_id)?;
        let now = Instant::now();
        match pending.lane {
            Lane::Request => {
                self.active_requests = self.active_requests.saturating_sub(1);
                if self.response_times.len() == RESPONSE_TIME_SAMPLES {
                    self.response_times.pop_front();
                }
                self.response_times
                    .push_back(now.saturating_duration_since(pending.started_at));
                self.failure_count = self.failure_count.saturating_sub(1);
                self.last_activity = now;
            }
            Lane::Probe => self.probes_in_flight = self.probes_in_flight.saturating_sub(1),
        }
        self.recompute_status();
        Some(pending)
    }

    /// Give up on a pending request (deadline or write failure).
    ///
    /// Returns false when the entry was already resolved.
    pub fn abandon(&mut self, correlation_id: u64) -> bool {
        let Some(pending) = self.pending.remove(&correlation_id) else {
            return false;
        };
        match pending.lane {
            Lane::Request => {
                self.active_requests = self.active_requests.saturating_sub(1);
                self.failure_count += 1;
                self.last_activity = Instant::now();
            }
            Lane::Probe => self.probes_in_flight = self.probes_in_flight.saturating_sub(1),
        }
        self.recompute_status();
        true
    }

    /// Remove every pending entry; callers reject them outside the lock
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.active_requests = 0;
        self.probes_in_flight = 0;
        self.recompute_status();
        self.pending.drain().map(|(_, pending)| pending).collect()
    }

    /// Retire an idle worker: only succeeds with no requests in flight
    pub fn try_retire(&mut self) -> bool {
        if self.status.is_active() && self.active_requests == 0 {
            self.status = WorkerStatus::Stopping;
            true
        } else {
            false
        }
    }

    /// Probe succeeded; returns true when this completed a recovery
    pub fn probe_succeeded(&mut self) -> bool {
        let was_degraded = matches!(
            self.health,
            WorkerHealth::Degraded | WorkerHealth::Unhealthy
        );
        self.health = WorkerHealth::Healthy;
        self.failure_count = self.failure_count.saturating_sub(1);
        if was_degraded && self.failure_count == 0 {
            return true;
        }
        false
    }

    /// Probe failed; returns true when the failure threshold is exceeded
    pub fn probe_failed(&mut self, threshold: u32) -> bool {
        self.failure_count += 1;
        if self.failure_count > threshold {
            self.health = WorkerHealth::Unhealthy;
            true
        } else {
            self.health = WorkerHealth::Degraded;
            false
        }
    }

    fn recompute_status(&mut self) {
        if self.status.is_active() {
            self.status = if self.active_requests >= self.max_concurrent {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Ready
            };
        }
    }

    pub fn active_requests(&self) -> usize {
        self.active_requests
    }

    pub fn probes_in_flight(&self) -> usize {
        self.probes_in_flight
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Rolling average over the last 100 request latencies
    pub fn average_response_time(&self) -> Option<Duration> {
        if self.response_times.is_empty() {
            return None;
        }
        let total: Duration = self.response_times.iter().sum();
        Some(total / self.response_times.len() as u32)
    }
}
