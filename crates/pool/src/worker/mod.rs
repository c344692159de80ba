//! Worker processes
//!
//! This module provides:
//! - [`WorkerHandle`] - One spawned worker process and its request multiplexer
//! - [`WorkerStatus`] / [`WorkerHealth`] - Lifecycle and health states
//! - [`WorkerSnapshot`] - Read-only view used for status reporting
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        WorkerHandle                          │
//! │   send() ──► pending[corr_id] ──► stdin writer task ──►      │
//! │                                                    child     │
//! │   reply ◄── stdout reader task (id → caller id) ◄──          │
//! │                                                              │
//! │   stderr reader (readiness marker, diagnostics)              │
//! │   supervisor (wait / SIGTERM / SIGKILL, exit event)          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod handle;
mod state;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use handle::WorkerHandle;

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Process is not running
    Stopped,
    /// Spawned, waiting for the readiness marker
    Starting,
    /// Accepting requests (below the concurrency cap)
    Ready,
    /// At the concurrency cap
    Busy,
    /// Protocol channel broke; waiting for the process to exit
    Error,
    /// Stop requested, waiting for the process to exit
    Stopping,
}

impl WorkerStatus {
    /// Whether the worker counts toward pool load
    pub fn is_active(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Busy => write!(f, "busy"),
            Self::Error => write!(f, "error"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Worker health as judged by probes and request outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Notifications a worker sends to its owning pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The worker's process exited
    Exited {
        worker_id: String,
        /// Exit was requested or the process exited with status 0
        clean: bool,
    },
}

/// Point-in-time view of one worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerSnapshot {
    pub id: String,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub health: WorkerHealth,
    pub active_requests: usize,
    pub probes_in_flight: usize,
    pub total_requests: u64,
    pub failure_count: u32,
    pub avg_response_time_ms: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub idle_ms: u64,
}
