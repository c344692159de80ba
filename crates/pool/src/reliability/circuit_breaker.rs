//! Circuit breaker

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::duration_millis;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold reached - all calls rejected
    Open,

    /// Recovery time elapsed - a single trial call allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// When consecutive failures reach the threshold, the circuit "opens" and
/// calls fail fast without reaching the pool.
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  recovery time  ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                 └──────────┘
///      ▲                               ▲        trial fails         │
///      │                               └────────────────────────────┤
///      │                  trial succeeds                            │
///      └────────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use muxpool_pool::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_recovery_time(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Time to wait after the last failure before allowing a trial call
    #[serde(with = "duration_millis")]
    pub recovery_time: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_time: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the recovery time (time before trying again after opening)
    pub fn with_recovery_time(mut self, recovery_time: Duration) -> Self {
        self.recovery_time = recovery_time;
        self
    }
}

/// Error types for circuit breaker operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Circuit is open, calls are not allowed
    #[error("circuit breaker is open")]
    Open,

    /// Circuit is half-open and its trial call is already in flight
    #[error("circuit breaker half-open, trial call in flight")]
    HalfOpenExhausted,
}

/// Point-in-time view of the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    trial_in_flight: bool,
}

/// In-process circuit breaker
///
/// # Example
///
/// ```ignore
/// match breaker.allow() {
///     Ok(permit) => match pool.dispatch(request).await {
///         Ok(response) => {
///             permit.success();
///             Ok(response)
///         }
///         Err(e) => {
///             permit.failure();
///             Err(e)
///         }
///     },
///     Err(e) => Err(e.into()),
/// }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Get the circuit breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check if a call should be allowed
    ///
    /// Returns a permit that must be used to report success/failure.
    /// Dropping it without reporting counts as a failure.
    pub fn allow(&self) -> Result<CircuitBreakerPermit<'_>, CircuitBreakerError> {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => Ok(CircuitBreakerPermit::new(self, false)),
            CircuitState::Open => {
                let elapsed = state
                    .last_failure_time
                    .map(|at| at.elapsed() >= self.config.recovery_time)
                    .unwrap_or(true);
                if !elapsed {
                    return Err(CircuitBreakerError::Open);
                }
                info!("Circuit breaker half-open, allowing trial call");
                state.state = CircuitState::HalfOpen;
                state.trial_in_flight = true;
                Ok(CircuitBreakerPermit::new(self, true))
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    return Err(CircuitBreakerError::HalfOpenExhausted);
                }
                state.trial_in_flight = true;
                Ok(CircuitBreakerPermit::new(self, true))
            }
        }
    }

    /// Current state without acquiring a permit
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state.lock();
        CircuitBreakerSnapshot {
            state: state.state,
            failure_count: state.failure_count,
        }
    }

    fn record_success(&self, trial: bool) {
        let mut state = self.state.lock();
        if trial {
            state.trial_in_flight = false;
        }
        match state.state {
            CircuitState::HalfOpen if trial => {
                info!("Circuit breaker closed after successful trial");
                state.state = CircuitState::Closed;
                state.failure_count = 0;
            }
            CircuitState::Closed => state.failure_count = 0,
            // stale result from before the circuit opened
            _ => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut state = self.state.lock();
        if trial {
            state.trial_in_flight = false;
        }
        let now = Instant::now();
        match state.state {
            CircuitState::HalfOpen if trial => {
                warn!("Circuit breaker trial failed, reopening");
                state.state = CircuitState::Open;
                state.failure_count = state.failure_count.saturating_add(1);
                state.last_failure_time = Some(now);
            }
            CircuitState::Closed => {
                state.failure_count = state.failure_count.saturating_add(1);
                state.last_failure_time = Some(now);
                if state.failure_count >= self.config.failure_threshold {
                    warn!(
                        failures = state.failure_count,
                        "Circuit breaker opened"
                    );
                    state.state = CircuitState::Open;
                }
            }
            _ => {}
        }
    }
}

/// Permit that must be held during a protected call
#[must_use = "report the outcome with success() or failure()"]
pub struct CircuitBreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    reported: bool,
}

impl<'a> CircuitBreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            reported: false,
        }
    }

    /// Report the call succeeded
    pub fn success(mut self) {
        self.reported = true;
        self.breaker.record_success(self.trial);
    }

    /// Report the call failed
    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for CircuitBreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.reported {
            self.breaker.record_failure(self.trial);
        }
    }
}
