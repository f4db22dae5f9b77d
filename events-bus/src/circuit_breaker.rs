//! Circuit breaker guarding the transport.
//!
//! # States
//!
//! ```text
//!            failure_threshold failures        recovery_timeout elapsed
//!  ┌──────────┐ ─────────────► ┌──────────┐ ─────────────► ┌───────────┐
//!  │  CLOSED  │                │   OPEN   │                │ HALF_OPEN │
//!  └──────────┘ ◄───────────── └──────────┘ ◄───────────── └───────────┘
//!        ▲        (never direct)      trial failed               │
//!        └───────────────────── trial succeeded ─────────────────┘
//! ```
//!
//! HALF_OPEN admits exactly one trial publish. Callers hold a
//! [`BreakerPermit`] for the duration of the transport call and report the
//! outcome on it; a permit dropped without an outcome gives the trial slot
//! back.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{EventBusError, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                config,
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Ask to call the transport.
    ///
    /// Fails with [`EventBusError::CircuitOpen`] while the recovery timeout
    /// has not elapsed, or while another caller holds the HALF_OPEN trial.
    pub fn acquire(&self) -> Result<BreakerPermit<'_>> {
        self.acquire_at(Instant::now())
    }

    fn acquire_at(&self, now: Instant) -> Result<BreakerPermit<'_>> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit::new(self, false)),
            CircuitState::Open => {
                let timeout = inner.config.recovery_timeout;
                let elapsed = inner
                    .last_failure
                    .map_or(timeout, |at| now.saturating_duration_since(at));
                if elapsed >= timeout {
                    info!("Circuit breaker transitioning to half_open");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(BreakerPermit::new(self, true))
                } else {
                    debug!(
                        remaining_ms = (timeout - elapsed).as_millis() as u64,
                        "Circuit breaker is open, rejecting publish"
                    );
                    Err(EventBusError::CircuitOpen {
                        retry_after: timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(EventBusError::CircuitOpen {
                        retry_after: Duration::ZERO,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(BreakerPermit::new(self, true))
                }
            }
        }
    }

    /// Only the HALF_OPEN trial may leave HALF_OPEN; outcomes of permits
    /// granted while CLOSED are ignored once the breaker has tripped.
    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen if trial => {
                info!("Circuit breaker closed after successful trial");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.trial_in_flight = false;
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                debug!(state = %inner.state, "Ignoring late success from a pre-trip publish");
            }
        }
    }

    fn on_failure(&self, now: Instant, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.last_failure = Some(now);
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= inner.config.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        threshold = inner.config.failure_threshold,
                        "Circuit breaker opened"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen if trial => {
                warn!("Circuit breaker trial failed, reopening");
                inner.last_failure = Some(now);
                inner.state = CircuitState::Open;
                inner.consecutive_failures = 0;
                inner.trial_in_flight = false;
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                debug!(state = %inner.state, "Ignoring late failure from a pre-trip publish");
            }
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.inner.lock().config.clone()
    }

    /// Change thresholds at runtime. The current state is kept; a CLOSED
    /// breaker already past the new threshold opens on its next failure.
    pub fn configure(&self, failure_threshold: u32, recovery_timeout: Duration) {
        let mut inner = self.inner.lock();
        inner.config.failure_threshold = failure_threshold.max(1);
        inner.config.recovery_timeout = recovery_timeout;
    }
}

/// Permission to make one transport call.
#[must_use = "report the transport outcome with success() or failure()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    reported: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            reported: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.reported = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.on_failure(Instant::now(), self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.reported && self.trial {
            self.breaker.release_trial();
        }
    }
}
