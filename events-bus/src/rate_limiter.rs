//! Sliding-window admission control for publishes on one bus.
//!
//! Keeps the instants of admitted publishes; an attempt is rejected while
//! `max_events` admissions already fall inside the trailing window.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::RateLimiterConfig;
use crate::error::{EventBusError, Result};

#[derive(Debug)]
struct Window {
    limit: Option<RateLimiterConfig>,
    admitted: VecDeque<Instant>,
}

/// Rate limiter shared by every publish on a bus
#[derive(Debug)]
pub struct RateLimiter {
    window: Mutex<Window>,
}

impl RateLimiter {
    /// `None` disables limiting.
    pub fn new(config: Option<RateLimiterConfig>) -> Self {
        Self {
            window: Mutex::new(Window {
                limit: config,
                admitted: VecDeque::new(),
            }),
        }
    }

    pub fn admit(&self) -> Result<()> {
        self.admit_at(Instant::now())
    }

    fn admit_at(&self, now: Instant) -> Result<()> {
        let mut window = self.window.lock();
        let Some(limit) = window.limit.clone() else {
            return Ok(());
        };

        while let Some(oldest) = window.admitted.front() {
            if now.saturating_duration_since(*oldest) >= limit.window {
                window.admitted.pop_front();
            } else {
                break;
            }
        }

        if window.admitted.len() >= limit.max_events {
            debug!(
                max_events = limit.max_events,
                window_ms = limit.window.as_millis() as u64,
                "Publish rejected by rate limiter"
            );
            return Err(EventBusError::RateLimitExceeded {
                max_events: limit.max_events,
                window: limit.window,
            });
        }

        window.admitted.push_back(now);
        Ok(())
    }

    /// Replace the limit; admissions recorded so far are kept.
    pub fn configure(&self, max_events: usize, window: Duration) {
        self.window.lock().limit = Some(RateLimiterConfig { max_events, window });
    }

    pub fn disable(&self) {
        let mut guard = self.window.lock();
        guard.limit = None;
        guard.admitted.clear();
    }

    pub fn config(&self) -> Option<RateLimiterConfig> {
        self.window.lock().limit.clone()
    }
}
