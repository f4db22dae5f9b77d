//! Publish/dispatch counters, latency averages and health derivation.
//!
//! Every recorder is lock-free or holds a lock only for a single arithmetic
//! update, so reading a snapshot never waits on the publish path.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::circuit_breaker::CircuitState;

/// Smoothing factor for latency moving averages.
pub const EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Default)]
struct Ema {
    value: Mutex<Option<f64>>,
}

impl Ema {
    fn record(&self, sample_ms: f64) {
        let mut value = self.value.lock();
        *value = Some(match *value {
            Some(avg) => EMA_ALPHA * sample_ms + (1.0 - EMA_ALPHA) * avg,
            None => sample_ms,
        });
    }

    fn get(&self) -> f64 {
        self.value.lock().unwrap_or(0.0)
    }
}

#[derive(Debug, Default)]
pub struct BusMetrics {
    published: AtomicU64,
    failed_publishes: AtomicU64,
    handler_invocations: AtomicU64,
    failed_handlers: AtomicU64,
    by_type: DashMap<String, u64>,
    publish_latency: Ema,
    handler_latency: Ema,
    last_publish: RwLock<Option<DateTime<Utc>>>,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_publish(&self, event_type: &str, latency: Duration) {
        self.published.fetch_add(1, Ordering::Relaxed);
        *self.by_type.entry(event_type.to_string()).or_insert(0) += 1;
        self.publish_latency.record(millis(latency));
        *self.last_publish.write() = Some(Utc::now());
    }

    pub fn record_failed_publish(&self) {
        self.failed_publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler(&self, latency: Duration, succeeded: bool) {
        self.handler_invocations.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.failed_handlers.fetch_add(1, Ordering::Relaxed);
        }
        self.handler_latency.record(millis(latency));
    }

    pub fn last_publish_time(&self) -> Option<DateTime<Utc>> {
        *self.last_publish.read()
    }

    pub fn snapshot(&self, subscribers: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            failed_publishes: self.failed_publishes.load(Ordering::Relaxed),
            failed_handlers: self.failed_handlers.load(Ordering::Relaxed),
            handler_invocations: self.handler_invocations.load(Ordering::Relaxed),
            subscribers,
            avg_publish_ms: self.publish_latency.get(),
            avg_handler_ms: self.handler_latency.get(),
            events_by_type: self
                .by_type
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            last_publish_time: self.last_publish_time(),
        }
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Point-in-time copy of the bus counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub failed_publishes: u64,
    pub failed_handlers: u64,
    pub handler_invocations: u64,
    pub subscribers: usize,
    pub avg_publish_ms: f64,
    pub avg_handler_ms: f64,
    pub events_by_type: BTreeMap<String, u64>,
    pub last_publish_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn derive(transport_connected: bool, breaker: CircuitState) -> Self {
        match (transport_connected, breaker) {
            (true, CircuitState::Closed) => Self::Healthy,
            (true, CircuitState::HalfOpen) => Self::Degraded,
            _ => Self::Unhealthy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub transport_connected: bool,
    pub subscriber_count: usize,
    pub breaker_state: CircuitState,
    pub last_publish_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusStatistics {
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    pub breaker_state: CircuitState,
    pub consecutive_failures: u32,
    pub active_subscriptions: usize,
    pub replay_buffered: usize,
}
