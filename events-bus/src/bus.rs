//! The event bus: publish pipeline, subscription API and operational
//! queries over one transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{EventBusConfig, TransportConfig};
use crate::dispatch::Dispatcher;
use crate::error::{EventBusError, Result};
use crate::event::Event;
use crate::handlers::SharedHandler;
use crate::metrics::{BusMetrics, BusStatistics, HealthReport, HealthStatus};
use crate::rate_limiter::RateLimiter;
use crate::registry::{SubscriptionHandle, SubscriptionRegistry};
use crate::replay::{EventQuery, ReplayBuffer};
use crate::transport::{Delivery, DirectTransport, RedisTransport, Transport};

/// Event bus owning all routing, protection and bookkeeping state.
///
/// Every instance is independent; nothing is process global.
pub struct EventBus {
    config: EventBusConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    replay: ReplayBuffer,
    metrics: Arc<BusMetrics>,
    /// Serializes listener start/stop against registry changes.
    lifecycle: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl EventBus {
    /// Build a bus with the transport named in `config`.
    pub fn new(config: EventBusConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = match &config.transport {
            TransportConfig::Direct => Arc::new(DirectTransport::new()),
            TransportConfig::Redis {
                url,
                channel_prefix,
            } => Arc::new(RedisTransport::new(url, channel_prefix)?),
        };
        Self::with_transport(config, transport)
    }

    /// Build a bus over a caller supplied transport.
    pub fn with_transport(config: EventBusConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(BusMetrics::new());
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(metrics.clone(), config.dispatch.max_wait));
        transport.bind(Delivery::new(registry.clone(), dispatcher.clone()));

        Ok(Self {
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            limiter: RateLimiter::new(config.rate_limit.clone()),
            replay: ReplayBuffer::new(config.replay.capacity),
            config,
            transport,
            registry,
            dispatcher,
            metrics,
            lifecycle: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    // =============================================================================
    // Lifecycle
    // =============================================================================

    /// Connect the transport. Does nothing when already connected.
    pub async fn initialize(&self) -> Result<()> {
        if self.transport.is_connected() && !self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.transport.connect().await?;
        self.closed.store(false, Ordering::SeqCst);
        info!(transport = self.transport.name(), "Event bus initialized");
        Ok(())
    }

    /// Drop every subscription, stop listeners and release the transport.
    ///
    /// When cleanup does not finish within `timeout`, remaining listeners
    /// are aborted.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);

        let graceful = async {
            let _guard = self.lifecycle.lock().await;
            let keys = self.registry.clear();
            debug!(keys = keys.len(), "Subscriptions cleared");
            self.transport.shutdown().await
        };

        match tokio::time::timeout(timeout, graceful).await {
            Ok(result) => {
                info!(transport = self.transport.name(), "Event bus shut down");
                result
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Event bus shutdown timed out, forcing cleanup"
                );
                self.registry.clear();
                self.transport.abort();
                Ok(())
            }
        }
    }

    // =============================================================================
    // Producer API
    // =============================================================================

    /// Publish one event. Returns how many receivers it reached: local
    /// handlers in direct mode, broker subscribers in broker mode.
    pub async fn publish(&self, event: Event) -> Result<usize> {
        let started = Instant::now();
        event.validate(self.config.max_payload_bytes)?;

        let outcome = self.publish_validated(event, started).await;
        if outcome.is_err() {
            self.metrics.record_failed_publish();
        }
        outcome
    }

    async fn publish_validated(&self, event: Event, started: Instant) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventBusError::Publish("event bus is shut down".into()));
        }

        let permit = self.breaker.acquire()?;
        if let Err(e) = self.limiter.admit() {
            warn!(event_type = event.event_type(), "Publish rejected by rate limiter");
            return Err(e);
        }
        let payload = event.to_bytes()?;

        let delivered = match self.transport.send(&event, &payload).await {
            Ok(delivered) => {
                permit.success();
                delivered
            }
            Err(e) if e.is_transport_failure() => {
                permit.failure();
                error!(
                    event_id = event.id(),
                    event_type = event.event_type(),
                    transport = self.transport.name(),
                    error = %e,
                    "Transport failed to publish event"
                );
                return Err(match e {
                    EventBusError::Publish(_) => e,
                    other => EventBusError::Publish(other.to_string()),
                });
            }
            Err(e) => {
                // not a broker health signal; a trial permit gives its slot back on drop
                warn!(
                    event_id = event.id(),
                    event_type = event.event_type(),
                    error = %e,
                    "Transport rejected event"
                );
                return Err(e);
            }
        };

        let latency = started.elapsed();
        self.metrics.record_publish(event.event_type(), latency);
        debug!(
            event_id = event.id(),
            event_type = event.event_type(),
            delivered,
            latency_us = latency.as_micros() as u64,
            "Event published"
        );
        self.replay.append(event);
        Ok(delivered)
    }

    /// Publish events one after another. Every event is attempted; when any
    /// fail the result is a [`EventBusError::Batch`] carrying the first
    /// failure. Returns the summed delivery count otherwise.
    pub async fn publish_batch(&self, events: Vec<Event>) -> Result<usize> {
        let attempted = events.len();
        let mut delivered = 0;
        let mut failed = 0;
        let mut first = None;

        for event in events {
            let event_id = event.id().to_string();
            match self.publish(event).await {
                Ok(count) => delivered += count,
                Err(e) => {
                    debug!(event_id = %event_id, error = %e, "Batch member failed");
                    failed += 1;
                    first.get_or_insert(e);
                }
            }
        }

        match first {
            None => Ok(delivered),
            Some(first) => Err(EventBusError::Batch {
                failed,
                attempted,
                first: Box::new(first),
            }),
        }
    }

    // =============================================================================
    // Consumer API
    // =============================================================================

    /// Register `handler` for an exact event type or a `prefix*` pattern.
    pub async fn subscribe(&self, key: &str, handler: SharedHandler) -> Result<SubscriptionHandle> {
        let _guard = self.lifecycle.lock().await;
        let handler_name = handler.name().to_string();
        let (handle, first) = self.registry.subscribe(key, handler)?;

        if first {
            if let Err(e) = self.transport.listen(key).await {
                self.registry.unsubscribe(&handle);
                error!(key = %key, error = %e, "Listener setup failed");
                return Err(match e {
                    EventBusError::Subscribe(_) => e,
                    other => EventBusError::Subscribe(other.to_string()),
                });
            }
        }

        info!(key = %key, handler = %handler_name, subscription_id = %handle.id(), "Subscribed");
        Ok(handle)
    }

    /// Remove a subscription. Unknown or repeated handles are ignored. When
    /// the last handler of a key goes, its listener is released before this
    /// returns.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let removal = self.registry.unsubscribe(handle);
        if !removal.removed {
            return Ok(());
        }

        if removal.key_emptied {
            self.transport
                .stop_listening(handle.key())
                .await
                .map_err(|e| match e {
                    EventBusError::Subscribe(_) => e,
                    other => EventBusError::Subscribe(other.to_string()),
                })?;
        }
        info!(key = handle.key(), subscription_id = %handle.id(), "Unsubscribed");
        Ok(())
    }

    pub fn subscription_keys(&self) -> Vec<String> {
        self.registry.keys()
    }

    pub fn handler_count(&self, key: &str) -> usize {
        self.registry.handler_count(key)
    }

    // =============================================================================
    // Operational API
    // =============================================================================

    pub fn health_check(&self) -> HealthReport {
        let transport_connected = self.transport.is_connected() && !self.closed.load(Ordering::SeqCst);
        let breaker_state = self.breaker.state();
        HealthReport {
            status: HealthStatus::derive(transport_connected, breaker_state),
            transport_connected,
            subscriber_count: self.registry.subscriber_count(),
            breaker_state,
            last_publish_time: self.metrics.last_publish_time(),
        }
    }

    pub fn statistics(&self) -> BusStatistics {
        BusStatistics {
            metrics: self.metrics.snapshot(self.registry.subscriber_count()),
            breaker_state: self.breaker.state(),
            consecutive_failures: self.breaker.consecutive_failures(),
            active_subscriptions: self.registry.key_count(),
            replay_buffered: self.replay.len(),
        }
    }

    pub fn get_published_events(&self, query: &EventQuery) -> Vec<Event> {
        self.replay.query(query)
    }

    /// Re-dispatch buffered events matching `query`, oldest first, either
    /// to `targets` or to the handlers currently subscribed to each event.
    /// Returns the number of events replayed.
    pub async fn replay_events(&self, query: &EventQuery, targets: Option<Vec<SharedHandler>>) -> Result<usize> {
        let events = self.replay.query(query);
        for event in &events {
            let handlers = match &targets {
                Some(targets) => targets.clone(),
                None => self.registry.matching_handlers(event.event_type()),
            };
            self.dispatcher.dispatch(event, handlers).await;
        }
        info!(replayed = events.len(), "Replayed buffered events");
        Ok(events.len())
    }

    pub fn configure_rate_limit(&self, max_events: usize, window: Duration) -> Result<()> {
        if max_events == 0 || window.is_zero() {
            return Err(EventBusError::Validation(
                "rate limit needs max_events >= 1 and a non-zero window".into(),
            ));
        }
        self.limiter.configure(max_events, window);
        info!(max_events, window_ms = window.as_millis() as u64, "Rate limit configured");
        Ok(())
    }

    pub fn disable_rate_limit(&self) {
        self.limiter.disable();
        info!("Rate limit disabled");
    }

    pub fn configure_circuit_breaker(&self, failure_threshold: u32, recovery_timeout: Duration) -> Result<()> {
        if failure_threshold == 0 {
            return Err(EventBusError::Validation(
                "circuit breaker threshold must be at least 1".into(),
            ));
        }
        self.breaker.configure(failure_threshold, recovery_timeout);
        info!(
            failure_threshold,
            recovery_timeout_ms = recovery_timeout.as_millis() as u64,
            "Circuit breaker configured"
        );
        Ok(())
    }
}
