//! End-to-end bus scenarios
//!
//! Covers routing, unsubscribe, replay eviction, circuit breaking, handler
//! isolation, rate limiting and batch publishing against the direct
//! transport and a controllable in-test transport.

use async_trait::async_trait;
use events_bus::catalog::{self, PointsAwarded};
use events_bus::replay::EventQuery;
use events_bus::transport::Delivery;
use events_bus::*;
use parking_lot::RwLock;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

fn direct_bus() -> EventBus {
    EventBus::new(EventBusConfig::default()).unwrap()
}

fn counting_handler(name: &str, counter: Arc<AtomicUsize>) -> SharedHandler {
    handler_fn(name, move |_event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

fn recording_handler(name: &str, seen: Arc<parking_lot::Mutex<Vec<Event>>>) -> SharedHandler {
    handler_fn(name, move |event| {
        let seen = seen.clone();
        async move {
            seen.lock().push(event);
            Ok(())
        }
    })
}

/// Transport whose broker can be switched on and off from the test.
#[derive(Default)]
struct SwitchableTransport {
    failing: AtomicBool,
    rejecting: AtomicBool,
    refuse_listen: AtomicBool,
    delivery: RwLock<Option<Delivery>>,
    sends: AtomicUsize,
}

#[async_trait]
impl Transport for SwitchableTransport {
    fn name(&self) -> &'static str {
        "switchable"
    }

    fn bind(&self, delivery: Delivery) {
        *self.delivery.write() = Some(delivery);
    }

    async fn connect(&self) -> events_bus::Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn send(&self, event: &Event, _payload: &[u8]) -> events_bus::Result<usize> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EventBusError::Publish("broker unavailable".into()));
        }
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(EventBusError::Serialization("payload refused by codec".into()));
        }
        let delivery = self.delivery.read().clone();
        match delivery {
            Some(delivery) => Ok(delivery.deliver(event).await),
            None => Ok(0),
        }
    }

    async fn listen(&self, key: &str) -> events_bus::Result<()> {
        if self.refuse_listen.load(Ordering::SeqCst) {
            return Err(EventBusError::Connection(format!("cannot listen on {key}")));
        }
        Ok(())
    }

    async fn stop_listening(&self, _key: &str) -> events_bus::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> events_bus::Result<()> {
        Ok(())
    }
}

/// Transport that parks the first send until released.
#[derive(Default)]
struct SlowTransport {
    failing: AtomicBool,
    parked: AtomicUsize,
    release: Notify,
}

#[async_trait]
impl Transport for SlowTransport {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn bind(&self, _delivery: Delivery) {}

    async fn connect(&self) -> events_bus::Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn send(&self, _event: &Event, _payload: &[u8]) -> events_bus::Result<usize> {
        if self.parked.fetch_add(1, Ordering::SeqCst) == 0 {
            self.release.notified().await;
            return Ok(0);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(EventBusError::Publish("broker unavailable".into()));
        }
        Ok(0)
    }

    async fn listen(&self, _key: &str) -> events_bus::Result<()> {
        Ok(())
    }

    async fn stop_listening(&self, _key: &str) -> events_bus::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> events_bus::Result<()> {
        Ok(())
    }
}

/// Transport whose shutdown never completes on its own.
#[derive(Default)]
struct StuckTransport {
    aborted: AtomicBool,
}

#[async_trait]
impl Transport for StuckTransport {
    fn name(&self) -> &'static str {
        "stuck"
    }

    fn bind(&self, _delivery: Delivery) {}

    async fn connect(&self) -> events_bus::Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.aborted.load(Ordering::SeqCst)
    }

    async fn send(&self, _event: &Event, _payload: &[u8]) -> events_bus::Result<usize> {
        Ok(0)
    }

    async fn listen(&self, _key: &str) -> events_bus::Result<()> {
        Ok(())
    }

    async fn stop_listening(&self, _key: &str) -> events_bus::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> events_bus::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_wildcard_subscription_receives_domain_events_only() {
    let bus = direct_bus();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    bus.subscribe(catalog::ALL_GAME, recording_handler("game-feed", seen.clone()))
        .await
        .unwrap();

    for event_type in ["game.points_awarded", "game.level_up", "user.registered"] {
        bus.publish(Event::new(event_type, json!({"user_id": 1})).unwrap())
            .await
            .unwrap();
    }

    let types: Vec<String> = seen.lock().iter().map(|e| e.event_type().to_string()).collect();
    assert_eq!(types, vec!["game.points_awarded", "game.level_up"]);
}

#[tokio::test]
async fn test_exact_and_wildcard_handlers_both_receive() {
    let bus = direct_bus();
    let exact = Arc::new(AtomicUsize::new(0));
    let wildcard = Arc::new(AtomicUsize::new(0));
    bus.subscribe(catalog::LEVEL_UP, counting_handler("exact", exact.clone()))
        .await
        .unwrap();
    bus.subscribe("game.*", counting_handler("wildcard", wildcard.clone()))
        .await
        .unwrap();

    let delivered = bus
        .publish(Event::new(catalog::LEVEL_UP, json!({"level": 3})).unwrap())
        .await
        .unwrap();

    assert_eq!(delivered, 2);
    assert_eq!(exact.load(Ordering::SeqCst), 1);
    assert_eq!(wildcard.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_catalog_payload_survives_the_bus() {
    let bus = direct_bus();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    bus.subscribe(catalog::POINTS_AWARDED, recording_handler("points", seen.clone()))
        .await
        .unwrap();

    let payload = PointsAwarded {
        user_id: 42,
        points: 150,
        reason: Some("quest".into()),
    };
    bus.publish(catalog::points_awarded(&payload, "game-service").unwrap())
        .await
        .unwrap();

    let received = seen.lock().clone();
    assert_eq!(received.len(), 1);
    let decoded: PointsAwarded = catalog::decode(&received[0]).unwrap();
    assert_eq!(decoded, payload);
    assert_eq!(received[0].source(), Some("game-service"));
}

// ============================================================================
// Subscription lifecycle
// ============================================================================

#[tokio::test]
async fn test_unsubscribed_handler_is_not_invoked_again() {
    let bus = direct_bus();
    let counter = Arc::new(AtomicUsize::new(0));
    let handle = bus
        .subscribe("user.registered", counting_handler("welcome-mail", counter.clone()))
        .await
        .unwrap();

    bus.publish(Event::new("user.registered", json!({"user_id": 1})).unwrap())
        .await
        .unwrap();
    bus.unsubscribe(&handle).await.unwrap();
    bus.publish(Event::new("user.registered", json!({"user_id": 2})).unwrap())
        .await
        .unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(bus.subscription_keys().is_empty());

    // second unsubscribe is a no-op
    bus.unsubscribe(&handle).await.unwrap();
}

#[tokio::test]
async fn test_remaining_handlers_keep_the_key_alive() {
    let bus = direct_bus();
    let first = bus
        .subscribe("game.*", handler_fn("a", |_| async { Ok(()) }))
        .await
        .unwrap();
    bus.subscribe("game.*", handler_fn("b", |_| async { Ok(()) }))
        .await
        .unwrap();

    bus.unsubscribe(&first).await.unwrap();

    assert_eq!(bus.handler_count("game.*"), 1);
    assert_eq!(bus.subscription_keys(), vec!["game.*".to_string()]);
}

#[tokio::test]
async fn test_listener_failure_rolls_back_subscription() {
    let transport = Arc::new(SwitchableTransport::default());
    transport.refuse_listen.store(true, Ordering::SeqCst);
    let bus = EventBus::with_transport(EventBusConfig::default(), transport.clone()).unwrap();

    let result = bus
        .subscribe("game.*", handler_fn("h", |_| async { Ok(()) }))
        .await;

    assert!(matches!(result, Err(EventBusError::Subscribe(_))));
    assert_eq!(bus.handler_count("game.*"), 0);
    assert_eq!(bus.health_check().subscriber_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_lets_in_flight_dispatch_finish() {
    let bus = Arc::new(direct_bus());
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());

    let handler = {
        let (started, finished, release) = (started.clone(), finished.clone(), release.clone());
        handler_fn("slow-projection", move |_| {
            let (started, finished, release) = (started.clone(), finished.clone(), release.clone());
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };
    let handle = bus.subscribe("narrative.*", handler).await.unwrap();

    let publisher = {
        let bus = bus.clone();
        tokio::spawn(async move {
            bus.publish(Event::new("narrative.chapter_started", json!({})).unwrap())
                .await
        })
    };
    while started.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    bus.unsubscribe(&handle).await.unwrap();
    release.notify_one();
    assert_eq!(publisher.await.unwrap().unwrap(), 1);

    for _ in 0..100 {
        if finished.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(finished.load(Ordering::SeqCst), 1);

    let delivered = bus
        .publish(Event::new("narrative.chapter_completed", json!({})).unwrap())
        .await
        .unwrap();
    assert_eq!(delivered, 0);
    assert_eq!(started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalid_subscription_keys_are_rejected() {
    let bus = direct_bus();
    for key in ["", "game.*.x", "game events", "ga?e.*", "game.[ab]*"] {
        let result = bus.subscribe(key, handler_fn("h", |_| async { Ok(()) })).await;
        assert!(matches!(result, Err(EventBusError::Validation(_))), "key {key:?}");
    }
}

// ============================================================================
// Replay buffer
// ============================================================================

#[tokio::test]
async fn test_replay_buffer_keeps_most_recent_events() {
    let mut config = EventBusConfig::default();
    config.replay.capacity = 5;
    let bus = EventBus::new(config).unwrap();

    let mut ids = Vec::new();
    for n in 0..8 {
        let event = Event::new("game.points_awarded", json!({"n": n})).unwrap();
        ids.push(event.id().to_string());
        bus.publish(event).await.unwrap();
    }

    let buffered: Vec<String> = bus
        .get_published_events(&EventQuery::all())
        .iter()
        .map(|e| e.id().to_string())
        .collect();
    assert_eq!(buffered, ids[3..].to_vec());

    let latest = bus.get_published_events(&EventQuery::all().limit(2));
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[1].id(), ids[7]);
    assert_eq!(bus.statistics().replay_buffered, 5);
}

#[tokio::test]
async fn test_replay_to_explicit_handlers() {
    let bus = direct_bus();
    for event_type in ["game.level_up", "user.registered", "game.points_awarded"] {
        bus.publish(Event::new(event_type, json!({})).unwrap())
            .await
            .unwrap();
    }

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let replayed = bus
        .replay_events(
            &EventQuery::all().types(["game.*"]),
            Some(vec![recording_handler("audit", seen.clone())]),
        )
        .await
        .unwrap();

    assert_eq!(replayed, 2);
    let types: Vec<String> = seen.lock().iter().map(|e| e.event_type().to_string()).collect();
    assert_eq!(types, vec!["game.level_up", "game.points_awarded"]);
}

#[tokio::test]
async fn test_replay_to_current_subscribers() {
    let bus = direct_bus();
    bus.publish(Event::new("user.registered", json!({"user_id": 9})).unwrap())
        .await
        .unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    bus.subscribe("user.*", counting_handler("late-joiner", counter.clone()))
        .await
        .unwrap();

    let replayed = bus.replay_events(&EventQuery::all(), None).await.unwrap();
    assert_eq!(replayed, 1);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Circuit breaker and health
// ============================================================================

#[tokio::test]
async fn test_circuit_opens_and_recovers() {
    let transport = Arc::new(SwitchableTransport::default());
    let mut config = EventBusConfig::default();
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.recovery_timeout = Duration::from_millis(100);
    let bus = EventBus::with_transport(config, transport.clone()).unwrap();
    assert_eq!(bus.health_check().status, HealthStatus::Healthy);

    transport.failing.store(true, Ordering::SeqCst);
    for _ in 0..2 {
        let result = bus.publish(Event::new("game.level_up", json!({})).unwrap()).await;
        assert!(matches!(result, Err(EventBusError::Publish(_))));
    }

    let health = bus.health_check();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!(health.breaker_state, CircuitState::Open);

    // rejected without touching the transport
    let result = bus.publish(Event::new("game.level_up", json!({})).unwrap()).await;
    assert!(matches!(result, Err(EventBusError::CircuitOpen { .. })));
    assert_eq!(transport.sends.load(Ordering::SeqCst), 2);

    transport.failing.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    bus.publish(Event::new("game.level_up", json!({})).unwrap())
        .await
        .unwrap();

    let health = bus.health_check();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.breaker_state, CircuitState::Closed);
    assert!(health.last_publish_time.is_some());

    let stats = bus.statistics();
    assert_eq!(stats.metrics.published, 1);
    assert_eq!(stats.metrics.failed_publishes, 3);
    assert_eq!(stats.consecutive_failures, 0);
}

#[tokio::test]
async fn test_failed_trial_reopens_circuit() {
    let transport = Arc::new(SwitchableTransport::default());
    let bus = EventBus::with_transport(EventBusConfig::default(), transport.clone()).unwrap();
    bus.configure_circuit_breaker(1, Duration::from_millis(50)).unwrap();

    transport.failing.store(true, Ordering::SeqCst);
    assert!(bus.publish(Event::new("game.level_up", json!({})).unwrap()).await.is_err());
    assert_eq!(bus.health_check().breaker_state, CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let result = bus.publish(Event::new("game.level_up", json!({})).unwrap()).await;
    assert!(matches!(result, Err(EventBusError::Publish(_))));
    assert_eq!(bus.health_check().breaker_state, CircuitState::Open);

    let result = bus.publish(Event::new("game.level_up", json!({})).unwrap()).await;
    assert!(matches!(result, Err(EventBusError::CircuitOpen { .. })));
}

#[tokio::test]
async fn test_non_transport_errors_leave_breaker_alone() {
    let transport = Arc::new(SwitchableTransport::default());
    let bus = EventBus::with_transport(EventBusConfig::default(), transport.clone()).unwrap();
    bus.configure_circuit_breaker(1, Duration::from_secs(60)).unwrap();
    transport.rejecting.store(true, Ordering::SeqCst);

    let result = bus.publish(Event::new("game.level_up", json!({})).unwrap()).await;

    assert!(matches!(result, Err(EventBusError::Serialization(_))));
    let stats = bus.statistics();
    assert_eq!(stats.breaker_state, CircuitState::Closed);
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(stats.metrics.failed_publishes, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishes_cannot_close_open_circuit() {
    let transport = Arc::new(SlowTransport::default());
    let mut config = EventBusConfig::default();
    config.circuit_breaker.failure_threshold = 2;
    let bus = Arc::new(EventBus::with_transport(config, transport.clone()).unwrap());

    // admitted while CLOSED, answered only after the breaker trips
    let slow = {
        let bus = bus.clone();
        tokio::spawn(async move { bus.publish(Event::new("game.level_up", json!({})).unwrap()).await })
    };
    while transport.parked.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    transport.failing.store(true, Ordering::SeqCst);
    for _ in 0..2 {
        assert!(bus.publish(Event::new("game.level_up", json!({})).unwrap()).await.is_err());
    }
    assert_eq!(bus.health_check().breaker_state, CircuitState::Open);

    transport.failing.store(false, Ordering::SeqCst);
    transport.release.notify_one();
    assert!(slow.await.unwrap().is_ok());

    assert_eq!(bus.health_check().breaker_state, CircuitState::Open);
    let result = bus.publish(Event::new("game.level_up", json!({})).unwrap()).await;
    assert!(matches!(result, Err(EventBusError::CircuitOpen { .. })));
}

// ============================================================================
// Handler isolation
// ============================================================================

#[tokio::test]
async fn test_failing_handler_does_not_affect_others() {
    let bus = direct_bus();
    let counter = Arc::new(AtomicUsize::new(0));
    bus.subscribe(
        "narrative.decision_made",
        handler_fn("broken", |_| async { Err::<(), _>(anyhow::anyhow!("storage offline")) }),
    )
    .await
    .unwrap();
    bus.subscribe("narrative.*", counting_handler("healthy", counter.clone()))
        .await
        .unwrap();

    for n in 0..10 {
        bus.publish(Event::new("narrative.decision_made", json!({"n": n})).unwrap())
            .await
            .unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), 10);
    let stats = bus.statistics();
    assert_eq!(stats.metrics.published, 10);
    assert_eq!(stats.metrics.failed_handlers, 10);
    assert_eq!(stats.metrics.handler_invocations, 20);
    assert_eq!(stats.metrics.failed_publishes, 0);
    assert_eq!(stats.metrics.events_by_type.get("narrative.decision_made"), Some(&10));
}

// ============================================================================
// Rate limiting and batches
// ============================================================================

#[tokio::test]
async fn test_rate_limit_window_slides() {
    let bus = direct_bus();
    bus.configure_rate_limit(3, Duration::from_millis(200)).unwrap();

    for _ in 0..3 {
        bus.publish(Event::new("game.level_up", json!({})).unwrap())
            .await
            .unwrap();
    }
    let result = bus.publish(Event::new("game.level_up", json!({})).unwrap()).await;
    assert!(matches!(
        result,
        Err(EventBusError::RateLimitExceeded { max_events: 3, .. })
    ));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(bus.publish(Event::new("game.level_up", json!({})).unwrap()).await.is_ok());
}

#[tokio::test]
async fn test_batch_reports_partial_failure() {
    let bus = direct_bus();
    let counter = Arc::new(AtomicUsize::new(0));
    bus.subscribe("game.*", counting_handler("h", counter.clone()))
        .await
        .unwrap();
    bus.configure_rate_limit(2, Duration::from_secs(60)).unwrap();

    let events: Vec<Event> = (0..3)
        .map(|n| Event::new("game.points_awarded", json!({"n": n})).unwrap())
        .collect();

    match bus.publish_batch(events).await {
        Err(EventBusError::Batch {
            failed,
            attempted,
            first,
        }) => {
            assert_eq!(failed, 1);
            assert_eq!(attempted, 3);
            assert!(matches!(*first, EventBusError::RateLimitExceeded { .. }));
        }
        other => panic!("expected batch failure, got {other:?}"),
    }
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_batch_success_sums_deliveries() {
    let bus = direct_bus();
    bus.subscribe("game.*", handler_fn("a", |_| async { Ok(()) }))
        .await
        .unwrap();
    bus.subscribe("game.*", handler_fn("b", |_| async { Ok(()) }))
        .await
        .unwrap();

    let events = vec![
        Event::new("game.level_up", json!({})).unwrap(),
        Event::new("game.streak_updated", json!({})).unwrap(),
    ];
    assert_eq!(bus.publish_batch(events).await.unwrap(), 4);
    assert_eq!(bus.publish_batch(Vec::new()).await.unwrap(), 0);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_clears_subscriptions() {
    let bus = direct_bus();
    let counter = Arc::new(AtomicUsize::new(0));
    bus.subscribe("user.*", counting_handler("h", counter.clone()))
        .await
        .unwrap();

    bus.shutdown(Duration::from_secs(1)).await.unwrap();
    bus.initialize().await.unwrap();
    bus.publish(Event::new("user.deleted", json!({})).unwrap())
        .await
        .unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(bus.health_check().subscriber_count, 0);
}

#[tokio::test]
async fn test_shutdown_forces_cleanup_after_timeout() {
    let transport = Arc::new(StuckTransport::default());
    let bus = EventBus::with_transport(EventBusConfig::default(), transport.clone()).unwrap();
    bus.subscribe("user.*", handler_fn("h", |_| async { Ok(()) }))
        .await
        .unwrap();

    let started = Instant::now();
    bus.shutdown(Duration::from_millis(50)).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(transport.aborted.load(Ordering::SeqCst));
    assert!(bus.subscription_keys().is_empty());
    assert_eq!(bus.health_check().status, HealthStatus::Unhealthy);
}
