//! Event bus for decoupled services
//!
//! Producers publish typed events; consumers subscribe by exact event type
//! or by a trailing-wildcard pattern such as `game.*`. The bus provides:
//! - Direct (in-process) and Redis pub/sub transports behind one API
//! - A circuit breaker and a sliding-window rate limiter on the publish path
//! - Concurrent, fault-isolated handler dispatch
//! - A bounded replay buffer of recently published events
//! - Metrics, statistics and a health report
//!
//! # Event Types
//!
//! Event types are dot-separated names (`<domain>.<action>`). The
//! [`catalog`] module lists the types used across services together with
//! their payloads.
//!
//! # Example
//!
//! ```rust,no_run
//! use events_bus::{handler_fn, Event, EventBus, EventBusConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = EventBus::new(EventBusConfig::default())?;
//!     bus.initialize().await?;
//!
//!     bus.subscribe(
//!         "game.*",
//!         handler_fn("leaderboard", |event| async move {
//!             println!("received {}", event.event_type());
//!             Ok(())
//!         }),
//!     )
//!     .await?;
//!
//!     let event = Event::new("game.points_awarded", json!({"user_id": 7, "points": 50}))?;
//!     bus.publish(event).await?;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod catalog;
pub mod circuit_breaker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod handlers;
pub mod metrics;
pub mod pattern;
pub mod rate_limiter;
pub mod registry;
pub mod replay;
pub mod telemetry;
pub mod transport;

pub use bus::*;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use config::*;
pub use error::*;
pub use event::*;
pub use handlers::*;
pub use metrics::{BusStatistics, HealthReport, HealthStatus, MetricsSnapshot};
pub use registry::SubscriptionHandle;
pub use replay::EventQuery;
pub use transport::{DirectTransport, RedisTransport, Transport};
