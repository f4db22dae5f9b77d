//! Pluggable carrier between publishers and the dispatch engine.
//!
//! - [`DirectTransport`]: in-process, delivery happens inside `send`.
//! - [`RedisTransport`]: Redis pub/sub, one channel per event type and one
//!   listener per subscription key.

use async_trait::async_trait;
use std::sync::Arc;

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::event::Event;
use crate::registry::SubscriptionRegistry;

pub mod direct;
pub mod redis_pubsub;

pub use direct::DirectTransport;
pub use redis_pubsub::RedisTransport;

/// Route from a transport back into the bus: registry lookup followed by
/// dispatch.
#[derive(Clone)]
pub struct Delivery {
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
}

impl Delivery {
    pub fn new(registry: Arc<SubscriptionRegistry>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    /// Dispatch to every handler whose key matches the event type.
    pub async fn deliver(&self, event: &Event) -> usize {
        let handlers = self.registry.matching_handlers(event.event_type());
        self.dispatcher.dispatch(event, handlers).await
    }

    /// Dispatch to the handlers registered under exactly `key`.
    pub async fn deliver_to_key(&self, key: &str, event: &Event) -> usize {
        let handlers = self.registry.handlers_for_key(key);
        self.dispatcher.dispatch(event, handlers).await
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Attach the bus this transport delivers into. Called once by the bus.
    fn bind(&self, delivery: Delivery);

    /// Establish the connection. Calling it again while connected is a no-op.
    async fn connect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Carry one event. `payload` is the event's wire encoding. Returns the
    /// number of receivers the transport reached.
    async fn send(&self, event: &Event, payload: &[u8]) -> Result<usize>;

    /// Start receiving events for a subscription key.
    async fn listen(&self, key: &str) -> Result<()>;

    /// Stop the listener for `key` and release its channel before returning.
    async fn stop_listening(&self, key: &str) -> Result<()>;

    /// Stop every listener and drop the connection.
    async fn shutdown(&self) -> Result<()>;

    /// Forced cleanup after a shutdown that ran out of time.
    fn abort(&self) {}
}
