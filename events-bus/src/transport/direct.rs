use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use super::{Delivery, Transport};
use crate::error::{EventBusError, Result};
use crate::event::Event;

/// In-process transport. `send` dispatches straight to the registry
/// snapshot taken at call time, so listeners are not needed.
pub struct DirectTransport {
    delivery: RwLock<Option<Delivery>>,
    connected: AtomicBool,
}

impl DirectTransport {
    pub fn new() -> Self {
        Self {
            delivery: RwLock::new(None),
            connected: AtomicBool::new(true),
        }
    }
}

impl Default for DirectTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn bind(&self, delivery: Delivery) {
        *self.delivery.write() = Some(delivery);
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, event: &Event, _payload: &[u8]) -> Result<usize> {
        if !self.is_connected() {
            return Err(EventBusError::Publish("direct transport is shut down".into()));
        }
        let delivery = self.delivery.read().clone();
        match delivery {
            Some(delivery) => Ok(delivery.deliver(event).await),
            None => {
                debug!(event_type = event.event_type(), "Direct transport not bound, event dropped");
                Ok(0)
            }
        }
    }

    async fn listen(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn stop_listening(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
