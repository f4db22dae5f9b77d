//! Concurrent fan-out of one event to its handlers.
//!
//! Each handler runs in its own task on a private clone of the event. A
//! failing or panicking handler is logged and counted, never propagated.
//! The caller waits for all handlers up to `max_wait`; past that the wait
//! is abandoned, the handlers keep running, and their outcome is still
//! recorded when they finish.

use futures::future::join_all;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::event::Event;
use crate::handlers::SharedHandler;
use crate::metrics::BusMetrics;

#[derive(Debug)]
pub struct Dispatcher {
    metrics: Arc<BusMetrics>,
    max_wait: Duration,
}

impl Dispatcher {
    pub fn new(metrics: Arc<BusMetrics>, max_wait: Duration) -> Self {
        Self { metrics, max_wait }
    }

    /// Deliver `event` to every handler. Returns the number of handlers the
    /// event was handed to.
    pub async fn dispatch(&self, event: &Event, handlers: Vec<SharedHandler>) -> usize {
        let count = handlers.len();
        if count == 0 {
            debug!(event_id = event.id(), event_type = event.event_type(), "No handlers matched");
            return 0;
        }

        let tasks: Vec<_> = handlers
            .into_iter()
            .map(|handler| {
                let event = event.clone();
                let metrics = self.metrics.clone();
                tokio::spawn(invoke(handler, event, metrics))
            })
            .collect();

        if tokio::time::timeout(self.max_wait, join_all(tasks)).await.is_err() {
            warn!(
                event_id = event.id(),
                event_type = event.event_type(),
                max_wait_ms = self.max_wait.as_millis() as u64,
                "Handlers still running, continuing in background"
            );
        }
        count
    }
}

async fn invoke(handler: SharedHandler, event: Event, metrics: Arc<BusMetrics>) {
    let name = handler.name().to_string();
    let event_id = event.id().to_string();
    let event_type = event.event_type().to_string();
    let started = Instant::now();

    let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
    let elapsed = started.elapsed();

    let succeeded = match outcome {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(handler = %name, event_id = %event_id, event_type = %event_type, error = %e, "Handler failed");
            false
        }
        Err(_) => {
            warn!(handler = %name, event_id = %event_id, event_type = %event_type, "Handler panicked");
            false
        }
    };
    metrics.record_handler(elapsed, succeeded);
}
