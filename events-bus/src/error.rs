use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Invalid event or subscription: {0}")]
    Validation(String),

    #[error("Event serialization failed: {0}")]
    Serialization(String),

    #[error("Circuit breaker is open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("Rate limit exceeded: at most {max_events} events per {window:?}")]
    RateLimitExceeded { max_events: usize, window: Duration },

    #[error("Event publishing failed: {0}")]
    Publish(String),

    #[error("Event subscription failed: {0}")]
    Subscribe(String),

    #[error("Event broker connection failed: {0}")]
    Connection(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("{failed} of {attempted} events in batch failed, first failure: {first}")]
    Batch {
        failed: usize,
        attempted: usize,
        first: Box<EventBusError>,
    },
}

impl EventBusError {
    /// Broker unavailability, the only error the circuit breaker counts.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Publish(_) | Self::Connection(_))
    }
}

impl From<serde_json::Error> for EventBusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for EventBusError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EventBusError>;
