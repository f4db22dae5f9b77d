// Event types and structures
use chrono::{DateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use uuid::Uuid;

use crate::error::{EventBusError, Result};

/// Default ceiling for the serialized `data` payload of a single event.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

lazy_static! {
    static ref EVENT_TYPE: Regex =
        Regex::new(r"^[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+)+$").expect("event type pattern is valid");
}

/// Delivery priority carried alongside an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Immutable record of something that happened in one of the services.
///
/// Two events are equal when their ids are equal. Once built, the id and
/// type cannot change; handlers always receive their own clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    timestamp: DateTime<Utc>,
    #[serde(default = "empty_object")]
    data: serde_json::Value,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    priority: EventPriority,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Event {
    /// Build an event with generated id and timestamp and default options.
    pub fn new(event_type: &str, data: serde_json::Value) -> Result<Self> {
        Self::builder(event_type).data(data).build()
    }

    pub fn builder(event_type: &str) -> EventBuilder {
        EventBuilder::new(event_type)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn priority(&self) -> EventPriority {
        self.priority
    }

    /// Start a follow-up event that shares this event's correlation id.
    ///
    /// When this event has no correlation id, its own id becomes the
    /// correlation id of the follow-up.
    pub fn caused_by(&self, event_type: &str) -> EventBuilder {
        let correlation = self
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.id.clone());
        EventBuilder::new(event_type).correlation_id(correlation)
    }

    /// Check the type format and the payload ceiling.
    pub fn validate(&self, max_payload_bytes: usize) -> Result<()> {
        validate_event_type(&self.event_type)?;
        if self.id.trim().is_empty() {
            return Err(EventBusError::Validation("event id must not be empty".into()));
        }
        let size = payload_size(&self.data)?;
        if size > max_payload_bytes {
            return Err(EventBusError::Validation(format!(
                "payload of {} is {} bytes, limit is {} bytes",
                self.event_type, size, max_payload_bytes
            )));
        }
        Ok(())
    }

    /// Encode as the flat JSON document used on the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a wire document. Unknown fields are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let event: Event = serde_json::from_slice(bytes)?;
        if event.id.is_empty() {
            return Err(EventBusError::Serialization("missing event id".into()));
        }
        validate_event_type(&event.event_type)
            .map_err(|e| EventBusError::Serialization(e.to_string()))?;
        Ok(event)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Optional attributes for a new [`Event`].
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event_type: String,
    id: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    data: serde_json::Value,
    correlation_id: Option<String>,
    source: Option<String>,
    priority: EventPriority,
    max_payload_bytes: usize,
}

impl EventBuilder {
    fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            id: None,
            timestamp: None,
            data: empty_object(),
            correlation_id: None,
            source: None,
            priority: EventPriority::default(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Serialize any payload type into the event's data tree.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.data = serde_json::to_value(payload)
            .map_err(|e| EventBusError::Validation(format!("payload is not serializable: {e}")))?;
        Ok(self)
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn timestamp<Tz: TimeZone>(mut self, timestamp: DateTime<Tz>) -> Self {
        self.timestamp = Some(timestamp.with_timezone(&Utc));
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = limit;
        self
    }

    pub fn build(self) -> Result<Event> {
        let event = Event {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            event_type: self.event_type,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            data: self.data,
            correlation_id: self.correlation_id,
            source: self.source,
            priority: self.priority,
        };
        event.validate(self.max_payload_bytes)?;
        Ok(event)
    }
}

/// Event types are dot separated namespaces such as `game.points_awarded`.
pub fn validate_event_type(event_type: &str) -> Result<()> {
    if event_type.is_empty() {
        return Err(EventBusError::Validation("event type must not be empty".into()));
    }
    if !EVENT_TYPE.is_match(event_type) {
        return Err(EventBusError::Validation(format!(
            "event type {event_type:?} must look like segment.segment"
        )));
    }
    Ok(())
}

fn payload_size(data: &serde_json::Value) -> Result<usize> {
    let bytes = serde_json::to_vec(data)
        .map_err(|e| EventBusError::Validation(format!("payload is not serializable: {e}")))?;
    Ok(bytes.len())
}
