//! Bounded history of published events for inspection and replay.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::event::Event;
use crate::pattern::matches;

/// Filter over buffered events.
///
/// `types` entries are subscription keys, so `"game.*"` selects every game
/// event. `since` is an inclusive lower bound on the event timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub limit: Option<usize>,
    pub types: Option<Vec<String>>,
    pub since: Option<DateTime<Utc>>,
}

impl EventQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        let type_ok = self.types.as_ref().map_or(true, |types| {
            types.iter().any(|key| matches(event.event_type(), key))
        });
        let time_ok = self.since.map_or(true, |since| event.timestamp() >= since);
        type_ok && time_ok
    }
}

#[derive(Debug)]
pub struct ReplayBuffer {
    events: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Push to the tail, evicting the oldest entry when full.
    pub fn append(&self, event: Event) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// The most recent `limit` matches, oldest first.
    pub fn query(&self, query: &EventQuery) -> Vec<Event> {
        let events = self.events.lock();
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut selected: Vec<Event> = events
            .iter()
            .rev()
            .filter(|event| query.matches(event))
            .take(limit)
            .cloned()
            .collect();
        selected.reverse();
        selected
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }
}
