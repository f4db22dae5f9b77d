//! Subscription registry: subscription key -> ordered handlers.
//!
//! Reads hand out owned snapshots, so a dispatch in progress never observes
//! a concurrent subscribe or unsubscribe.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::Result;
use crate::handlers::SharedHandler;
use crate::pattern::{is_wildcard, matches, validate_key};

/// Opaque handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: Uuid,
    key: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub key: String,
    pub handler: SharedHandler,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("handler", &self.handler.name())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Result of removing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub removed: bool,
    /// The key has no handlers left.
    pub key_emptied: bool,
}

#[derive(Debug, Default)]
struct Keys {
    exact: BTreeMap<String, Vec<Subscription>>,
    wildcard: BTreeMap<String, Vec<Subscription>>,
}

impl Keys {
    fn table(&mut self, key: &str) -> &mut BTreeMap<String, Vec<Subscription>> {
        if is_wildcard(key) {
            &mut self.wildcard
        } else {
            &mut self.exact
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    keys: RwLock<Keys>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `key`. The flag is true when this is the
    /// first handler for the key.
    pub fn subscribe(&self, key: &str, handler: SharedHandler) -> Result<(SubscriptionHandle, bool)> {
        validate_key(key)?;
        let subscription = Subscription {
            id: Uuid::new_v4(),
            key: key.to_string(),
            handler,
            created_at: Utc::now(),
        };
        let handle = SubscriptionHandle {
            id: subscription.id,
            key: subscription.key.clone(),
        };

        let mut keys = self.keys.write();
        let subscribers = keys.table(key).entry(key.to_string()).or_default();
        let first = subscribers.is_empty();
        subscribers.push(subscription);
        Ok((handle, first))
    }

    /// Removing an unknown or already removed handle is a no-op.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> Removal {
        let mut keys = self.keys.write();
        let table = keys.table(&handle.key);
        let Some(subscribers) = table.get_mut(&handle.key) else {
            return Removal {
                removed: false,
                key_emptied: false,
            };
        };

        let before = subscribers.len();
        subscribers.retain(|s| s.id != handle.id);
        let removed = subscribers.len() != before;
        let key_emptied = removed && subscribers.is_empty();
        if subscribers.is_empty() {
            table.remove(&handle.key);
        }
        Removal {
            removed,
            key_emptied,
        }
    }

    /// Handlers for `channel`: exact subscribers first, then every matching
    /// wildcard key in key order.
    pub fn matching_handlers(&self, channel: &str) -> Vec<SharedHandler> {
        let keys = self.keys.read();
        let exact = keys.exact.get(channel).into_iter().flatten();
        let wildcard = keys
            .wildcard
            .iter()
            .filter(|(pattern, _)| matches(channel, pattern))
            .flat_map(|(_, subscribers)| subscribers);

        exact.chain(wildcard).map(|s| s.handler.clone()).collect()
    }

    /// Handlers registered under exactly `key`.
    pub fn handlers_for_key(&self, key: &str) -> Vec<SharedHandler> {
        let keys = self.keys.read();
        let table = if is_wildcard(key) { &keys.wildcard } else { &keys.exact };
        table
            .get(key)
            .map(|subscribers| subscribers.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<String> {
        let keys = self.keys.read();
        keys.exact.keys().chain(keys.wildcard.keys()).cloned().collect()
    }

    pub fn handler_count(&self, key: &str) -> usize {
        let keys = self.keys.read();
        let table = if is_wildcard(key) { &keys.wildcard } else { &keys.exact };
        table.get(key).map_or(0, Vec::len)
    }

    /// Total handlers across all keys.
    pub fn subscriber_count(&self) -> usize {
        let keys = self.keys.read();
        keys.exact.values().chain(keys.wildcard.values()).map(Vec::len).sum()
    }

    pub fn key_count(&self) -> usize {
        let keys = self.keys.read();
        keys.exact.len() + keys.wildcard.len()
    }

    /// Drop every subscription, returning the keys that were active.
    pub fn clear(&self) -> Vec<String> {
        let mut keys = self.keys.write();
        let active = keys.exact.keys().chain(keys.wildcard.keys()).cloned().collect();
        *keys = Keys::default();
        active
    }
}
