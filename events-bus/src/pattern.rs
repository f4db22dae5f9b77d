//! Channel matching for exact and wildcard subscription keys.
//!
//! A key ending in `*` matches every channel that starts with the literal
//! text before the `*`. Matching is plain prefix comparison, the same rule a
//! Redis `PSUBSCRIBE` applies, so `"ab*"` matches both `"ab.def"` and
//! `"abc.def"`.

use crate::error::{EventBusError, Result};

pub const WILDCARD: char = '*';

/// Glob syntax a Redis pattern subscription would interpret beyond `*`.
const GLOB_METACHARACTERS: [char; 4] = ['?', '[', ']', '\\'];

/// Whether `channel` is delivered to subscribers of `pattern`.
pub fn matches(channel: &str, pattern: &str) -> bool {
    match pattern.strip_suffix(WILDCARD) {
        Some(prefix) => channel.starts_with(prefix),
        None => channel == pattern,
    }
}

pub fn is_wildcard(key: &str) -> bool {
    key.ends_with(WILDCARD)
}

/// Subscription keys are either an exact channel or a prefix followed by a
/// single trailing `*`.
pub fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(EventBusError::Validation("subscription key must not be empty".into()));
    }
    if key.chars().any(char::is_whitespace) {
        return Err(EventBusError::Validation(format!(
            "subscription key {key:?} must not contain whitespace"
        )));
    }
    if key.contains(GLOB_METACHARACTERS) {
        return Err(EventBusError::Validation(format!(
            "subscription key {key:?} must not contain '?', '[', ']' or '\\'"
        )));
    }
    let wildcards = key.matches(WILDCARD).count();
    if wildcards > 1 || (wildcards == 1 && !is_wildcard(key)) {
        return Err(EventBusError::Validation(format!(
            "subscription key {key:?} may only contain one trailing '*'"
        )));
    }
    Ok(())
}

/// Broker channel for a key: `events.<key>` with the default prefix.
pub fn channel_name(prefix: &str, key: &str) -> String {
    format!("{prefix}.{key}")
}
