//! Well-known event types exchanged by the gamification, narrative and user
//! services, with typed constructors for the common ones.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::event::{Event, EventPriority};

pub const POINTS_AWARDED: &str = "game.points_awarded";
pub const ACHIEVEMENT_UNLOCKED: &str = "game.achievement_unlocked";
pub const LEVEL_UP: &str = "game.level_up";
pub const STREAK_UPDATED: &str = "game.streak_updated";

pub const CHAPTER_STARTED: &str = "narrative.chapter_started";
pub const DECISION_MADE: &str = "narrative.decision_made";
pub const CHAPTER_COMPLETED: &str = "narrative.chapter_completed";

pub const USER_REGISTERED: &str = "user.registered";
pub const USER_PROFILE_UPDATED: &str = "user.profile_updated";
pub const USER_DELETED: &str = "user.deleted";

/// Wildcard keys for subscribing to a whole service namespace.
pub const ALL_GAME: &str = "game.*";
pub const ALL_NARRATIVE: &str = "narrative.*";
pub const ALL_USER: &str = "user.*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointsAwarded {
    pub user_id: i64,
    pub points: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AchievementUnlocked {
    pub user_id: i64,
    pub achievement_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionMade {
    pub user_id: i64,
    pub chapter_id: String,
    pub decision_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRegistered {
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

pub fn points_awarded(payload: &PointsAwarded, source: &str) -> Result<Event> {
    Event::builder(POINTS_AWARDED)
        .payload(payload)?
        .source(source)
        .build()
}

/// Achievements are user visible, so they jump the queue.
pub fn achievement_unlocked(payload: &AchievementUnlocked, source: &str) -> Result<Event> {
    Event::builder(ACHIEVEMENT_UNLOCKED)
        .payload(payload)?
        .source(source)
        .priority(EventPriority::High)
        .build()
}

pub fn decision_made(payload: &DecisionMade, source: &str) -> Result<Event> {
    Event::builder(DECISION_MADE)
        .payload(payload)?
        .source(source)
        .build()
}

pub fn user_registered(payload: &UserRegistered, source: &str) -> Result<Event> {
    Event::builder(USER_REGISTERED)
        .payload(payload)?
        .source(source)
        .build()
}

/// Decode the data tree of a received event into a typed payload.
pub fn decode<T: for<'de> Deserialize<'de>>(event: &Event) -> Result<T> {
    Ok(serde_json::from_value(event.data().clone())?)
}
