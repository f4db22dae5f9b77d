//! Bus configuration.
//!
//! Values are layered: built-in defaults, then an optional file, then
//! `EVENTS_BUS__*` environment variables (`__` separates nested keys), e.g.
//!
//! ```text
//! EVENTS_BUS__TRANSPORT__MODE=redis
//! EVENTS_BUS__TRANSPORT__URL=redis://cache:6379
//! EVENTS_BUS__CIRCUIT_BREAKER__FAILURE_THRESHOLD=3
//! EVENTS_BUS__RATE_LIMIT__MAX_EVENTS=500
//! EVENTS_BUS__RATE_LIMIT__WINDOW=1000
//! ```
//!
//! Durations are integer milliseconds.

use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EventBusError, Result};
use crate::event::DEFAULT_MAX_PAYLOAD_BYTES;

pub const ENV_PREFIX: &str = "EVENTS_BUS";

// Serialize Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub transport: TransportConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Absent means publishes are never rate limited.
    pub rate_limit: Option<RateLimiterConfig>,
    pub replay: ReplayConfig,
    pub dispatch: DispatchConfig,
    pub max_payload_bytes: usize,
}

/// Which transport carries published events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TransportConfig {
    /// In-process delivery, no network.
    Direct,
    /// Redis pub/sub, one channel per event type.
    Redis {
        #[serde(default = "default_redis_url")]
        url: String,
        #[serde(default = "default_channel_prefix")]
        channel_prefix: String,
    },
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_channel_prefix() -> String {
    "events".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive transport failures before the breaker opens
    pub failure_threshold: u32,
    /// Time the breaker stays open before admitting a trial publish
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Maximum admitted publishes inside one window
    pub max_events: usize,
    /// Length of the sliding window
    #[serde(with = "duration_millis")]
    pub window: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Number of recently published events kept for replay
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// How long a publish waits for its handlers before leaving them to
    /// finish in the background
    #[serde(with = "duration_millis")]
    pub max_wait: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: None,
            replay: ReplayConfig::default(),
            dispatch: DispatchConfig::default(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Direct
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_millis(250),
        }
    }
}

impl EventBusConfig {
    /// Defaults overlaid with `path` (if it exists) and the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Self::defaults()?;
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        Self::finish(builder.add_source(Self::environment()))
    }

    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Defaults overlaid with a TOML document.
    pub fn from_toml(document: &str) -> Result<Self> {
        let builder = Self::defaults()?.add_source(File::from_str(document, FileFormat::Toml));
        Self::finish(builder)
    }

    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(EventBusError::Configuration(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.replay.capacity == 0 {
            return Err(EventBusError::Configuration(
                "replay.capacity must be at least 1".into(),
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(EventBusError::Configuration(
                "max_payload_bytes must be at least 1".into(),
            ));
        }
        if let Some(limit) = &self.rate_limit {
            if limit.max_events == 0 || limit.window.is_zero() {
                return Err(EventBusError::Configuration(
                    "rate_limit needs max_events >= 1 and a non-zero window".into(),
                ));
            }
        }
        if let TransportConfig::Redis { url, .. } = &self.transport {
            if url.trim().is_empty() {
                return Err(EventBusError::Configuration("transport.url must be set".into()));
            }
        }
        Ok(())
    }

    fn defaults() -> Result<ConfigBuilder<config::builder::DefaultState>> {
        let defaults = Config::try_from(&Self::default())?;
        Ok(Config::builder().add_source(defaults))
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
    }

    fn finish(builder: ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}
