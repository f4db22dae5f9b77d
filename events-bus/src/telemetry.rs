//! Tracing subscriber setup for services embedding the bus.

use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::error::{EventBusError, Result};

pub const LOG_FORMAT_ENV: &str = "EVENTS_BUS_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable output for development
    Pretty,
    /// One JSON object per line for log shipping
    Json,
}

impl LogFormat {
    /// `json` selects JSON output, anything else is pretty.
    pub fn from_env() -> Self {
        match std::env::var(LOG_FORMAT_ENV) {
            Ok(value) => Self::parse(&value),
            Err(_) => Self::Pretty,
        }
    }

    fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default
/// `events_bus=info` filter. Fails if a subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "events_bus=info".into());

    let installed = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_level(true),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .try_init(),
    };

    installed.map_err(|e| EventBusError::Configuration(format!("tracing already initialized: {e}")))
}
