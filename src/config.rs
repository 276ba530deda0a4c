use base64::{engine::general_purpose, Engine as _};
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} missing")]
    Missing(&'static str),
    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Points awarded for a correct answer.
pub const ANSWER_REWARD: i32 = 1;

/// Tunables of a live round.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub question_count: i32,
    pub question_duration: Duration,
    pub buffer_duration: Duration,
    pub countdown: Duration,
    pub early_advance: bool,
    /// How long an orphaned session may sit past its deadline before it is reaped.
    pub stale_grace: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            question_count: 10,
            question_duration: Duration::from_secs(30),
            buffer_duration: Duration::from_secs(2),
            countdown: Duration::from_secs(5),
            early_advance: true,
            stale_grace: Duration::from_secs(120),
        }
    }
}

impl LiveConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let question_count: i32 = env_or("LIVE_QUESTION_COUNT", defaults.question_count)?;
        if !(1..=1000).contains(&question_count) {
            return Err(ConfigError::Invalid {
                name: "LIVE_QUESTION_COUNT",
                value: question_count.to_string(),
            });
        }
        Ok(Self {
            question_count,
            question_duration: env_secs("LIVE_QUESTION_DURATION_SEC", defaults.question_duration, 1..=3600)?,
            buffer_duration: env_secs("LIVE_BUFFER_DURATION_SEC", defaults.buffer_duration, 0..=600)?,
            countdown: env_secs("LIVE_COUNTDOWN_SEC", defaults.countdown, 0..=600)?,
            early_advance: env_or("LIVE_EARLY_ADVANCE", defaults.early_advance)?,
            stale_grace: env_secs("LIVE_STALE_GRACE_SEC", defaults.stale_grace, 1..=86_400)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Absent means the in-memory store.
    pub database_url: Option<String>,
    pub bind_addr: String,
    pub session_key: Vec<u8>,
    pub event_channel_capacity: usize,
    pub live: LiveConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());

        let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| {
            let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
            format!("0.0.0.0:{}", port)
        });

        let session_key_b64 =
            std::env::var("SESSION_KEY").map_err(|_| ConfigError::Missing("SESSION_KEY"))?;
        let session_key = general_purpose::STANDARD
            .decode(session_key_b64.trim())
            .map_err(|_| ConfigError::Invalid {
                name: "SESSION_KEY",
                value: "<not base64>".to_string(),
            })?;

        Ok(Self {
            database_url,
            bind_addr,
            session_key,
            event_channel_capacity: env_or("EVENT_CHANNEL_CAPACITY", 256usize)?,
            live: LiveConfig::from_env()?,
        })
    }
}

fn env_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        _ => Ok(default),
    }
}

/// Whole seconds within `range`.
fn env_secs(
    name: &'static str,
    default: Duration,
    range: RangeInclusive<u64>,
) -> Result<Duration, ConfigError> {
    let secs: u64 = env_or(name, default.as_secs())?;
    if !range.contains(&secs) {
        return Err(ConfigError::Invalid {
            name,
            value: secs.to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}
