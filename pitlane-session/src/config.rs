//! Session Configuration
//!
//! Every fixed constant the session core needs is supplied here by the
//! surrounding application. Nothing is derived internally.

use std::path::Path;
use std::time::Duration;
use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Largest supported player cap.
pub const MAX_PLAYER_CAP: u8 = 16;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Player cap outside `1..=MAX_PLAYER_CAP`.
    #[error("max_players must be between 1 and 16, got {0}")]
    InvalidPlayerCap(u8),

    /// Tick rate must be positive.
    #[error("tick_rate must be positive")]
    ZeroTickRate,

    /// Countdown must last at least one tick.
    #[error("countdown_ms must be positive")]
    ZeroCountdown,

    /// Environment variable could not be parsed.
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },

    /// Config file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Configuration for a race session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Player cap; sizes the finish slots and is the ready/in-scene threshold.
    pub max_players: u8,
    /// Countdown length (milliseconds).
    pub countdown_ms: u64,
    /// Maximum ready-up wait on the authority holder (milliseconds).
    pub ready_up_timeout_ms: u64,
    /// Delay before the last participant in the race scene is sent back
    /// (milliseconds).
    pub last_player_departure_ms: u64,
    /// Scheduler passes per second.
    pub tick_rate: u32,
    /// Per-subscriber event buffer.
    pub event_capacity: usize,
    /// Prefix for generated nicknames.
    pub nickname_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_players: 4,
            countdown_ms: 3_000,
            ready_up_timeout_ms: 30_000,
            last_player_departure_ms: 5_000,
            tick_rate: 10,
            event_capacity: 256,
            nickname_prefix: "racer".to_string(),
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `PITLANE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = env_parse("PITLANE_MAX_PLAYERS")? {
            config.max_players = v;
        }
        if let Some(v) = env_parse("PITLANE_COUNTDOWN_MS")? {
            config.countdown_ms = v;
        }
        if let Some(v) = env_parse("PITLANE_READY_UP_TIMEOUT_MS")? {
            config.ready_up_timeout_ms = v;
        }
        if let Some(v) = env_parse("PITLANE_LAST_PLAYER_DEPARTURE_MS")? {
            config.last_player_departure_ms = v;
        }
        if let Some(v) = env_parse("PITLANE_TICK_RATE")? {
            config.tick_rate = v;
        }
        if let Ok(prefix) = std::env::var("PITLANE_NICKNAME_PREFIX") {
            config.nickname_prefix = prefix;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Check invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_players == 0 || self.max_players > MAX_PLAYER_CAP {
            return Err(ConfigError::InvalidPlayerCap(self.max_players));
        }
        if self.tick_rate == 0 {
            return Err(ConfigError::ZeroTickRate);
        }
        if self.countdown_ms == 0 {
            return Err(ConfigError::ZeroCountdown);
        }
        Ok(())
    }

    /// Countdown length.
    pub fn countdown(&self) -> Duration {
        Duration::from_millis(self.countdown_ms)
    }

    /// Ready-up wait window.
    pub fn ready_up_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_up_timeout_ms)
    }

    /// Last-participant departure delay.
    pub fn last_player_departure(&self) -> Duration {
        Duration::from_millis(self.last_player_departure_ms)
    }

    /// Wall-clock length of one scheduler pass.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.tick_rate.max(1) as u64)
    }

    /// Scheduler passes covering `duration`, rounded up, at least one.
    pub fn ticks_for(&self, duration: Duration) -> u32 {
        let rate = self.tick_rate.max(1) as u128;
        let ticks = (duration.as_millis() * rate).div_ceil(1000);
        ticks.clamp(1, u32::MAX as u128) as u32
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_players, 4);
        assert_eq!(config.tick_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_ticks_for_rounds_up() {
        let config = SessionConfig { tick_rate: 10, ..Default::default() };
        assert_eq!(config.ticks_for(Duration::from_secs(3)), 30);
        assert_eq!(config.ticks_for(Duration::from_millis(150)), 2);
        assert_eq!(config.ticks_for(Duration::ZERO), 1);
    }

    #[test]
    fn test_json_partial_uses_defaults() {
        let config = SessionConfig::from_json_str(r#"{"max_players": 3, "countdown_ms": 1500}"#).unwrap();
        assert_eq!(config.max_players, 3);
        assert_eq!(config.countdown(), Duration::from_millis(1500));
        assert_eq!(config.tick_rate, 10);
    }

    #[test]
    fn test_invalid_cap_rejected() {
        assert!(matches!(
            SessionConfig::from_json_str(r#"{"max_players": 0}"#),
            Err(ConfigError::InvalidPlayerCap(0))
        ));
        let config = SessionConfig { max_players: 17, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_tick_rate_rejected() {
        let config = SessionConfig { tick_rate: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroTickRate)));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(SessionConfig::from_json_str("{"), Err(ConfigError::Parse(_))));
    }
}
