//! Engine configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `MOTION_POOL_`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! MOTION_POOL_ENGINE_POLL_INTERVAL_MS=5
//! MOTION_POOL_LOGGING_LEVEL=debug
//! ```
//!
//! The first `_` after the prefix separates the section from the key, so
//! multi-word keys keep their underscores.
//!
//! # Example
//!
//! ```no_run
//! use motion_pool::config::PoolConfig;
//!
//! let config = PoolConfig::load_from("config/pool.toml")?;
//! println!("poll every {} ms", config.engine.poll_interval_ms);
//! # Ok::<(), motion_pool::config::ConfigError>(())
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of environment variables overriding file values.
pub const ENV_PREFIX: &str = "MOTION_POOL_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File, TOML or environment could not be read.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value is out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Session and monitoring tunables
    #[serde(default)]
    pub engine: EngineConfig,
    /// Tracing subscriber settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tunables of the execution engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Sleep between two monitoring ticks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Positions are read once every this many state polls
    #[serde(default = "default_state_polls_per_read")]
    pub state_polls_per_read: u32,
    /// Pause between motion end and the final authoritative read
    #[serde(default)]
    pub settle_delay_ms: u64,
    /// Capacity of the notification broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level (trace, debug, info, warn, error); `RUST_LOG` wins when set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

fn default_poll_interval() -> u64 {
    10
}

fn default_state_polls_per_read() -> u32 {
    10
}

fn default_event_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            state_polls_per_read: default_state_polls_per_read(),
            settle_delay_ms: 0,
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Default settle delay as a `Duration`.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl PoolConfig {
    /// Load configuration from `config/pool.toml` plus environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/pool.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Missing files are not an error: defaults apply and environment
    /// variables still override them.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(PoolConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("_").map(section_key))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Poll interval is not zero
    /// - At least one state poll per position read
    /// - Event channel capacity is not zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid logging level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.engine.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.engine.state_polls_per_read == 0 {
            return Err(ConfigError::ValidationError(
                "state_polls_per_read must be at least 1".to_string(),
            ));
        }

        if self.engine.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "event_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Render as TOML, e.g. to seed a configuration file.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

// `ENGINE_POLL_INTERVAL_MS` splits into `engine.poll.interval.ms`; keep only
// the section split so multi-word keys survive.
fn section_key(key: &figment::value::UncasedStr) -> figment::value::Uncased<'_> {
    let key = key.as_str();
    match key.split_once('.') {
        Some((section, rest)) => format!("{section}.{}", rest.replace('.', "_")).into(),
        None => key.to_string().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.engine.state_polls_per_read, 10);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[engine]\npoll_interval_ms = 5\nsettle_delay_ms = 200\n\n[logging]\nlevel = \"debug\""
        )
        .unwrap();

        let config = PoolConfig::load_from(file.path()).unwrap();
        assert_eq!(config.engine.poll_interval_ms, 5);
        assert_eq!(config.engine.settle_delay(), Duration::from_millis(200));
        assert_eq!(config.engine.event_capacity, 1024);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = PoolConfig::load_from("/nonexistent/pool.toml").unwrap();
        assert_eq!(config, PoolConfig::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\npoll_interval_ms = 5").unwrap();

        std::env::set_var("MOTION_POOL_ENGINE_POLL_INTERVAL_MS", "25");
        let config = PoolConfig::load_from(file.path());
        std::env::remove_var("MOTION_POOL_ENGINE_POLL_INTERVAL_MS");

        assert_eq!(config.unwrap().engine.poll_interval_ms, 25);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = PoolConfig::default();
        config.logging.level = "loud".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid logging level 'loud'"));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut config = PoolConfig::default();
        config.engine.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = PoolConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: PoolConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
