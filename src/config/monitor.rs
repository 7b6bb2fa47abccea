use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::registry::MIN_INTER_PORT_DELAY;
use crate::connection::RegistrySettings;
use crate::probe::ProbeSettings;
use crate::serial::buffer::DEFAULT_BUFFER_CAPACITY;
use crate::serial::reader::ReadLoopSettings;

const MAX_PAUSE_POLL_MS: u64 = 250;
const MAX_READ_ERROR_BACKOFF_MS: u64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    pub read_timeout_ms: u64,
    pub attempts: u32,
    pub include_uncommon: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 200,
            attempts: 3,
            include_uncommon: true,
        }
    }
}

/// Runtime tuning, loaded from JSON. Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Receive buffer size per connection, in bytes
    pub buffer_capacity: usize,
    /// Spacing between sequential opens in connect-all / disconnect-all
    pub inter_port_delay_ms: u64,
    /// How often a paused read loop re-checks the pause flag
    pub pause_poll_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub max_consecutive_read_errors: u32,
    pub read_error_backoff_ms: u64,
    pub probe: ProbeConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            inter_port_delay_ms: MIN_INTER_PORT_DELAY.as_millis() as u64,
            pause_poll_ms: 100,
            shutdown_timeout_ms: 2000,
            max_consecutive_read_errors: 5,
            read_error_backoff_ms: 50,
            probe: ProbeConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: MonitorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&contents)?;
        log::info!("Loaded config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid("buffer_capacity must be at least 1".into()));
        }
        if self.inter_port_delay_ms < MIN_INTER_PORT_DELAY.as_millis() as u64 {
            return Err(ConfigError::Invalid(format!(
                "inter_port_delay_ms must be at least {}",
                MIN_INTER_PORT_DELAY.as_millis()
            )));
        }
        if self.pause_poll_ms == 0 || self.pause_poll_ms > MAX_PAUSE_POLL_MS {
            return Err(ConfigError::Invalid(format!(
                "pause_poll_ms must be between 1 and {}",
                MAX_PAUSE_POLL_MS
            )));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::Invalid("shutdown_timeout_ms must be positive".into()));
        }
        if self.read_error_backoff_ms > MAX_READ_ERROR_BACKOFF_MS {
            return Err(ConfigError::Invalid(format!(
                "read_error_backoff_ms must be at most {}",
                MAX_READ_ERROR_BACKOFF_MS
            )));
        }
        if self.max_consecutive_read_errors == 0 {
            return Err(ConfigError::Invalid("max_consecutive_read_errors must be at least 1".into()));
        }
        if self.probe.attempts == 0 {
            return Err(ConfigError::Invalid("probe.attempts must be at least 1".into()));
        }
        if self.probe.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("probe.read_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            buffer_capacity: self.buffer_capacity,
            inter_port_delay: Duration::from_millis(self.inter_port_delay_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            read_loop: ReadLoopSettings {
                pause_poll: Duration::from_millis(self.pause_poll_ms),
                max_consecutive_errors: self.max_consecutive_read_errors,
                error_backoff: Duration::from_millis(self.read_error_backoff_ms),
            },
            ..RegistrySettings::default()
        }
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            read_timeout: Duration::from_millis(self.probe.read_timeout_ms),
            attempts: self.probe.attempts,
            include_uncommon: self.probe.include_uncommon,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_capacity, 10_000);
        assert_eq!(config.inter_port_delay_ms, 500);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = MonitorConfig::from_json_str(r#"{"buffer_capacity": 64, "probe": {"attempts": 5}}"#).unwrap();
        assert_eq!(config.buffer_capacity, 64);
        assert_eq!(config.probe.attempts, 5);
        assert_eq!(config.probe.read_timeout_ms, 200);
        assert_eq!(config.pause_poll_ms, 100);
    }

    #[test]
    fn test_rejects_short_inter_port_delay() {
        let err = MonitorConfig::from_json_str(r#"{"inter_port_delay_ms": 100}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_slow_pause_poll() {
        assert!(MonitorConfig::from_json_str(r#"{"pause_poll_ms": 1000}"#).is_err());
        assert!(MonitorConfig::from_json_str(r#"{"pause_poll_ms": 0}"#).is_err());
    }

    #[test]
    fn test_rejects_zero_shutdown_timeout() {
        let err = MonitorConfig::from_json_str(r#"{"shutdown_timeout_ms": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_read_error_backoff_is_capped() {
        assert!(MonitorConfig::from_json_str(r#"{"read_error_backoff_ms": 1000}"#).is_ok());
        assert!(MonitorConfig::from_json_str(r#"{"read_error_backoff_ms": 1001}"#).is_err());
    }

    #[test]
    fn test_settings_conversion() {
        let config = MonitorConfig::default();
        let registry = config.registry_settings();
        assert_eq!(registry.inter_port_delay, Duration::from_millis(500));
        assert_eq!(registry.read_loop.pause_poll, Duration::from_millis(100));
        let probe = config.probe_settings();
        assert_eq!(probe.read_timeout, Duration::from_millis(200));
        assert_eq!(probe.attempts, 3);
    }
}
