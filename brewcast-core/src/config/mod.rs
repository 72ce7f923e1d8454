//! Configuration management for brewcast
//!
//! Environment-based configuration with defaults and validation. Every
//! timing constant of the sync protocol lives here; the defaults are the
//! reference values (5 s heartbeat, 15 s peer timeout, 100 ms fallback
//! self-clear, 5 s reconnect backoff).

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main configuration for a device session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Mesh membership configuration
    pub mesh: MeshConfig,

    /// Presence protocol timing
    pub presence: PresenceConfig,

    /// Transport configuration
    pub transport: TransportConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Mesh membership configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Shared static secret stamped into every message and compared by
    /// equality on receipt. Coarse authentication only.
    pub shared_secret: String,

    /// Bus name same-device sessions rendezvous on.
    pub channel_name: String,
}

/// Presence protocol timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Heartbeat emission interval
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// A peer silent for this long is swept out (reference: three
    /// missed heartbeats)
    #[serde(with = "humantime_serde")]
    pub peer_timeout: Duration,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Delay before the storage-key fallback clears its shared key
    #[serde(with = "humantime_serde")]
    pub fallback_clear_delay: Duration,

    /// Backoff between data-channel reconnect attempts (initiator only)
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,

    /// Bind address for data-channel offers
    pub bind_address: String,

    /// Inbound queue depth per transport
    pub channel_capacity: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mesh: MeshConfig::default(),
            presence: PresenceConfig::default(),
            transport: TransportConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            shared_secret: "brewcast-local".to_string(),
            channel_name: "brewcast".to_string(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(15),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            fallback_clear_delay: Duration::from_millis(100),
            reconnect_backoff: Duration::from_secs(5),
            bind_address: "127.0.0.1:0".to_string(),
            channel_capacity: 64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Variables follow the pattern: BREWCAST_<SECTION>_<KEY>.
    /// Durations are given in milliseconds, e.g.
    /// BREWCAST_PRESENCE_HEARTBEAT_MS=5000.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(secret) = env::var("BREWCAST_MESH_SHARED_SECRET") {
            config.mesh.shared_secret = secret;
        }
        if let Ok(name) = env::var("BREWCAST_MESH_CHANNEL_NAME") {
            config.mesh.channel_name = name;
        }

        if let Ok(ms) = env::var("BREWCAST_PRESENCE_HEARTBEAT_MS") {
            config.presence.heartbeat_interval = Duration::from_millis(
                ms.parse()
                    .map_err(|e| ConfigError::InvalidValue(format!("Invalid heartbeat: {}", e)))?,
            );
        }
        if let Ok(ms) = env::var("BREWCAST_PRESENCE_PEER_TIMEOUT_MS") {
            config.presence.peer_timeout = Duration::from_millis(
                ms.parse()
                    .map_err(|e| ConfigError::InvalidValue(format!("Invalid peer timeout: {}", e)))?,
            );
        }

        if let Ok(ms) = env::var("BREWCAST_TRANSPORT_CLEAR_DELAY_MS") {
            config.transport.fallback_clear_delay = Duration::from_millis(
                ms.parse()
                    .map_err(|e| ConfigError::InvalidValue(format!("Invalid clear delay: {}", e)))?,
            );
        }
        if let Ok(ms) = env::var("BREWCAST_TRANSPORT_RECONNECT_MS") {
            config.transport.reconnect_backoff = Duration::from_millis(
                ms.parse()
                    .map_err(|e| ConfigError::InvalidValue(format!("Invalid backoff: {}", e)))?,
            );
        }
        if let Ok(addr) = env::var("BREWCAST_TRANSPORT_BIND_ADDRESS") {
            config.transport.bind_address = addr;
        }

        if let Ok(level) = env::var("BREWCAST_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(json) = env::var("BREWCAST_LOG_JSON") {
            config.logging.json_format = json
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid JSON flag: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mesh.shared_secret.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "shared_secret must not be empty".to_string(),
            ));
        }
        if self.mesh.channel_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "channel_name must not be empty".to_string(),
            ));
        }
        if self.presence.heartbeat_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_interval must be greater than 0".to_string(),
            ));
        }
        if self.presence.peer_timeout <= self.presence.heartbeat_interval {
            return Err(ConfigError::ValidationFailed(
                "peer_timeout must exceed heartbeat_interval".to_string(),
            ));
        }
        if self.transport.channel_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "channel_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_reference_values() {
        let config = Config::default();
        assert_eq!(config.presence.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.presence.peer_timeout, Duration::from_secs(15));
        assert_eq!(
            config.transport.fallback_clear_delay,
            Duration::from_millis(100)
        );
        assert_eq!(config.transport.reconnect_backoff, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_empty_secret() {
        let mut config = Config::default();
        config.mesh.shared_secret = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_timeout_below_heartbeat() {
        let mut config = Config::default();
        config.presence.peer_timeout = Duration::from_secs(3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_round_trip_with_durations() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.presence.heartbeat_interval,
            config.presence.heartbeat_interval
        );
        assert_eq!(back.mesh.shared_secret, config.mesh.shared_secret);
    }
}
