//! Configuration for the signaling relay
//!
//! Configuration can be loaded from a TOML file and/or environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use studyroom_webrtc::signaling::RelayLimits;

/// Main configuration for the relay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Room limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_http_port() -> u16 {
    8787
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            host: default_host(),
        }
    }
}

/// Room limits, enforced at join
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of live rooms
    #[serde(default = "default_max_rooms")]
    pub max_rooms: usize,

    /// Maximum participants per room
    #[serde(default = "default_max_participants")]
    pub max_participants_per_room: usize,
}

fn default_max_rooms() -> usize {
    1000
}

fn default_max_participants() -> usize {
    2 // study sessions are 1:1
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_rooms: default_max_rooms(),
            max_participants_per_room: default_max_participants(),
        }
    }
}

impl LimitsConfig {
    /// Limits in the form the relay store takes
    pub fn relay_limits(&self) -> RelayLimits {
        RelayLimits {
            max_rooms: self.max_rooms,
            max_participants_per_room: self.max_participants_per_room,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: RelayConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = RelayConfig::default();

        if let Ok(port) = std::env::var("RELAY_HTTP_PORT") {
            if let Ok(p) = port.parse() {
                config.server.http_port = p;
            }
        }
        if let Ok(host) = std::env::var("RELAY_HOST") {
            config.server.host = host;
        }

        if let Ok(max) = std::env::var("RELAY_MAX_ROOMS") {
            if let Ok(m) = max.parse() {
                config.limits.max_rooms = m;
            }
        }
        if let Ok(max) = std::env::var("RELAY_MAX_PARTICIPANTS") {
            if let Ok(m) = max.parse() {
                config.limits.max_participants_per_room = m;
            }
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
        }
        Ok(Self::from_env())
    }

    /// Reject limits that would make every join fail
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_rooms == 0 {
            return Err(ConfigError::Invalid("max_rooms must be at least 1".to_string()));
        }
        if self.limits.max_participants_per_room < 2 {
            return Err(ConfigError::Invalid(
                "max_participants_per_room must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    /// `host:port` to bind the HTTP listener to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
