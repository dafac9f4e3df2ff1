//! Configuration types for study room sessions

use serde::{Deserialize, Serialize};

/// Public STUN servers used when nothing else is configured
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Main configuration for a [`SessionOrchestrator`](crate::SessionOrchestrator)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Signaling relay base URL (http:// or https://)
    pub relay_url: String,

    /// How inbound signals are received (default: Push)
    pub signaling_mode: SignalingMode,

    /// Relay poll interval in milliseconds (default: 2000ms, range: 1-60000ms)
    pub poll_interval_ms: u64,

    /// STUN server URLs (may be empty on a LAN)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Acquire media as soon as the session is enabled (default: false)
    pub auto_start_media: bool,

    /// Media requested from the capture device
    pub media: MediaConstraints,

    /// Quality sampling interval in milliseconds (default: 2000ms)
    pub quality_sample_interval_ms: u64,

    /// Reconnection backoff settings
    pub reconnect: ReconnectOptions,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Signal delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalingMode {
    /// Relay pushes signals over a WebSocket subscription (default)
    ///
    /// Falls back to polling while the subscription is down.
    #[default]
    Push,
    /// Client polls the relay every `poll_interval_ms`
    Polling,
}

/// Media constraints passed to the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture video (default: false)
    pub video: bool,
    /// Capture audio (default: true)
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: false,
            audio: true,
        }
    }
}

impl MediaConstraints {
    /// Audio only
    pub fn audio_only() -> Self {
        Self::default()
    }

    /// Audio and video
    pub fn audio_video() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }

    /// True when neither kind is requested
    pub fn is_empty(&self) -> bool {
        !self.video && !self.audio
    }
}

/// Reconnection backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectOptions {
    /// Maximum number of reconnection attempts (default: 5)
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds (default: 1000)
    pub backoff_initial_ms: u64,

    /// Maximum backoff delay in milliseconds (default: 16000)
    pub backoff_max_ms: u64,

    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_initial_ms: 1000,
            backoff_max_ms: 16000,
            backoff_multiplier: 2.0,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://localhost:8787".to_string(),
            signaling_mode: SignalingMode::Push,
            poll_interval_ms: 2000,
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            turn_servers: Vec::new(),
            auto_start_media: false,
            media: MediaConstraints::default(),
            quality_sample_interval_ms: 2000,
            reconnect: ReconnectOptions::default(),
        }
    }
}

impl SessionConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `relay_url` is not an http(s) URL
    /// - `poll_interval_ms` is not in range 1-60000
    /// - `quality_sample_interval_ms` is zero
    /// - a STUN/TURN URL has the wrong scheme
    /// - the reconnect backoff is inconsistent
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        // Validate relay URL
        let parsed = url::Url::parse(&self.relay_url).map_err(|e| {
            Error::InvalidConfig(format!("relay_url is not a valid URL: {}", e))
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(Error::InvalidConfig(format!(
                "relay_url must start with http:// or https://, got {}",
                self.relay_url
            )));
        }

        // Validate poll interval
        if self.poll_interval_ms == 0 || self.poll_interval_ms > 60_000 {
            return Err(Error::InvalidConfig(format!(
                "poll_interval_ms must be in range 1-60000, got {}",
                self.poll_interval_ms
            )));
        }

        // Validate quality sampling
        if self.quality_sample_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "quality_sample_interval_ms must be greater than 0".to_string(),
            ));
        }

        // Validate ICE servers
        for stun in &self.stun_servers {
            if !stun.starts_with("stun:") && !stun.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server must start with stun: or stuns:, got {}",
                    stun
                )));
            }
        }
        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        // Validate reconnect backoff
        let reconnect = &self.reconnect;
        if reconnect.backoff_initial_ms == 0 {
            return Err(Error::InvalidConfig(
                "backoff_initial_ms must be greater than 0".to_string(),
            ));
        }
        if reconnect.backoff_max_ms < reconnect.backoff_initial_ms {
            return Err(Error::InvalidConfig(format!(
                "backoff_max_ms ({}) must be >= backoff_initial_ms ({})",
                reconnect.backoff_max_ms, reconnect.backoff_initial_ms
            )));
        }
        if reconnect.backoff_multiplier.is_nan() || reconnect.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                reconnect.backoff_multiplier
            )));
        }

        Ok(())
    }

    /// Create a configuration preset that polls the relay
    ///
    /// For relays deployed without WebSocket support.
    ///
    /// # Example
    ///
    /// ```
    /// use studyroom_webrtc::{SessionConfig, SignalingMode};
    ///
    /// let config = SessionConfig::polling("https://relay.example.com");
    /// assert_eq!(config.signaling_mode, SignalingMode::Polling);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn polling(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            signaling_mode: SignalingMode::Polling,
            ..Default::default()
        }
    }

    /// Create a configuration preset for peers on the same network
    ///
    /// Settings:
    /// - No STUN servers (host candidates only)
    /// - Poll interval: 100ms
    /// - Quality sampling: 500ms
    ///
    /// # Example
    ///
    /// ```
    /// use studyroom_webrtc::SessionConfig;
    ///
    /// let config = SessionConfig::lan("http://127.0.0.1:8787");
    /// assert!(config.stun_servers.is_empty());
    /// assert_eq!(config.poll_interval_ms, 100);
    /// ```
    pub fn lan(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            stun_servers: Vec::new(),
            poll_interval_ms: 100,
            quality_sample_interval_ms: 500,
            ..Default::default()
        }
    }

    /// Add TURN servers to the configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Set the signaling mode
    pub fn with_signaling_mode(mut self, mode: SignalingMode) -> Self {
        self.signaling_mode = mode;
        self
    }

    /// Set the relay poll interval
    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    /// Acquire media when the session is enabled
    pub fn with_auto_start_media(mut self, auto_start: bool) -> Self {
        self.auto_start_media = auto_start;
        self
    }

    /// Set the media constraints
    pub fn with_media(mut self, media: MediaConstraints) -> Self {
        self.media = media;
        self
    }

    /// Set the reconnection backoff
    pub fn with_reconnect(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = reconnect;
        self
    }
}
