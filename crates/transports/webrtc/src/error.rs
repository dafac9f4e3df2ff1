//! Error types for study room sessions

/// Result type alias using the session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or maintaining a session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling relay unreachable or returned an error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// User refused access to camera/microphone
    #[error("Media permission denied: {0}")]
    PermissionDenied(String),

    /// Requested capture device does not exist
    #[error("Media device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Any other media acquisition failure
    #[error("Media error: {0}")]
    MediaError(String),

    /// Offer/answer exchange could not be completed
    #[error("Negotiation failed: {0}")]
    NegotiationFailure(String),

    /// Reconnection gave up after the configured number of attempts
    #[error("Reconnection exhausted after {attempts} attempts")]
    ReconnectExhausted {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Room not known to the relay
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Participant not present in the room
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Relay room limit reached
    #[error("Room full: {0}")]
    RoomFull(String),

    /// Session orchestration error
    #[error("Session error: {0}")]
    SessionError(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Operation on a closed session or connection
    #[error("Closed: {0}")]
    Closed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_) | Error::NegotiationFailure(_) | Error::IoError(_)
        )
    }

    /// Check if this error came from media acquisition
    pub fn is_media_error(&self) -> bool {
        matches!(
            self,
            Error::PermissionDenied(_) | Error::DeviceUnavailable(_) | Error::MediaError(_)
        )
    }

    /// Check if this error is an offer/answer or ICE failure
    pub fn is_negotiation_error(&self) -> bool {
        matches!(
            self,
            Error::NegotiationFailure(_)
                | Error::SdpError(_)
                | Error::IceCandidateError(_)
                | Error::PeerConnectionError(_)
        )
    }

    /// Check if this error ends the session for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::ReconnectExhausted { .. } | Error::Closed(_))
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtcError(e.to_string())
    }
}
