//! Connection state machine

use serde::{Deserialize, Serialize};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Initial state, connection not yet started
    #[default]
    New,
    /// ICE/DTLS handshake in progress
    Connecting,
    /// Media is flowing
    Connected,
    /// Connectivity lost, may recover on its own
    Disconnected,
    /// Connection failed
    Failed,
    /// Connection closed (terminal)
    Closed,
    /// Connected and exchanging a new offer/answer
    Renegotiating,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is allowed
    ///
    /// Staying in the same state is not a transition.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (New, Connecting | Failed | Closed)
                | (Connecting, Connected | Disconnected | Failed | Closed)
                | (Connected, Disconnected | Failed | Renegotiating | Closed)
                | (Renegotiating, Connected | Disconnected | Failed | Closed)
                | (Disconnected, Connected | Connecting | Failed | Closed)
                | (Failed, Connecting | Closed)
        )
    }

    /// Connected or renegotiating over a live transport
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Renegotiating)
    }

    /// States that trigger recovery
    pub fn is_broken(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Disconnected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
            ConnectionState::Renegotiating => "renegotiating",
        }
    }

    /// Map a webrtc-rs state; `Unspecified` has no counterpart
    pub fn from_rtc(state: RTCPeerConnectionState) -> Option<Self> {
        match state {
            RTCPeerConnectionState::New => Some(ConnectionState::New),
            RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
            RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
            RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
            RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
