//! Externally visible session state

use crate::media::{LocalStream, RemoteStream};
use crate::peer::ConnectionState;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which side initiated the current exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Joined second and sent the offer
    Offerer,
    /// Joined first and answered; the polite side during glare
    Answerer,
}

/// Coarse category of the last error, for host UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    DeviceUnavailable,
    Media,
    Signaling,
    Negotiation,
    ReconnectExhausted,
    Other,
}

impl ErrorKind {
    pub fn of(error: &Error) -> Self {
        match error {
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            e if e.is_media_error() => ErrorKind::Media,
            Error::SignalingError(_)
            | Error::SessionNotFound(_)
            | Error::PeerNotFound(_)
            | Error::RoomFull(_) => ErrorKind::Signaling,
            e if e.is_negotiation_error() => ErrorKind::Negotiation,
            Error::ReconnectExhausted { .. } => ErrorKind::ReconnectExhausted,
            _ => ErrorKind::Other,
        }
    }
}

/// Error recorded in the snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for SessionError {
    fn from(error: &Error) -> Self {
        Self {
            kind: ErrorKind::of(error),
            message: error.to_string(),
        }
    }
}

/// Whether the local user may speak
///
/// Requires our audio on, the partner's audio on, media granted and no
/// permission denial.
pub fn can_speak(
    audio_enabled: bool,
    partner_audio_enabled: bool,
    has_requested_media: bool,
    media_permission_denied: bool,
) -> bool {
    audio_enabled && partner_audio_enabled && has_requested_media && !media_permission_denied
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    /// Between enable (or a reconnect attempt) and the first `connected`
    pub is_connecting: bool,
    pub role: Option<Role>,
    pub partner_id: Option<String>,
    pub error: Option<SessionError>,
    pub media_permission_denied: bool,
    pub has_requested_media: bool,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub partner_audio_enabled: bool,
    /// Derived; see [`can_speak`]
    pub can_speak: bool,
    /// Attempts started since the last `connected`
    pub reconnect_attempt: u32,
    pub reconnect_exhausted: bool,
    pub local_stream: Option<Arc<LocalStream>>,
    pub remote_stream: Option<Arc<RemoteStream>>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::New,
            is_connecting: false,
            role: None,
            partner_id: None,
            error: None,
            media_permission_denied: false,
            has_requested_media: false,
            video_enabled: false,
            audio_enabled: true,
            partner_audio_enabled: true,
            can_speak: false,
            reconnect_attempt: 0,
            reconnect_exhausted: false,
            local_stream: None,
            remote_stream: None,
        }
    }
}

impl SessionSnapshot {
    /// Recompute derived fields
    pub(crate) fn refresh(&mut self) {
        self.can_speak = can_speak(
            self.audio_enabled,
            self.partner_audio_enabled,
            self.has_requested_media,
            self.media_permission_denied,
        );
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_speak_requires_every_condition() {
        assert!(can_speak(true, true, true, false));
        assert!(!can_speak(false, true, true, false));
        assert!(!can_speak(true, false, true, false));
        assert!(!can_speak(true, true, false, false));
        assert!(!can_speak(true, true, true, true));
    }

    #[test]
    fn test_default_snapshot_cannot_speak() {
        let mut snapshot = SessionSnapshot::default();
        snapshot.refresh();
        assert!(!snapshot.can_speak);
        assert!(snapshot.partner_audio_enabled);

        snapshot.has_requested_media = true;
        snapshot.refresh();
        assert!(snapshot.can_speak);
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            ErrorKind::of(&Error::PermissionDenied("x".into())),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            ErrorKind::of(&Error::MediaError("x".into())),
            ErrorKind::Media
        );
        assert_eq!(
            ErrorKind::of(&Error::SignalingError("x".into())),
            ErrorKind::Signaling
        );
        assert_eq!(
            ErrorKind::of(&Error::SdpError("x".into())),
            ErrorKind::Negotiation
        );
        assert_eq!(
            ErrorKind::of(&Error::ReconnectExhausted { attempts: 5 }),
            ErrorKind::ReconnectExhausted
        );
    }
}
