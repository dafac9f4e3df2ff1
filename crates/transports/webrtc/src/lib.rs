//! WebRTC session establishment and resilience for 1:1 study rooms
//!
//! This crate discovers a partner through a signaling relay, negotiates an
//! audio/video peer connection, monitors link health and recovers the link
//! after failure. Booking, chat and persistence stay with the host
//! application, which drives a [`SessionOrchestrator`] and watches its
//! [`SessionSnapshot`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Host application                                        │
//! │  ↓ enable / toggle / request_media / reconnect / disable │
//! │  SessionOrchestrator                                     │
//! │  └─ driver task (owns everything below)                  │
//! │     ├─ RelayClient ── SignalingTransport                 │
//! │     │                 ├─ PushRelayTransport (WebSocket)  │
//! │     │                 ├─ HttpRelayTransport (polling)    │
//! │     │                 └─ LocalRelayTransport (in-proc)   │
//! │     ├─ PeerConnectionManager (RTCPeerConnection, media)  │
//! │     ├─ QualityMonitor (stats → excellent/good/poor)      │
//! │     └─ ReconnectionController (exponential backoff)      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use studyroom_webrtc::{SessionConfig, SignalingMode};
//!
//! let config = SessionConfig::polling("http://localhost:8787")
//!     .with_poll_interval_ms(500)
//!     .with_auto_start_media(true);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.signaling_mode, SignalingMode::Polling);
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

pub use config::{
    MediaConstraints, ReconnectOptions, SessionConfig, SignalingMode, TurnServerConfig,
};
pub use error::{Error, Result};
pub use media::{LocalStream, MediaDevices, RemoteStream, SyntheticMediaDevices};
pub use peer::{ConnectionState, QualityLevel, QualityReport};
pub use session::{ErrorKind, Role, SessionError, SessionOrchestrator, SessionSnapshot};
pub use signaling::{transport_for, RelayClient, RelayStore, RoomId, SignalingTransport};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
