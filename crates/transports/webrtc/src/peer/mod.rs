//! WebRTC peer connection management
//!
//! Handles the connection state machine, offer/answer and ICE negotiation,
//! link quality sampling and backoff-driven recovery.

pub mod connection;
pub mod lifecycle;
pub mod quality;
pub mod state;

pub use connection::{PeerConnectionManager, PeerEvent, PeerEventKind, ToggleOutcome};
pub use lifecycle::{
    ReconnectDecision, ReconnectionController, ReconnectionPolicy, ReconnectionState,
};
pub use quality::{
    classify, QualityEstimator, QualityLevel, QualityMonitor, QualityReport, QualitySample,
    StatsSource, TransportStats,
};
pub use state::ConnectionState;
