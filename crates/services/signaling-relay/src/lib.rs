//! StudyRoom Signaling Relay
//!
//! Rendezvous point for 1:1 study sessions. Peers join a room, then trade
//! offers, answers and ICE candidates through it until their direct WebRTC
//! transport is up. Signals are held in memory and handed out once, either
//! on an HTTP fetch or straight down a WebSocket subscription.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        studyroom-relay                        │
//! ├───────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐                                         │
//! │  │  HTTP API (axum) │ ← POST /webrtc/join-session             │
//! │  │                  │ ← POST /webrtc/offer | answer | ice     │
//! │  │                  │ ← GET  /webrtc/offer/:s/:from/:to       │
//! │  │                  │ ← GET  /webrtc/subscribe/:s/:user (WS)  │
//! │  └────────┬─────────┘                                         │
//! │           │                                                   │
//! │           ▼                                                   │
//! │  ┌──────────────────────────────────────────────────────────┐ │
//! │  │  RelayStore (studyroom-webrtc)                           │ │
//! │  │  rooms → participants, offer/answer slots, ICE batches,  │ │
//! │  │          push subscribers                                │ │
//! │  └──────────────────────────────────────────────────────────┘ │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;

pub use api::{build_router, AppState, RelayError};
pub use config::{ConfigError, RelayConfig};
