//! HTTP API for the signaling relay
//!
//! - `POST /webrtc/join-session` / `POST /webrtc/leave-session` - Room membership
//! - `POST /webrtc/{offer,answer,ice-candidate}` - Publish a signal
//! - `GET /webrtc/{offer,answer}/:sessionId/:fromUserId/:toUserId` - Consume a description
//! - `GET /webrtc/ice-candidates/:sessionId/:fromUserId/:toUserId` - Drain candidates
//! - `GET /webrtc/subscribe/:sessionId/:userId` - WebSocket push subscription
//! - `GET /health`, `GET /stats`

pub mod push;
pub mod signaling;

pub use signaling::RelayError;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use studyroom_webrtc::RelayStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::RelayConfig;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Rooms, stored signals and push subscribers
    pub store: Arc<RelayStore>,
    /// Service configuration
    pub config: Arc<RelayConfig>,
    /// Process start, reported by `/stats`
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Create a new AppState with a store sized by `config.limits`
    pub fn new(config: Arc<RelayConfig>) -> Self {
        let store = Arc::new(RelayStore::new(config.limits.relay_limits()));
        Self::with_store(store, config)
    }

    /// Create a new AppState around an existing store
    pub fn with_store(store: Arc<RelayStore>, config: Arc<RelayConfig>) -> Self {
        Self {
            store,
            config,
            started_at: Utc::now(),
        }
    }
}

/// Build the HTTP API router
pub fn build_router(state: AppState) -> Router {
    // Browser clients of the same relay call it cross-origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Membership
        .route("/webrtc/join-session", post(signaling::join_session))
        .route("/webrtc/leave-session", post(signaling::leave_session))
        // Publish
        .route("/webrtc/offer", post(signaling::publish_offer))
        .route("/webrtc/answer", post(signaling::publish_answer))
        .route("/webrtc/ice-candidate", post(signaling::publish_candidate))
        // Consume
        .route("/webrtc/offer/:session_id/:from_user_id/:to_user_id", get(signaling::take_offer))
        .route("/webrtc/answer/:session_id/:from_user_id/:to_user_id", get(signaling::take_answer))
        .route(
            "/webrtc/ice-candidates/:session_id/:from_user_id/:to_user_id",
            get(signaling::drain_candidates),
        )
        // Push
        .route("/webrtc/subscribe/:session_id/:user_id", get(push::subscribe))
        // Health and stats
        .route("/health", get(health_check))
        .route("/stats", get(stats_handler))
        // Middleware
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Relay occupancy
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub rooms: usize,
    pub max_rooms: usize,
    pub max_participants_per_room: usize,
    pub started_at: DateTime<Utc>,
}

/// Stats endpoint
async fn stats_handler(State(state): State<AppState>) -> Json<RelayStats> {
    let limits = state.store.limits();
    Json(RelayStats {
        rooms: state.store.room_count(),
        max_rooms: limits.max_rooms,
        max_participants_per_room: limits.max_participants_per_room,
        started_at: state.started_at,
    })
}
