//! Signaling endpoints
//!
//! Thin handlers over [`RelayStore`](studyroom_webrtc::RelayStore): bodies
//! are validated, the store does the rest.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use studyroom_webrtc::signaling::protocol::{
    AnswerResponse, ErrorResponse, IceCandidatesResponse, JoinRequest, JoinResponse,
    LeaveRequest, OfferResponse, PublishRequest, PublishResponse, SuccessResponse,
};
use studyroom_webrtc::signaling::SignalKind;
use studyroom_webrtc::Error;
use tracing::debug;

use super::AppState;

/// Errors returned by relay handlers
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// A required body field is missing or empty
    #[error("Missing required fields")]
    MissingFields,

    /// Rejected by the relay store
    #[error(transparent)]
    Store(#[from] Error),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::MissingFields => StatusCode::BAD_REQUEST,
            RelayError::Store(Error::SessionNotFound(_)) => StatusCode::NOT_FOUND,
            RelayError::Store(Error::PeerNotFound(_)) => StatusCode::FORBIDDEN,
            RelayError::Store(Error::RoomFull(_)) => StatusCode::CONFLICT,
            RelayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        debug!(status = %status, error = %self, "Request rejected");
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

type Addressed = Path<(String, String, String)>;

// ============================================================================
// Membership
// ============================================================================

/// Join (or re-join) a room; responds with the other participants
pub async fn join_session(
    State(state): State<AppState>,
    Json(req): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, RelayError> {
    if !req.is_complete() {
        return Err(RelayError::MissingFields);
    }
    let participants = state
        .store
        .join(&req.session_id, &req.user_id, &req.user_name)?;
    Ok(Json(JoinResponse {
        success: true,
        participants,
    }))
}

/// Leave a room; leaving a room one is not in still succeeds
pub async fn leave_session(
    State(state): State<AppState>,
    Json(req): Json<LeaveRequest>,
) -> Result<Json<SuccessResponse>, RelayError> {
    if !req.is_complete() {
        return Err(RelayError::MissingFields);
    }
    state.store.leave(&req.session_id, &req.user_id);
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================================
// Publish
// ============================================================================

fn publish(
    state: &AppState,
    kind: SignalKind,
    req: PublishRequest,
) -> Result<Json<PublishResponse>, RelayError> {
    if !req.is_complete(kind) {
        return Err(RelayError::MissingFields);
    }
    let payload = req.payload(kind).cloned().ok_or(RelayError::MissingFields)?;
    let published = state.store.publish(
        &req.session_id,
        kind,
        &req.from_user_id,
        &req.to_user_id,
        payload,
    )?;
    Ok(Json(PublishResponse {
        success: true,
        seq: Some(published.seq),
    }))
}

pub async fn publish_offer(
    State(state): State<AppState>,
    Json(req): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, RelayError> {
    publish(&state, SignalKind::Offer, req)
}

pub async fn publish_answer(
    State(state): State<AppState>,
    Json(req): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, RelayError> {
    publish(&state, SignalKind::Answer, req)
}

pub async fn publish_candidate(
    State(state): State<AppState>,
    Json(req): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, RelayError> {
    publish(&state, SignalKind::IceCandidate, req)
}

// ============================================================================
// Consume
// ============================================================================

/// Hand out the stored offer once; `{offer: null}` when there is none
pub async fn take_offer(
    State(state): State<AppState>,
    Path((session_id, from, to)): Addressed,
) -> Json<OfferResponse> {
    let envelope = state
        .store
        .take_description(&session_id, SignalKind::Offer, &from, &to);
    Json(OfferResponse {
        seq: envelope.as_ref().map(|e| e.seq),
        offer: envelope.map(|e| e.payload),
    })
}

/// Hand out the stored answer once; `{answer: null}` when there is none
pub async fn take_answer(
    State(state): State<AppState>,
    Path((session_id, from, to)): Addressed,
) -> Json<AnswerResponse> {
    let envelope = state
        .store
        .take_description(&session_id, SignalKind::Answer, &from, &to);
    Json(AnswerResponse {
        seq: envelope.as_ref().map(|e| e.seq),
        answer: envelope.map(|e| e.payload),
    })
}

/// Drain the stored candidates in send order; `seq` is the last one's
pub async fn drain_candidates(
    State(state): State<AppState>,
    Path((session_id, from, to)): Addressed,
) -> Json<IceCandidatesResponse> {
    let batch = state.store.drain_candidates(&session_id, &from, &to);
    let seq = batch.last().map(|e| e.seq);
    Json(IceCandidatesResponse {
        candidates: batch.into_iter().map(|e| e.payload).collect(),
        seq,
    })
}
