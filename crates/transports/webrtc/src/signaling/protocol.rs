//! Relay wire format
//!
//! JSON bodies exchanged with the signaling relay. Field names are camelCase
//! so browser clients of the same relay can read them unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of signaling message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
    /// Trickled ICE candidate
    IceCandidate,
}

impl SignalKind {
    /// Name used in logs and error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice_candidate",
        }
    }

    /// Relay path segment used to publish this kind
    pub fn publish_path(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }

    /// Relay path segment used to fetch this kind
    pub fn fetch_path(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidates",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Member of a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// External user id
    pub user_id: String,
    /// Display name
    pub user_name: String,
    /// Last (re)join time
    pub joined_at: DateTime<Utc>,
}

/// A signaling message as stored and delivered by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    /// Relay-assigned, strictly increasing sequence number
    pub seq: u64,
    /// Room the message belongs to
    pub session_id: String,
    /// Sender
    pub from_user_id: String,
    /// Addressee
    pub to_user_id: String,
    /// Message kind
    pub kind: SignalKind,
    /// Session description or ICE candidate, browser-compatible JSON
    pub payload: Value,
    /// Time the relay accepted the message
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// HTTP request / response bodies
// ============================================================================

/// `POST /webrtc/join-session`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinRequest {
    pub session_id: String,
    pub user_id: String,
    pub user_name: String,
}

impl JoinRequest {
    /// True when every field is present and non-empty
    pub fn is_complete(&self) -> bool {
        !self.session_id.is_empty() && !self.user_id.is_empty() && !self.user_name.is_empty()
    }
}

/// Response to a join; `participants` excludes the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub success: bool,
    pub participants: Vec<Participant>,
}

/// `POST /webrtc/offer`, `/webrtc/answer` and `/webrtc/ice-candidate`
///
/// The payload travels under a key named after its kind (`offer`, `answer`
/// or `candidate`), so the body is kept generic here and the payload is
/// pulled out with [`PublishRequest::payload`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublishRequest {
    pub session_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Value>,
}

impl PublishRequest {
    /// Build a request carrying `payload` under the key for `kind`
    pub fn new(
        kind: SignalKind,
        session_id: &str,
        from_user_id: &str,
        to_user_id: &str,
        payload: Value,
    ) -> Self {
        let mut request = Self {
            session_id: session_id.to_string(),
            from_user_id: from_user_id.to_string(),
            to_user_id: to_user_id.to_string(),
            ..Default::default()
        };
        match kind {
            SignalKind::Offer => request.offer = Some(payload),
            SignalKind::Answer => request.answer = Some(payload),
            SignalKind::IceCandidate => request.candidate = Some(payload),
        }
        request
    }

    /// Payload for `kind`, if present and not null
    pub fn payload(&self, kind: SignalKind) -> Option<&Value> {
        let value = match kind {
            SignalKind::Offer => self.offer.as_ref(),
            SignalKind::Answer => self.answer.as_ref(),
            SignalKind::IceCandidate => self.candidate.as_ref(),
        };
        value.filter(|v| !v.is_null())
    }

    /// True when the addressing fields and the payload for `kind` are present
    pub fn is_complete(&self, kind: SignalKind) -> bool {
        !self.session_id.is_empty()
            && !self.from_user_id.is_empty()
            && !self.to_user_id.is_empty()
            && self.payload(kind).is_some()
    }
}

/// Response to a publish
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResponse {
    pub success: bool,
    #[serde(default)]
    pub seq: Option<u64>,
}

/// `GET /webrtc/offer/...`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OfferResponse {
    pub offer: Option<Value>,
    pub seq: Option<u64>,
}

/// `GET /webrtc/answer/...`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnswerResponse {
    pub answer: Option<Value>,
    pub seq: Option<u64>,
}

/// `GET /webrtc/ice-candidates/...`; `seq` is that of the last candidate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IceCandidatesResponse {
    pub candidates: Vec<Value>,
    pub seq: Option<u64>,
}

/// `POST /webrtc/leave-session`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaveRequest {
    pub session_id: String,
    pub user_id: String,
}

impl LeaveRequest {
    /// True when every field is present and non-empty
    pub fn is_complete(&self) -> bool {
        !self.session_id.is_empty() && !self.user_id.is_empty()
    }
}

/// Generic `{success}` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error body returned with non-2xx statuses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// Push subscription frames
// ============================================================================

/// Frames sent by the relay on `GET /webrtc/subscribe/:sessionId/:userId`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushFrame {
    /// Subscription accepted; stored signals follow
    Subscribed {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },
    /// A signal addressed to the subscriber
    Signal(SignalEnvelope),
}
