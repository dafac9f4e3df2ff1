//! Signaling relay client
//!
//! Peers never talk to each other before the transport is up; offers,
//! answers and ICE candidates travel through a relay instead. Three
//! [`SignalingTransport`] backends are provided:
//! - [`HttpRelayTransport`]: polls the relay's HTTP routes
//! - [`PushRelayTransport`]: HTTP for sending, WebSocket subscription for receiving
//! - [`LocalRelayTransport`]: in-process over a shared [`RelayStore`]
//!
//! [`RelayClient`] binds a transport to one room and one user and decodes
//! payloads into webrtc-rs types.

pub mod http;
pub mod local;
pub mod protocol;
pub mod store;
pub mod websocket;

pub use http::HttpRelayTransport;
pub use local::LocalRelayTransport;
pub use protocol::{Participant, PushFrame, SignalEnvelope, SignalKind};
pub use store::{Delivery, Published, RelayLimits, RelayStore, Subscription};
pub use websocket::PushRelayTransport;

use crate::config::{SessionConfig, SignalingMode};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Room identifier derived from a session's external id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    /// Derive the room for `session_id`
    ///
    /// The same session always maps to the same room. Ids are used as URL
    /// path segments, so empty ids and ids containing `/` are rejected.
    pub fn derive(session_id: &str) -> Result<Self> {
        let trimmed = session_id.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidConfig("session id must not be empty".to_string()));
        }
        if trimmed.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "session id must not contain '/', got {}",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Room id as sent to the relay
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend that moves signaling messages through a relay
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Join `room`, returning the participants other than `user_id`
    async fn join(&self, room: &RoomId, user_id: &str, user_name: &str)
        -> Result<Vec<Participant>>;

    /// Publish a message; returns the relay-assigned sequence number
    async fn publish(
        &self,
        room: &RoomId,
        kind: SignalKind,
        from: &str,
        to: &str,
        payload: Value,
    ) -> Result<u64>;

    /// Consume pending messages of `kind` from `from` to `to`
    async fn fetch(
        &self,
        room: &RoomId,
        kind: SignalKind,
        from: &str,
        to: &str,
    ) -> Result<Vec<SignalEnvelope>>;

    /// Leave `room`
    async fn leave(&self, room: &RoomId, user_id: &str) -> Result<()>;

    /// Wait until new signals may be available or `timeout` elapses
    async fn wait_for_signal(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    /// Delivery mode of this transport
    fn mode(&self) -> SignalingMode;
}

/// Create the transport selected by `config.signaling_mode`
pub fn transport_for(config: &SessionConfig) -> Result<Arc<dyn SignalingTransport>> {
    let transport: Arc<dyn SignalingTransport> = match config.signaling_mode {
        SignalingMode::Polling => Arc::new(HttpRelayTransport::new(&config.relay_url)?),
        SignalingMode::Push => Arc::new(PushRelayTransport::new(
            &config.relay_url,
            Duration::from_millis(config.poll_interval_ms),
        )?),
    };
    Ok(transport)
}

// ============================================================================
// Inbox for pushed signals
// ============================================================================

/// Queue of pushed envelopes waiting to be fetched
#[derive(Default)]
pub(crate) struct Inbox {
    queue: Mutex<VecDeque<SignalEnvelope>>,
    notify: Notify,
}

impl Inbox {
    pub(crate) fn push(&self, envelope: SignalEnvelope) {
        self.queue.lock().push_back(envelope);
        self.notify.notify_one();
    }

    /// Remove and return the queued envelopes matching (kind, from, to)
    pub(crate) fn take(&self, kind: SignalKind, from: &str, to: &str) -> Vec<SignalEnvelope> {
        let mut queue = self.queue.lock();
        let mut taken = Vec::new();
        queue.retain(|e| {
            if e.kind == kind && e.from_user_id == from && e.to_user_id == to {
                taken.push(e.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    /// Wake a waiter without queueing anything
    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }

    pub(crate) fn clear(&self) {
        self.queue.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Wait for a push or `timeout`
    pub(crate) async fn wait(&self, timeout: Duration) {
        if self.len() > 0 {
            return;
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}

// ============================================================================
// Relay client
// ============================================================================

/// Signaling client bound to one room and one user
pub struct RelayClient {
    transport: Arc<dyn SignalingTransport>,
    room: RoomId,
    self_id: String,
    display_name: String,
    /// Highest accepted sequence number per (kind, sender)
    seen: Mutex<HashMap<(SignalKind, String), u64>>,
}

impl RelayClient {
    /// Create a client for `self_id` in `room`
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        room: RoomId,
        self_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            room,
            self_id: self_id.into(),
            display_name: display_name.into(),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Room this client is bound to
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Local user id
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Delivery mode of the underlying transport
    pub fn mode(&self) -> SignalingMode {
        self.transport.mode()
    }

    /// Join the room; returns the other participants in join order
    pub async fn join_room(&self) -> Result<Vec<Participant>> {
        let participants = self
            .transport
            .join(&self.room, &self.self_id, &self.display_name)
            .await?;
        Ok(participants
            .into_iter()
            .filter(|p| p.user_id != self.self_id)
            .collect())
    }

    /// Send an SDP offer to `to`
    pub async fn send_offer(&self, to: &str, offer: &RTCSessionDescription) -> Result<()> {
        self.send_description(SignalKind::Offer, to, offer).await
    }

    /// Send an SDP answer to `to`
    pub async fn send_answer(&self, to: &str, answer: &RTCSessionDescription) -> Result<()> {
        self.send_description(SignalKind::Answer, to, answer).await
    }

    async fn send_description(
        &self,
        kind: SignalKind,
        to: &str,
        description: &RTCSessionDescription,
    ) -> Result<()> {
        let payload = serde_json::to_value(description)?;
        let seq = self
            .transport
            .publish(&self.room, kind, &self.self_id, to, payload)
            .await?;
        debug!(room = %self.room, kind = %kind, to = %to, seq, "Sent description");
        Ok(())
    }

    /// Send a local ICE candidate to `to`
    pub async fn send_ice_candidate(&self, to: &str, candidate: &RTCIceCandidateInit) -> Result<()> {
        let payload = serde_json::to_value(candidate)?;
        self.transport
            .publish(&self.room, SignalKind::IceCandidate, &self.self_id, to, payload)
            .await?;
        Ok(())
    }

    /// Consume the pending offer from `from`, if any
    pub async fn poll_offer(&self, from: &str) -> Result<Option<RTCSessionDescription>> {
        self.poll_description(SignalKind::Offer, from).await
    }

    /// Consume the pending answer from `from`, if any
    pub async fn poll_answer(&self, from: &str) -> Result<Option<RTCSessionDescription>> {
        self.poll_description(SignalKind::Answer, from).await
    }

    async fn poll_description(
        &self,
        kind: SignalKind,
        from: &str,
    ) -> Result<Option<RTCSessionDescription>> {
        let envelopes = self.fetch_fresh(kind, from).await?;
        let Some(newest) = envelopes.into_iter().max_by_key(|e| e.seq) else {
            return Ok(None);
        };
        match serde_json::from_value::<RTCSessionDescription>(newest.payload) {
            Ok(description) => Ok(Some(description)),
            Err(e) => {
                warn!(room = %self.room, kind = %kind, from = %from, error = %e, "Discarding undecodable description");
                Ok(None)
            }
        }
    }

    /// Drain pending ICE candidates from `from`, in send order
    pub async fn poll_ice_candidates(&self, from: &str) -> Result<Vec<RTCIceCandidateInit>> {
        let envelopes = self.fetch_fresh(SignalKind::IceCandidate, from).await?;
        let mut candidates = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            match serde_json::from_value::<RTCIceCandidateInit>(envelope.payload) {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => {
                    warn!(room = %self.room, from = %from, error = %e, "Discarding undecodable ICE candidate");
                }
            }
        }
        Ok(candidates)
    }

    /// Fetch and drop envelopes not newer than those already accepted
    async fn fetch_fresh(&self, kind: SignalKind, from: &str) -> Result<Vec<SignalEnvelope>> {
        let mut envelopes = self
            .transport
            .fetch(&self.room, kind, from, &self.self_id)
            .await?;
        if envelopes.is_empty() {
            return Ok(envelopes);
        }
        envelopes.sort_by_key(|e| e.seq);

        let mut seen = self.seen.lock();
        let floor = seen.get(&(kind, from.to_string())).copied().unwrap_or(0);
        let before = envelopes.len();
        // seq 0 means the relay did not report one
        envelopes.retain(|e| e.seq == 0 || e.seq > floor);
        if envelopes.len() != before {
            debug!(
                room = %self.room,
                kind = %kind,
                from = %from,
                dropped = before - envelopes.len(),
                "Dropped stale signals"
            );
        }
        if let Some(max) = envelopes.iter().map(|e| e.seq).max() {
            if max > floor {
                seen.insert((kind, from.to_string()), max);
            }
        }
        Ok(envelopes)
    }

    /// Leave the room
    pub async fn leave_room(&self) -> Result<()> {
        self.seen.lock().clear();
        self.transport.leave(&self.room, &self.self_id).await
    }

    /// Wait until new signals may be available or `timeout` elapses
    pub async fn wait_for_signal(&self, timeout: Duration) {
        self.transport.wait_for_signal(timeout).await;
    }
}
