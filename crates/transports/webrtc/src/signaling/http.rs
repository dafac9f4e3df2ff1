//! HTTP polling transport

use super::protocol::{
    AnswerResponse, IceCandidatesResponse, JoinRequest, JoinResponse, LeaveRequest,
    OfferResponse, Participant, PublishRequest, PublishResponse, SignalEnvelope, SignalKind,
    SuccessResponse,
};
use super::{RoomId, SignalingTransport};
use crate::config::SignalingMode;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Transport that talks to the relay's HTTP routes
///
/// Inbound signals are only seen when [`fetch`](SignalingTransport::fetch)
/// is called, so callers poll on an interval.
#[derive(Clone)]
pub struct HttpRelayTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpRelayTransport {
    /// Create a transport for the relay at `relay_url` (http:// or https://)
    pub fn new(relay_url: &str) -> Result<Self> {
        let base_url = Url::parse(relay_url.trim())
            .map_err(|e| Error::InvalidConfig(format!("invalid relay url: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidConfig(format!(
                "relay url cannot be used as a base: {}",
                relay_url
            )));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()
            .map_err(|e| Error::SignalingError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, base_url })
    }

    /// Relay base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build `{base}/seg/seg/...` with each segment percent-encoded
    pub(crate) fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidConfig(format!("invalid relay url: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post<B, R>(&self, segments: &[&str], body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.endpoint(segments)?;
        let response = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| Error::SignalingError(format!("POST {} failed: {}", url, e)))?;
        Self::decode(url, response).await
    }

    async fn get<R: DeserializeOwned>(&self, segments: &[&str]) -> Result<R> {
        let url = self.endpoint(segments)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::SignalingError(format!("GET {} failed: {}", url, e)))?;
        Self::decode(url, response).await
    }

    async fn decode<R: DeserializeOwned>(url: Url, response: reqwest::Response) -> Result<R> {
        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default();
            return Err(Error::SignalingError(format!(
                "{} returned {}: {}",
                url, status, detail
            )));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| Error::SignalingError(format!("Invalid response from {}: {}", url, e)))
    }
}

/// Wrap fetched payloads into envelopes; `seq` 0 when the relay sent none
fn envelopes(
    room: &RoomId,
    kind: SignalKind,
    from: &str,
    to: &str,
    payloads: Vec<Value>,
    seq: Option<u64>,
) -> Vec<SignalEnvelope> {
    let timestamp = Utc::now();
    payloads
        .into_iter()
        .filter(|p| !p.is_null())
        .map(|payload| SignalEnvelope {
            seq: seq.unwrap_or(0),
            session_id: room.as_str().to_string(),
            from_user_id: from.to_string(),
            to_user_id: to.to_string(),
            kind,
            payload,
            timestamp,
        })
        .collect()
}

#[async_trait]
impl SignalingTransport for HttpRelayTransport {
    async fn join(
        &self,
        room: &RoomId,
        user_id: &str,
        user_name: &str,
    ) -> Result<Vec<Participant>> {
        let request = JoinRequest {
            session_id: room.as_str().to_string(),
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
        };
        let response: JoinResponse = self.post(&["webrtc", "join-session"], &request).await?;
        if !response.success {
            return Err(Error::SignalingError(format!("join of room {} rejected", room)));
        }
        Ok(response.participants)
    }

    async fn publish(
        &self,
        room: &RoomId,
        kind: SignalKind,
        from: &str,
        to: &str,
        payload: Value,
    ) -> Result<u64> {
        let request = PublishRequest::new(kind, room.as_str(), from, to, payload);
        let response: PublishResponse = self.post(&["webrtc", kind.publish_path()], &request).await?;
        if !response.success {
            return Err(Error::SignalingError(format!("{} to {} rejected", kind, to)));
        }
        Ok(response.seq.unwrap_or(0))
    }

    async fn fetch(
        &self,
        room: &RoomId,
        kind: SignalKind,
        from: &str,
        to: &str,
    ) -> Result<Vec<SignalEnvelope>> {
        let segments = ["webrtc", kind.fetch_path(), room.as_str(), from, to];
        let fetched = match kind {
            SignalKind::Offer => {
                let response: OfferResponse = self.get(&segments).await?;
                envelopes(room, kind, from, to, response.offer.into_iter().collect(), response.seq)
            }
            SignalKind::Answer => {
                let response: AnswerResponse = self.get(&segments).await?;
                envelopes(room, kind, from, to, response.answer.into_iter().collect(), response.seq)
            }
            SignalKind::IceCandidate => {
                let response: IceCandidatesResponse = self.get(&segments).await?;
                envelopes(room, kind, from, to, response.candidates, response.seq)
            }
        };
        if !fetched.is_empty() {
            debug!(room = %room, kind = %kind, from = %from, count = fetched.len(), "Fetched signals");
        }
        Ok(fetched)
    }

    async fn leave(&self, room: &RoomId, user_id: &str) -> Result<()> {
        let request = LeaveRequest {
            session_id: room.as_str().to_string(),
            user_id: user_id.to_string(),
        };
        let _: SuccessResponse = self.post(&["webrtc", "leave-session"], &request).await?;
        Ok(())
    }

    fn mode(&self) -> SignalingMode {
        SignalingMode::Polling
    }
}
