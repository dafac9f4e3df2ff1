//! Push transport: HTTP for sending, WebSocket subscription for receiving

use super::http::HttpRelayTransport;
use super::protocol::{Participant, PushFrame, SignalEnvelope, SignalKind};
use super::{Inbox, RoomId, SignalingTransport};
use crate::config::SignalingMode;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Shared between the transport and its subscription task
#[derive(Default)]
struct PushState {
    inbox: Inbox,
    /// Subscription acknowledged by the relay
    live: AtomicBool,
}

struct ActiveSubscription {
    room: RoomId,
    user_id: String,
    task: JoinHandle<()>,
}

/// Transport that receives signals over a relay WebSocket subscription
///
/// The subscription is opened on the first join and re-opened every
/// `retry_interval` while it is down. While it is down, fetches fall back
/// to HTTP polling so nothing is lost.
pub struct PushRelayTransport {
    http: HttpRelayTransport,
    retry_interval: Duration,
    state: Arc<PushState>,
    subscription: Mutex<Option<ActiveSubscription>>,
}

impl PushRelayTransport {
    /// Create a push transport for the relay at `relay_url` (http:// or https://)
    pub fn new(relay_url: &str, retry_interval: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpRelayTransport::new(relay_url)?,
            retry_interval,
            state: Arc::new(PushState::default()),
            subscription: Mutex::new(None),
        })
    }

    /// Whether the WebSocket subscription is currently up
    pub fn is_live(&self) -> bool {
        self.state.live.load(Ordering::SeqCst)
    }

    /// `ws(s)://.../webrtc/subscribe/{room}/{user}`
    fn subscribe_url(&self, room: &RoomId, user_id: &str) -> Result<Url> {
        let mut url = self
            .http
            .endpoint(&["webrtc", "subscribe", room.as_str(), user_id])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| Error::InvalidConfig(format!("cannot derive WebSocket url from {}", url)))?;
        Ok(url)
    }

    fn ensure_subscription(&self, room: &RoomId, user_id: &str) -> Result<()> {
        let mut active = self.subscription.lock();
        if let Some(existing) = active.as_ref() {
            if existing.room == *room && existing.user_id == user_id && !existing.task.is_finished() {
                return Ok(());
            }
        }
        if let Some(previous) = active.take() {
            previous.task.abort();
        }

        let url = self.subscribe_url(room, user_id)?;
        let task = tokio::spawn(subscription_task(
            url,
            Arc::clone(&self.state),
            self.retry_interval,
        ));
        *active = Some(ActiveSubscription {
            room: room.clone(),
            user_id: user_id.to_string(),
            task,
        });
        Ok(())
    }

    fn stop_subscription(&self) {
        if let Some(active) = self.subscription.lock().take() {
            active.task.abort();
        }
        self.state.live.store(false, Ordering::SeqCst);
        self.state.inbox.clear();
    }
}

impl Drop for PushRelayTransport {
    fn drop(&mut self) {
        if let Some(active) = self.subscription.get_mut().take() {
            active.task.abort();
        }
    }
}

/// Keep a subscription open, feeding pushed envelopes into the inbox
async fn subscription_task(url: Url, state: Arc<PushState>, retry_interval: Duration) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((mut ws_stream, _)) => {
                debug!(url = %url, "Push subscription connected");

                while let Some(msg_result) = ws_stream.next().await {
                    match msg_result {
                        Ok(Message::Text(text)) => match serde_json::from_str::<PushFrame>(&text) {
                            Ok(PushFrame::Subscribed { session_id, user_id }) => {
                                info!(room = %session_id, user_id = %user_id, "Push subscription live");
                                state.live.store(true, Ordering::SeqCst);
                                // Wake waiters so they fetch anything stored before now
                                state.inbox.wake();
                            }
                            Ok(PushFrame::Signal(envelope)) => state.inbox.push(envelope),
                            Err(e) => warn!(error = %e, "Ignoring malformed push frame"),
                        },
                        Ok(Message::Close(_)) => {
                            debug!("Push subscription closed by relay");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Push subscription error");
                            break;
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Push subscription connect failed");
            }
        }

        state.live.store(false, Ordering::SeqCst);
        tokio::time::sleep(retry_interval).await;
    }
}

#[async_trait]
impl SignalingTransport for PushRelayTransport {
    async fn join(
        &self,
        room: &RoomId,
        user_id: &str,
        user_name: &str,
    ) -> Result<Vec<Participant>> {
        let participants = self.http.join(room, user_id, user_name).await?;
        self.ensure_subscription(room, user_id)?;
        Ok(participants)
    }

    async fn publish(
        &self,
        room: &RoomId,
        kind: SignalKind,
        from: &str,
        to: &str,
        payload: Value,
    ) -> Result<u64> {
        self.http.publish(room, kind, from, to, payload).await
    }

    async fn fetch(
        &self,
        room: &RoomId,
        kind: SignalKind,
        from: &str,
        to: &str,
    ) -> Result<Vec<SignalEnvelope>> {
        let mut envelopes = self.state.inbox.take(kind, from, to);
        if !self.is_live() {
            envelopes.extend(self.http.fetch(room, kind, from, to).await?);
        }
        Ok(envelopes)
    }

    async fn leave(&self, room: &RoomId, user_id: &str) -> Result<()> {
        self.stop_subscription();
        self.http.leave(room, user_id).await
    }

    async fn wait_for_signal(&self, timeout: Duration) {
        self.state.inbox.wait(timeout).await;
    }

    fn mode(&self) -> SignalingMode {
        SignalingMode::Push
    }
}
