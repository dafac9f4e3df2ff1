//! In-process transport over a shared [`RelayStore`]

use super::protocol::{Participant, SignalEnvelope, SignalKind};
use super::store::RelayStore;
use super::{Inbox, RoomId, SignalingTransport};
use crate::config::SignalingMode;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Transport that talks to a [`RelayStore`] in the same process
///
/// Used to run two peers against one relay without a network hop. In
/// [`SignalingMode::Push`] it subscribes to the store like a WebSocket
/// client would. [`set_offline`](Self::set_offline) simulates an
/// unreachable relay.
pub struct LocalRelayTransport {
    store: Arc<RelayStore>,
    mode: SignalingMode,
    offline: AtomicBool,
    inbox: Arc<Inbox>,
    forwarder: Mutex<Option<(RoomId, String, JoinHandle<()>)>>,
}

impl LocalRelayTransport {
    /// Create a transport over `store`
    pub fn new(store: Arc<RelayStore>, mode: SignalingMode) -> Self {
        Self {
            store,
            mode,
            offline: AtomicBool::new(false),
            inbox: Arc::new(Inbox::default()),
            forwarder: Mutex::new(None),
        }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<RelayStore> {
        &self.store
    }

    /// Make every operation fail with [`Error::SignalingError`] while set
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::SignalingError("relay unreachable".to_string()));
        }
        Ok(())
    }

    fn ensure_forwarder(&self, room: &RoomId, user_id: &str) -> Result<()> {
        let mut forwarder = self.forwarder.lock();
        if let Some((current_room, current_user, task)) = forwarder.as_ref() {
            if current_room == room && current_user == user_id && !task.is_finished() {
                return Ok(());
            }
        }
        if let Some((_, _, task)) = forwarder.take() {
            task.abort();
        }

        let mut subscription = self.store.subscribe(room.as_str(), user_id)?;
        let inbox = Arc::clone(&self.inbox);
        let task = tokio::spawn(async move {
            while let Some(envelope) = subscription.receiver.recv().await {
                inbox.push(envelope);
            }
        });
        debug!(room = %room, user_id = %user_id, "Local push subscription opened");
        *forwarder = Some((room.clone(), user_id.to_string(), task));
        Ok(())
    }

    fn stop_forwarder(&self) {
        if let Some((_, _, task)) = self.forwarder.lock().take() {
            task.abort();
        }
        self.inbox.clear();
    }
}

impl Drop for LocalRelayTransport {
    fn drop(&mut self) {
        if let Some((_, _, task)) = self.forwarder.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalingTransport for LocalRelayTransport {
    async fn join(
        &self,
        room: &RoomId,
        user_id: &str,
        user_name: &str,
    ) -> Result<Vec<Participant>> {
        self.check_online()?;
        let participants = self.store.join(room.as_str(), user_id, user_name)?;
        if self.mode == SignalingMode::Push {
            self.ensure_forwarder(room, user_id)?;
        }
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
        self.check_online()?;
        let published = self.store.publish(room.as_str(), kind, from, to, payload)?;
        Ok(published.seq)
    }

    async fn fetch(
        &self,
        room: &RoomId,
        kind: SignalKind,
        from: &str,
        to: &str,
    ) -> Result<Vec<SignalEnvelope>> {
        self.check_online()?;
        let mut envelopes = self.inbox.take(kind, from, to);
        envelopes.extend(self.store.take(room.as_str(), kind, from, to));
        Ok(envelopes)
    }

    async fn leave(&self, room: &RoomId, user_id: &str) -> Result<()> {
        self.stop_forwarder();
        self.check_online()?;
        self.store.leave(room.as_str(), user_id);
        Ok(())
    }

    async fn wait_for_signal(&self, timeout: Duration) {
        match self.mode {
            SignalingMode::Push => self.inbox.wait(timeout).await,
            SignalingMode::Polling => tokio::time::sleep(timeout).await,
        }
    }

    fn mode(&self) -> SignalingMode {
        self.mode
    }
}
