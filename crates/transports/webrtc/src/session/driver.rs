//! Session driver task
//!
//! One task per enabled session owns the peer connection, the relay client,
//! the reconnection controller and every timer. Commands, peer events,
//! signal wake-ups and the backoff timer are handled one at a time.

use super::snapshot::{Role, SessionError, SessionSnapshot};
use crate::config::SessionConfig;
use crate::media::{MediaDevices, MediaKind};
use crate::peer::{
    ConnectionState, PeerConnectionManager, PeerEvent, PeerEventKind, QualityMonitor,
    ReconnectDecision, ReconnectionController, ReconnectionPolicy, ToggleOutcome,
};
use crate::signaling::RelayClient;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Request handled by the driver
pub(crate) enum Command {
    RequestMedia(oneshot::Sender<bool>),
    SetAudio(bool, oneshot::Sender<Result<()>>),
    SetVideo(bool, oneshot::Sender<Result<()>>),
    SetPartnerAudio(bool),
    Reconnect(oneshot::Sender<Result<()>>),
    DropConnection(oneshot::Sender<Result<()>>),
    Disable(oneshot::Sender<()>),
}

/// Where the offer/answer exchange stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Not in a room
    Idle,
    /// Answerer waiting for the first offer
    AwaitingOffer,
    /// Offerer waiting for the answer
    AwaitingAnswer,
    /// First exchange done; either side may renegotiate
    Negotiated,
}

pub(crate) struct Driver {
    config: SessionConfig,
    relay: Arc<RelayClient>,
    devices: Arc<dyn MediaDevices>,
    live: Arc<AtomicBool>,
    snapshot: watch::Sender<SessionSnapshot>,
    quality: Arc<Mutex<QualityMonitor>>,
    reconnect: ReconnectionController,
    reconnect_at: Option<Instant>,
    peer: Option<PeerConnectionManager>,
    generation: u64,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    phase: Phase,
    role: Option<Role>,
    partner: Option<String>,
    /// Local candidates gathered before the partner was known
    outgoing_candidates: Vec<RTCIceCandidateInit>,
    /// Media was granted at least once; re-acquired after a rebuild
    media_granted: bool,
    /// A local renegotiation is owed once signaling is stable
    renegotiation_pending: bool,
}

impl Driver {
    /// Build a driver; returns it with the peer event receiver
    pub(crate) fn new(
        config: SessionConfig,
        relay: Arc<RelayClient>,
        devices: Arc<dyn MediaDevices>,
        live: Arc<AtomicBool>,
        snapshot: watch::Sender<SessionSnapshot>,
        quality: Arc<Mutex<QualityMonitor>>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reconnect = ReconnectionController::new(ReconnectionPolicy::from(&config.reconnect));
        let driver = Self {
            config,
            relay,
            devices,
            live,
            snapshot,
            quality,
            reconnect,
            reconnect_at: None,
            peer: None,
            generation: 0,
            events_tx,
            phase: Phase::Idle,
            role: None,
            partner: None,
            outgoing_candidates: Vec::new(),
            media_granted: false,
            renegotiation_pending: false,
        };
        (driver, events_rx)
    }

    /// Flag the orchestrator sets to stop reconnection synchronously
    pub(crate) fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.reconnect.cancel_handle()
    }

    /// Main loop; returns after `Disable` or when the orchestrator is dropped
    #[instrument(skip_all, fields(room = %self.relay.room(), user_id = %self.relay.self_id()))]
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        info!("Session driver started");
        let relay = Arc::clone(&self.relay);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        if self.config.auto_start_media {
            self.media_granted = true;
        }
        if let Err(e) = self.establish().await {
            warn!(error = %e, "Initial join failed");
            self.record_error(&e);
            let decision = self.reconnect.on_state_change(ConnectionState::Failed);
            self.apply_decision(decision);
        }

        let mut next_poll = Instant::now() + poll_interval;
        let mut disabled_reply = None;

        loop {
            if !self.live.load(Ordering::SeqCst) {
                debug!("Liveness cleared, stopping driver");
                break;
            }
            let reconnect_at = self.reconnect_at;
            let until_poll = next_poll.saturating_duration_since(Instant::now());

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Disable(reply)) => {
                        disabled_reply = Some(reply);
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                Some(event) = events.recv() => self.handle_peer_event(event).await,

                _ = sleep_until(reconnect_at) => {
                    self.reconnect_at = None;
                    self.run_reconnect_attempt().await;
                }

                _ = relay.wait_for_signal(until_poll) => {
                    self.tick().await;
                    next_poll = Instant::now() + poll_interval;
                }
            }
        }

        self.shutdown().await;
        if let Some(reply) = disabled_reply {
            let _ = reply.send(());
        }
        info!("Session driver stopped");
    }

    // ========================================================================
    // Snapshot helpers
    // ========================================================================

    fn update(&self, f: impl FnOnce(&mut SessionSnapshot)) {
        self.snapshot.send_modify(|snapshot| {
            f(snapshot);
            snapshot.refresh();
        });
    }

    fn record_error(&self, error: &Error) {
        let recorded = SessionError::from(error);
        self.update(|s| s.error = Some(recorded));
    }

    fn peer(&self) -> Result<&PeerConnectionManager> {
        self.peer
            .as_ref()
            .ok_or_else(|| Error::SessionError("no active peer connection".to_string()))
    }

    // ========================================================================
    // Establishment
    // ========================================================================

    /// Join the room and start the first exchange
    async fn establish(&mut self) -> Result<()> {
        self.update(|s| {
            s.is_connecting = true;
            s.reconnect_exhausted = false;
        });

        let others = self.relay.join_room().await?;
        self.build_peer().await?;
        if self.media_granted {
            self.acquire_media().await;
        }

        match others.first() {
            Some(partner) => {
                info!(partner_id = %partner.user_id, "Partner present, sending offer");
                self.role = Some(Role::Offerer);
                self.set_partner(partner.user_id.clone()).await;
                let offer = self.peer()?.create_offer().await?;
                self.relay.send_offer(&partner.user_id, &offer).await?;
                self.phase = Phase::AwaitingAnswer;
            }
            None => {
                info!("Room empty, waiting for an offer");
                self.role = Some(Role::Answerer);
                self.phase = Phase::AwaitingOffer;
            }
        }
        let role = self.role;
        self.update(|s| s.role = role);
        Ok(())
    }

    /// Replace the peer connection with a fresh generation
    async fn build_peer(&mut self) -> Result<()> {
        self.close_peer().await;
        self.generation += 1;
        let peer = PeerConnectionManager::initialize(
            &self.config,
            Arc::clone(&self.devices),
            self.generation,
            self.events_tx.clone(),
        )
        .await?;
        self.quality.lock().start(peer.stats_source());
        self.peer = Some(peer);
        self.update(|s| {
            s.connection_state = ConnectionState::New;
            s.remote_stream = None;
        });
        Ok(())
    }

    async fn close_peer(&mut self) {
        if let Some(peer) = self.peer.take() {
            self.quality.lock().stop();
            if let Err(e) = peer.close().await {
                debug!(generation = peer.generation(), error = %e, "Peer close reported an error");
            }
        }
        self.update(|s| {
            s.local_stream = None;
            s.remote_stream = None;
        });
    }

    async fn set_partner(&mut self, partner_id: String) {
        self.partner = Some(partner_id.clone());
        self.update(|s| s.partner_id = Some(partner_id.clone()));

        for candidate in std::mem::take(&mut self.outgoing_candidates) {
            if let Err(e) = self.relay.send_ice_candidate(&partner_id, &candidate).await {
                warn!(error = %e, "Failed to send buffered ICE candidate");
            }
        }
    }

    /// Close the connection and leave the room
    async fn teardown(&mut self) {
        self.close_peer().await;
        if let Err(e) = self.relay.leave_room().await {
            debug!(error = %e, "Leave failed during teardown");
        }
        self.phase = Phase::Idle;
        self.role = None;
        self.partner = None;
        self.outgoing_candidates.clear();
        self.renegotiation_pending = false;
        self.update(|s| {
            s.role = None;
            s.partner_id = None;
        });
    }

    // ========================================================================
    // Media
    // ========================================================================

    /// Acquire local media on the current connection; failures land in the snapshot
    async fn acquire_media(&mut self) -> bool {
        let constraints = self.config.media;
        let result = match self.peer() {
            Ok(peer) => peer.start_local_media(constraints).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(stream) => {
                self.media_granted = true;
                let audio = stream.has_track(MediaKind::Audio);
                let video = stream.has_track(MediaKind::Video);
                self.update(|s| {
                    s.has_requested_media = true;
                    s.media_permission_denied = false;
                    s.audio_enabled = audio;
                    s.video_enabled = video;
                    s.local_stream = Some(stream);
                });
                true
            }
            Err(e) => {
                warn!(error = %e, "Media acquisition failed");
                let denied = e.is_media_error();
                if denied {
                    self.media_granted = false;
                }
                let recorded = SessionError::from(&e);
                self.update(|s| {
                    s.media_permission_denied = denied;
                    s.has_requested_media = false;
                    s.error = Some(recorded);
                });
                false
            }
        }
    }

    async fn request_media(&mut self) -> bool {
        if self.snapshot.borrow().has_requested_media {
            return true;
        }
        if self.peer.is_none() {
            // Acquired by `establish` once the room is joined again
            debug!("Media requested without a connection, deferring");
            self.media_granted = true;
            return false;
        }
        self.update(|s| {
            s.error = None;
            s.media_permission_denied = false;
            s.has_requested_media = true;
        });
        if !self.acquire_media().await {
            return false;
        }
        if self.partner.is_some() {
            if let Err(e) = self.renegotiate().await {
                warn!(error = %e, "Renegotiation after media request failed");
                self.record_error(&e);
            }
        }
        true
    }

    async fn set_track_enabled(&mut self, kind: MediaKind, enabled: bool) -> Result<()> {
        let peer = self.peer()?;
        let outcome = match kind {
            MediaKind::Audio => peer.set_audio_enabled(enabled).await,
            MediaKind::Video => peer.set_video_enabled(enabled).await,
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_media_error() {
                    let recorded = SessionError::from(&e);
                    self.update(|s| {
                        s.media_permission_denied = true;
                        s.error = Some(recorded);
                    });
                }
                return Err(e);
            }
        };

        let local_stream = peer.local_stream().await;
        self.update(|s| {
            match kind {
                MediaKind::Audio => {
                    s.audio_enabled = enabled;
                    if !enabled {
                        s.partner_audio_enabled = false;
                    }
                }
                MediaKind::Video => s.video_enabled = enabled,
            }
            if outcome == ToggleOutcome::NeedsRenegotiation {
                s.has_requested_media = true;
                s.media_permission_denied = false;
                s.local_stream = local_stream;
            }
        });

        if outcome == ToggleOutcome::NeedsRenegotiation {
            self.media_granted = true;
            self.renegotiate().await?;
        }
        Ok(())
    }

    // ========================================================================
    // Negotiation
    // ========================================================================

    /// Send a fresh offer to the partner, or defer until signaling is stable
    async fn renegotiate(&mut self) -> Result<()> {
        let Some(partner) = self.partner.clone() else {
            return Ok(());
        };
        let stable = self.phase == Phase::Negotiated && self.peer()?.signaling_is_stable();
        self.renegotiation_pending = !stable;
        if !stable {
            debug!(phase = ?self.phase, "Deferring renegotiation");
            return Ok(());
        }
        let peer = self.peer()?;
        peer.begin_renegotiation();
        let offer = peer.create_offer().await?;
        self.relay.send_offer(&partner, &offer).await?;
        info!(partner_id = %partner, "Renegotiation offer sent");
        Ok(())
    }

    /// Apply `offer` and send our answer
    async fn accept_offer(&mut self, partner: &str, offer: RTCSessionDescription) -> Result<()> {
        let peer = self.peer()?;
        peer.set_remote_description(offer).await?;
        let answer = peer.create_answer().await?;
        self.relay.send_answer(partner, &answer).await?;
        self.phase = Phase::Negotiated;
        debug!(partner_id = %partner, "Answer sent");
        Ok(())
    }

    /// Partner started over: rebuild the connection and answer
    async fn restart_for_offer(&mut self, partner: &str, offer: RTCSessionDescription) -> Result<()> {
        info!(partner_id = %partner, "Partner restarted, rebuilding connection");
        if self.reconnect.withdraw() {
            self.reconnect_at = None;
        }
        self.renegotiation_pending = false;
        self.build_peer().await?;
        if self.media_granted {
            self.acquire_media().await;
        }
        self.role = Some(Role::Answerer);
        self.update(|s| {
            s.role = Some(Role::Answerer);
            s.is_connecting = true;
        });
        self.accept_offer(partner, offer).await
    }

    /// Offer from the partner after the first exchange
    async fn handle_partner_offer(&mut self, partner: &str, offer: RTCSessionDescription) -> Result<()> {
        let peer = self.peer()?;
        if peer.state().is_broken() || peer.is_partner_restart(&offer).await {
            return self.restart_for_offer(partner, offer).await;
        }

        if peer.has_local_offer() {
            match self.role {
                Some(Role::Answerer) => {
                    debug!("Offer glare, rolling back local offer");
                    if let Err(e) = peer.rollback_local_offer().await {
                        warn!(error = %e, "Rollback failed");
                        return self.restart_for_offer(partner, offer).await;
                    }
                    self.renegotiation_pending = true;
                }
                _ => {
                    debug!("Offer glare, keeping local offer");
                    return Ok(());
                }
            }
        }

        match self.accept_offer(partner, offer.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_negotiation_error() => {
                warn!(error = %e, "Offer does not apply to current connection");
                self.restart_for_offer(partner, offer).await
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_remote_candidates(&mut self, partner: &str) -> Result<()> {
        let candidates = self.relay.poll_ice_candidates(partner).await?;
        if candidates.is_empty() {
            return Ok(());
        }
        let peer = self.peer()?;
        trace!(count = candidates.len(), "Applying remote ICE candidates");
        for candidate in candidates {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!(error = %e, "Failed to add remote ICE candidate");
            }
        }
        Ok(())
    }

    // ========================================================================
    // Event handlers
    // ========================================================================

    async fn tick(&mut self) {
        if self.peer.is_none() {
            return;
        }
        let result = match self.phase {
            Phase::Idle => Ok(()),
            Phase::AwaitingOffer => self.tick_awaiting_offer().await,
            Phase::AwaitingAnswer => self.tick_awaiting_answer().await,
            Phase::Negotiated => self.tick_negotiated().await,
        };
        if let Err(e) = result {
            debug!(error = %e, phase = ?self.phase, "Signaling tick failed");
            self.record_error(&e);
        }
    }

    async fn tick_awaiting_offer(&mut self) -> Result<()> {
        // Re-join to refresh the participant list
        let others = self.relay.join_room().await?;
        for participant in others {
            if let Some(offer) = self.relay.poll_offer(&participant.user_id).await? {
                info!(partner_id = %participant.user_id, "Offer received");
                self.set_partner(participant.user_id.clone()).await;
                self.accept_offer(&participant.user_id, offer).await?;
                return self.apply_remote_candidates(&participant.user_id).await;
            }
        }
        Ok(())
    }

    async fn tick_awaiting_answer(&mut self) -> Result<()> {
        let Some(partner) = self.partner.clone() else {
            return Ok(());
        };
        if let Some(answer) = self.relay.poll_answer(&partner).await? {
            info!(partner_id = %partner, "Answer received");
            self.peer()?.set_remote_description(answer).await?;
            self.phase = Phase::Negotiated;
            return self.apply_remote_candidates(&partner).await;
        }
        // An offer instead of an answer: the partner started over
        if let Some(offer) = self.relay.poll_offer(&partner).await? {
            self.restart_for_offer(&partner, offer).await?;
        }
        self.apply_remote_candidates(&partner).await
    }

    async fn tick_negotiated(&mut self) -> Result<()> {
        let Some(partner) = self.partner.clone() else {
            return Ok(());
        };
        if let Some(offer) = self.relay.poll_offer(&partner).await? {
            self.handle_partner_offer(&partner, offer).await?;
        }
        if let Some(answer) = self.relay.poll_answer(&partner).await? {
            let peer = self.peer()?;
            if peer.has_local_offer() {
                peer.set_remote_description(answer).await?;
                debug!(partner_id = %partner, "Renegotiation answer applied");
            } else {
                debug!(partner_id = %partner, "Ignoring answer without a pending offer");
            }
        }
        self.apply_remote_candidates(&partner).await?;

        if self.renegotiation_pending && self.peer()?.signaling_is_stable() {
            self.renegotiate().await?;
        }
        Ok(())
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        if self.peer.is_none() || event.generation != self.generation {
            trace!(generation = event.generation, "Dropping stale peer event");
            return;
        }
        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => match self.partner.clone() {
                Some(partner) => {
                    if let Err(e) = self.relay.send_ice_candidate(&partner, &candidate).await {
                        warn!(error = %e, "Failed to send ICE candidate");
                        self.record_error(&e);
                    }
                }
                None => self.outgoing_candidates.push(candidate),
            },
            PeerEventKind::RemoteTrack(track) => {
                let remote = self.peer.as_ref().and_then(|p| p.remote_stream());
                self.update(|s| {
                    if track.kind == MediaKind::Audio {
                        s.partner_audio_enabled = true;
                    }
                    s.remote_stream = remote;
                });
            }
            PeerEventKind::StateChanged(state) => self.on_connection_state(state),
        }
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        info!(state = %state, generation = self.generation, "Connection state changed");
        self.update(|s| {
            s.connection_state = state;
            match state {
                ConnectionState::Connected => {
                    s.is_connecting = false;
                    s.error = None;
                }
                ConnectionState::Failed | ConnectionState::Closed => s.is_connecting = false,
                _ => {}
            }
        });
        let decision = self.reconnect.on_state_change(state);
        self.apply_decision(decision);
    }

    fn apply_decision(&mut self, decision: ReconnectDecision) {
        match decision {
            ReconnectDecision::Ignore => {}
            ReconnectDecision::Schedule { attempt, delay } => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect timer armed");
                self.reconnect_at = Some(Instant::now() + delay);
            }
            ReconnectDecision::CancelPending => {
                self.reconnect_at = None;
            }
            ReconnectDecision::Exhausted { attempts } => {
                self.reconnect_at = None;
                let error = SessionError::from(&Error::ReconnectExhausted { attempts });
                self.update(|s| {
                    s.reconnect_exhausted = true;
                    s.is_connecting = false;
                    s.error = Some(error);
                });
            }
        }
        let retries = self.reconnect.retries();
        self.update(|s| s.reconnect_attempt = retries);
    }

    async fn run_reconnect_attempt(&mut self) {
        if !self.live.load(Ordering::SeqCst) {
            return;
        }
        let Some(attempt) = self.reconnect.begin_attempt() else {
            return;
        };
        self.update(|s| {
            s.reconnect_attempt = attempt;
            s.is_connecting = true;
        });

        self.teardown().await;
        let outcome = self.establish().await;
        if let Err(e) = &outcome {
            warn!(attempt, error = %e, "Reconnection attempt failed");
            self.record_error(e);
        }
        let decision = self.reconnect.attempt_resolved(outcome.is_ok());
        self.apply_decision(decision);
    }

    async fn reconnect_now(&mut self) -> Result<()> {
        info!("Manual reconnect requested");
        self.reconnect.reset();
        self.reconnect_at = None;
        self.update(|s| {
            s.reconnect_exhausted = false;
            s.reconnect_attempt = 0;
            s.error = None;
        });

        self.teardown().await;
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.record_error(&e);
                let decision = self.reconnect.on_state_change(ConnectionState::Failed);
                self.apply_decision(decision);
                Err(e)
            }
        }
    }

    /// Close the peer connection as a network loss would, keeping the room
    async fn drop_connection(&mut self) -> Result<()> {
        let peer = self.peer()?;
        warn!(generation = peer.generation(), "Dropping peer connection");
        if let Err(e) = peer.close().await {
            debug!(error = %e, "Peer close reported an error");
        }
        self.on_connection_state(ConnectionState::Failed);
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::RequestMedia(reply) => {
                let granted = self.request_media().await;
                let _ = reply.send(granted);
            }
            Command::SetAudio(enabled, reply) => {
                let result = self.set_track_enabled(MediaKind::Audio, enabled).await;
                let _ = reply.send(result);
            }
            Command::SetVideo(enabled, reply) => {
                let result = self.set_track_enabled(MediaKind::Video, enabled).await;
                let _ = reply.send(result);
            }
            Command::SetPartnerAudio(enabled) => {
                self.update(|s| s.partner_audio_enabled = enabled);
            }
            Command::Reconnect(reply) => {
                let result = self.reconnect_now().await;
                let _ = reply.send(result);
            }
            Command::DropConnection(reply) => {
                let result = self.drop_connection().await;
                let _ = reply.send(result);
            }
            // Handled by the loop
            Command::Disable(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn shutdown(&mut self) {
        self.reconnect.cancel();
        self.reconnect_at = None;
        self.quality.lock().reset();
        self.teardown().await;
        self.media_granted = false;
        self.update(|s| {
            s.connection_state = ConnectionState::Closed;
            s.is_connecting = false;
            s.has_requested_media = false;
            s.local_stream = None;
            s.remote_stream = None;
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
