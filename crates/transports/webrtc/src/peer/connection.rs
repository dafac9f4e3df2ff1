//! WebRTC peer connection management

use crate::config::{MediaConstraints, SessionConfig};
use crate::media::{LocalStream, LocalTrack, MediaDevices, MediaKind, RemoteStream, RemoteTrack};
use crate::peer::quality::{StatsSource, TransportStats};
use crate::peer::state::ConnectionState;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::candidate::CandidatePairState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Event emitted by a [`PeerConnectionManager`]
#[derive(Debug, Clone)]
pub struct PeerEvent {
    /// Generation of the manager that emitted the event
    pub generation: u64,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    /// Local ICE candidate to trickle to the partner
    LocalCandidate(RTCIceCandidateInit),
    /// Partner track arrived
    RemoteTrack(RemoteTrack),
    /// Connection state moved
    StateChanged(ConnectionState),
}

/// Result of toggling a media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// Existing track flipped in place
    Applied,
    /// A new track was attached; an offer/answer cycle must follow
    NeedsRenegotiation,
}

/// Shared connection state with transition checking
#[derive(Clone)]
struct StateCell {
    state: Arc<Mutex<ConnectionState>>,
    closed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<PeerEvent>,
    generation: u64,
}

impl StateCell {
    fn get(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Apply `next` if the transition is allowed; returns whether it moved
    fn transition(&self, next: ConnectionState) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut state = self.state.lock();
        let current = *state;
        if current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            debug!(
                generation = self.generation,
                from = %current,
                to = %next,
                "Ignoring disallowed state transition"
            );
            return false;
        }
        debug!(generation = self.generation, from = %current, to = %next, "Peer state transition");
        *state = next;
        drop(state);
        self.emit(PeerEventKind::StateChanged(next));
        true
    }

    fn emit(&self, kind: PeerEventKind) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(PeerEvent {
            generation: self.generation,
            kind,
        });
    }
}

/// Owns one `RTCPeerConnection` and its local/remote media
///
/// Every callback registered on the connection is tagged with the
/// manager's generation and becomes a no-op once [`close`](Self::close)
/// has run, so a replaced manager can never touch session state.
pub struct PeerConnectionManager {
    generation: u64,
    peer_connection: Arc<RTCPeerConnection>,
    devices: Arc<dyn MediaDevices>,
    cell: StateCell,
    local_stream: RwLock<Option<Arc<LocalStream>>>,
    remote_stream: Arc<RemoteStream>,
    /// Remote candidates received before the remote description
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    /// RTCP drains and remote track readers
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl PeerConnectionManager {
    /// Create a peer connection and register its handlers
    ///
    /// # Arguments
    ///
    /// * `config` - STUN/TURN servers
    /// * `devices` - Capture provider used by [`start_local_media`](Self::start_local_media)
    /// * `generation` - Tag attached to every emitted event
    /// * `events` - Sink for candidates, remote tracks and state changes
    #[instrument(skip(config, devices, events))]
    pub async fn initialize(
        config: &SessionConfig,
        devices: Arc<dyn MediaDevices>,
        generation: u64,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        // Create MediaEngine with default codecs (Opus, VP8/VP9/H.264)
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        // Create InterceptorRegistry with default interceptors (NACK, RTCP reports)
        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        // Configure ICE servers (STUN/TURN)
        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::WebRtcError(format!("Failed to create peer connection: {}", e))
            })?);

        let cell = StateCell {
            state: Arc::new(Mutex::new(ConnectionState::New)),
            closed: Arc::new(AtomicBool::new(false)),
            events,
            generation,
        };
        let remote_stream = Arc::new(RemoteStream::new(format!("remote-{}", generation)));
        let tasks = Arc::new(Mutex::new(Vec::new()));

        // Connection state changes
        let state_cell = cell.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let state_cell = state_cell.clone();
                Box::pin(async move {
                    if let Some(next) = ConnectionState::from_rtc(s) {
                        state_cell.transition(next);
                    }
                })
            },
        ));

        // Local ICE candidates
        let candidate_cell = cell.clone();
        peer_connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let candidate_cell = candidate_cell.clone();
            Box::pin(async move {
                let Some(candidate) = c else {
                    trace!(generation = candidate_cell.generation, "ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => candidate_cell.emit(PeerEventKind::LocalCandidate(init)),
                    Err(e) => warn!(error = %e, "Failed to serialize local ICE candidate"),
                }
            })
        }));

        // Remote tracks: record and drain so receiver stats keep moving
        let track_cell = cell.clone();
        let track_stream = Arc::clone(&remote_stream);
        let track_tasks = Arc::clone(&tasks);
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let track_cell = track_cell.clone();
                let track_stream = Arc::clone(&track_stream);
                let track_tasks = Arc::clone(&track_tasks);
                Box::pin(async move {
                    if track_cell.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    let Some(kind) = MediaKind::from_codec_type(track.kind()) else {
                        return;
                    };
                    let remote = RemoteTrack {
                        id: track.id(),
                        kind,
                    };
                    info!(
                        generation = track_cell.generation,
                        track_id = %remote.id,
                        kind = %kind,
                        "Remote track received"
                    );
                    track_stream.add_track(remote.clone());

                    let reader_stream = Arc::clone(&track_stream);
                    let reader = tokio::spawn(async move {
                        while track.read_rtp().await.is_ok() {
                            reader_stream.record_packet();
                        }
                    });
                    track_tasks.lock().push(reader);

                    track_cell.emit(PeerEventKind::RemoteTrack(remote));
                })
            },
        ));

        info!(generation, "Peer connection created");

        Ok(Self {
            generation,
            peer_connection,
            devices,
            cell,
            local_stream: RwLock::new(None),
            remote_stream,
            pending_candidates: Mutex::new(Vec::new()),
            tasks,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.cell.get()
    }

    pub fn is_closed(&self) -> bool {
        self.cell.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed(format!(
                "peer connection generation {} is closed",
                self.generation
            )));
        }
        Ok(())
    }

    /// Current local stream, if media was started
    pub async fn local_stream(&self) -> Option<Arc<LocalStream>> {
        self.local_stream.read().await.clone()
    }

    /// Partner stream, once at least one track has arrived
    pub fn remote_stream(&self) -> Option<Arc<RemoteStream>> {
        if self.remote_stream.tracks().is_empty() {
            None
        } else {
            Some(Arc::clone(&self.remote_stream))
        }
    }

    /// Acquire local media and attach its tracks
    ///
    /// Idempotent: while a stream is open it is returned as-is.
    pub async fn start_local_media(&self, constraints: MediaConstraints) -> Result<Arc<LocalStream>> {
        self.ensure_open()?;
        let mut slot = self.local_stream.write().await;
        if let Some(stream) = slot.as_ref() {
            if !stream.is_stopped() {
                return Ok(Arc::clone(stream));
            }
        }

        let stream = Arc::new(self.devices.request_user_media(constraints).await?);
        for track in stream.tracks() {
            self.attach_track(&track).await?;
        }
        info!(
            generation = self.generation,
            stream_id = %stream.id(),
            tracks = stream.tracks().len(),
            "Local media started"
        );
        *slot = Some(Arc::clone(&stream));
        Ok(stream)
    }

    /// Add `track` to the connection and drain its RTCP
    async fn attach_track(&self, track: &Arc<LocalTrack>) -> Result<()> {
        let sender = self
            .peer_connection
            .add_track(track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| {
                Error::MediaTrackError(format!("Failed to add {} track: {}", track.kind(), e))
            })?;

        let drain = tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        self.tasks.lock().push(drain);

        debug!(generation = self.generation, track_id = %track.id(), "Local track attached");
        Ok(())
    }

    /// Make sure an offer asks to receive both audio and video
    async fn ensure_receive_transceivers(&self) -> Result<()> {
        let transceivers = self.peer_connection.get_transceivers().await;
        for kind in MediaKind::ALL {
            let present = transceivers
                .iter()
                .any(|t| MediaKind::from_codec_type(t.kind()) == Some(kind));
            if present {
                continue;
            }
            self.peer_connection
                .add_transceiver_from_kind(
                    kind.codec_type(),
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| {
                    Error::MediaTrackError(format!("Failed to add {} transceiver: {}", kind, e))
                })?;
        }
        Ok(())
    }

    /// Create an SDP offer and apply it locally
    pub async fn create_offer(&self) -> Result<RTCSessionDescription> {
        self.ensure_open()?;
        self.ensure_receive_transceivers().await?;

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after setting offer".to_string()))?;

        debug!(generation = self.generation, "Created SDP offer");
        Ok(local)
    }

    /// Create an SDP answer to the applied remote offer
    pub async fn create_answer(&self) -> Result<RTCSessionDescription> {
        self.ensure_open()?;
        let has_offer = self
            .peer_connection
            .remote_description()
            .await
            .is_some_and(|d| d.sdp_type == RTCSdpType::Offer);
        if !has_offer {
            return Err(Error::NegotiationFailure(
                "cannot answer without a remote offer".to_string(),
            ));
        }

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after setting answer".to_string()))?;

        if self.state() == ConnectionState::Renegotiating {
            self.cell.transition(ConnectionState::Connected);
        }

        debug!(generation = self.generation, "Created SDP answer");
        Ok(local)
    }

    /// Apply the partner's offer or answer, then flush queued candidates
    pub async fn set_remote_description(&self, description: RTCSessionDescription) -> Result<()> {
        self.ensure_open()?;
        let sdp_type = description.sdp_type;

        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote {}: {}", sdp_type, e)))?;

        match (sdp_type, self.state()) {
            (RTCSdpType::Offer, ConnectionState::Connected) => {
                self.cell.transition(ConnectionState::Renegotiating);
            }
            (RTCSdpType::Answer, ConnectionState::Renegotiating) => {
                self.cell.transition(ConnectionState::Connected);
            }
            _ => {}
        }

        let queued: Vec<RTCIceCandidateInit> = std::mem::take(&mut *self.pending_candidates.lock());
        if !queued.is_empty() {
            debug!(generation = self.generation, count = queued.len(), "Flushing early ICE candidates");
        }
        for candidate in queued {
            if let Err(e) = self.peer_connection.add_ice_candidate(candidate).await {
                warn!(generation = self.generation, error = %e, "Dropping queued ICE candidate");
            }
        }
        Ok(())
    }

    /// Add a remote ICE candidate; queued until a remote description exists
    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.ensure_open()?;
        if self.peer_connection.remote_description().await.is_none() {
            trace!(generation = self.generation, "Queueing early ICE candidate");
            self.pending_candidates.lock().push(candidate);
            return Ok(());
        }

        self.peer_connection
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    /// Number of candidates waiting for a remote description
    pub fn queued_candidate_count(&self) -> usize {
        self.pending_candidates.lock().len()
    }

    /// Whether `offer` comes from a new partner connection
    ///
    /// A renegotiation keeps the DTLS fingerprint; a rebuilt connection
    /// brings a fresh certificate.
    pub async fn is_partner_restart(&self, offer: &RTCSessionDescription) -> bool {
        let Some(current) = self.peer_connection.remote_description().await else {
            return false;
        };
        match (dtls_fingerprint(&current.sdp), dtls_fingerprint(&offer.sdp)) {
            (Some(current), Some(incoming)) => current != incoming,
            _ => false,
        }
    }

    /// Mark the start of a local renegotiation
    pub fn begin_renegotiation(&self) -> bool {
        self.state() == ConnectionState::Connected
            && self.cell.transition(ConnectionState::Renegotiating)
    }

    /// Whether no offer/answer exchange is in progress
    pub fn signaling_is_stable(&self) -> bool {
        self.peer_connection.signaling_state() == RTCSignalingState::Stable
    }

    /// Whether our offer is waiting for an answer
    pub fn has_local_offer(&self) -> bool {
        self.peer_connection.signaling_state() == RTCSignalingState::HaveLocalOffer
    }

    /// Withdraw our pending offer so an incoming one can be applied
    pub async fn rollback_local_offer(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.has_local_offer() {
            return Ok(());
        }
        let pending = match self.peer_connection.pending_local_description().await {
            Some(description) => description,
            None => self
                .peer_connection
                .local_description()
                .await
                .ok_or_else(|| Error::SdpError("No local offer to roll back".to_string()))?,
        };

        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        rollback.sdp = pending.sdp;
        self.peer_connection
            .set_local_description(rollback)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to roll back local offer: {}", e)))?;

        debug!(generation = self.generation, "Rolled back local offer");
        Ok(())
    }

    /// Enable or mute local audio
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<ToggleOutcome> {
        self.set_kind_enabled(MediaKind::Audio, enabled).await
    }

    /// Enable or hide local video
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<ToggleOutcome> {
        self.set_kind_enabled(MediaKind::Video, enabled).await
    }

    async fn set_kind_enabled(&self, kind: MediaKind, enabled: bool) -> Result<ToggleOutcome> {
        self.ensure_open()?;
        let mut slot = self.local_stream.write().await;

        if let Some(track) = slot.as_ref().and_then(|s| s.track(kind)) {
            track.set_enabled(enabled);
            debug!(generation = self.generation, kind = %kind, enabled, "Track toggled");
            return Ok(ToggleOutcome::Applied);
        }
        if !enabled {
            return Ok(ToggleOutcome::Applied);
        }

        // No track of this kind yet: capture one and attach it
        let constraints = MediaConstraints {
            audio: kind == MediaKind::Audio,
            video: kind == MediaKind::Video,
        };
        let captured = self.devices.request_user_media(constraints).await?;
        let track = captured
            .track(kind)
            .ok_or_else(|| Error::DeviceUnavailable(format!("no {} track captured", kind)))?;
        self.attach_track(&track).await?;

        match slot.as_ref() {
            Some(stream) => stream.add_track(track),
            None => *slot = Some(Arc::new(captured)),
        }
        info!(generation = self.generation, kind = %kind, "Track added, renegotiation required");
        Ok(ToggleOutcome::NeedsRenegotiation)
    }

    /// Stats reader for the quality monitor
    pub fn stats_source(&self) -> Arc<dyn StatsSource> {
        Arc::new(PeerStats {
            peer_connection: Arc::clone(&self.peer_connection),
            closed: Arc::clone(&self.cell.closed),
            epoch: Instant::now(),
        })
    }

    /// Close the connection and release media; idempotent
    pub async fn close(&self) -> Result<()> {
        if self.cell.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(generation = self.generation, "Closing peer connection");
        *self.cell.state.lock() = ConnectionState::Closed;

        if let Some(stream) = self.local_stream.write().await.take() {
            stream.stop();
        }
        self.remote_stream.end();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.pending_candidates.lock().clear();

        self.peer_connection.close().await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to close connection: {}", e))
        })
    }
}

/// First `a=fingerprint:` value in an SDP blob
fn dtls_fingerprint(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix("a=fingerprint:"))
}

/// Reads inbound audio counters and the active candidate pair RTT
struct PeerStats {
    peer_connection: Arc<RTCPeerConnection>,
    closed: Arc<AtomicBool>,
    epoch: Instant,
}

#[async_trait]
impl StatsSource for PeerStats {
    async fn transport_stats(&self) -> Result<TransportStats> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("peer connection is closed".to_string()));
        }
        let report = self.peer_connection.get_stats().await;
        let mut stats = TransportStats {
            timestamp_ms: self.epoch.elapsed().as_secs_f64() * 1000.0,
            ..Default::default()
        };

        // webrtc-rs does not report inbound loss or jitter; both stay 0
        let mut pairs = Vec::new();
        for entry in report.reports.values() {
            match entry {
                StatsReportType::InboundRTP(inbound) if inbound.kind == "audio" => {
                    stats.bytes_received += inbound.bytes_received;
                    stats.packets_received += inbound.packets_received;
                }
                StatsReportType::CandidatePair(pair) => pairs.push(PairSample {
                    succeeded: pair.state == CandidatePairState::Succeeded,
                    nominated: pair.nominated,
                    timestamp: pair.timestamp,
                    round_trip_seconds: pair.current_round_trip_time,
                }),
                _ => {}
            }
        }
        stats.round_trip_seconds = active_round_trip(pairs);
        Ok(stats)
    }
}

/// The fields of a candidate pair report that pick the active pair
#[derive(Debug, Clone, Copy)]
struct PairSample<T> {
    succeeded: bool,
    nominated: bool,
    timestamp: T,
    round_trip_seconds: f64,
}

/// RTT of the pair carrying media
///
/// Only succeeded pairs count. A nominated pair wins over the others, then
/// the most recently reported one.
fn active_round_trip<T: Ord + Copy>(pairs: impl IntoIterator<Item = PairSample<T>>) -> Option<f64> {
    pairs
        .into_iter()
        .filter(|pair| pair.succeeded)
        .max_by_key(|pair| (pair.nominated, pair.timestamp))
        .map(|pair| pair.round_trip_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticMediaDevices;

    async fn manager(generation: u64) -> (PeerConnectionManager, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = SessionConfig {
            stun_servers: Vec::new(),
            ..Default::default()
        };
        let manager = PeerConnectionManager::initialize(
            &config,
            Arc::new(SyntheticMediaDevices::new()),
            generation,
            tx,
        )
        .await
        .unwrap();
        (manager, rx)
    }

    #[tokio::test]
    async fn test_offer_requests_audio_and_video() {
        let (manager, _rx) = manager(1).await;
        let offer = manager.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, RTCSdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(manager.has_local_offer());
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let (manager, _rx) = manager(1).await;
        let err = manager.create_answer().await.unwrap_err();
        assert!(matches!(err, Error::NegotiationFailure(_)));
    }

    #[tokio::test]
    async fn test_early_candidates_are_queued() {
        let (manager, _rx) = manager(1).await;
        manager
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            })
            .await
            .unwrap();
        assert_eq!(manager.queued_candidate_count(), 1);
    }

    #[tokio::test]
    async fn test_start_local_media_is_idempotent() {
        let (manager, _rx) = manager(1).await;
        let first = manager
            .start_local_media(MediaConstraints::default())
            .await
            .unwrap();
        let second = manager
            .start_local_media(MediaConstraints::default())
            .await
            .unwrap();
        assert_eq!(first.id(), second.id());
        manager.close().await.unwrap();
        assert!(first.is_stopped());
    }

    #[tokio::test]
    async fn test_toggle_video_without_track_needs_renegotiation() {
        let (manager, _rx) = manager(1).await;
        manager
            .start_local_media(MediaConstraints::default())
            .await
            .unwrap();

        assert_eq!(
            manager.set_audio_enabled(false).await.unwrap(),
            ToggleOutcome::Applied
        );
        assert_eq!(
            manager.set_video_enabled(true).await.unwrap(),
            ToggleOutcome::NeedsRenegotiation
        );
        let stream = manager.local_stream().await.unwrap();
        assert!(stream.has_track(MediaKind::Video));
        assert!(!stream.track(MediaKind::Audio).unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let (manager, _rx) = manager(1).await;
        manager.close().await.unwrap();
        manager.close().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(manager.create_offer().await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_returns_to_stable() {
        let (manager, _rx) = manager(1).await;
        manager.create_offer().await.unwrap();
        assert!(!manager.signaling_is_stable());
        manager.rollback_local_offer().await.unwrap();
        assert!(manager.signaling_is_stable());
    }

    #[test]
    fn test_dtls_fingerprint_extraction() {
        let sdp = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\na=fingerprint:sha-256 AB:CD\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";
        assert_eq!(dtls_fingerprint(sdp), Some("sha-256 AB:CD"));
        assert_eq!(dtls_fingerprint("v=0\r\n"), None);
    }

    #[tokio::test]
    async fn test_partner_restart_detection() {
        let (offerer, _rx1) = manager(1).await;
        let (answerer, _rx2) = manager(2).await;
        let (rebuilt, _rx3) = manager(3).await;

        let offer = offerer.create_offer().await.unwrap();
        assert!(!answerer.is_partner_restart(&offer).await);
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        let renegotiation = offerer.create_offer().await.unwrap();
        assert!(!answerer.is_partner_restart(&renegotiation).await);

        let fresh = rebuilt.create_offer().await.unwrap();
        assert!(answerer.is_partner_restart(&fresh).await);
    }

    fn pair(succeeded: bool, nominated: bool, at: Instant, rtt: f64) -> PairSample<Instant> {
        PairSample {
            succeeded,
            nominated,
            timestamp: at,
            round_trip_seconds: rtt,
        }
    }

    #[test]
    fn test_active_round_trip_prefers_nominated_then_latest() {
        let t0 = Instant::now();
        let t1 = t0 + std::time::Duration::from_millis(10);
        let t2 = t0 + std::time::Duration::from_millis(20);

        assert_eq!(active_round_trip(Vec::<PairSample<Instant>>::new()), None);
        assert_eq!(active_round_trip(vec![pair(false, true, t2, 0.5)]), None);

        // Nominated wins even when an unnominated pair reported later
        let pairs = vec![
            pair(true, false, t2, 0.3),
            pair(true, true, t0, 0.05),
            pair(false, true, t2, 0.9),
        ];
        assert_eq!(active_round_trip(pairs.clone()), Some(0.05));
        let reversed: Vec<_> = pairs.into_iter().rev().collect();
        assert_eq!(active_round_trip(reversed), Some(0.05));

        // Without a nominated pair the newest report wins
        let pairs = vec![pair(true, false, t1, 0.2), pair(true, false, t2, 0.1), pair(true, false, t0, 0.4)];
        assert_eq!(active_round_trip(pairs), Some(0.1));
    }

    fn state_changes(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PeerEventKind::StateChanged(state) = event.kind {
                states.push(state);
            }
        }
        states
    }

    /// Offer/answer, then trickle candidates both ways until both sides connect
    async fn connect(
        offerer: &PeerConnectionManager,
        offerer_rx: &mut mpsc::UnboundedReceiver<PeerEvent>,
        answerer: &PeerConnectionManager,
        answerer_rx: &mut mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        offerer
            .start_local_media(MediaConstraints::default())
            .await
            .unwrap();
        let offer = offerer.create_offer().await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        let trickle = async {
            let (mut offerer_up, mut answerer_up) = (false, false);
            while !(offerer_up && answerer_up) {
                tokio::select! {
                    Some(event) = offerer_rx.recv() => match event.kind {
                        PeerEventKind::LocalCandidate(candidate) => {
                            let _ = answerer.add_ice_candidate(candidate).await;
                        }
                        PeerEventKind::StateChanged(ConnectionState::Connected) => offerer_up = true,
                        _ => {}
                    },
                    Some(event) = answerer_rx.recv() => match event.kind {
                        PeerEventKind::LocalCandidate(candidate) => {
                            let _ = offerer.add_ice_candidate(candidate).await;
                        }
                        PeerEventKind::StateChanged(ConnectionState::Connected) => answerer_up = true,
                        _ => {}
                    },
                }
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(20), trickle)
            .await
            .expect("peers did not connect");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_renegotiation_reports_renegotiating_then_connected() {
        let (offerer, mut offerer_rx) = manager(1).await;
        let (answerer, mut answerer_rx) = manager(2).await;
        connect(&offerer, &mut offerer_rx, &answerer, &mut answerer_rx).await;
        state_changes(&mut offerer_rx);
        state_changes(&mut answerer_rx);

        assert!(offerer.begin_renegotiation());
        assert_eq!(offerer.state(), ConnectionState::Renegotiating);
        // Only valid from `connected`
        assert!(!offerer.begin_renegotiation());

        let offer = offerer.create_offer().await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        assert_eq!(answerer.state(), ConnectionState::Renegotiating);
        let answer = answerer.create_answer().await.unwrap();
        assert_eq!(answerer.state(), ConnectionState::Connected);
        offerer.set_remote_description(answer).await.unwrap();
        assert_eq!(offerer.state(), ConnectionState::Connected);
        assert!(offerer.signaling_is_stable());

        assert_eq!(
            state_changes(&mut offerer_rx),
            vec![ConnectionState::Renegotiating, ConnectionState::Connected]
        );
        assert_eq!(
            state_changes(&mut answerer_rx),
            vec![ConnectionState::Renegotiating, ConnectionState::Connected]
        );

        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
    }
}
