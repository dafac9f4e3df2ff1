//! Local and remote media streams
//!
//! Capture is behind the [`MediaDevices`] trait so hosts can plug in a real
//! camera/microphone backend. [`SyntheticMediaDevices`] produces silent
//! Opus and placeholder VP8 samples for headless peers and tests.

pub mod synthetic;

pub use synthetic::SyntheticMediaDevices;

use crate::config::MediaConstraints;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Kind of media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Both kinds, audio first
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// Codec used for local tracks of this kind (Opus / VP8)
    pub fn codec_capability(&self) -> RTCRtpCodecCapability {
        match self {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000, // Standard 90kHz clock for video
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        }
    }

    /// webrtc-rs codec type
    pub fn codec_type(&self) -> RTPCodecType {
        match self {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        }
    }

    /// Map a webrtc-rs codec type back to a kind
    pub fn from_codec_type(codec_type: RTPCodecType) -> Option<Self> {
        match codec_type {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        }
    }

    /// Kinds requested by `constraints`
    pub fn requested_by(constraints: &MediaConstraints) -> Vec<MediaKind> {
        let mut kinds = Vec::with_capacity(2);
        if constraints.audio {
            kinds.push(MediaKind::Audio);
        }
        if constraints.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a capture failure name to the media error taxonomy
///
/// `NotAllowedError` becomes [`Error::PermissionDenied`], `NotFoundError`
/// becomes [`Error::DeviceUnavailable`], anything else [`Error::MediaError`].
pub fn media_error_from_name(name: &str, message: &str) -> Error {
    let detail = format!("{}: {}", name, message);
    match name {
        "NotAllowedError" | "PermissionDeniedError" | "SecurityError" => {
            Error::PermissionDenied(detail)
        }
        "NotFoundError" | "DevicesNotFoundError" | "OverconstrainedError" => {
            Error::DeviceUnavailable(detail)
        }
        _ => Error::MediaError(detail),
    }
}

/// Provider of local capture streams
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire a stream satisfying `constraints`
    ///
    /// # Errors
    ///
    /// [`Error::PermissionDenied`], [`Error::DeviceUnavailable`] or
    /// [`Error::MediaError`].
    async fn request_user_media(&self, constraints: MediaConstraints) -> Result<LocalStream>;
}

// ============================================================================
// Local media
// ============================================================================

/// Captured track feeding an RTP sender
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    /// Task producing samples for this track
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LocalTrack {
    /// Create an enabled track of `kind` belonging to `stream_id`
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind, uuid::Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(
            kind.codec_capability(),
            id.clone(),
            stream_id.to_string(),
        ));
        Self {
            id,
            kind,
            track,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            pump: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Underlying webrtc-rs track
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or mute the track; disabled tracks send nothing
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Attach the task producing samples; it is aborted on [`stop`](Self::stop)
    pub fn attach_pump(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Write one encoded sample
    ///
    /// Returns `Ok(false)` without sending while the track is disabled.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool> {
        if self.is_stopped() {
            return Err(Error::Closed(format!("track {} is stopped", self.id)));
        }
        if !self.is_enabled() {
            return Ok(false);
        }
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to write sample: {}", e)))?;
        Ok(true)
    }

    /// Stop the track and release its source; idempotent
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        debug!(track_id = %self.id, kind = %self.kind, "Local track stopped");
    }
}

impl Drop for LocalTrack {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

/// Set of local tracks sharing one stream id
#[derive(Debug)]
pub struct LocalStream {
    id: String,
    tracks: RwLock<Vec<Arc<LocalTrack>>>,
}

impl Default for LocalStream {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStream {
    pub fn new() -> Self {
        Self {
            id: format!("stream-{}", uuid::Uuid::new_v4()),
            tracks: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.tracks.read().clone()
    }

    /// First live track of `kind`
    pub fn track(&self, kind: MediaKind) -> Option<Arc<LocalTrack>> {
        self.tracks
            .read()
            .iter()
            .find(|t| t.kind() == kind && !t.is_stopped())
            .cloned()
    }

    pub fn has_track(&self, kind: MediaKind) -> bool {
        self.track(kind).is_some()
    }

    pub fn add_track(&self, track: Arc<LocalTrack>) {
        self.tracks.write().push(track);
    }

    /// Stop every track; idempotent
    pub fn stop(&self) {
        for track in self.tracks.read().iter() {
            track.stop();
        }
    }

    /// True once every track is stopped
    pub fn is_stopped(&self) -> bool {
        self.tracks.read().iter().all(|t| t.is_stopped())
    }
}

// ============================================================================
// Remote media
// ============================================================================

/// Track received from the partner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Tracks received from the partner, grouped as one stream
#[derive(Debug)]
pub struct RemoteStream {
    id: String,
    tracks: RwLock<Vec<RemoteTrack>>,
    packets_received: AtomicU64,
    ended: AtomicBool,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: RwLock::new(Vec::new()),
            packets_received: AtomicU64::new(0),
            ended: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.read().clone()
    }

    pub fn has_track(&self, kind: MediaKind) -> bool {
        self.tracks.read().iter().any(|t| t.kind == kind)
    }

    pub(crate) fn add_track(&self, track: RemoteTrack) {
        let mut tracks = self.tracks.write();
        if !tracks.iter().any(|t| t.id == track.id) {
            tracks.push(track);
        }
    }

    /// RTP packets received across all tracks
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub(crate) fn record_packet(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub(crate) fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_error_mapping() {
        assert!(matches!(
            media_error_from_name("NotAllowedError", "denied"),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            media_error_from_name("NotFoundError", "no camera"),
            Error::DeviceUnavailable(_)
        ));
        assert!(matches!(
            media_error_from_name("NotReadableError", "busy"),
            Error::MediaError(_)
        ));
    }

    #[test]
    fn test_requested_kinds() {
        assert_eq!(
            MediaKind::requested_by(&MediaConstraints::default()),
            vec![MediaKind::Audio]
        );
        assert_eq!(
            MediaKind::requested_by(&MediaConstraints::audio_video()),
            vec![MediaKind::Audio, MediaKind::Video]
        );
    }

    #[test]
    fn test_local_stream_track_lookup() {
        let stream = LocalStream::new();
        let audio = Arc::new(LocalTrack::new(MediaKind::Audio, stream.id()));
        stream.add_track(Arc::clone(&audio));

        assert!(stream.has_track(MediaKind::Audio));
        assert!(!stream.has_track(MediaKind::Video));

        audio.set_enabled(false);
        assert!(!stream.track(MediaKind::Audio).unwrap().is_enabled());

        stream.stop();
        stream.stop();
        assert!(stream.is_stopped());
        assert!(!stream.has_track(MediaKind::Audio));
    }

    #[tokio::test]
    async fn test_disabled_track_writes_nothing() {
        let track = LocalTrack::new(MediaKind::Audio, "s");
        track.set_enabled(false);
        let sent = track
            .write_sample(Bytes::from_static(&[0xF8, 0xFF, 0xFE]), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!sent);

        track.stop();
        assert!(track
            .write_sample(Bytes::new(), Duration::from_millis(20))
            .await
            .is_err());
    }

    #[test]
    fn test_remote_stream_dedupes_tracks() {
        let stream = RemoteStream::new("remote");
        let track = RemoteTrack {
            id: "a1".to_string(),
            kind: MediaKind::Audio,
        };
        stream.add_track(track.clone());
        stream.add_track(track);
        assert_eq!(stream.tracks().len(), 1);
        assert!(stream.has_track(MediaKind::Audio));
    }
}
