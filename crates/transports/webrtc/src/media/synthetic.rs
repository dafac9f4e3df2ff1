//! Synthetic capture devices

use super::{media_error_from_name, LocalStream, LocalTrack, MediaDevices, MediaKind};
use crate::config::MediaConstraints;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// One 20ms Opus frame of silence
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Placeholder VP8 keyframe payload
const VP8_PLACEHOLDER: [u8; 10] = [0x10, 0x02, 0x00, 0x9D, 0x01, 0x2A, 0x10, 0x00, 0x10, 0x00];

const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(33);

/// Capture devices that generate placeholder media
///
/// Permission and device presence are switchable at runtime so denial and
/// missing-hardware paths can be exercised.
pub struct SyntheticMediaDevices {
    permission_granted: AtomicBool,
    has_microphone: AtomicBool,
    has_camera: AtomicBool,
    /// Forced failure by name (e.g. `NotReadableError`)
    failure: Mutex<Option<String>>,
    requests: AtomicU32,
}

impl Default for SyntheticMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticMediaDevices {
    /// Microphone and camera present, permission granted
    pub fn new() -> Self {
        Self {
            permission_granted: AtomicBool::new(true),
            has_microphone: AtomicBool::new(true),
            has_camera: AtomicBool::new(true),
            failure: Mutex::new(None),
            requests: AtomicU32::new(0),
        }
    }

    /// Devices whose user refuses access
    pub fn denied() -> Self {
        let devices = Self::new();
        devices.set_permission(false);
        devices
    }

    pub fn set_permission(&self, granted: bool) {
        self.permission_granted.store(granted, Ordering::SeqCst);
    }

    pub fn set_has_microphone(&self, present: bool) {
        self.has_microphone.store(present, Ordering::SeqCst);
    }

    pub fn set_has_camera(&self, present: bool) {
        self.has_camera.store(present, Ordering::SeqCst);
    }

    /// Fail every request with the named error until cleared
    pub fn set_failure(&self, name: Option<&str>) {
        *self.failure.lock() = name.map(str::to_string);
    }

    /// Number of capture requests received
    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    fn check(&self, constraints: &MediaConstraints) -> Result<()> {
        if constraints.is_empty() {
            return Err(Error::MediaError(
                "TypeError: at least one of audio and video must be requested".to_string(),
            ));
        }
        if let Some(name) = self.failure.lock().as_deref() {
            return Err(media_error_from_name(name, "capture failed"));
        }
        if !self.permission_granted.load(Ordering::SeqCst) {
            return Err(media_error_from_name("NotAllowedError", "Permission denied"));
        }
        if constraints.audio && !self.has_microphone.load(Ordering::SeqCst) {
            return Err(media_error_from_name("NotFoundError", "No microphone found"));
        }
        if constraints.video && !self.has_camera.load(Ordering::SeqCst) {
            return Err(media_error_from_name("NotFoundError", "No camera found"));
        }
        Ok(())
    }
}

/// Feed placeholder samples into `track` until it stops or is dropped
fn spawn_pump(track: &Arc<LocalTrack>) {
    let weak: Weak<LocalTrack> = Arc::downgrade(track);
    let (payload, frame) = match track.kind() {
        MediaKind::Audio => (Bytes::from_static(&OPUS_SILENCE), AUDIO_FRAME),
        MediaKind::Video => (Bytes::from_static(&VP8_PLACEHOLDER), VIDEO_FRAME),
    };

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(frame);
        loop {
            ticker.tick().await;
            let Some(track) = weak.upgrade() else {
                break;
            };
            if track.is_stopped() {
                break;
            }
            if let Err(e) = track.write_sample(payload.clone(), frame).await {
                trace!(track_id = %track.id(), error = %e, "Sample write failed");
            }
        }
    });
    track.attach_pump(handle);
}

#[async_trait]
impl MediaDevices for SyntheticMediaDevices {
    async fn request_user_media(&self, constraints: MediaConstraints) -> Result<LocalStream> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.check(&constraints)?;

        let stream = LocalStream::new();
        for kind in MediaKind::requested_by(&constraints) {
            let track = Arc::new(LocalTrack::new(kind, stream.id()));
            spawn_pump(&track);
            stream.add_track(track);
        }

        debug!(
            stream_id = %stream.id(),
            audio = constraints.audio,
            video = constraints.video,
            "Synthetic media acquired"
        );
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grants_requested_kinds() {
        let devices = SyntheticMediaDevices::new();
        let stream = devices
            .request_user_media(MediaConstraints::audio_video())
            .await
            .unwrap();
        assert!(stream.has_track(MediaKind::Audio));
        assert!(stream.has_track(MediaKind::Video));
        assert_eq!(devices.request_count(), 1);
        stream.stop();
    }

    #[tokio::test]
    async fn test_denied_permission() {
        let devices = SyntheticMediaDevices::denied();
        let err = devices
            .request_user_media(MediaConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_missing_camera() {
        let devices = SyntheticMediaDevices::new();
        devices.set_has_camera(false);
        assert!(devices.request_user_media(MediaConstraints::audio_only()).await.is_ok());
        let err = devices
            .request_user_media(MediaConstraints::audio_video())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_forced_failure_and_empty_constraints() {
        let devices = SyntheticMediaDevices::new();
        devices.set_failure(Some("NotReadableError"));
        let err = devices
            .request_user_media(MediaConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaError(_)));

        devices.set_failure(None);
        let err = devices
            .request_user_media(MediaConstraints { video: false, audio: false })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaError(_)));
    }
}
