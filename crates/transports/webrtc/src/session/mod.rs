//! Session orchestration
//!
//! [`SessionOrchestrator`] composes the relay client, peer connection
//! manager, quality monitor and reconnection controller into
//! join → negotiate → monitor → recover → leave. State is published as a
//! [`SessionSnapshot`] on a watch channel.
//!
//! ```no_run
//! use std::sync::Arc;
//! use studyroom_webrtc::media::SyntheticMediaDevices;
//! use studyroom_webrtc::signaling::transport_for;
//! use studyroom_webrtc::{SessionConfig, SessionOrchestrator};
//!
//! # async fn run() -> studyroom_webrtc::Result<()> {
//! let config = SessionConfig::default();
//! let transport = transport_for(&config)?;
//! let session = SessionOrchestrator::new(config, transport, Arc::new(SyntheticMediaDevices::new()));
//!
//! session.enable("session-42", "alice", "Alice").await?;
//! session.request_media().await;
//! let mut updates = session.subscribe();
//! while updates.changed().await.is_ok() {
//!     if updates.borrow().is_connected() {
//!         break;
//!     }
//! }
//! session.disable().await;
//! # Ok(())
//! # }
//! ```

mod driver;
pub mod snapshot;

pub use snapshot::{can_speak, ErrorKind, Role, SessionError, SessionSnapshot};

use crate::config::{SessionConfig, SignalingMode};
use crate::media::MediaDevices;
use crate::peer::{QualityLevel, QualityMonitor, QualityReport};
use crate::signaling::{RelayClient, RoomId, SignalingTransport};
use crate::{Error, Result};
use driver::{Command, Driver};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to a running driver
struct ActiveSession {
    room: RoomId,
    commands: mpsc::Sender<Command>,
    live: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Owns one study-room connection at a time
pub struct SessionOrchestrator {
    config: SessionConfig,
    transport: Arc<dyn SignalingTransport>,
    devices: Arc<dyn MediaDevices>,
    snapshot: watch::Sender<SessionSnapshot>,
    quality: Arc<Mutex<QualityMonitor>>,
    active: tokio::sync::Mutex<Option<ActiveSession>>,
}

impl SessionOrchestrator {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn SignalingTransport>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        let (snapshot, _rx) = watch::channel(SessionSnapshot::default());
        let quality = QualityMonitor::new(Duration::from_millis(config.quality_sample_interval_ms));
        Self {
            config,
            transport,
            devices,
            snapshot,
            quality: Arc::new(Mutex::new(quality)),
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Delivery mode of the signaling transport
    pub fn signaling_mode(&self) -> SignalingMode {
        self.transport.mode()
    }

    /// Join the room for `session_id` and start negotiating
    ///
    /// Enabling while already enabled tears the previous session down
    /// first. Runtime failures (signaling, media, negotiation) land in the
    /// snapshot; only invalid configuration or session ids are returned.
    pub async fn enable(&self, session_id: &str, self_id: &str, display_name: &str) -> Result<()> {
        self.config.validate()?;
        let room = RoomId::derive(session_id)?;
        if self_id.trim().is_empty() {
            return Err(Error::InvalidConfig("user id must not be empty".to_string()));
        }

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            debug!(room = %previous.room, "Replacing enabled session");
            Self::stop(previous).await;
        }

        info!(room = %room, user_id = %self_id, "Enabling session");
        self.snapshot.send_replace(SessionSnapshot::default());
        self.quality.lock().reset();

        let relay = Arc::new(RelayClient::new(
            Arc::clone(&self.transport),
            room.clone(),
            self_id,
            display_name,
        ));
        let live = Arc::new(AtomicBool::new(true));
        let (driver, events) = Driver::new(
            self.config.clone(),
            relay,
            Arc::clone(&self.devices),
            Arc::clone(&live),
            self.snapshot.clone(),
            Arc::clone(&self.quality),
        );
        let cancel = driver.cancel_handle();
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let task = tokio::spawn(driver.run(commands_rx, events));

        *active = Some(ActiveSession {
            room,
            commands: commands_tx,
            live,
            cancel,
            task,
        });
        Ok(())
    }

    /// Leave the room and release every resource; idempotent
    pub async fn disable(&self) {
        let Some(session) = self.active.lock().await.take() else {
            return;
        };
        info!(room = %session.room, "Disabling session");
        Self::stop(session).await;
    }

    async fn stop(session: ActiveSession) {
        // Observed by the driver loop and any pending reconnect timer
        session.live.store(false, Ordering::SeqCst);
        session.cancel.store(true, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        if session.commands.send(Command::Disable(tx)).await.is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = session.task.await {
            warn!(error = %e, "Session driver ended abnormally");
        }
    }

    /// Whether a session is enabled
    pub async fn is_enabled(&self) -> bool {
        self.active.lock().await.is_some()
    }

    async fn send(&self, command: Command) -> Result<()> {
        let active = self.active.lock().await;
        let session = active
            .as_ref()
            .ok_or_else(|| Error::SessionError("session is not enabled".to_string()))?;
        session
            .commands
            .send(command)
            .await
            .map_err(|_| Error::Closed("session driver stopped".to_string()))
    }

    /// Acquire camera/microphone per the configured constraints
    ///
    /// Returns `true` if media is (already) available.
    pub async fn request_media(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.send(Command::RequestMedia(tx)).await {
            debug!(error = %e, "Media request without an active session");
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Enable or mute the microphone
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SetAudio(enabled, tx)).await?;
        rx.await
            .map_err(|_| Error::Closed("session driver stopped".to_string()))?
    }

    /// Enable or hide the camera
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SetVideo(enabled, tx)).await?;
        rx.await
            .map_err(|_| Error::Closed("session driver stopped".to_string()))?
    }

    /// Relay the partner's explicit microphone state
    pub async fn set_partner_audio_enabled(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetPartnerAudio(enabled)).await
    }

    /// Tear down and re-join now, resetting the retry budget
    pub async fn reconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Reconnect(tx)).await?;
        rx.await
            .map_err(|_| Error::Closed("session driver stopped".to_string()))?
    }

    /// Close the peer connection without leaving the room
    ///
    /// The session sees a `failed` connection and recovers through the
    /// reconnection controller. Used to exercise recovery in tests.
    #[doc(hidden)]
    pub async fn drop_connection(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::DropConnection(tx)).await?;
        rx.await
            .map_err(|_| Error::Closed("session driver stopped".to_string()))?
    }

    /// Current state
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Latest link quality report
    pub fn quality(&self) -> Option<QualityReport> {
        self.quality.lock().latest()
    }

    /// Latest link quality level, `Disconnected` before the first sample
    pub fn quality_level(&self) -> QualityLevel {
        self.quality()
            .map(|report| report.level)
            .unwrap_or(QualityLevel::Disconnected)
    }

    /// Watch link quality reports
    pub fn subscribe_quality(&self) -> watch::Receiver<Option<QualityReport>> {
        self.quality.lock().subscribe()
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        if let Some(session) = self.active.get_mut().take() {
            session.live.store(false, Ordering::SeqCst);
            session.cancel.store(true, Ordering::SeqCst);
            // The driver shuts down once its command channel closes
            drop(session.commands);
        }
    }
}
