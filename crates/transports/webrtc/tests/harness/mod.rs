//! Study room end-to-end test harness
//!
//! Provides infrastructure for integration testing of two-party sessions:
//! - Shared in-process relay store
//! - Orchestrators wired to synthetic media devices
//! - Snapshot wait helpers
//!
//! Basic usage pattern:
//!
//! 1. Create a `StudyRoomHarness` for a signaling mode
//! 2. Create peers using `harness.create_peer()`
//! 3. Enable both and wait for `connected` with `wait_for`
//! 4. Call `peer.session.disable()` to clean up

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use studyroom_webrtc::signaling::LocalRelayTransport;
use studyroom_webrtc::{
    RelayStore, SessionConfig, SessionOrchestrator, SessionSnapshot, SignalingMode,
    SyntheticMediaDevices,
};
use tokio::sync::watch;

/// Default wait for a session condition
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Session error: {0}")]
    SessionError(#[from] studyroom_webrtc::Error),
}

/// Initialize test logging once; honours `RUST_LOG`
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("studyroom_webrtc=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// One participant: orchestrator plus the knobs tests turn
pub struct TestPeer {
    pub user_id: String,
    pub session: SessionOrchestrator,
    pub devices: Arc<SyntheticMediaDevices>,
    pub transport: Arc<LocalRelayTransport>,
}

impl TestPeer {
    pub async fn enable(&self, session_id: &str) -> HarnessResult<()> {
        self.session
            .enable(session_id, &self.user_id, &self.user_id)
            .await?;
        Ok(())
    }

    pub async fn wait_for<F>(&self, what: &str, predicate: F) -> HarnessResult<SessionSnapshot>
    where
        F: Fn(&SessionSnapshot) -> bool,
    {
        wait_for(self.session.subscribe(), what, CONNECT_TIMEOUT, predicate).await
    }

    pub async fn wait_connected(&self) -> HarnessResult<SessionSnapshot> {
        self.wait_for("connected", |s| s.is_connected()).await
    }
}

/// Shared relay plus peer factory
pub struct StudyRoomHarness {
    pub store: Arc<RelayStore>,
    pub mode: SignalingMode,
}

impl StudyRoomHarness {
    pub fn new(mode: SignalingMode) -> Self {
        init_logging();
        Self {
            store: Arc::new(RelayStore::default()),
            mode,
        }
    }

    /// Loopback-friendly config: host candidates only, fast polling
    pub fn config(&self) -> SessionConfig {
        SessionConfig::lan("http://localhost:8787").with_signaling_mode(self.mode)
    }

    pub fn create_peer(&self, user_id: &str) -> TestPeer {
        self.create_peer_with(user_id, self.config().with_auto_start_media(true))
    }

    pub fn create_peer_with(&self, user_id: &str, config: SessionConfig) -> TestPeer {
        let devices = Arc::new(SyntheticMediaDevices::new());
        let transport = Arc::new(LocalRelayTransport::new(Arc::clone(&self.store), self.mode));
        let session = SessionOrchestrator::new(config, transport.clone(), devices.clone());
        TestPeer {
            user_id: user_id.to_string(),
            session,
            devices,
            transport,
        }
    }

    /// Enable `first` then `second` in `session_id` and wait for both to connect
    pub async fn connect_pair(
        &self,
        session_id: &str,
        first: &TestPeer,
        second: &TestPeer,
    ) -> HarnessResult<()> {
        first.enable(session_id).await?;
        first
            .wait_for("answerer role", |s| s.role.is_some())
            .await?;
        second.enable(session_id).await?;
        first.wait_connected().await?;
        second.wait_connected().await?;
        Ok(())
    }
}

/// Wait until `predicate` holds for the latest snapshot
pub async fn wait_for<F>(
    mut rx: watch::Receiver<SessionSnapshot>,
    what: &str,
    timeout: Duration,
    predicate: F,
) -> HarnessResult<SessionSnapshot>
where
    F: Fn(&SessionSnapshot) -> bool,
{
    let waited = tokio::time::timeout(timeout, async {
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if predicate(&snapshot) {
                    return Some(snapshot.clone());
                }
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    })
    .await;

    match waited {
        Ok(Some(snapshot)) => Ok(snapshot),
        Ok(None) => Err(HarnessError::Timeout(format!("{}: session dropped", what))),
        Err(_) => Err(HarnessError::Timeout(format!(
            "{} not reached within {:?}",
            what, timeout
        ))),
    }
}
