//! Peer connection lifecycle management
//!
//! Exponential-backoff recovery for a failed or dropped connection. The
//! controller is a plain state machine: it decides *when* to reconnect and
//! the session driver performs the teardown and re-join.

use crate::config::ReconnectOptions;
use crate::peer::state::ConnectionState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reconnection policy configuration
///
/// Controls how reconnection attempts are made when a peer connection fails.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectionPolicy {
    /// Maximum number of reconnection attempts (default: 5)
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds (default: 1000ms)
    pub backoff_initial_ms: u64,
    /// Maximum backoff delay in milliseconds (default: 16000ms)
    pub backoff_max_ms: u64,
    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::from(&ReconnectOptions::default())
    }
}

impl From<&ReconnectOptions> for ReconnectionPolicy {
    fn from(options: &ReconnectOptions) -> Self {
        Self {
            max_retries: options.max_retries,
            backoff_initial_ms: options.backoff_initial_ms,
            backoff_max_ms: options.backoff_max_ms,
            backoff_multiplier: options.backoff_multiplier,
        }
    }
}

impl ReconnectionPolicy {
    /// Calculate backoff duration for a given attempt number
    ///
    /// `min(initial * multiplier^attempt, max)`
    ///
    /// # Arguments
    /// * `attempt` - Attempts already made (0-indexed)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let backoff_ms = (self.backoff_initial_ms as f64) * self.backoff_multiplier.powi(exponent);

        // Clamp to maximum
        let backoff_ms = backoff_ms.min(self.backoff_max_ms as f64);

        Duration::from_millis(backoff_ms as u64)
    }

    /// Check if more retries are allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

// ============================================================================
// Reconnection Controller
// ============================================================================

/// Reconnection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionState {
    /// Nothing scheduled
    Idle,
    /// Timer running for the given attempt
    WaitingForBackoff { attempt: u32 },
    /// Attempt in progress
    Reconnecting { attempt: u32 },
    /// Gave up; only an explicit reset re-arms the controller
    Exhausted,
}

/// What the driver should do after an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Nothing to do
    Ignore,
    /// Start a timer; call [`ReconnectionController::begin_attempt`] when it fires
    Schedule { attempt: u32, delay: Duration },
    /// Drop the pending timer; the connection recovered on its own
    CancelPending,
    /// Report [`Error::ReconnectExhausted`](crate::Error::ReconnectExhausted)
    Exhausted { attempts: u32 },
}

/// Drives exponential-backoff recovery from connection state changes
pub struct ReconnectionController {
    policy: ReconnectionPolicy,
    state: ReconnectionState,
    /// Attempts started since the last successful connection
    retries: u32,
    cancelled: Arc<AtomicBool>,
}

impl ReconnectionController {
    pub fn new(policy: ReconnectionPolicy) -> Self {
        Self {
            policy,
            state: ReconnectionState::Idle,
            retries: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> ReconnectionState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn policy(&self) -> &ReconnectionPolicy {
        &self.policy
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == ReconnectionState::Exhausted
    }

    /// Flag observed by [`begin_attempt`](Self::begin_attempt); may be set from any thread
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Feed a connection state change
    pub fn on_state_change(&mut self, state: ConnectionState) -> ReconnectDecision {
        match state {
            ConnectionState::Connected => {
                if self.retries > 0 {
                    info!(attempts = self.retries, "Connection recovered");
                }
                self.retries = 0;
                match self.state {
                    ReconnectionState::WaitingForBackoff { attempt } => {
                        debug!(attempt, "Connection healed before backoff elapsed");
                        self.state = ReconnectionState::Idle;
                        ReconnectDecision::CancelPending
                    }
                    ReconnectionState::Exhausted => ReconnectDecision::Ignore,
                    _ => {
                        self.state = ReconnectionState::Idle;
                        ReconnectDecision::Ignore
                    }
                }
            }
            ConnectionState::Failed | ConnectionState::Disconnected => {
                if self.state != ReconnectionState::Idle {
                    return ReconnectDecision::Ignore;
                }
                self.schedule_next()
            }
            _ => ReconnectDecision::Ignore,
        }
    }

    fn schedule_next(&mut self) -> ReconnectDecision {
        if self.cancelled.load(Ordering::SeqCst) {
            return ReconnectDecision::Ignore;
        }
        if !self.policy.should_retry(self.retries) {
            warn!(attempts = self.retries, "Reconnection attempts exhausted");
            self.state = ReconnectionState::Exhausted;
            return ReconnectDecision::Exhausted {
                attempts: self.retries,
            };
        }

        let delay = self.policy.calculate_backoff(self.retries);
        let attempt = self.retries + 1;
        info!(
            attempt,
            max_retries = self.policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnection"
        );
        self.state = ReconnectionState::WaitingForBackoff { attempt };
        ReconnectDecision::Schedule { attempt, delay }
    }

    /// Backoff elapsed; returns the attempt number to run, or `None` if cancelled
    pub fn begin_attempt(&mut self) -> Option<u32> {
        if self.cancelled.load(Ordering::SeqCst) {
            self.state = ReconnectionState::Idle;
            return None;
        }
        if !matches!(self.state, ReconnectionState::WaitingForBackoff { .. }) {
            return None;
        }
        self.retries += 1;
        self.state = ReconnectionState::Reconnecting {
            attempt: self.retries,
        };
        info!(attempt = self.retries, "Reconnection attempt started");
        Some(self.retries)
    }

    /// Report the outcome of setting up the current attempt
    ///
    /// Success only means the rejoin went through; the counter resets when
    /// the connection reports `Connected`.
    pub fn attempt_resolved(&mut self, succeeded: bool) -> ReconnectDecision {
        if !matches!(self.state, ReconnectionState::Reconnecting { .. }) {
            return ReconnectDecision::Ignore;
        }
        self.state = ReconnectionState::Idle;
        if succeeded {
            ReconnectDecision::Ignore
        } else {
            warn!(attempt = self.retries, "Reconnection attempt failed");
            self.schedule_next()
        }
    }

    /// Stop all recovery; pending timers must not start an attempt
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if self.state != ReconnectionState::Exhausted {
            self.state = ReconnectionState::Idle;
        }
    }

    /// Drop a pending attempt because the partner re-initiated the session
    ///
    /// The retry count is kept. Returns whether a timer was pending.
    pub fn withdraw(&mut self) -> bool {
        if matches!(self.state, ReconnectionState::WaitingForBackoff { .. }) {
            self.state = ReconnectionState::Idle;
            true
        } else {
            false
        }
    }

    /// Re-arm after an explicit user action
    pub fn reset(&mut self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.state = ReconnectionState::Idle;
        self.retries = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnection_policy_default() {
        let policy = ReconnectionPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.backoff_initial_ms, 1000);
        assert_eq!(policy.backoff_max_ms, 16000);
    }

    #[test]
    fn test_exponential_backoff_sequence() {
        let policy = ReconnectionPolicy::default();
        let delays: Vec<u64> = (0..6)
            .map(|n| policy.calculate_backoff(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 16000]);
    }

    #[test]
    fn test_backoff_huge_attempt_clamps() {
        let policy = ReconnectionPolicy::default();
        assert_eq!(policy.calculate_backoff(u32::MAX), Duration::from_millis(16000));
    }

    #[test]
    fn test_should_retry() {
        let policy = ReconnectionPolicy {
            max_retries: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_ignores_non_failure_states() {
        let mut controller = ReconnectionController::new(ReconnectionPolicy::default());
        for state in [
            ConnectionState::New,
            ConnectionState::Connecting,
            ConnectionState::Closed,
            ConnectionState::Renegotiating,
        ] {
            assert_eq!(controller.on_state_change(state), ReconnectDecision::Ignore);
        }
        assert_eq!(controller.state(), ReconnectionState::Idle);
    }

    #[test]
    fn test_failure_schedules_once() {
        let mut controller = ReconnectionController::new(ReconnectionPolicy::default());
        assert_eq!(
            controller.on_state_change(ConnectionState::Failed),
            ReconnectDecision::Schedule {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
        // Second failure while waiting does not stack a timer
        assert_eq!(
            controller.on_state_change(ConnectionState::Disconnected),
            ReconnectDecision::Ignore
        );
        assert_eq!(controller.begin_attempt(), Some(1));
        // Nor while the attempt is in flight
        assert_eq!(
            controller.on_state_change(ConnectionState::Failed),
            ReconnectDecision::Ignore
        );
    }

    #[test]
    fn test_connected_cancels_pending_timer() {
        let mut controller = ReconnectionController::new(ReconnectionPolicy::default());
        controller.on_state_change(ConnectionState::Disconnected);
        assert_eq!(
            controller.on_state_change(ConnectionState::Connected),
            ReconnectDecision::CancelPending
        );
        assert_eq!(controller.retries(), 0);
        assert_eq!(controller.begin_attempt(), None);
    }

    #[test]
    fn test_connected_resets_counter() {
        let mut controller = ReconnectionController::new(ReconnectionPolicy::default());
        controller.on_state_change(ConnectionState::Failed);
        controller.begin_attempt();
        controller.attempt_resolved(true);
        assert_eq!(controller.retries(), 1);

        controller.on_state_change(ConnectionState::Connected);
        assert_eq!(controller.retries(), 0);
        assert_eq!(
            controller.on_state_change(ConnectionState::Failed),
            ReconnectDecision::Schedule {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
    }

    #[test]
    fn test_exhaustion_reported_exactly_once() {
        let mut controller = ReconnectionController::new(ReconnectionPolicy::default());
        let mut delays = Vec::new();
        let mut exhausted = 0;

        let mut decision = controller.on_state_change(ConnectionState::Failed);
        loop {
            match decision {
                ReconnectDecision::Schedule { attempt, delay } => {
                    delays.push(delay.as_millis() as u64);
                    assert_eq!(controller.begin_attempt(), Some(attempt));
                    decision = controller.attempt_resolved(false);
                }
                ReconnectDecision::Exhausted { attempts } => {
                    assert_eq!(attempts, 5);
                    exhausted += 1;
                    break;
                }
                other => panic!("unexpected decision {:?}", other),
            }
        }

        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(exhausted, 1);
        assert!(controller.is_exhausted());
        assert_eq!(
            controller.on_state_change(ConnectionState::Failed),
            ReconnectDecision::Ignore
        );
    }

    #[test]
    fn test_cancel_blocks_pending_attempt() {
        let mut controller = ReconnectionController::new(ReconnectionPolicy::default());
        controller.on_state_change(ConnectionState::Failed);
        controller.cancel_handle().store(true, Ordering::SeqCst);
        assert_eq!(controller.begin_attempt(), None);
        assert_eq!(
            controller.on_state_change(ConnectionState::Failed),
            ReconnectDecision::Ignore
        );

        controller.reset();
        assert!(matches!(
            controller.on_state_change(ConnectionState::Failed),
            ReconnectDecision::Schedule { .. }
        ));
    }

    #[test]
    fn test_withdraw_keeps_retry_count() {
        let mut controller = ReconnectionController::new(ReconnectionPolicy::default());
        controller.on_state_change(ConnectionState::Failed);
        controller.begin_attempt();
        controller.attempt_resolved(true);
        controller.on_state_change(ConnectionState::Failed);

        assert!(controller.withdraw());
        assert!(!controller.withdraw());
        assert_eq!(controller.begin_attempt(), None);
        assert_eq!(controller.retries(), 1);
    }
}
