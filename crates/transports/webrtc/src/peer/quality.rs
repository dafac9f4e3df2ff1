//! Connection quality monitoring
//!
//! Samples transport statistics on an interval and classifies the link.
//! Purely observational: nothing here feeds back into negotiation.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Link quality classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Excellent,
    Good,
    Poor,
    Disconnected,
}

/// Derived link metrics
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualitySample {
    pub bitrate_kbps: f64,
    pub packet_loss_pct: f64,
    pub jitter_ms: f64,
    pub round_trip_ms: f64,
}

/// Latest classified sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityReport {
    pub sample: QualitySample,
    pub level: QualityLevel,
    pub sampled_at: Instant,
}

/// Classify a link; the first matching rule wins
///
/// 1. no bitrate: `Disconnected`
/// 2. loss < 1%, jitter < 30ms, rtt < 150ms: `Excellent`
/// 3. loss < 3%, jitter < 50ms, rtt < 300ms: `Good`
/// 4. otherwise: `Poor`
pub fn classify(bitrate_kbps: f64, packet_loss_pct: f64, jitter_ms: f64, round_trip_ms: f64) -> QualityLevel {
    if bitrate_kbps <= 0.0 {
        QualityLevel::Disconnected
    } else if packet_loss_pct < 1.0 && jitter_ms < 30.0 && round_trip_ms < 150.0 {
        QualityLevel::Excellent
    } else if packet_loss_pct < 3.0 && jitter_ms < 50.0 && round_trip_ms < 300.0 {
        QualityLevel::Good
    } else {
        QualityLevel::Poor
    }
}

impl QualitySample {
    pub fn level(&self) -> QualityLevel {
        classify(
            self.bitrate_kbps,
            self.packet_loss_pct,
            self.jitter_ms,
            self.round_trip_ms,
        )
    }
}

/// Raw inbound transport counters
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransportStats {
    pub bytes_received: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub jitter_seconds: f64,
    /// Round trip of the active candidate pair, if one succeeded
    pub round_trip_seconds: Option<f64>,
    /// Milliseconds on a monotonic clock when the counters were read
    pub timestamp_ms: f64,
}

/// Something that can report transport counters
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn transport_stats(&self) -> Result<TransportStats>;
}

/// Turns successive counter snapshots into samples
#[derive(Debug, Default)]
pub struct QualityEstimator {
    previous: Option<TransportStats>,
}

impl QualityEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a sample from `stats` and the previous snapshot
    ///
    /// Bitrate is 0 on the first snapshot and when time did not advance.
    pub fn update(&mut self, stats: TransportStats) -> QualitySample {
        let bitrate_kbps = match self.previous {
            Some(prev) => {
                let elapsed_ms = stats.timestamp_ms - prev.timestamp_ms;
                if elapsed_ms > 0.0 {
                    let bytes = stats.bytes_received.saturating_sub(prev.bytes_received);
                    (bytes as f64 * 8.0) / elapsed_ms
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        let counted = stats.packets_lost + stats.packets_received;
        let packet_loss_pct = if counted > 0 {
            stats.packets_lost as f64 / counted as f64 * 100.0
        } else {
            0.0
        };

        self.previous = Some(stats);

        QualitySample {
            bitrate_kbps,
            packet_loss_pct,
            jitter_ms: stats.jitter_seconds * 1000.0,
            round_trip_ms: stats.round_trip_seconds.unwrap_or(0.0) * 1000.0,
        }
    }
}

/// Periodic sampler publishing [`QualityReport`]s on a watch channel
pub struct QualityMonitor {
    interval: Duration,
    tx: watch::Sender<Option<QualityReport>>,
    task: Option<JoinHandle<()>>,
}

impl QualityMonitor {
    pub fn new(interval: Duration) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            interval,
            tx,
            task: None,
        }
    }

    /// Start sampling `source`: once now, then every interval
    ///
    /// Restarting replaces the previous sampler and its baseline.
    pub fn start(&mut self, source: Arc<dyn StatsSource>) {
        self.stop();
        let tx = self.tx.clone();
        let interval = self.interval;

        self.task = Some(tokio::spawn(async move {
            let mut estimator = QualityEstimator::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match source.transport_stats().await {
                    Ok(stats) => {
                        let sample = estimator.update(stats);
                        let level = sample.level();
                        trace!(?sample, ?level, "Quality sample");
                        tx.send_replace(Some(QualityReport {
                            sample,
                            level,
                            sampled_at: Instant::now(),
                        }));
                    }
                    Err(e) => debug!(error = %e, "Stats query failed, skipping sample"),
                }
            }
        }));
    }

    /// Stop sampling; the last report stays readable
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Stop sampling and forget the last report
    pub fn reset(&mut self) {
        self.stop();
        self.tx.send_replace(None);
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn latest(&self) -> Option<QualityReport> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<QualityReport>> {
        self.tx.subscribe()
    }
}

impl Drop for QualityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_classify_vectors() {
        assert_eq!(classify(0.0, 0.0, 0.0, 0.0), QualityLevel::Disconnected);
        assert_eq!(classify(500.0, 0.5, 20.0, 100.0), QualityLevel::Excellent);
        assert_eq!(classify(500.0, 2.0, 40.0, 200.0), QualityLevel::Good);
        assert_eq!(classify(500.0, 5.0, 20.0, 100.0), QualityLevel::Poor);

        assert_eq!(classify(0.0, 0.5, 10.0, 100.0), QualityLevel::Disconnected);
        assert_eq!(classify(0.0, 5.0, 100.0, 500.0), QualityLevel::Disconnected);
        assert_eq!(classify(100.0, 0.5, 10.0, 100.0), QualityLevel::Excellent);
        assert_eq!(classify(100.0, 2.0, 40.0, 250.0), QualityLevel::Good);
        assert_eq!(classify(100.0, 5.0, 100.0, 500.0), QualityLevel::Poor);
    }

    #[test]
    fn test_classify_boundaries() {
        assert_eq!(classify(1.0, 1.0, 0.0, 0.0), QualityLevel::Good);
        assert_eq!(classify(1.0, 0.0, 50.0, 0.0), QualityLevel::Poor);
        assert_eq!(classify(1.0, 0.0, 0.0, 300.0), QualityLevel::Poor);
    }

    #[test]
    fn test_estimator_first_sample_has_no_bitrate() {
        let mut estimator = QualityEstimator::new();
        let sample = estimator.update(TransportStats {
            bytes_received: 10_000,
            packets_received: 100,
            timestamp_ms: 1000.0,
            ..Default::default()
        });
        assert_eq!(sample.bitrate_kbps, 0.0);
        assert_eq!(sample.level(), QualityLevel::Disconnected);
    }

    #[test]
    fn test_estimator_derives_metrics() {
        let mut estimator = QualityEstimator::new();
        estimator.update(TransportStats {
            bytes_received: 0,
            timestamp_ms: 0.0,
            ..Default::default()
        });
        let sample = estimator.update(TransportStats {
            bytes_received: 8_000,
            packets_received: 98,
            packets_lost: 2,
            jitter_seconds: 0.012,
            round_trip_seconds: Some(0.08),
            timestamp_ms: 2000.0,
        });
        // 8000 bytes * 8 / 2000 ms
        assert!((sample.bitrate_kbps - 32.0).abs() < 1e-9);
        assert!((sample.packet_loss_pct - 2.0).abs() < 1e-9);
        assert!((sample.jitter_ms - 12.0).abs() < 1e-9);
        assert!((sample.round_trip_ms - 80.0).abs() < 1e-9);
        assert_eq!(sample.level(), QualityLevel::Good);
    }

    #[test]
    fn test_estimator_zero_elapsed() {
        let mut estimator = QualityEstimator::new();
        let stats = TransportStats {
            bytes_received: 100,
            timestamp_ms: 5.0,
            ..Default::default()
        };
        estimator.update(stats);
        assert_eq!(estimator.update(stats).bitrate_kbps, 0.0);
    }

    struct Counter(Mutex<u64>);

    #[async_trait]
    impl StatsSource for Counter {
        async fn transport_stats(&self) -> Result<TransportStats> {
            let mut calls = self.0.lock();
            *calls += 1;
            Ok(TransportStats {
                bytes_received: *calls * 1000,
                packets_received: *calls * 10,
                timestamp_ms: *calls as f64 * 100.0,
                ..Default::default()
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_samples_immediately_then_periodically() {
        let source = Arc::new(Counter(Mutex::new(0)));
        let mut monitor = QualityMonitor::new(Duration::from_secs(2));
        let mut rx = monitor.subscribe();
        monitor.start(source.clone());

        rx.changed().await.unwrap();
        let first = monitor.latest().unwrap();
        assert_eq!(first.level, QualityLevel::Disconnected);

        tokio::time::advance(Duration::from_secs(2)).await;
        rx.changed().await.unwrap();
        let second = monitor.latest().unwrap();
        assert!(second.sample.bitrate_kbps > 0.0);
        assert_eq!(*source.0.lock(), 2);

        monitor.stop();
        assert!(!monitor.is_running());
        assert!(monitor.latest().is_some());
        monitor.reset();
        assert!(monitor.latest().is_none());
    }
}
