//! Telemetry liveness.
//!
//! The link counts as up while telemetry keeps arriving. A silence longer
//! than the liveness timeout flips it to down until the next record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kartlink_core::types::Telemetry;

/// The most recent telemetry record seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastSeen {
    /// When the record arrived, on the local monotonic clock.
    pub received_at: Instant,
    /// Timestamp the kart put on the record.
    pub timestamp: DateTime<Utc>,
}

/// Watches the telemetry stream and publishes whether it is alive.
pub struct LivenessMonitor {
    connected: watch::Receiver<bool>,
    last_seen: watch::Receiver<Option<LastSeen>>,
    cancel: CancellationToken,
}

impl LivenessMonitor {
    /// Start watching `telemetry`. The link starts out down.
    pub fn spawn(telemetry: broadcast::Receiver<Telemetry>, timeout: Duration) -> Self {
        let (connected_tx, connected) = watch::channel(false);
        let (seen_tx, last_seen) = watch::channel(None);
        let cancel = CancellationToken::new();

        tokio::spawn(watch_loop(
            telemetry,
            timeout,
            connected_tx,
            seen_tx,
            cancel.clone(),
        ));

        Self {
            connected,
            last_seen,
            cancel,
        }
    }

    /// `true` while telemetry arrives at least once per timeout.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// The most recent telemetry record, if any arrived yet.
    pub fn last_seen(&self) -> Option<LastSeen> {
        *self.last_seen.borrow()
    }

    /// Whole seconds since the last telemetry record arrived.
    pub fn seconds_since_last(&self) -> Option<u64> {
        self.last_seen().map(|seen| seen.received_at.elapsed().as_secs())
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn watch_loop(
    mut telemetry: broadcast::Receiver<Telemetry>,
    timeout: Duration,
    connected_tx: watch::Sender<bool>,
    seen_tx: watch::Sender<Option<LastSeen>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            next = tokio::time::timeout(timeout, telemetry.recv()) => match next {
                Ok(Ok(record)) => {
                    seen_tx.send_replace(Some(LastSeen {
                        received_at: Instant::now(),
                        timestamp: record.data.timestamp,
                    }));
                    set(&connected_tx, true);
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "liveness monitor lagged");
                    set(&connected_tx, true);
                }
                Ok(Err(RecvError::Closed)) => {
                    set(&connected_tx, false);
                    break;
                }
                Err(_) => set(&connected_tx, false),
            },
        }
    }
}

fn set(tx: &watch::Sender<bool>, up: bool) {
    let changed = tx.send_if_modified(|current| {
        let changed = *current != up;
        *current = up;
        changed
    });
    if changed {
        debug!(connected = up, "telemetry liveness changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kartlink_core::types::{TelemetryData, timestamp};

    fn record(ts: &str) -> Telemetry {
        Telemetry {
            recipient: "base".into(),
            sender: "kart-7".into(),
            rssi: None,
            snr: None,
            data: TelemetryData {
                lat: Some(52.0),
                lng: Some(4.0),
                altitude: None,
                speed: Some(12.5),
                course: None,
                battery: None,
                hdop: None,
                satellites: None,
                timestamp: timestamp::parse(ts).unwrap(),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn starts_down_and_comes_up_on_telemetry() {
        let (tx, rx) = broadcast::channel(8);
        let monitor = LivenessMonitor::spawn(rx, Duration::from_secs(10));
        let mut connected = monitor.connected();
        assert!(!monitor.is_connected());
        assert_eq!(monitor.last_seen(), None);
        assert_eq!(monitor.seconds_since_last(), None);

        tx.send(record("2024-01-01T00:00:00Z")).unwrap();
        connected.wait_for(|up| *up).await.unwrap();

        assert_eq!(
            monitor.last_seen().map(|s| s.timestamp),
            timestamp::parse("2024-01-01T00:00:00Z")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silence_takes_link_down() {
        let (tx, rx) = broadcast::channel(8);
        let monitor = LivenessMonitor::spawn(rx, Duration::from_secs(10));
        let mut connected = monitor.connected();

        tx.send(record("2024-01-01T00:00:00Z")).unwrap();
        connected.wait_for(|up| *up).await.unwrap();

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(monitor.is_connected());

        connected.wait_for(|up| !*up).await.unwrap();
        assert!(monitor.seconds_since_last().unwrap() >= 10);

        tx.send(record("2024-01-01T00:00:20Z")).unwrap();
        connected.wait_for(|up| *up).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn steady_telemetry_stays_up() {
        let (tx, rx) = broadcast::channel(8);
        let monitor = LivenessMonitor::spawn(rx, Duration::from_secs(10));
        let mut connected = monitor.connected();

        for _ in 0..5 {
            tx.send(record("2024-01-01T00:00:00Z")).unwrap();
            connected.wait_for(|up| *up).await.unwrap();
            tokio::time::sleep(Duration::from_secs(8)).await;
            assert!(monitor.is_connected());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn seconds_since_last_counts_up() {
        let (tx, rx) = broadcast::channel(8);
        let monitor = LivenessMonitor::spawn(rx, Duration::from_secs(10));
        let mut connected = monitor.connected();

        tx.send(record("2024-01-01T00:00:00Z")).unwrap();
        connected.wait_for(|up| *up).await.unwrap();
        assert_eq!(monitor.seconds_since_last(), Some(0));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(monitor.seconds_since_last(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_stream_goes_down() {
        let (tx, rx) = broadcast::channel(8);
        let monitor = LivenessMonitor::spawn(rx, Duration::from_secs(10));
        let mut connected = monitor.connected();

        tx.send(record("2024-01-01T00:00:00Z")).unwrap();
        connected.wait_for(|up| *up).await.unwrap();
        drop(tx);

        connected.wait_for(|up| !*up).await.unwrap();
    }
}
