//! Live set of detected hardware ports.
//!
//! Every update is a full snapshot. Subscribers always see the latest
//! snapshot as a whole; nothing is merged with what came before.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use monitor_fsm::{DetectedPorts, MonitorError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Source of detected-ports snapshots, queried on demand.
#[async_trait]
pub trait DeviceScanner: Send + Sync {
    async fn detected_ports(&self) -> Result<DetectedPorts, MonitorError>;
}

/// Holder of the current detection snapshot.
#[derive(Clone)]
pub struct PortPresence {
    tx: Arc<watch::Sender<DetectedPorts>>,
}

impl Default for PortPresence {
    fn default() -> Self {
        Self::new()
    }
}

impl PortPresence {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(DetectedPorts::new());
        Self { tx: Arc::new(tx) }
    }

    /// Point query for the current snapshot.
    pub fn detected_ports(&self) -> DetectedPorts {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DetectedPorts> {
        self.tx.subscribe()
    }

    /// Replace the snapshot wholesale. Subscribers are notified even when the
    /// contents are unchanged, so a poll also acts as a re-detection pulse.
    pub fn replace(&self, snapshot: DetectedPorts) {
        debug!("Detected ports snapshot: {} port(s)", snapshot.len());
        self.tx.send_replace(snapshot);
    }

    /// The scanner is unreachable: publish an empty snapshot.
    pub fn mark_unavailable(&self) {
        self.replace(DetectedPorts::new());
    }
}

/// Poll `scanner` every `interval` until `cancel` fires.
pub fn spawn_presence_poller(
    scanner: Arc<dyn DeviceScanner>,
    presence: PortPresence,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match scanner.detected_ports().await {
                Ok(snapshot) => presence.replace(snapshot),
                Err(e) => {
                    warn!("Device scan failed: {}", e);
                    presence.mark_unavailable();
                }
            }
        }
        debug!("Presence poller stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use monitor_fsm::{DetectedPort, PortIdentifier};
    use std::sync::Mutex;

    fn snapshot(addresses: &[&str]) -> DetectedPorts {
        DetectedPorts::from_ports(
            addresses
                .iter()
                .map(|a| DetectedPort::new(PortIdentifier::serial(*a))),
        )
    }

    #[test]
    fn snapshots_replace_rather_than_merge() {
        let presence = PortPresence::new();
        presence.replace(snapshot(&["/dev/ttyACM0"]));
        presence.replace(snapshot(&["/dev/ttyACM1"]));

        let current = presence.detected_ports();
        assert_eq!(current.len(), 1);
        assert!(current.contains_port(&PortIdentifier::serial("/dev/ttyACM1")));
        assert!(!current.contains_port(&PortIdentifier::serial("/dev/ttyACM0")));
    }

    #[tokio::test]
    async fn subscribers_see_latest_snapshot() {
        let presence = PortPresence::new();
        let mut rx = presence.subscribe();
        presence.replace(snapshot(&["/dev/ttyACM0"]));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);

        presence.mark_unavailable();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_empty());
    }

    struct ScriptedScanner {
        results: Mutex<Vec<Result<DetectedPorts, MonitorError>>>,
    }

    #[async_trait]
    impl DeviceScanner for ScriptedScanner {
        async fn detected_ports(&self) -> Result<DetectedPorts, MonitorError> {
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(DetectedPorts::new())
            } else {
                results.remove(0)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poller_fails_open_on_scan_error() {
        let scanner = Arc::new(ScriptedScanner {
            results: Mutex::new(vec![
                Ok(snapshot(&["/dev/ttyACM0"])),
                Err(MonitorError::BridgeDisconnected),
            ]),
        });
        let presence = PortPresence::new();
        let mut rx = presence.subscribe();
        let cancel = CancellationToken::new();
        let task = spawn_presence_poller(
            scanner,
            presence.clone(),
            Duration::from_millis(100),
            cancel.clone(),
        );

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_empty());

        cancel.cancel();
        task.await.unwrap();
    }
}
