//! Bridge transports.
//!
//! A transport opens one upstream byte stream per port and forwards control
//! operations to the bridge. Whether further readers may share that stream is
//! a property of the transport, see [`TransportMode`].

pub mod http;
pub mod ws;

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::BoxStream;
use monitor_fsm::{MonitorError, MonitorPhysicalState, PortIdentifier};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::ManagerError;

pub use http::{HttpDeviceScanner, HttpTransport};
pub use ws::{BridgeFrame, ControlFrame, WebSocketTransport};

/// Raw bytes from the bridge, ending on close or on the first error.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, MonitorError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// One upstream fans out to any number of readers.
    Shared,
    /// One reader per upstream; a second open reports `AlreadyAttached`.
    Exclusive,
}

/// Which transport to reach the bridge with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    Websocket,
}

/// Out-of-band notifications from the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    PhysicalStateChanged { state: MonitorPhysicalState },
    ResumeOnPort {
        from: PortIdentifier,
        to: PortIdentifier,
    },
    Disconnected,
    Reconnected,
}

#[async_trait]
pub trait MonitorTransport: Send + Sync {
    fn mode(&self) -> TransportMode;

    async fn open(
        &self,
        port: &PortIdentifier,
        baudrate: Option<u32>,
    ) -> Result<ByteStream, MonitorError>;

    async fn send(&self, port: &PortIdentifier, text: &str) -> Result<(), MonitorError>;

    async fn update_baudrate(
        &self,
        port: &PortIdentifier,
        baudrate: u32,
    ) -> Result<(), MonitorError>;

    /// The bridge moved a live monitor from `from` to `to`. Control
    /// operations addressed to `to` must reach the moved stream afterwards.
    fn rekey(&self, _from: &PortIdentifier, _to: &PortIdentifier) {}

    fn events(&self) -> broadcast::Receiver<BridgeEvent>;
}

/// Tracks whether the bridge is reachable and publishes the edges.
pub(crate) struct BridgeLink {
    down: AtomicBool,
    events: broadcast::Sender<BridgeEvent>,
}

impl BridgeLink {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            down: AtomicBool::new(false),
            events,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    /// Pass a request result through, noting reachability changes.
    pub(crate) fn observe<T>(&self, result: Result<T, MonitorError>) -> Result<T, MonitorError> {
        match &result {
            Err(MonitorError::BridgeDisconnected) => {
                if !self.down.swap(true, Ordering::SeqCst) {
                    warn!("Bridge is unreachable");
                    self.emit(BridgeEvent::Disconnected);
                }
            }
            _ => {
                if self.down.swap(false, Ordering::SeqCst) {
                    info!("Bridge is reachable again");
                    self.emit(BridgeEvent::Reconnected);
                }
            }
        }
        result
    }
}

/// Parse a bridge base url so that relative endpoints join under it.
pub(crate) fn parse_base_url(url: &str) -> Result<Url, ManagerError> {
    let mut parsed =
        Url::parse(url).map_err(|e| ManagerError::InvalidUrl(format!("{}: {}", url, e)))?;
    if !parsed.path().ends_with('/') {
        let path = format!("{}/", parsed.path());
        parsed.set_path(&path);
    }
    Ok(parsed)
}

pub(crate) fn endpoint(base: &Url, path: &str) -> Result<Url, MonitorError> {
    base.join(path)
        .map_err(|e| MonitorError::internal(format!("bad endpoint {}: {}", path, e)))
}

/// Query pairs naming a monitor on the bridge.
pub(crate) fn monitor_query(
    port: &PortIdentifier,
    baudrate: Option<u32>,
) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("protocol", port.protocol.clone()),
        ("address", port.address.clone()),
    ];
    if let Some(baudrate) = baudrate {
        query.push(("baudrate", baudrate.to_string()));
    }
    query
}
