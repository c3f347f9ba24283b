//! Wiring: presence, registry, multiplexer and host in one place.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::{ClientConnection, ClientIdentity, MonitorSink};
use crate::error::ManagerError;
use crate::messenger::{HostClient, spawn_host};
use crate::presence::{DeviceScanner, PortPresence, spawn_presence_poller};
use crate::registry::{DEFAULT_PRESENCE_GRACE, RegistryHandle, SessionRegistry};
use crate::stream::StreamMultiplexer;
use crate::transport::{
    HttpDeviceScanner, HttpTransport, MonitorTransport, TransportKind, WebSocketTransport,
};

/// Runtime configuration for a [`MonitorService`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub bridge_url: String,
    pub transport: TransportKind,
    pub poll_interval: Duration,
    /// How long a port may be missing from detection before it is lost.
    pub presence_grace: Duration,
    pub default_baudrate: Option<u32>,
    pub auto_play: bool,
    pub notification_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            bridge_url: "http://127.0.0.1:50051".to_string(),
            transport: TransportKind::Http,
            poll_interval: Duration::from_millis(1000),
            presence_grace: DEFAULT_PRESENCE_GRACE,
            default_baudrate: Some(9600),
            auto_play: true,
            notification_capacity: 256,
        }
    }
}

pub struct MonitorService {
    config: MonitorConfig,
    presence: PortPresence,
    registry: RegistryHandle,
    multiplexer: StreamMultiplexer,
    host: HostClient,
    cancel: CancellationToken,
}

impl MonitorService {
    /// Connect to the bridge named in `config` and start polling it.
    pub fn start(config: MonitorConfig) -> Result<Self, ManagerError> {
        let transport: Arc<dyn MonitorTransport> = match config.transport {
            TransportKind::Http => Arc::new(HttpTransport::new(&config.bridge_url)?),
            TransportKind::Websocket => Arc::new(WebSocketTransport::new(&config.bridge_url)?),
        };
        let scanner: Arc<dyn DeviceScanner> = Arc::new(HttpDeviceScanner::new(&config.bridge_url)?);
        info!(
            "Monitor service using {:?} transport at {}",
            config.transport, config.bridge_url
        );
        Ok(Self::with_parts(transport, Some(scanner), config))
    }

    /// Build the service over explicit parts. Without a scanner the caller
    /// feeds [`PortPresence`] directly.
    pub fn with_parts(
        transport: Arc<dyn MonitorTransport>,
        scanner: Option<Arc<dyn DeviceScanner>>,
        config: MonitorConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let presence = PortPresence::new();
        let registry = SessionRegistry::spawn(config.presence_grace, config.notification_capacity);
        let multiplexer = StreamMultiplexer::new(transport);
        multiplexer.bind_registry(registry.clone(), cancel.child_token());

        spawn_presence_sync(presence.clone(), registry.clone(), cancel.child_token());
        if let Some(scanner) = scanner {
            spawn_presence_poller(
                scanner,
                presence.clone(),
                config.poll_interval,
                cancel.child_token(),
            );
        }

        let (host, _) = spawn_host(
            registry.clone(),
            multiplexer.clone(),
            presence.clone(),
            config.notification_capacity,
            cancel.child_token(),
        );

        Self {
            config,
            presence,
            registry,
            multiplexer,
            host,
            cancel,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn host(&self) -> HostClient {
        self.host.clone()
    }

    pub fn presence(&self) -> &PortPresence {
        &self.presence
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn multiplexer(&self) -> &StreamMultiplexer {
        &self.multiplexer
    }

    /// Create a client adapter that is already listening for notifications.
    pub fn connect(&self, identity: ClientIdentity, sink: Arc<dyn MonitorSink>) -> ClientConnection {
        let connection = ClientConnection::new(
            identity,
            self.host(),
            sink,
            self.config.default_baudrate,
            self.config.auto_play,
        );
        connection.listen(self.cancel.child_token());
        connection
    }

    /// Stop every background task. Idempotent.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("Monitor service shutting down");
        }
        self.cancel.cancel();
    }
}

impl Drop for MonitorService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Feed every presence snapshot to the registry.
fn spawn_presence_sync(presence: PortPresence, registry: RegistryHandle, cancel: CancellationToken) {
    let mut watch = presence.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = watch.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let snapshot = watch.borrow_and_update().clone();
            if let Err(e) = registry.apply_presence(snapshot).await {
                warn!("Failed to apply presence snapshot: {}", e);
                break;
            }
        }
    });
}
