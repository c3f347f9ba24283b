//! Typed request/notification channel between client adapters and the host.
//!
//! Every request kind is a [`HostRequest`] variant carrying its own responder,
//! so the reply type is fixed by the variant. Notifications fan out over a
//! broadcast channel and are fire-and-forget.

use std::future::Future;

use monitor_fsm::{
    AttemptId, ClientId, DetectedPorts, MonitorError, MonitorSessionState, PortIdentifier,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ManagerError;
use crate::presence::PortPresence;
use crate::registry::{RegistryHandle, SessionNotification};
use crate::stream::{MonitorReader, StreamMultiplexer};

type Reply<T> = oneshot::Sender<Result<T, ManagerError>>;

pub enum HostRequest {
    Start {
        client: ClientId,
        port: PortIdentifier,
        baudrate: Option<u32>,
        respond_to: Reply<MonitorSessionState>,
    },
    Stop {
        client: ClientId,
        port: PortIdentifier,
        respond_to: Reply<Option<MonitorSessionState>>,
    },
    Detach {
        client: ClientId,
        respond_to: Reply<()>,
    },
    OpenMonitor {
        port: PortIdentifier,
        baudrate: Option<u32>,
        attempt_id: Option<AttemptId>,
        cancel: CancellationToken,
        respond_to: Reply<MonitorReader>,
    },
    ReportOpened {
        port: PortIdentifier,
        attempt_id: AttemptId,
        respond_to: Reply<()>,
    },
    ReportOpenError {
        port: PortIdentifier,
        attempt_id: AttemptId,
        error: MonitorError,
        respond_to: Reply<()>,
    },
    ReportStreamClosed {
        port: PortIdentifier,
        attempt_id: Option<AttemptId>,
        respond_to: Reply<()>,
    },
    SendText {
        port: PortIdentifier,
        text: String,
        respond_to: Reply<()>,
    },
    UpdateBaudrate {
        port: PortIdentifier,
        baudrate: u32,
        respond_to: Reply<()>,
    },
    DetectedPorts {
        respond_to: Reply<DetectedPorts>,
    },
    SessionState {
        port: PortIdentifier,
        respond_to: Reply<Option<MonitorSessionState>>,
    },
}

impl HostRequest {
    fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
            Self::Detach { .. } => "detach",
            Self::OpenMonitor { .. } => "open_monitor",
            Self::ReportOpened { .. } => "report_opened",
            Self::ReportOpenError { .. } => "report_open_error",
            Self::ReportStreamClosed { .. } => "report_stream_closed",
            Self::SendText { .. } => "send_text",
            Self::UpdateBaudrate { .. } => "update_baudrate",
            Self::DetectedPorts { .. } => "detected_ports",
            Self::SessionState { .. } => "session_state",
        }
    }
}

/// Pushed from the host to every client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostNotification {
    DetectedPortsChanged { ports: DetectedPorts },
    SessionChanged { session: MonitorSessionState },
    SessionRemoved { port: PortIdentifier },
    SessionMoved {
        from: PortIdentifier,
        to: PortIdentifier,
    },
    BridgeDisconnected,
}

impl From<SessionNotification> for HostNotification {
    fn from(notification: SessionNotification) -> Self {
        match notification {
            SessionNotification::Changed { session } => Self::SessionChanged { session },
            SessionNotification::Removed { port } => Self::SessionRemoved { port },
            SessionNotification::Moved { from, to } => Self::SessionMoved { from, to },
            SessionNotification::BridgeDisconnected => Self::BridgeDisconnected,
        }
    }
}

/// Client side of the messenger. Cheap to clone.
#[derive(Clone)]
pub struct HostClient {
    sender: mpsc::Sender<HostRequest>,
    notifications: broadcast::Sender<HostNotification>,
}

impl HostClient {
    /// Send one request and wait for its reply, or for `cancel`.
    pub async fn request<T>(
        &self,
        cancel: &CancellationToken,
        build: impl FnOnce(Reply<T>) -> HostRequest,
    ) -> Result<T, ManagerError> {
        let (tx, rx) = oneshot::channel();
        let exchange = async {
            self.sender
                .send(build(tx))
                .await
                .map_err(|_| ManagerError::ActorGone("monitor host"))?;
            rx.await
                .map_err(|_| ManagerError::NoResponse("monitor host"))?
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ManagerError::Cancelled),
            result = exchange => result,
        }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> HostRequest,
    ) -> Result<T, ManagerError> {
        self.request(&CancellationToken::new(), build).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostNotification> {
        self.notifications.subscribe()
    }

    pub async fn start(
        &self,
        client: ClientId,
        port: PortIdentifier,
        baudrate: Option<u32>,
    ) -> Result<MonitorSessionState, ManagerError> {
        self.call(|respond_to| HostRequest::Start {
            client,
            port,
            baudrate,
            respond_to,
        })
        .await
    }

    pub async fn stop(
        &self,
        client: ClientId,
        port: PortIdentifier,
    ) -> Result<Option<MonitorSessionState>, ManagerError> {
        self.call(|respond_to| HostRequest::Stop {
            client,
            port,
            respond_to,
        })
        .await
    }

    pub async fn detach(&self, client: ClientId) -> Result<(), ManagerError> {
        self.call(|respond_to| HostRequest::Detach { client, respond_to })
            .await
    }

    /// Attach a reader for `port`. `attempt_id` names the session attempt
    /// the stream serves, if any.
    pub async fn open_monitor(
        &self,
        port: PortIdentifier,
        baudrate: Option<u32>,
        attempt_id: Option<AttemptId>,
        cancel: &CancellationToken,
    ) -> Result<MonitorReader, ManagerError> {
        let token = cancel.clone();
        self.request(cancel, |respond_to| HostRequest::OpenMonitor {
            port,
            baudrate,
            attempt_id,
            cancel: token,
            respond_to,
        })
        .await
    }

    pub async fn report_opened(
        &self,
        port: PortIdentifier,
        attempt_id: AttemptId,
    ) -> Result<(), ManagerError> {
        self.call(|respond_to| HostRequest::ReportOpened {
            port,
            attempt_id,
            respond_to,
        })
        .await
    }

    pub async fn report_open_error(
        &self,
        port: PortIdentifier,
        attempt_id: AttemptId,
        error: MonitorError,
    ) -> Result<(), ManagerError> {
        self.call(|respond_to| HostRequest::ReportOpenError {
            port,
            attempt_id,
            error,
            respond_to,
        })
        .await
    }

    pub async fn report_stream_closed(
        &self,
        port: PortIdentifier,
        attempt_id: Option<AttemptId>,
    ) -> Result<(), ManagerError> {
        self.call(|respond_to| HostRequest::ReportStreamClosed {
            port,
            attempt_id,
            respond_to,
        })
        .await
    }

    pub async fn send_text(&self, port: PortIdentifier, text: String) -> Result<(), ManagerError> {
        self.call(|respond_to| HostRequest::SendText {
            port,
            text,
            respond_to,
        })
        .await
    }

    pub async fn update_baudrate(
        &self,
        port: PortIdentifier,
        baudrate: u32,
    ) -> Result<(), ManagerError> {
        self.call(|respond_to| HostRequest::UpdateBaudrate {
            port,
            baudrate,
            respond_to,
        })
        .await
    }

    pub async fn detected_ports(&self) -> Result<DetectedPorts, ManagerError> {
        self.call(|respond_to| HostRequest::DetectedPorts { respond_to })
            .await
    }

    pub async fn session_state(
        &self,
        port: PortIdentifier,
    ) -> Result<Option<MonitorSessionState>, ManagerError> {
        self.call(|respond_to| HostRequest::SessionState { port, respond_to })
            .await
    }
}

/// Host side: the pieces a request may touch.
#[derive(Clone)]
struct Host {
    registry: RegistryHandle,
    multiplexer: StreamMultiplexer,
    presence: PortPresence,
}

impl Host {
    async fn handle(self, request: HostRequest) {
        debug!("Host request: {}", request.name());
        match request {
            HostRequest::Start {
                client,
                port,
                baudrate,
                respond_to,
            } => {
                let _ = respond_to.send(self.registry.start(client, port, baudrate).await);
            }
            HostRequest::Stop {
                client,
                port,
                respond_to,
            } => {
                let _ = respond_to.send(self.registry.stop(client, port).await);
            }
            HostRequest::Detach { client, respond_to } => {
                let _ = respond_to.send(self.registry.detach(client).await);
            }
            HostRequest::OpenMonitor {
                port,
                baudrate,
                attempt_id,
                cancel,
                respond_to,
            } => {
                let result = self
                    .multiplexer
                    .open(&port, baudrate, attempt_id, cancel)
                    .await;
                let _ = respond_to.send(result.map_err(ManagerError::from));
            }
            HostRequest::ReportOpened {
                port,
                attempt_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.registry.report_opened(port, attempt_id).await);
            }
            HostRequest::ReportOpenError {
                port,
                attempt_id,
                error,
                respond_to,
            } => {
                let result = self
                    .registry
                    .report_open_failed(port, attempt_id, error)
                    .await;
                let _ = respond_to.send(result);
            }
            HostRequest::ReportStreamClosed {
                port,
                attempt_id,
                respond_to,
            } => {
                let result = self.registry.report_stream_closed(port, attempt_id).await;
                let _ = respond_to.send(result);
            }
            HostRequest::SendText {
                port,
                text,
                respond_to,
            } => {
                let result = self.multiplexer.send(&port, &text).await;
                let _ = respond_to.send(result.map_err(ManagerError::from));
            }
            HostRequest::UpdateBaudrate {
                port,
                baudrate,
                respond_to,
            } => {
                let _ = respond_to.send(self.update_baudrate(port, baudrate).await);
            }
            HostRequest::DetectedPorts { respond_to } => {
                let _ = respond_to.send(Ok(self.presence.detected_ports()));
            }
            HostRequest::SessionState { port, respond_to } => {
                let _ = respond_to.send(self.registry.session(port).await);
            }
        }
    }

    /// Record the rate for the port and push it to a live monitor.
    async fn update_baudrate(&self, port: PortIdentifier, baudrate: u32) -> Result<(), ManagerError> {
        self.registry.set_baudrate(port.clone(), baudrate).await?;
        if self.multiplexer.is_open(&port) {
            self.multiplexer.update_baudrate(&port, baudrate).await?;
        }
        Ok(())
    }
}

/// Serve host requests and forward registry and presence changes as
/// notifications until `cancel` fires.
pub fn spawn_host(
    registry: RegistryHandle,
    multiplexer: StreamMultiplexer,
    presence: PortPresence,
    capacity: usize,
    cancel: CancellationToken,
) -> (HostClient, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::channel::<HostRequest>(capacity.max(1));
    let (notifications, _) = broadcast::channel(capacity.max(1));

    spawn_forwarder(
        "session",
        registry.subscribe(),
        notifications.clone(),
        cancel.clone(),
    );
    spawn_presence_forwarder(presence.clone(), notifications.clone(), cancel.clone());

    let host = Host {
        registry,
        multiplexer,
        presence,
    };
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = receiver.recv() => match request {
                    Some(request) => {
                        tokio::spawn(host.clone().handle(request));
                    }
                    None => break,
                },
            }
        }
        debug!("Monitor host stopped");
    });

    (
        HostClient {
            sender,
            notifications,
        },
        handle,
    )
}

fn spawn_forwarder<T>(
    what: &'static str,
    mut source: broadcast::Receiver<T>,
    sink: broadcast::Sender<HostNotification>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    HostNotification: From<T>,
{
    spawn_until(cancel, async move {
        loop {
            match source.recv().await {
                Ok(item) => {
                    let _ = sink.send(HostNotification::from(item));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Host dropped {} {} notification(s)", n, what);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_presence_forwarder(
    presence: PortPresence,
    sink: broadcast::Sender<HostNotification>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut watch = presence.subscribe();
    spawn_until(cancel, async move {
        while watch.changed().await.is_ok() {
            let ports = watch.borrow_and_update().clone();
            let _ = sink.send(HostNotification::DetectedPortsChanged { ports });
        }
    })
}

fn spawn_until(
    cancel: CancellationToken,
    work: impl Future<Output = ()> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = work => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use crate::transport::{BridgeEvent, ByteStream, MonitorTransport, TransportMode};
    use async_trait::async_trait;
    use futures::StreamExt;
    use monitor_fsm::{DetectedPort, SessionStatus};
    use std::sync::Arc;
    use std::time::Duration;

    struct SilentBridge {
        events: broadcast::Sender<BridgeEvent>,
    }

    #[async_trait]
    impl MonitorTransport for SilentBridge {
        fn mode(&self) -> TransportMode {
            TransportMode::Shared
        }

        async fn open(
            &self,
            _port: &PortIdentifier,
            _baudrate: Option<u32>,
        ) -> Result<ByteStream, MonitorError> {
            Ok(futures::stream::pending().boxed())
        }

        async fn send(&self, _port: &PortIdentifier, _text: &str) -> Result<(), MonitorError> {
            Err(MonitorError::PortBusy)
        }

        async fn update_baudrate(
            &self,
            _port: &PortIdentifier,
            _baudrate: u32,
        ) -> Result<(), MonitorError> {
            Ok(())
        }

        fn events(&self) -> broadcast::Receiver<BridgeEvent> {
            self.events.subscribe()
        }
    }

    fn host() -> (HostClient, PortPresence, CancellationToken) {
        let cancel = CancellationToken::new();
        let registry = SessionRegistry::spawn(Duration::ZERO, 64);
        let presence = PortPresence::new();
        let mux = StreamMultiplexer::new(Arc::new(SilentBridge {
            events: broadcast::channel(4).0,
        }));
        let (client, _) = spawn_host(registry, mux, presence.clone(), 64, cancel.clone());
        (client, presence, cancel)
    }

    fn acm0() -> PortIdentifier {
        PortIdentifier::serial("/dev/ttyACM0")
    }

    #[tokio::test]
    async fn start_reply_carries_session_state() {
        let (client, _presence, _cancel) = host();
        let mut notifications = client.subscribe();

        let session = client
            .start(ClientId::new(), acm0(), Some(9600))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Paused);

        match notifications.recv().await.unwrap() {
            HostNotification::SessionChanged { session } => assert_eq!(session.port, acm0()),
            other => panic!("unexpected notification: {:?}", other),
        }
    }

    #[tokio::test]
    async fn presence_changes_are_pushed() {
        let (client, presence, _cancel) = host();
        let mut notifications = client.subscribe();

        presence.replace(DetectedPorts::from_ports([DetectedPort::new(acm0())]));
        match notifications.recv().await.unwrap() {
            HostNotification::DetectedPortsChanged { ports } => {
                assert!(ports.contains_port(&acm0()))
            }
            other => panic!("unexpected notification: {:?}", other),
        }
        assert_eq!(client.detected_ports().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_request_reports_cancelled() {
        let (client, _presence, _cancel) = host();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = client.open_monitor(acm0(), Some(9600), None, &cancel).await;
        assert!(matches!(result, Err(ManagerError::Cancelled)));
        // Cancelling again is harmless.
        cancel.cancel();
    }

    #[tokio::test]
    async fn transport_errors_keep_their_class() {
        let (client, _presence, _cancel) = host();
        let err = client.send_text(acm0(), "hi".into()).await.unwrap_err();
        assert_eq!(MonitorError::from(err), MonitorError::PortBusy);
    }

    #[tokio::test]
    async fn stopped_host_reads_as_gone() {
        let (client, _presence, cancel) = host();
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = client.detected_ports().await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::ActorGone(_) | ManagerError::NoResponse(_)
        ));
    }

    #[test]
    fn notification_tags() {
        let json = serde_json::to_value(HostNotification::SessionMoved {
            from: acm0(),
            to: PortIdentifier::serial("/dev/ttyACM1"),
        })
        .unwrap();
        assert_eq!(json["type"], "session_moved");
    }
}
