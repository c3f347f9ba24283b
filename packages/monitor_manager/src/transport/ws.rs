//! Duplex transport: one WebSocket per monitor, shared by every reader.
//!
//! Binary frames carry monitor data. Text frames carry JSON control
//! messages in both directions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::SinkExt;
use futures::stream::{SplitStream, StreamExt};
use monitor_fsm::{MonitorError, MonitorPhysicalState, PortIdentifier, PortKey};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::{
    BridgeEvent, BridgeLink, ByteStream, MonitorTransport, TransportMode, endpoint,
    monitor_query, parse_base_url,
};
use crate::error::ManagerError;

/// Bridge-to-client control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeFrame {
    PhysicalState {
        state: MonitorPhysicalState,
    },
    ResumeOnPort {
        from: PortIdentifier,
        to: PortIdentifier,
    },
    Error {
        code: String,
        #[serde(default)]
        message: Option<String>,
    },
}

/// Client-to-bridge control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Send { text: String },
    Baudrate { baudrate: u32 },
}

/// Classify a tungstenite failure.
pub(crate) fn from_tungstenite(err: tungstenite::Error) -> MonitorError {
    match &err {
        tungstenite::Error::Io(io_err)
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ) =>
        {
            MonitorError::BridgeDisconnected
        }
        tungstenite::Error::Http(response) => {
            MonitorError::from_status(response.status().as_u16(), "")
        }
        _ => MonitorError::internal(err.to_string()),
    }
}

type Writers = Arc<Mutex<HashMap<PortKey, mpsc::UnboundedSender<Message>>>>;

fn lock(writers: &Writers) -> MutexGuard<'_, HashMap<PortKey, mpsc::UnboundedSender<Message>>> {
    writers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct WebSocketTransport {
    base_url: Url,
    link: Arc<BridgeLink>,
    writers: Writers,
}

impl WebSocketTransport {
    /// `base_url` may use http(s) or ws(s); it is rewritten to ws(s).
    pub fn new(base_url: &str) -> Result<Self, ManagerError> {
        let mut url = parse_base_url(base_url)?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ManagerError::InvalidUrl(format!(
                    "unsupported scheme {} in {}",
                    other, base_url
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ManagerError::InvalidUrl(base_url.to_string()))?;
        Ok(Self {
            base_url: url,
            link: Arc::new(BridgeLink::new()),
            writers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn control(&self, port: &PortIdentifier, frame: ControlFrame) -> Result<(), MonitorError> {
        let writer = lock(&self.writers)
            .get(&port.key())
            .cloned()
            .ok_or_else(|| MonitorError::internal(format!("no monitor open on {}", port)))?;
        let json = serde_json::to_string(&frame)
            .map_err(|e| MonitorError::internal(e.to_string()))?;
        writer
            .send(Message::Text(json.into()))
            .map_err(|_| MonitorError::internal(format!("monitor on {} is closed", port)))
    }
}

/// Drops the control writer when its reader goes away, under whatever key
/// the writer has been moved to since.
struct WriterGuard {
    writers: Writers,
    tx: mpsc::UnboundedSender<Message>,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        lock(&self.writers).retain(|_, current| !current.same_channel(&self.tx));
    }
}

struct WsReader {
    source: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    link: Arc<BridgeLink>,
    finished: bool,
    _writer: WriterGuard,
}

impl WsReader {
    async fn next_item(&mut self) -> Option<Result<Vec<u8>, MonitorError>> {
        if self.finished {
            return None;
        }
        loop {
            let msg = match self.source.next().await? {
                Ok(msg) => msg,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(from_tungstenite(e)));
                }
            };
            match msg {
                Message::Binary(data) => return Some(Ok(data.to_vec())),
                Message::Text(text) => match serde_json::from_str::<BridgeFrame>(&text) {
                    Ok(BridgeFrame::PhysicalState { state }) => {
                        self.link.emit(BridgeEvent::PhysicalStateChanged { state });
                    }
                    Ok(BridgeFrame::ResumeOnPort { from, to }) => {
                        self.link.emit(BridgeEvent::ResumeOnPort { from, to });
                    }
                    Ok(BridgeFrame::Error { code, message }) => {
                        self.finished = true;
                        return Some(Err(MonitorError::from_code(&code, message.as_deref())));
                    }
                    Err(e) => warn!("Ignoring malformed bridge frame: {}", e),
                },
                Message::Close(_) => {
                    self.finished = true;
                    return None;
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl MonitorTransport for WebSocketTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Shared
    }

    async fn open(
        &self,
        port: &PortIdentifier,
        baudrate: Option<u32>,
    ) -> Result<ByteStream, MonitorError> {
        let mut url = endpoint(&self.base_url, "monitor")?;
        url.query_pairs_mut()
            .extend_pairs(monitor_query(port, baudrate));
        debug!("Opening WebSocket monitor at {}", url);

        let connected = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(from_tungstenite);
        let (stream, _) = self.link.observe(connected)?;
        let (mut sink, source) = stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        lock(&self.writers).insert(port.key(), tx.clone());
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = WsReader {
            source,
            link: self.link.clone(),
            finished: false,
            _writer: WriterGuard {
                writers: self.writers.clone(),
                tx,
            },
        };
        Ok(futures::stream::unfold(reader, |mut reader| async move {
            let item = reader.next_item().await?;
            Some((item, reader))
        })
        .boxed())
    }

    async fn send(&self, port: &PortIdentifier, text: &str) -> Result<(), MonitorError> {
        self.control(
            port,
            ControlFrame::Send {
                text: text.to_string(),
            },
        )
    }

    async fn update_baudrate(
        &self,
        port: &PortIdentifier,
        baudrate: u32,
    ) -> Result<(), MonitorError> {
        self.control(port, ControlFrame::Baudrate { baudrate })
    }

    fn rekey(&self, from: &PortIdentifier, to: &PortIdentifier) {
        let mut writers = lock(&self.writers);
        if let Some(writer) = writers.remove(&from.key()) {
            debug!("Moving control writer from {} to {}", from, to);
            writers.insert(to.key(), writer);
        }
    }

    fn events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.link.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monitor_fsm::PhysicalStatus;
    use tokio::net::TcpListener;

    fn acm0() -> PortIdentifier {
        PortIdentifier::serial("/dev/ttyACM0")
    }

    #[test]
    fn http_base_becomes_ws() {
        let transport = WebSocketTransport::new("http://127.0.0.1:50051").unwrap();
        assert_eq!(transport.base_url.as_str(), "ws://127.0.0.1:50051/");
        let transport = WebSocketTransport::new("https://bridge.local/api").unwrap();
        assert_eq!(transport.base_url.as_str(), "wss://bridge.local/api/");
    }

    #[test]
    fn bridge_frame_parses_error_code() {
        let frame: BridgeFrame =
            serde_json::from_str(r#"{"type":"error","code":"port_busy"}"#).unwrap();
        assert_eq!(
            frame,
            BridgeFrame::Error {
                code: "port_busy".into(),
                message: None
            }
        );
    }

    #[test]
    fn control_frame_shape() {
        let json = serde_json::to_value(ControlFrame::Baudrate { baudrate: 9600 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "baudrate", "baudrate": 9600}));
    }

    #[tokio::test]
    async fn send_without_open_monitor_fails() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:1").unwrap();
        let err = transport.send(&acm0(), "hi").await.unwrap_err();
        assert!(matches!(err, MonitorError::Internal { .. }));
    }

    #[tokio::test]
    async fn stream_carries_data_and_control_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let physical = BridgeFrame::PhysicalState {
                state: MonitorPhysicalState {
                    port: PortIdentifier::serial("/dev/ttyACM0"),
                    state: PhysicalStatus::Started,
                    attempt_id: Some(1),
                    error: None,
                },
            };
            let json = serde_json::to_string(&physical).unwrap();
            ws.send(Message::Text(json.into())).await.unwrap();
            ws.send(Message::Binary(b"hello".to_vec().into()))
                .await
                .unwrap();
            ws.send(Message::Text(
                r#"{"type":"error","code":"port_busy"}"#.to_string().into(),
            ))
            .await
            .unwrap();
            // Hold the socket open until the client goes away.
            while ws.next().await.is_some() {}
        });

        let transport = WebSocketTransport::new(&format!("http://{}", addr)).unwrap();
        let mut events = transport.events();
        let mut stream = transport.open(&acm0(), Some(9600)).await.unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), b"hello".to_vec());
        assert_eq!(
            stream.next().await.unwrap().unwrap_err(),
            MonitorError::PortBusy
        );
        assert!(stream.next().await.is_none());
        assert!(matches!(
            events.recv().await.unwrap(),
            BridgeEvent::PhysicalStateChanged { .. }
        ));
    }

    #[tokio::test]
    async fn control_follows_a_moved_monitor() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames_tx, mut frames) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let frame: ControlFrame = serde_json::from_str(&text).unwrap();
                    let _ = frames_tx.send(frame);
                }
            }
        });

        let acm1 = PortIdentifier::serial("/dev/ttyACM1");
        let transport = WebSocketTransport::new(&format!("http://{}", addr)).unwrap();
        let stream = transport.open(&acm0(), Some(9600)).await.unwrap();

        transport.rekey(&acm0(), &acm1);
        transport.send(&acm1, "ping").await.unwrap();
        transport.update_baudrate(&acm1, 115200).await.unwrap();
        assert!(transport.send(&acm0(), "stale").await.is_err());

        assert_eq!(
            frames.recv().await.unwrap(),
            ControlFrame::Send {
                text: "ping".into()
            }
        );
        assert_eq!(
            frames.recv().await.unwrap(),
            ControlFrame::Baudrate { baudrate: 115200 }
        );

        // The moved writer is released with its reader.
        drop(stream);
        assert!(transport.send(&acm1, "gone").await.is_err());
    }
}
