//! Request/stream transport: one chunked HTTP response per monitor.

use async_trait::async_trait;
use futures::StreamExt;
use monitor_fsm::{DetectedPort, DetectedPorts, MonitorError, PortIdentifier};
use reqwest::Url;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    BridgeEvent, BridgeLink, ByteStream, MonitorTransport, TransportMode, endpoint,
    monitor_query, parse_base_url,
};
use crate::error::ManagerError;
use crate::presence::DeviceScanner;

/// Classify a reqwest failure.
pub(crate) fn from_reqwest(err: reqwest::Error) -> MonitorError {
    if err.is_connect() {
        MonitorError::BridgeDisconnected
    } else if let Some(status) = err.status() {
        MonitorError::from_status(status.as_u16(), "")
    } else {
        MonitorError::internal(err.to_string())
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, MonitorError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(MonitorError::from_status(status.as_u16(), &body))
}

#[derive(Serialize)]
struct SendBody<'a> {
    protocol: &'a str,
    address: &'a str,
    text: &'a str,
}

#[derive(Serialize)]
struct BaudrateBody<'a> {
    protocol: &'a str,
    address: &'a str,
    baudrate: u32,
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    link: BridgeLink,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, ManagerError> {
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: parse_base_url(base_url)?,
            link: BridgeLink::new(),
        })
    }

    async fn request_monitor(
        &self,
        port: &PortIdentifier,
        baudrate: Option<u32>,
    ) -> Result<reqwest::Response, MonitorError> {
        let url = endpoint(&self.base_url, "monitor")?;
        let resp = self
            .client
            .get(url)
            .query(&monitor_query(port, baudrate))
            .send()
            .await
            .map_err(from_reqwest)?;
        check(resp).await
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<(), MonitorError> {
        let url = endpoint(&self.base_url, path)?;
        let result = match self.client.post(url).json(body).send().await {
            Ok(resp) => check(resp).await.map(|_| ()),
            Err(e) => Err(from_reqwest(e)),
        };
        self.link.observe(result)
    }
}

#[async_trait]
impl MonitorTransport for HttpTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Exclusive
    }

    async fn open(
        &self,
        port: &PortIdentifier,
        baudrate: Option<u32>,
    ) -> Result<ByteStream, MonitorError> {
        debug!("Opening HTTP monitor on {} (baudrate {:?})", port, baudrate);
        let resp = self
            .link
            .observe(self.request_monitor(port, baudrate).await)?;
        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(from_reqwest))
            .boxed())
    }

    async fn send(&self, port: &PortIdentifier, text: &str) -> Result<(), MonitorError> {
        self.post(
            "monitor/send",
            &SendBody {
                protocol: &port.protocol,
                address: &port.address,
                text,
            },
        )
        .await
    }

    async fn update_baudrate(
        &self,
        port: &PortIdentifier,
        baudrate: u32,
    ) -> Result<(), MonitorError> {
        self.post(
            "monitor/baudrate",
            &BaudrateBody {
                protocol: &port.protocol,
                address: &port.address,
                baudrate,
            },
        )
        .await
    }

    fn events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.link.subscribe()
    }
}

/// Polls `GET {bridge}/ports` for a JSON array of detected ports.
pub struct HttpDeviceScanner {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpDeviceScanner {
    pub fn new(base_url: &str) -> Result<Self, ManagerError> {
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: parse_base_url(base_url)?,
        })
    }
}

#[async_trait]
impl DeviceScanner for HttpDeviceScanner {
    async fn detected_ports(&self) -> Result<DetectedPorts, MonitorError> {
        let url = endpoint(&self.base_url, "ports")?;
        let resp = self.client.get(url).send().await.map_err(from_reqwest)?;
        let ports: Vec<DetectedPort> = check(resp).await?.json().await.map_err(from_reqwest)?;
        Ok(DetectedPorts::from_ports(ports))
    }
}
