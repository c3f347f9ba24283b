//! Serial monitor runtime.
//!
//! Components, leaves first:
//!
//! - [`presence`]: the live detected-ports snapshot and its poller
//! - [`registry`]: the session registry actor, one session per port-key
//! - [`transport`]: HTTP and WebSocket bridge transports
//! - [`stream`]: one upstream per port-key, fanned out to readers
//! - [`messenger`]: typed requests and notifications between host and clients
//! - [`adapter`]: the per-client connection adapter
//! - [`service`]: wiring for all of the above

pub mod adapter;
pub mod error;
pub mod messenger;
pub mod presence;
pub mod registry;
pub mod service;
pub mod stream;
pub mod transport;

pub use adapter::{ClientConnection, ClientIdentity, MonitorSink, Utf8Decoder};
pub use error::ManagerError;
pub use messenger::{HostClient, HostNotification, HostRequest, spawn_host};
pub use presence::{DeviceScanner, PortPresence, spawn_presence_poller};
pub use registry::{DEFAULT_PRESENCE_GRACE, RegistryHandle, SessionNotification, SessionRegistry};
pub use service::{MonitorConfig, MonitorService};
pub use stream::{MonitorReader, ReadChunk, StreamMultiplexer};
pub use transport::{
    BridgeEvent, ByteStream, HttpDeviceScanner, HttpTransport, MonitorTransport, TransportKind,
    TransportMode, WebSocketTransport,
};
