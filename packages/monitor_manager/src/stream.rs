//! Stream multiplexer.
//!
//! Owns at most one upstream per port-key and fans its bytes out to readers.
//! Readers are detached independently; only the registry-driven close pump
//! (see [`StreamMultiplexer::bind_registry`]) tears an upstream down. An
//! upstream that ends any other way is reported to the registry as a closed
//! stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use futures::StreamExt;
use monitor_fsm::{AttemptId, MonitorError, PortIdentifier, PortKey};
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{RegistryHandle, SessionNotification};
use crate::transport::{BridgeEvent, ByteStream, MonitorTransport, TransportMode};

const FAN_OUT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum StreamItem {
    Data(Arc<[u8]>),
    Failed(MonitorError),
    End,
}

/// One pull from a [`MonitorReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunk {
    pub value: Option<Vec<u8>>,
    pub done: bool,
}

impl ReadChunk {
    fn data(bytes: &[u8]) -> Self {
        Self {
            value: Some(bytes.to_vec()),
            done: false,
        }
    }

    fn done() -> Self {
        Self {
            value: None,
            done: true,
        }
    }
}

/// A single consumer of a port's upstream.
pub struct MonitorReader {
    port: PortIdentifier,
    rx: broadcast::Receiver<StreamItem>,
    cancel: CancellationToken,
    /// Set for exclusive upstreams: this reader is the only one, and letting
    /// go of it releases the upstream.
    upstream: Option<CancellationToken>,
    done: bool,
}

impl MonitorReader {
    pub fn port(&self) -> &PortIdentifier {
        &self.port
    }

    /// Next chunk. Cancellation ends the reader with `done` and no error.
    pub async fn read(&mut self) -> Result<ReadChunk, MonitorError> {
        loop {
            if self.done {
                return Ok(ReadChunk::done());
            }
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.finish();
                    return Ok(ReadChunk::done());
                }
                item = self.rx.recv() => item,
            };
            match item {
                Ok(StreamItem::Data(bytes)) => return Ok(ReadChunk::data(&bytes)),
                Ok(StreamItem::End) | Err(broadcast::error::RecvError::Closed) => {
                    self.finish();
                }
                Ok(StreamItem::Failed(e)) => {
                    self.finish();
                    return Err(e);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Reader on {} lagged, skipped {} chunk(s)", self.port, n);
                }
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        if let Some(upstream) = &self.upstream {
            upstream.cancel();
        }
    }
}

impl Drop for MonitorReader {
    fn drop(&mut self) {
        self.finish();
    }
}

struct Upstream {
    id: u64,
    /// The session attempt this upstream was opened for.
    attempt: Option<AttemptId>,
    tx: broadcast::Sender<StreamItem>,
    /// Fired by [`StreamMultiplexer::close`].
    cancel: CancellationToken,
    /// Fired when the only reader of an exclusive upstream lets go.
    released: CancellationToken,
}

impl Upstream {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.released.is_cancelled()
    }
}

/// Serializes opens of one port-key.
struct Gate {
    turn: Arc<AsyncMutex<()>>,
    /// Bumped by every close; an open that sees it move discards its stream.
    closes: u64,
}

#[derive(Default)]
struct Ports {
    upstreams: HashMap<PortKey, Upstream>,
    gates: HashMap<PortKey, Gate>,
}

impl Ports {
    fn closes(&self, key: &PortKey) -> u64 {
        self.gates.get(key).map_or(0, |gate| gate.closes)
    }

    fn remove(&mut self, key: &PortKey) -> Option<Upstream> {
        if let Some(gate) = self.gates.get_mut(key) {
            gate.closes += 1;
        }
        self.upstreams.remove(key)
    }
}

struct Inner {
    transport: Arc<dyn MonitorTransport>,
    ports: Mutex<Ports>,
    registry: OnceLock<RegistryHandle>,
    next_id: AtomicU64,
}

impl Inner {
    fn ports(&self) -> MutexGuard<'_, Ports> {
        self.ports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Join the open queue for `key`.
    fn gate(&self, key: &PortKey) -> GateTicket<'_> {
        let turn = self
            .ports()
            .gates
            .entry(key.clone())
            .or_insert_with(|| Gate {
                turn: Arc::new(AsyncMutex::new(())),
                closes: 0,
            })
            .turn
            .clone();
        GateTicket {
            inner: self,
            key: key.clone(),
            turn,
        }
    }
}

/// A place in one port's open queue. The gate is dropped with its last
/// ticket.
struct GateTicket<'a> {
    inner: &'a Inner,
    key: PortKey,
    turn: Arc<AsyncMutex<()>>,
}

impl Drop for GateTicket<'_> {
    fn drop(&mut self) {
        let mut ports = self.inner.ports();
        let last = ports
            .gates
            .get(&self.key)
            .is_some_and(|gate| Arc::ptr_eq(&gate.turn, &self.turn))
            && Arc::strong_count(&self.turn) <= 2;
        if last {
            ports.gates.remove(&self.key);
        }
    }
}

#[derive(Clone)]
pub struct StreamMultiplexer {
    inner: Arc<Inner>,
}

impl StreamMultiplexer {
    pub fn new(transport: Arc<dyn MonitorTransport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                ports: Mutex::new(Ports::default()),
                registry: OnceLock::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.inner.transport.mode()
    }

    pub fn events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.transport.events()
    }

    /// Attach a reader to the upstream for `port`, opening it if needed.
    ///
    /// Opens of one port are serialized, so two concurrent callers never
    /// open it twice; opens of different ports do not wait on each other.
    /// On an exclusive transport a second reader gets `AlreadyAttached`.
    /// `attempt` is the session attempt the upstream serves, reported back
    /// if the upstream ends without being closed.
    pub async fn open(
        &self,
        port: &PortIdentifier,
        baudrate: Option<u32>,
        attempt: Option<AttemptId>,
        cancel: CancellationToken,
    ) -> Result<MonitorReader, MonitorError> {
        let key = port.key();
        let exclusive = self.mode() == TransportMode::Exclusive;

        let gate = self.inner.gate(&key);
        let _turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(self.finished_reader(port, cancel));
            }
            turn = gate.turn.lock() => turn,
        };

        let closes = {
            let ports = self.inner.ports();
            if let Some(existing) = ports.upstreams.get(&key).filter(|u| u.is_live()) {
                if exclusive {
                    return Err(MonitorError::AlreadyAttached);
                }
                debug!("Joining shared upstream on {}", key);
                return Ok(MonitorReader {
                    port: port.clone(),
                    rx: existing.tx.subscribe(),
                    cancel,
                    upstream: None,
                    done: false,
                });
            }
            ports.closes(&key)
        };

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(self.finished_reader(port, cancel));
            }
            opened = self.inner.transport.open(port, baudrate) => opened?,
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = broadcast::channel(FAN_OUT_CAPACITY);
        let upstream_cancel = CancellationToken::new();
        let released = CancellationToken::new();
        {
            let mut ports = self.inner.ports();
            if ports.closes(&key) != closes {
                debug!("{} was closed while opening, dropping the new upstream", key);
                return Ok(self.finished_reader(port, cancel));
            }
            ports.upstreams.insert(
                key.clone(),
                Upstream {
                    id,
                    attempt,
                    tx: tx.clone(),
                    cancel: upstream_cancel.clone(),
                    released: released.clone(),
                },
            );
        }
        info!("Opened upstream {} for {}", id, key);

        tokio::spawn(pump(
            self.inner.clone(),
            key,
            id,
            stream,
            tx,
            upstream_cancel,
            released.clone(),
        ));

        Ok(MonitorReader {
            port: port.clone(),
            rx,
            cancel,
            upstream: exclusive.then_some(released),
            done: false,
        })
    }

    fn finished_reader(&self, port: &PortIdentifier, cancel: CancellationToken) -> MonitorReader {
        let (_, rx) = broadcast::channel(1);
        MonitorReader {
            port: port.clone(),
            rx,
            cancel,
            upstream: None,
            done: true,
        }
    }

    /// Tear down the upstream for `port`. Returns whether one existed. An
    /// open of the port still in flight is discarded when it completes.
    pub fn close(&self, port: &PortIdentifier) -> bool {
        let removed = self.inner.ports().remove(&port.key());
        match removed {
            Some(upstream) => {
                info!("Closing upstream {} for {}", upstream.id, port);
                upstream.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn close_all(&self) {
        let drained: Vec<_> = {
            let mut ports = self.inner.ports();
            let keys: Vec<_> = ports.upstreams.keys().cloned().collect();
            keys.into_iter()
                .filter_map(|key| ports.remove(&key).map(|u| (key, u)))
                .collect()
        };
        for (key, upstream) in drained {
            debug!("Dropping upstream {} for {}", upstream.id, key);
            upstream.cancel.cancel();
        }
    }

    /// Re-key a live upstream after the bridge moved its device.
    pub fn rekey(&self, from: &PortIdentifier, to: &PortIdentifier) {
        {
            let mut ports = self.inner.ports();
            if let Some(upstream) = ports.upstreams.remove(&from.key()) {
                ports.upstreams.insert(to.key(), upstream);
            }
        }
        self.inner.transport.rekey(from, to);
    }

    pub fn is_open(&self, port: &PortIdentifier) -> bool {
        self.inner
            .ports()
            .upstreams
            .get(&port.key())
            .is_some_and(Upstream::is_live)
    }

    pub async fn send(&self, port: &PortIdentifier, text: &str) -> Result<(), MonitorError> {
        self.inner.transport.send(port, text).await
    }

    pub async fn update_baudrate(
        &self,
        port: &PortIdentifier,
        baudrate: u32,
    ) -> Result<(), MonitorError> {
        self.inner.transport.update_baudrate(port, baudrate).await
    }

    /// Drive closes from session state and feed bridge events to the
    /// registry, until `cancel` fires.
    pub fn bind_registry(
        &self,
        registry: RegistryHandle,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        if self.inner.registry.set(registry.clone()).is_err() {
            warn!("Multiplexer was already bound to a registry");
        }
        let mux = self.clone();
        let mut sessions = registry.subscribe();
        let mut bridge = self.events();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    notification = sessions.recv() => match notification {
                        Ok(SessionNotification::Changed { session }) if session.close_pending => {
                            mux.close(&session.port);
                            if let Err(e) = registry.close_completed(session.port.clone()).await {
                                warn!("Failed to report close of {}: {}", session.port, e);
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Close pump lagged, skipped {} notification(s)", n);
                            mux.sweep(&registry).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },

                    event = bridge.recv() => match event {
                        Ok(event) => mux.forward(&registry, event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Missed {} bridge event(s)", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Close pump stopped");
        })
    }

    /// Close every upstream whose session is pending close.
    async fn sweep(&self, registry: &RegistryHandle) {
        let Ok(sessions) = registry.sessions().await else {
            return;
        };
        for session in sessions.into_iter().filter(|s| s.close_pending) {
            self.close(&session.port);
            let _ = registry.close_completed(session.port).await;
        }
    }

    async fn forward(&self, registry: &RegistryHandle, event: BridgeEvent) {
        let result = match event {
            BridgeEvent::PhysicalStateChanged { state } => {
                registry.physical_state_changed(state).await
            }
            BridgeEvent::ResumeOnPort { from, to } => {
                self.rekey(&from, &to);
                registry.resume_on_port(from, to).await
            }
            BridgeEvent::Disconnected => {
                self.close_all();
                registry.bridge_disconnected().await
            }
            BridgeEvent::Reconnected => registry.bridge_reconnected().await,
        };
        if let Err(e) = result {
            warn!("Failed to forward bridge event: {}", e);
        }
    }
}

/// Copy one upstream into its fan-out channel until it ends or is cancelled.
async fn pump(
    inner: Arc<Inner>,
    key: PortKey,
    id: u64,
    mut stream: ByteStream,
    tx: broadcast::Sender<StreamItem>,
    cancel: CancellationToken,
    released: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = released.cancelled() => break,
            item = stream.next() => match item {
                Some(Ok(bytes)) => {
                    let _ = tx.send(StreamItem::Data(bytes.into()));
                }
                Some(Err(e)) => {
                    debug!("Upstream {} for {} failed: {}", id, key, e);
                    let _ = tx.send(StreamItem::Failed(e));
                    break;
                }
                None => break,
            },
        }
    }
    let _ = tx.send(StreamItem::End);
    drop(stream);

    // The entry may have moved to another key since it was opened.
    let ended = {
        let mut ports = inner.ports();
        let current = ports
            .upstreams
            .iter()
            .find(|(_, u)| u.id == id)
            .map(|(k, _)| k.clone());
        current.and_then(|k| ports.upstreams.remove(&k).map(|u| (k, u)))
    };
    cancel.cancel();
    debug!("Upstream {} for {} ended", id, key);

    // Closed by the registry: nothing to report.
    let Some((key, upstream)) = ended else {
        return;
    };
    let (Some(attempt), Some(registry)) = (upstream.attempt, inner.registry.get()) else {
        return;
    };
    info!("Upstream {} for {} ended on its own, reporting attempt {}", id, key, attempt);
    if let Err(e) = registry.report_stream_closed(key.to_port(), Some(attempt)).await {
        warn!("Failed to report closed stream on {}: {}", key, e);
    }
}
