//! Client connection adapter: one per UI surface.
//!
//! The adapter turns `play`/`stop` into intents for the session registry and
//! opens the byte stream only when the session says this client should:
//! the session is connecting on an attempt this adapter has not serviced yet,
//! or it is active and this adapter has not attached. Every host notification
//! re-runs [`ClientConnection::reconcile`]; the `opening` and `attached`
//! guards make repeated runs harmless. A client that joined a stream held
//! exclusively by another drops its `attached` guard once the session moves
//! off that stream's attempt.

use std::sync::{Arc, Mutex, MutexGuard};

use monitor_fsm::{
    AttemptId, ClientId, DetectedPorts, LogicalState, MonitorContext, MonitorError, MonitorEvent,
    MonitorSessionState, MonitorView, PauseReason, PortIdentifier, SessionStatus, ViewProjector,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ManagerError;
use crate::messenger::{HostClient, HostNotification};

/// Who is attaching. Created once per adapter and passed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_id: ClientId,
    pub name: String,
}

impl ClientIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            client_id: ClientId::new(),
            name: name.into(),
        }
    }
}

/// Receives what the adapter reads. Called outside any lock.
pub trait MonitorSink: Send + Sync + 'static {
    fn on_start(&self, port: &PortIdentifier);
    fn on_text(&self, text: &str);
    fn on_stop(&self, port: &PortIdentifier);
    /// The port is held by another process. Auto-play is already off.
    fn on_busy(&self, port: &PortIdentifier, error: &MonitorError);
}

/// Decodes UTF-8 across chunk boundaries.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode as much of the buffered input as possible. An incomplete
    /// sequence at the end is kept for the next chunk; invalid bytes become
    /// U+FFFD.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let keep = rest.len();
        let start = self.pending.len() - keep;
        self.pending.drain(..start);
        out
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

struct AdapterState {
    ctx: MonitorContext,
    baudrate: Option<u32>,
    auto_play: bool,
    detected: DetectedPorts,
    /// Registry session for the selected port, as last observed.
    session: Option<MonitorSessionState>,
    opening: bool,
    attached: bool,
    /// Set while attached by joining a stream another client holds
    /// exclusively: the attempt that stream belongs to.
    absorbed: Option<AttemptId>,
    serviced_attempt: Option<AttemptId>,
    /// Bumped whenever the local reader is abandoned; a reader task only
    /// touches the guards while its generation is current.
    generation: u64,
    reader_cancel: Option<CancellationToken>,
    listener: Option<CancellationToken>,
    projector: ViewProjector,
}

impl AdapterState {
    fn selected(&self) -> Option<PortIdentifier> {
        self.ctx.selected_port.clone()
    }

    fn is_running(&self) -> bool {
        self.ctx.desired.is_running()
    }

    /// Drop the local reader and reset the guards.
    fn release_reader(&mut self) {
        if let Some(cancel) = self.reader_cancel.take() {
            cancel.cancel();
        }
        self.generation += 1;
        self.opening = false;
        self.attached = false;
        self.absorbed = None;
    }

    fn apply(&mut self, event: MonitorEvent) {
        self.ctx = self.ctx.apply(event);
    }
}

/// What one reader task is servicing.
struct OpenPlan {
    port: PortIdentifier,
    baudrate: Option<u32>,
    /// Set when the session is connecting on this attempt and the outcome
    /// must be reported back.
    attempt: Option<AttemptId>,
    /// The attempt that produced the stream being read.
    stream_attempt: Option<AttemptId>,
    local_attempt: Option<AttemptId>,
    generation: u64,
    cancel: CancellationToken,
}

struct Shared {
    identity: ClientIdentity,
    host: HostClient,
    sink: Arc<dyn MonitorSink>,
    state: Mutex<AdapterState>,
}

#[derive(Clone)]
pub struct ClientConnection {
    shared: Arc<Shared>,
}

impl ClientConnection {
    pub fn new(
        identity: ClientIdentity,
        host: HostClient,
        sink: Arc<dyn MonitorSink>,
        baudrate: Option<u32>,
        auto_play: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                identity,
                host,
                sink,
                state: Mutex::new(AdapterState {
                    ctx: MonitorContext::new(),
                    baudrate,
                    auto_play,
                    detected: DetectedPorts::new(),
                    session: None,
                    opening: false,
                    attached: false,
                    absorbed: None,
                    serviced_attempt: None,
                    generation: 0,
                    reader_cancel: None,
                    listener: None,
                    projector: ViewProjector::new(),
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AdapterState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.shared.identity
    }

    fn client_id(&self) -> ClientId {
        self.shared.identity.client_id
    }

    pub fn context(&self) -> MonitorContext {
        self.lock().ctx.clone()
    }

    /// UI status for the selected port. Equal views share one allocation.
    pub fn view(&self) -> Arc<MonitorView> {
        let mut st = self.lock();
        let selected = st.selected();
        let started = st.is_running();
        let AdapterState {
            projector,
            session,
            detected,
            ..
        } = &mut *st;
        projector.project(session.as_ref(), detected, selected.as_ref(), started)
    }

    pub fn is_attached(&self) -> bool {
        self.lock().attached
    }

    pub fn is_opening(&self) -> bool {
        self.lock().opening
    }

    pub fn auto_play(&self) -> bool {
        self.lock().auto_play
    }

    /// Express a start intent. Opening follows from the session state.
    pub async fn play(&self) -> Result<(), MonitorError> {
        let target = {
            let mut st = self.lock();
            if st.is_running() {
                return Ok(());
            }
            st.apply(MonitorEvent::UserStart);
            st.selected().map(|port| (port, st.baudrate))
        };
        if let Some((port, baudrate)) = target {
            info!("{} starting monitor on {}", self.shared.identity.name, port);
            let session = self
                .shared
                .host
                .start(self.client_id(), port, baudrate)
                .await?;
            self.observe_session(session);
        }
        self.reconcile();
        Ok(())
    }

    /// Express a stop intent and drop the local reader.
    pub async fn stop(&self) -> Result<(), MonitorError> {
        let port = {
            let mut st = self.lock();
            let was_running = st.is_running();
            st.release_reader();
            st.apply(MonitorEvent::UserStop);
            st.selected().filter(|_| was_running)
        };
        if let Some(port) = port {
            info!("{} stopping monitor on {}", self.shared.identity.name, port);
            if let Some(session) = self.shared.host.stop(self.client_id(), port).await? {
                self.observe_session(session);
            }
        }
        Ok(())
    }

    pub async fn select_port(&self, port: Option<PortIdentifier>) -> Result<(), MonitorError> {
        let (previous, running, detected, auto_play) = {
            let mut st = self.lock();
            let previous = st.selected();
            if previous == port {
                return Ok(());
            }
            st.release_reader();
            st.session = None;
            st.serviced_attempt = None;
            let detected = port.as_ref().is_some_and(|p| st.detected.contains_port(p));
            st.apply(MonitorEvent::PortSelected {
                port: port.clone(),
                detected,
            });
            (previous, st.is_running(), detected, st.auto_play)
        };

        if running {
            if let Some(previous) = previous {
                self.shared.host.stop(self.client_id(), previous).await?;
            }
            if let Some(port) = port {
                let baudrate = self.lock().baudrate;
                let session = self
                    .shared
                    .host
                    .start(self.client_id(), port, baudrate)
                    .await?;
                self.observe_session(session);
            }
        } else if auto_play && detected {
            return self.play().await;
        }
        self.reconcile();
        Ok(())
    }

    pub async fn set_baudrate(&self, baudrate: u32) -> Result<(), MonitorError> {
        let port = {
            let mut st = self.lock();
            st.baudrate = Some(baudrate);
            st.selected()
        };
        if let Some(port) = port {
            self.shared.host.update_baudrate(port, baudrate).await?;
        }
        self.reconcile();
        Ok(())
    }

    pub async fn set_auto_play(&self, auto_play: bool) -> Result<(), MonitorError> {
        let start = {
            let mut st = self.lock();
            st.auto_play = auto_play;
            auto_play && !st.is_running() && st.ctx.selected_detected
        };
        if start {
            self.play().await?;
        }
        Ok(())
    }

    pub async fn send_text(&self, text: &str) -> Result<(), MonitorError> {
        let port = self
            .lock()
            .selected()
            .ok_or_else(|| MonitorError::internal("no port selected"))?;
        Ok(self.shared.host.send_text(port, text.to_string()).await?)
    }

    /// Stop listening, drop the reader and detach from every session.
    /// Safe to call more than once.
    pub async fn dispose(&self) {
        {
            let mut st = self.lock();
            if st.ctx.logical == LogicalState::Closed {
                return;
            }
            st.release_reader();
            st.apply(MonitorEvent::Dispose);
            if let Some(listener) = st.listener.take() {
                listener.cancel();
            }
        }
        if let Err(e) = self.shared.host.detach(self.client_id()).await {
            debug!("Detach of {} failed: {}", self.client_id(), e);
        }
    }

    /// Subscribe to host notifications now and handle them on a task until
    /// `cancel` fires or the connection is disposed.
    pub fn listen(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let notifications = self.shared.host.subscribe();
        if let Some(previous) = self.lock().listener.replace(cancel.clone()) {
            previous.cancel();
        }
        let this = self.clone();
        tokio::spawn(async move { this.run(notifications, cancel).await })
    }

    async fn run(
        self,
        mut notifications: broadcast::Receiver<HostNotification>,
        cancel: CancellationToken,
    ) {
        if let Err(e) = self.resync().await {
            warn!("Initial sync for {} failed: {}", self.client_id(), e);
        }
        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => break,
                n = notifications.recv() => n,
            };
            match notification {
                Ok(notification) => self.handle(notification).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("{} missed {} notification(s), resyncing", self.client_id(), n);
                    if let Err(e) = self.resync().await {
                        warn!("Resync for {} failed: {}", self.client_id(), e);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("{} stopped listening", self.client_id());
    }

    async fn resync(&self) -> Result<(), ManagerError> {
        let ports = self.shared.host.detected_ports().await?;
        self.detection_changed(ports).await;
        let selected = self.lock().selected();
        if let Some(port) = selected {
            self.refresh_session(port).await;
        }
        self.reconcile();
        Ok(())
    }

    async fn handle(&self, notification: HostNotification) {
        match notification {
            HostNotification::DetectedPortsChanged { ports } => {
                self.detection_changed(ports).await;
            }
            HostNotification::SessionChanged { session } => self.observe_session(session),
            HostNotification::SessionRemoved { port } => {
                let mut st = self.lock();
                if st.session.as_ref().is_some_and(|s| s.port == port) {
                    st.session = None;
                }
            }
            HostNotification::SessionMoved { from, to } => {
                let mut st = self.lock();
                if st.selected().as_ref() == Some(&from) {
                    info!("{} following {} to {}", self.shared.identity.name, from, to);
                    st.apply(MonitorEvent::PortMigrated { from, to });
                    st.session = None;
                }
            }
            HostNotification::BridgeDisconnected => {
                let mut st = self.lock();
                st.release_reader();
                st.serviced_attempt = None;
                st.apply(MonitorEvent::BridgeDisconnected);
            }
        }
        self.reconcile();
    }

    async fn detection_changed(&self, ports: DetectedPorts) {
        let autoplay = {
            let mut st = self.lock();
            let Some(port) = st.selected() else {
                st.detected = ports;
                return;
            };
            let present = ports.contains_port(&port);
            st.detected = ports;
            if present && !st.ctx.selected_detected {
                st.apply(MonitorEvent::PortDetected { port });
                st.auto_play && !st.is_running()
            } else {
                // While a session is running the registry applies the loss
                // grace window; its session update carries the loss.
                let registry_owned = st.session.as_ref().is_some_and(|s| s.desired.is_running());
                if !present && st.ctx.selected_detected && !registry_owned {
                    st.apply(MonitorEvent::PortLost { port });
                }
                false
            }
        };
        if autoplay {
            if let Err(e) = self.play().await {
                warn!("Auto-play failed: {}", e);
            }
        }
    }

    fn observe_session(&self, session: MonitorSessionState) {
        let mut st = self.lock();
        if st.selected().as_ref() != Some(&session.port) {
            return;
        }
        if !session.detected && st.ctx.selected_detected {
            st.apply(MonitorEvent::PortLost {
                port: session.port.clone(),
            });
        }
        // The holder of the stream this client joined has gone away.
        if st.absorbed.is_some() && session.streaming_attempt() != st.absorbed {
            debug!("{} lost the stream it joined on {}", self.client_id(), session.port);
            st.absorbed = None;
            st.attached = false;
            st.apply(MonitorEvent::StreamClosed {
                port: None,
                attempt_id: None,
            });
        }
        st.session = Some(session);
    }

    /// Open the stream if the session says it is this client's turn.
    pub fn reconcile(&self) {
        let plan = {
            let mut st = self.lock();
            match self.plan_open(&mut st) {
                Some(plan) => plan,
                None => return,
            }
        };
        debug!(
            "{} opening {} (attempt {:?})",
            self.client_id(),
            plan.port,
            plan.attempt
        );
        let this = self.clone();
        tokio::spawn(async move { this.open_and_read(plan).await });
    }

    fn plan_open(&self, st: &mut AdapterState) -> Option<OpenPlan> {
        if st.opening || st.attached || !st.is_running() {
            return None;
        }
        let port = st.selected()?;
        let session = st
            .session
            .as_ref()
            .filter(|s| s.port == port && s.clients.contains(&self.client_id()))?;

        let attempt = match session.status {
            SessionStatus::Connecting => match session.current_attempt_id {
                Some(id) if st.serviced_attempt != Some(id) => Some(id),
                _ => return None,
            },
            SessionStatus::Active => None,
            _ => return None,
        };
        let stream_attempt = session.streaming_attempt();

        if port.requires_baudrate() && st.baudrate.is_none() {
            debug!("No baud rate for {} yet, not opening", port);
            st.opening = false;
            st.attached = false;
            return None;
        }

        if !st.ctx.is_connecting() {
            st.apply(MonitorEvent::OpenRequested {
                port: Some(port.clone()),
                attempt_id: None,
            });
        }
        if attempt.is_some() {
            st.serviced_attempt = attempt;
        }
        let cancel = CancellationToken::new();
        st.reader_cancel = Some(cancel.clone());
        st.opening = true;

        Some(OpenPlan {
            port,
            baudrate: st.baudrate,
            attempt,
            stream_attempt,
            local_attempt: st.ctx.current_attempt_id,
            generation: st.generation,
            cancel,
        })
    }

    async fn open_and_read(self, plan: OpenPlan) {
        let opened = self
            .shared
            .host
            .open_monitor(
                plan.port.clone(),
                plan.baudrate,
                plan.stream_attempt,
                &plan.cancel,
            )
            .await;

        let mut reader = match opened {
            Ok(reader) => reader,
            Err(ManagerError::Cancelled) => {
                self.settle_cancelled(&plan);
                return;
            }
            Err(e) => {
                self.open_failed(&plan, MonitorError::from(e)).await;
                return;
            }
        };

        {
            let mut st = self.lock();
            if plan.cancel.is_cancelled() || st.generation != plan.generation {
                if st.generation == plan.generation {
                    st.opening = false;
                }
                return;
            }
            st.opening = false;
            st.attached = true;
            st.apply(MonitorEvent::OpenOk {
                port: Some(plan.port.clone()),
                attempt_id: plan.local_attempt,
            });
        }
        if let Some(id) = plan.attempt {
            if let Err(e) = self.shared.host.report_opened(plan.port.clone(), id).await {
                warn!("Failed to report open of {}: {}", plan.port, e);
            }
        }

        self.shared.sink.on_start(&plan.port);
        let mut decoder = Utf8Decoder::default();
        let failure = loop {
            match reader.read().await {
                Ok(chunk) if chunk.done => break None,
                Ok(chunk) => {
                    if let Some(bytes) = chunk.value {
                        let text = decoder.push(&bytes);
                        if !text.is_empty() {
                            self.shared.sink.on_text(&text);
                        }
                    }
                }
                Err(e) => break Some(e),
            }
        };
        let tail = decoder.finish();
        if !tail.is_empty() {
            self.shared.sink.on_text(&tail);
        }
        drop(reader);

        let report = {
            let mut st = self.lock();
            let current = st.generation == plan.generation;
            if current {
                st.attached = false;
                st.reader_cancel = None;
            }
            if current && !plan.cancel.is_cancelled() {
                let port = st.selected().unwrap_or_else(|| plan.port.clone());
                st.apply(MonitorEvent::StreamClosed {
                    port: None,
                    attempt_id: None,
                });
                Some(port)
            } else {
                None
            }
        };
        if let Some(e) = &failure {
            if !e.is_benign() {
                warn!("Monitor stream on {} failed: {}", plan.port, e);
            }
        }
        self.shared.sink.on_stop(&plan.port);
        if let Some(port) = report {
            if let Err(e) = self
                .shared
                .host
                .report_stream_closed(port.clone(), plan.stream_attempt)
                .await
            {
                warn!("Failed to report closed stream: {}", e);
            }
            self.refresh_session(port).await;
            self.reconcile();
        }
    }

    /// Re-read the session instead of waiting for its notification.
    async fn refresh_session(&self, port: PortIdentifier) {
        match self.shared.host.session_state(port.clone()).await {
            Ok(Some(session)) => self.observe_session(session),
            Ok(None) => {
                let mut st = self.lock();
                if st.session.as_ref().is_some_and(|s| s.port == port) {
                    st.session = None;
                }
            }
            Err(e) => debug!("Session refresh for {} failed: {}", port, e),
        }
    }

    fn settle_cancelled(&self, plan: &OpenPlan) {
        let mut st = self.lock();
        if st.generation == plan.generation {
            st.opening = false;
            st.reader_cancel = None;
        }
    }

    async fn open_failed(&self, plan: &OpenPlan, error: MonitorError) {
        {
            let mut st = self.lock();
            if st.generation != plan.generation {
                return;
            }
            st.opening = false;
            st.reader_cancel = None;
            match &error {
                MonitorError::AlreadyAttached => {
                    debug!("{} already attached, joining", plan.port);
                    st.attached = true;
                    st.absorbed = plan.stream_attempt;
                    st.apply(MonitorEvent::OpenOk {
                        port: Some(plan.port.clone()),
                        attempt_id: plan.local_attempt,
                    });
                }
                _ => {
                    st.apply(MonitorEvent::OpenFail {
                        port: Some(plan.port.clone()),
                        attempt_id: plan.local_attempt,
                        error: error.clone(),
                    });
                    if error.disables_auto_play() {
                        st.auto_play = false;
                    }
                }
            }
        }

        if let Some(id) = plan.attempt {
            if let Err(e) = self
                .shared
                .host
                .report_open_error(plan.port.clone(), id, error.clone())
                .await
            {
                warn!("Failed to report open error on {}: {}", plan.port, e);
            }
        }

        match error {
            MonitorError::AlreadyAttached => {}
            MonitorError::PortBusy => {
                warn!("{} is busy", plan.port);
                self.shared.sink.on_busy(&plan.port, &error);
            }
            other => {
                warn!("Failed to open {}: {}", plan.port, other);
                self.shared.sink.on_stop(&plan.port);
            }
        }
    }

    /// Whether the session for the selected port is paused on a busy port.
    pub fn is_busy(&self) -> bool {
        self.lock()
            .session
            .as_ref()
            .is_some_and(|s| s.pause_reason == Some(PauseReason::ResourceBusy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_joins_split_sequences() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "héllo".as_bytes();
        assert_eq!(decoder.push(&bytes[..2]), "h");
        assert_eq!(decoder.push(&bytes[2..]), "éllo");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn decoder_flushes_truncated_tail() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push(&[b'x', 0xE2, 0x82]), "x");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn identity_is_explicit() {
        let a = ClientIdentity::new("editor");
        let b = ClientIdentity::new("editor");
        assert_ne!(a.client_id, b.client_id);
        assert_eq!(a.name, "editor");
    }
}
