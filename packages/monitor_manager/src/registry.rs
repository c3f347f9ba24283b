//! Session registry actor.
//!
//! Single owner of every [`MonitorSessionState`], keyed by port-key. All
//! transitions go through the actor's mailbox, so per-port ordering is the
//! order in which commands arrive. Attempt ids come from one counter shared
//! by all ports and only ever increase.

use std::collections::HashMap;
use std::time::Duration;

use monitor_fsm::{
    AttemptId, ClientId, DetectedPorts, MonitorError, MonitorPhysicalState, MonitorSessionState,
    PauseReason, PortIdentifier, PortKey, SessionStatus, SessionTransition,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::ManagerError;

/// Default time a port may be missing from detection before its session
/// treats it as lost.
pub const DEFAULT_PRESENCE_GRACE: Duration = Duration::from_millis(1000);

/// Pushed to subscribers on every session change.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionNotification {
    Changed { session: MonitorSessionState },
    Removed { port: PortIdentifier },
    /// The bridge resumed a session's device at a new address.
    Moved {
        from: PortIdentifier,
        to: PortIdentifier,
    },
    BridgeDisconnected,
}

enum RegistryCommand {
    Start {
        client: ClientId,
        port: PortIdentifier,
        baudrate: Option<u32>,
        respond_to: oneshot::Sender<Result<MonitorSessionState, ManagerError>>,
    },
    Stop {
        client: ClientId,
        port: PortIdentifier,
        respond_to: oneshot::Sender<Option<MonitorSessionState>>,
    },
    Detach {
        client: ClientId,
        respond_to: oneshot::Sender<()>,
    },
    Opened {
        port: PortIdentifier,
        attempt_id: AttemptId,
        respond_to: oneshot::Sender<()>,
    },
    OpenFailed {
        port: PortIdentifier,
        attempt_id: AttemptId,
        error: MonitorError,
        respond_to: oneshot::Sender<()>,
    },
    StreamClosed {
        port: PortIdentifier,
        attempt_id: Option<AttemptId>,
        respond_to: oneshot::Sender<()>,
    },
    CloseCompleted {
        port: PortIdentifier,
        respond_to: oneshot::Sender<()>,
    },
    ApplyPresence {
        snapshot: DetectedPorts,
        respond_to: oneshot::Sender<()>,
    },
    Physical {
        state: MonitorPhysicalState,
        respond_to: oneshot::Sender<()>,
    },
    ResumeOnPort {
        from: PortIdentifier,
        to: PortIdentifier,
        respond_to: oneshot::Sender<()>,
    },
    BridgeDisconnected {
        respond_to: oneshot::Sender<()>,
    },
    BridgeReconnected {
        respond_to: oneshot::Sender<()>,
    },
    SetBaudrate {
        port: PortIdentifier,
        baudrate: u32,
        respond_to: oneshot::Sender<()>,
    },
    GetBaudrate {
        port: PortIdentifier,
        respond_to: oneshot::Sender<Option<u32>>,
    },
    GetSession {
        port: PortIdentifier,
        respond_to: oneshot::Sender<Option<MonitorSessionState>>,
    },
    ListSessions {
        respond_to: oneshot::Sender<Vec<MonitorSessionState>>,
    },
    GraceExpired {
        key: PortKey,
        generation: u64,
    },
}

/// Handle to the session registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
    events: broadcast::Sender<SessionNotification>,
}

impl RegistryHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| ManagerError::ActorGone("session registry"))?;
        rx.await
            .map_err(|_| ManagerError::NoResponse("session registry"))
    }

    /// Attach `client` to the session for `port` and express a start intent.
    pub async fn start(
        &self,
        client: ClientId,
        port: PortIdentifier,
        baudrate: Option<u32>,
    ) -> Result<MonitorSessionState, ManagerError> {
        self.call(|respond_to| RegistryCommand::Start {
            client,
            port,
            baudrate,
            respond_to,
        })
        .await?
    }

    /// Detach `client` from one port. The stream keeps running while other
    /// clients remain.
    pub async fn stop(
        &self,
        client: ClientId,
        port: PortIdentifier,
    ) -> Result<Option<MonitorSessionState>, ManagerError> {
        self.call(|respond_to| RegistryCommand::Stop {
            client,
            port,
            respond_to,
        })
        .await
    }

    /// Detach `client` from every session it is part of.
    pub async fn detach(&self, client: ClientId) -> Result<(), ManagerError> {
        self.call(|respond_to| RegistryCommand::Detach { client, respond_to })
            .await
    }

    pub async fn report_opened(
        &self,
        port: PortIdentifier,
        attempt_id: AttemptId,
    ) -> Result<(), ManagerError> {
        self.call(|respond_to| RegistryCommand::Opened {
            port,
            attempt_id,
            respond_to,
        })
        .await
    }

    pub async fn report_open_failed(
        &self,
        port: PortIdentifier,
        attempt_id: AttemptId,
        error: MonitorError,
    ) -> Result<(), ManagerError> {
        self.call(|respond_to| RegistryCommand::OpenFailed {
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
        self.call(|respond_to| RegistryCommand::StreamClosed {
            port,
            attempt_id,
            respond_to,
        })
        .await
    }

    /// The upstream for `port` has been torn down.
    pub async fn close_completed(&self, port: PortIdentifier) -> Result<(), ManagerError> {
        self.call(|respond_to| RegistryCommand::CloseCompleted { port, respond_to })
            .await
    }

    pub async fn apply_presence(&self, snapshot: DetectedPorts) -> Result<(), ManagerError> {
        self.call(|respond_to| RegistryCommand::ApplyPresence {
            snapshot,
            respond_to,
        })
        .await
    }

    pub async fn physical_state_changed(
        &self,
        state: MonitorPhysicalState,
    ) -> Result<(), ManagerError> {
        self.call(|respond_to| RegistryCommand::Physical { state, respond_to })
            .await
    }

    /// Move the session and its baud rate from `from` to `to`.
    pub async fn resume_on_port(
        &self,
        from: PortIdentifier,
        to: PortIdentifier,
    ) -> Result<(), ManagerError> {
        self.call(|respond_to| RegistryCommand::ResumeOnPort {
            from,
            to,
            respond_to,
        })
        .await
    }

    pub async fn bridge_disconnected(&self) -> Result<(), ManagerError> {
        self.call(|respond_to| RegistryCommand::BridgeDisconnected { respond_to })
            .await
    }

    pub async fn bridge_reconnected(&self) -> Result<(), ManagerError> {
        self.call(|respond_to| RegistryCommand::BridgeReconnected { respond_to })
            .await
    }

    pub async fn set_baudrate(
        &self,
        port: PortIdentifier,
        baudrate: u32,
    ) -> Result<(), ManagerError> {
        self.call(|respond_to| RegistryCommand::SetBaudrate {
            port,
            baudrate,
            respond_to,
        })
        .await
    }

    pub async fn baudrate(&self, port: PortIdentifier) -> Result<Option<u32>, ManagerError> {
        self.call(|respond_to| RegistryCommand::GetBaudrate { port, respond_to })
            .await
    }

    pub async fn session(
        &self,
        port: PortIdentifier,
    ) -> Result<Option<MonitorSessionState>, ManagerError> {
        self.call(|respond_to| RegistryCommand::GetSession { port, respond_to })
            .await
    }

    pub async fn sessions(&self) -> Result<Vec<MonitorSessionState>, ManagerError> {
        self.call(|respond_to| RegistryCommand::ListSessions { respond_to })
            .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        self.events.subscribe()
    }
}

/// The registry actor. Construct with [`SessionRegistry::spawn`].
pub struct SessionRegistry {
    sessions: HashMap<PortKey, MonitorSessionState>,
    baudrates: HashMap<PortKey, u32>,
    detected: DetectedPorts,
    /// Ports missing from detection whose loss is still within the grace
    /// window, with the generation of the timer that will expire them.
    pending_loss: HashMap<PortKey, u64>,
    loss_generation: u64,
    grace: Duration,
    next_attempt: AttemptId,
    events: broadcast::Sender<SessionNotification>,
    receiver: mpsc::Receiver<RegistryCommand>,
    timers: mpsc::WeakSender<RegistryCommand>,
}

impl SessionRegistry {
    /// Spawn the registry and return its handle.
    pub fn spawn(grace: Duration, notification_capacity: usize) -> RegistryHandle {
        let (sender, receiver) = mpsc::channel(64);
        let (events, _) = broadcast::channel(notification_capacity.max(1));

        let actor = SessionRegistry {
            sessions: HashMap::new(),
            baudrates: HashMap::new(),
            detected: DetectedPorts::new(),
            pending_loss: HashMap::new(),
            loss_generation: 0,
            grace,
            next_attempt: 1,
            events: events.clone(),
            receiver,
            timers: sender.downgrade(),
        };
        tokio::spawn(actor.run());

        RegistryHandle { sender, events }
    }

    async fn run(mut self) {
        debug!("Session registry started");

        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                RegistryCommand::Start {
                    client,
                    port,
                    baudrate,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.start(client, port, baudrate));
                }

                RegistryCommand::Stop {
                    client,
                    port,
                    respond_to,
                } => {
                    debug!("{} stopping {}", client, port);
                    let state = self.transition(&port.key(), SessionTransition::Stop { client });
                    let _ = respond_to.send(state);
                }

                RegistryCommand::Detach { client, respond_to } => {
                    let keys: Vec<PortKey> = self
                        .sessions
                        .iter()
                        .filter(|(_, s)| s.clients.contains(&client))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in keys {
                        self.transition(&key, SessionTransition::Stop { client });
                    }
                    let _ = respond_to.send(());
                }

                RegistryCommand::Opened {
                    port,
                    attempt_id,
                    respond_to,
                } => {
                    self.transition(&port.key(), SessionTransition::Opened { attempt_id });
                    let _ = respond_to.send(());
                }

                RegistryCommand::OpenFailed {
                    port,
                    attempt_id,
                    error,
                    respond_to,
                } => {
                    if !error.is_benign() {
                        warn!("Open attempt {} on {} failed: {}", attempt_id, port, error);
                    }
                    self.transition(
                        &port.key(),
                        SessionTransition::OpenFailed { attempt_id, error },
                    );
                    let _ = respond_to.send(());
                }

                RegistryCommand::StreamClosed {
                    port,
                    attempt_id,
                    respond_to,
                } => {
                    self.transition(&port.key(), SessionTransition::StreamClosed { attempt_id });
                    let _ = respond_to.send(());
                }

                RegistryCommand::CloseCompleted { port, respond_to } => {
                    let next_attempt = self.allocate_attempt();
                    self.transition(
                        &port.key(),
                        SessionTransition::CloseCompleted { next_attempt },
                    );
                    let _ = respond_to.send(());
                }

                RegistryCommand::ApplyPresence {
                    snapshot,
                    respond_to,
                } => {
                    self.apply_presence(snapshot);
                    let _ = respond_to.send(());
                }

                RegistryCommand::Physical { state, respond_to } => {
                    debug!("Physical state for {}: {:?}", state.port, state.state);
                    let key = state.port.key();
                    self.transition(&key, SessionTransition::Physical { state });
                    let _ = respond_to.send(());
                }

                RegistryCommand::ResumeOnPort {
                    from,
                    to,
                    respond_to,
                } => {
                    self.resume_on_port(from, to);
                    let _ = respond_to.send(());
                }

                RegistryCommand::BridgeDisconnected { respond_to } => {
                    warn!("Bridge disconnected");
                    self.pending_loss.clear();
                    for key in self.keys() {
                        self.transition(&key, SessionTransition::BridgeDisconnected);
                    }
                    let _ = self.events.send(SessionNotification::BridgeDisconnected);
                    let _ = respond_to.send(());
                }

                RegistryCommand::BridgeReconnected { respond_to } => {
                    info!("Bridge reconnected");
                    for key in self.keys() {
                        let next_attempt = self.allocate_attempt();
                        self.transition(&key, SessionTransition::BridgeReconnected { next_attempt });
                    }
                    let _ = respond_to.send(());
                }

                RegistryCommand::SetBaudrate {
                    port,
                    baudrate,
                    respond_to,
                } => {
                    // Rates are kept per live session only.
                    let key = port.key();
                    if self.sessions.contains_key(&key) {
                        self.baudrates.insert(key, baudrate);
                    }
                    let _ = respond_to.send(());
                }

                RegistryCommand::GetBaudrate { port, respond_to } => {
                    let _ = respond_to.send(self.baudrates.get(&port.key()).copied());
                }

                RegistryCommand::GetSession { port, respond_to } => {
                    let _ = respond_to.send(self.sessions.get(&port.key()).cloned());
                }

                RegistryCommand::ListSessions { respond_to } => {
                    let mut sessions: Vec<_> = self.sessions.values().cloned().collect();
                    sessions.sort_by(|a, b| a.port.cmp(&b.port));
                    let _ = respond_to.send(sessions);
                }

                RegistryCommand::GraceExpired { key, generation } => {
                    self.grace_expired(key, generation);
                }
            }
        }

        debug!("Session registry stopped");
    }

    fn allocate_attempt(&mut self) -> AttemptId {
        let id = self.next_attempt;
        self.next_attempt += 1;
        id
    }

    fn keys(&self) -> Vec<PortKey> {
        self.sessions.keys().cloned().collect()
    }

    fn start(
        &mut self,
        client: ClientId,
        port: PortIdentifier,
        baudrate: Option<u32>,
    ) -> Result<MonitorSessionState, ManagerError> {
        let key = port.key();
        if !self.sessions.contains_key(&key) {
            info!("Creating monitor session for {}", key);
            let detected = self.detected.contains(&key);
            self.sessions
                .insert(key.clone(), MonitorSessionState::new(port, detected));
        }
        if let Some(baudrate) = baudrate {
            self.baudrates.insert(key.clone(), baudrate);
        }
        let next_attempt = self.allocate_attempt();
        self.transition(
            &key,
            SessionTransition::Start {
                client,
                next_attempt,
            },
        )
        .ok_or(ManagerError::NoSession(key))
    }

    /// Apply one transition and publish the result. Returns the session as
    /// it stands afterwards, including a session that was just disposed.
    fn transition(
        &mut self,
        key: &PortKey,
        transition: SessionTransition,
    ) -> Option<MonitorSessionState> {
        let current = self.sessions.get(key)?;
        let next = current.apply(transition);
        if next == *current {
            return Some(next);
        }

        debug!(
            "Session {}: {} -> {} (attempt {:?}, clients {})",
            key,
            current.status,
            next.status,
            next.current_attempt_id,
            next.clients.len()
        );

        if next.is_disposable() {
            debug!("Disposing session {}", key);
            self.sessions.remove(key);
            self.pending_loss.remove(key);
            self.baudrates.remove(key);
            let _ = self.events.send(SessionNotification::Removed {
                port: next.port.clone(),
            });
        } else {
            self.sessions.insert(key.clone(), next.clone());
            let _ = self.events.send(SessionNotification::Changed {
                session: next.clone(),
            });
        }
        Some(next)
    }

    fn apply_presence(&mut self, snapshot: DetectedPorts) {
        self.detected = snapshot;

        for key in self.keys() {
            let Some(session) = self.sessions.get(&key) else {
                continue;
            };

            if self.detected.contains(&key) {
                if self.pending_loss.remove(&key).is_some() {
                    debug!("{} reappeared within the grace window", key);
                }
                let waiting = session.status == SessionStatus::Paused
                    && session.pause_reason == Some(PauseReason::ResourceMissing);
                if !session.detected || waiting {
                    let next_attempt = self.allocate_attempt();
                    self.transition(&key, SessionTransition::PortDetected { next_attempt });
                }
            } else if session.detected && !self.pending_loss.contains_key(&key) {
                self.schedule_loss(key);
            }
        }
    }

    fn schedule_loss(&mut self, key: PortKey) {
        if self.grace.is_zero() {
            info!("{} is no longer detected", key);
            self.transition(&key, SessionTransition::PortLost);
            return;
        }

        self.loss_generation += 1;
        let generation = self.loss_generation;
        self.pending_loss.insert(key.clone(), generation);

        let timers = self.timers.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(tx) = timers.upgrade() {
                let _ = tx
                    .send(RegistryCommand::GraceExpired { key, generation })
                    .await;
            }
        });
    }

    fn grace_expired(&mut self, key: PortKey, generation: u64) {
        if self.pending_loss.get(&key) != Some(&generation) {
            return;
        }
        self.pending_loss.remove(&key);
        if !self.detected.contains(&key) {
            info!("{} is no longer detected", key);
            self.transition(&key, SessionTransition::PortLost);
        }
    }

    fn resume_on_port(&mut self, from: PortIdentifier, to: PortIdentifier) {
        let from_key = from.key();
        let to_key = to.key();
        if from_key == to_key {
            return;
        }
        info!("Bridge resumed {} on {}", from_key, to_key);

        if let Some(baudrate) = self.baudrates.remove(&from_key) {
            self.baudrates.insert(to_key.clone(), baudrate);
        }
        self.pending_loss.remove(&from_key);
        let _ = self.events.send(SessionNotification::Moved {
            from: from.clone(),
            to: to.clone(),
        });

        let Some(session) = self.sessions.remove(&from_key) else {
            return;
        };
        if self.sessions.contains_key(&to_key) {
            warn!("Replacing existing session on {} with migrated one", to_key);
        }
        let moved = session.apply(SessionTransition::Migrate { to });
        self.sessions.insert(to_key.clone(), moved.clone());
        let _ = self.events.send(SessionNotification::Changed { session: moved });

        // A session that lost its device resumes on the new address.
        let next_attempt = self.allocate_attempt();
        self.transition(&to_key, SessionTransition::PortDetected { next_attempt });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monitor_fsm::{DesiredState, DetectedPort};

    fn acm0() -> PortIdentifier {
        PortIdentifier::serial("/dev/ttyACM0")
    }

    fn acm1() -> PortIdentifier {
        PortIdentifier::serial("/dev/ttyACM1")
    }

    fn detected(ports: &[PortIdentifier]) -> DetectedPorts {
        DetectedPorts::from_ports(ports.iter().cloned().map(DetectedPort::new))
    }

    async fn registry_with(ports: &[PortIdentifier], grace: Duration) -> RegistryHandle {
        let registry = SessionRegistry::spawn(grace, 64);
        registry.apply_presence(detected(ports)).await.unwrap();
        registry
    }

    #[tokio::test]
    async fn start_creates_connecting_session() {
        let registry = registry_with(&[acm0()], Duration::ZERO).await;
        let session = registry
            .start(ClientId::new(), acm0(), Some(115200))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Connecting);
        assert!(session.current_attempt_id.is_some());
        assert_eq!(registry.baudrate(acm0()).await.unwrap(), Some(115200));
    }

    #[tokio::test]
    async fn second_client_joins_same_attempt() {
        let registry = registry_with(&[acm0()], Duration::ZERO).await;
        let first = registry.start(ClientId::new(), acm0(), None).await.unwrap();
        let second = registry.start(ClientId::new(), acm0(), None).await.unwrap();
        assert_eq!(first.current_attempt_id, second.current_attempt_id);
        assert_eq!(second.clients.len(), 2);
    }

    #[tokio::test]
    async fn attempt_ids_increase_across_ports() {
        let registry = registry_with(&[acm0(), acm1()], Duration::ZERO).await;
        let a = registry.start(ClientId::new(), acm0(), None).await.unwrap();
        let b = registry.start(ClientId::new(), acm1(), None).await.unwrap();
        assert!(b.current_attempt_id.unwrap() > a.current_attempt_id.unwrap());
    }

    #[tokio::test]
    async fn last_stop_requests_close_then_disposes() {
        let registry = registry_with(&[acm0()], Duration::ZERO).await;
        let mut events = registry.subscribe();
        let client = ClientId::new();
        let session = registry.start(client, acm0(), None).await.unwrap();
        let attempt = session.current_attempt_id.unwrap();
        registry.report_opened(acm0(), attempt).await.unwrap();

        let stopped = registry.stop(client, acm0()).await.unwrap().unwrap();
        assert!(stopped.close_pending);
        assert_eq!(stopped.desired, DesiredState::Stopped);

        registry.close_completed(acm0()).await.unwrap();
        assert!(registry.session(acm0()).await.unwrap().is_none());

        let mut removed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionNotification::Removed { .. }) {
                removed = true;
            }
        }
        assert!(removed);
    }

    #[tokio::test]
    async fn disposed_session_forgets_its_baudrate() {
        let registry = registry_with(&[acm0()], Duration::ZERO).await;
        let client = ClientId::new();
        let session = registry.start(client, acm0(), Some(115200)).await.unwrap();
        registry
            .report_opened(acm0(), session.current_attempt_id.unwrap())
            .await
            .unwrap();
        registry.set_baudrate(acm0(), 57600).await.unwrap();
        assert_eq!(registry.baudrate(acm0()).await.unwrap(), Some(57600));

        registry.stop(client, acm0()).await.unwrap();
        registry.close_completed(acm0()).await.unwrap();
        assert!(registry.session(acm0()).await.unwrap().is_none());
        assert_eq!(registry.baudrate(acm0()).await.unwrap(), None);

        // No session, nothing to remember.
        registry.set_baudrate(acm1(), 9600).await.unwrap();
        assert_eq!(registry.baudrate(acm1()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn detach_leaves_other_clients_running() {
        let registry = registry_with(&[acm0()], Duration::ZERO).await;
        let a = ClientId::new();
        let b = ClientId::new();
        let session = registry.start(a, acm0(), None).await.unwrap();
        registry.start(b, acm0(), None).await.unwrap();
        registry
            .report_opened(acm0(), session.current_attempt_id.unwrap())
            .await
            .unwrap();

        registry.detach(a).await.unwrap();
        let session = registry.session(acm0()).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert!(!session.close_pending);
        assert!(session.clients.contains(&b));
    }

    #[tokio::test]
    async fn already_attached_report_activates() {
        let registry = registry_with(&[acm0()], Duration::ZERO).await;
        let session = registry.start(ClientId::new(), acm0(), None).await.unwrap();
        registry
            .report_open_failed(
                acm0(),
                session.current_attempt_id.unwrap(),
                MonitorError::AlreadyAttached,
            )
            .await
            .unwrap();
        let session = registry.session(acm0()).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn loss_within_grace_window_is_ignored() {
        let registry = registry_with(&[acm0()], Duration::from_millis(1000)).await;
        let session = registry.start(ClientId::new(), acm0(), None).await.unwrap();
        registry
            .report_opened(acm0(), session.current_attempt_id.unwrap())
            .await
            .unwrap();

        registry.apply_presence(DetectedPorts::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        registry.apply_presence(detected(&[acm0()])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2000)).await;

        let session = registry.session(acm0()).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn loss_past_grace_window_pauses() {
        let registry = registry_with(&[acm0()], Duration::from_millis(1000)).await;
        let session = registry.start(ClientId::new(), acm0(), None).await.unwrap();
        registry
            .report_opened(acm0(), session.current_attempt_id.unwrap())
            .await
            .unwrap();

        registry.apply_presence(DetectedPorts::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let session = registry.session(acm0()).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Paused);
        assert_eq!(session.pause_reason, Some(PauseReason::ResourceMissing));
        assert!(session.close_pending);
    }

    #[tokio::test]
    async fn resume_on_port_migrates_session_and_baudrate() {
        let registry = registry_with(&[acm0()], Duration::ZERO).await;
        let session = registry
            .start(ClientId::new(), acm0(), Some(9600))
            .await
            .unwrap();
        registry
            .report_opened(acm0(), session.current_attempt_id.unwrap())
            .await
            .unwrap();

        registry.resume_on_port(acm0(), acm1()).await.unwrap();

        assert!(registry.session(acm0()).await.unwrap().is_none());
        let moved = registry.session(acm1()).await.unwrap().unwrap();
        assert_eq!(moved.status, SessionStatus::Active);
        assert_eq!(registry.baudrate(acm1()).await.unwrap(), Some(9600));
        assert_eq!(registry.baudrate(acm0()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bridge_disconnect_then_reconnect_retries() {
        let registry = registry_with(&[acm0()], Duration::ZERO).await;
        let session = registry.start(ClientId::new(), acm0(), None).await.unwrap();
        let first = session.current_attempt_id.unwrap();
        registry.report_opened(acm0(), first).await.unwrap();

        registry.bridge_disconnected().await.unwrap();
        let session = registry.session(acm0()).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.error, Some(MonitorError::BridgeDisconnected));

        registry.bridge_reconnected().await.unwrap();
        let session = registry.session(acm0()).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Connecting);
        assert!(session.current_attempt_id.unwrap() > first);
    }

    #[tokio::test]
    async fn start_on_undetected_port_waits_for_detection() {
        let registry = registry_with(&[], Duration::ZERO).await;
        let session = registry.start(ClientId::new(), acm0(), None).await.unwrap();
        assert_eq!(session.pause_reason, Some(PauseReason::ResourceMissing));

        registry.apply_presence(detected(&[acm0()])).await.unwrap();
        let session = registry.session(acm0()).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Connecting);
    }

    #[test]
    fn notification_serde_tag() {
        let json = serde_json::to_value(SessionNotification::Moved {
            from: acm0(),
            to: acm1(),
        })
        .unwrap();
        assert_eq!(json["type"], "moved");
        assert_eq!(json["to"]["address"], "/dev/ttyACM1");
    }
}
