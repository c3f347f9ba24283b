//! Per-port session state held by the session registry.
//!
//! One [`MonitorSessionState`] exists per port-key. It records what the
//! attached clients want (`desired`), what has been achieved (`status`), the
//! single in-flight open attempt and the clients sharing the stream.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{AttemptId, DesiredState, PauseReason};
use crate::error::MonitorError;
use crate::port::{PortIdentifier, PortKey};

/// Identity of one attached client (an editor or view).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Active,
    Paused,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Ground truth reported by the bridge about the OS-level connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PhysicalStatus {
    Started,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorPhysicalState {
    pub port: PortIdentifier,
    pub state: PhysicalStatus,
    #[serde(default)]
    pub attempt_id: Option<AttemptId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MonitorError>,
}

/// Inputs to a session. Transitions that may begin a new attempt carry the
/// id to use; the registry allocates ids from one monotonic counter.
#[derive(Debug, Clone)]
pub enum SessionTransition {
    Start {
        client: ClientId,
        next_attempt: AttemptId,
    },
    Stop {
        client: ClientId,
    },
    Opened {
        attempt_id: AttemptId,
    },
    OpenFailed {
        attempt_id: AttemptId,
        error: MonitorError,
    },
    StreamClosed {
        attempt_id: Option<AttemptId>,
    },
    PortDetected {
        next_attempt: AttemptId,
    },
    PortLost,
    CloseCompleted {
        next_attempt: AttemptId,
    },
    BridgeDisconnected,
    BridgeReconnected {
        next_attempt: AttemptId,
    },
    Physical {
        state: MonitorPhysicalState,
    },
    Migrate {
        to: PortIdentifier,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSessionState {
    pub port: PortIdentifier,
    pub desired: DesiredState,
    pub status: SessionStatus,
    pub pause_reason: Option<PauseReason>,
    pub current_attempt_id: Option<AttemptId>,
    pub last_completed_attempt_id: Option<AttemptId>,
    pub open_pending: bool,
    pub close_pending: bool,
    pub clients: BTreeSet<ClientId>,
    /// Whether the port is present in the latest detection snapshot.
    pub detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MonitorError>,
}

impl MonitorSessionState {
    pub fn new(port: PortIdentifier, detected: bool) -> Self {
        Self {
            port,
            desired: DesiredState::Stopped,
            status: SessionStatus::Idle,
            pause_reason: None,
            current_attempt_id: None,
            last_completed_attempt_id: None,
            open_pending: false,
            close_pending: false,
            clients: BTreeSet::new(),
            detected,
            error: None,
        }
    }

    pub fn key(&self) -> PortKey {
        self.port.key()
    }

    /// The attempt that produced the current stream, if any.
    pub fn streaming_attempt(&self) -> Option<AttemptId> {
        match self.status {
            SessionStatus::Connecting => self.current_attempt_id,
            SessionStatus::Active => self.last_completed_attempt_id,
            _ => None,
        }
    }

    /// Nothing left to track: the registry drops the entry.
    pub fn is_disposable(&self) -> bool {
        self.clients.is_empty()
            && self.desired == DesiredState::Stopped
            && !self.open_pending
            && !self.close_pending
            && self.error.is_none()
    }

    pub fn apply(&self, transition: SessionTransition) -> Self {
        let mut next = self.clone();
        match transition {
            SessionTransition::Start {
                client,
                next_attempt,
            } => {
                next.clients.insert(client);
                next.desired = DesiredState::Running;
                match next.status {
                    SessionStatus::Connecting | SessionStatus::Active => {}
                    _ => {
                        next.error = None;
                        next.resume(next_attempt);
                    }
                }
            }

            SessionTransition::Stop { client } => {
                next.clients.remove(&client);
                if next.clients.is_empty() {
                    next.desired = DesiredState::Stopped;
                    if matches!(
                        next.status,
                        SessionStatus::Active | SessionStatus::Connecting
                    ) {
                        next.close_pending = true;
                    }
                    next.cancel_attempt();
                    next.error = None;
                    next.pause(PauseReason::User);
                }
            }

            SessionTransition::Opened { attempt_id } => {
                if next.current_attempt_id != Some(attempt_id) {
                    return next;
                }
                next.complete_open();
            }

            SessionTransition::OpenFailed { attempt_id, error } => {
                if next.current_attempt_id != Some(attempt_id) {
                    return next;
                }
                match error {
                    MonitorError::AlreadyAttached => next.complete_open(),
                    MonitorError::PortBusy => {
                        next.cancel_attempt();
                        next.pause(PauseReason::ResourceBusy);
                        next.error = Some(MonitorError::PortBusy);
                    }
                    other => next.fail(other),
                }
            }

            SessionTransition::StreamClosed { attempt_id } => {
                let current = match attempt_id {
                    Some(id) => next.streaming_attempt() == Some(id),
                    None => next.streaming_attempt().is_some(),
                };
                if !current {
                    return next;
                }
                next.cancel_attempt();
                next.close_pending = false;
                if next.desired.is_running() {
                    next.pause(PauseReason::ResourceMissing);
                } else {
                    next.pause(PauseReason::User);
                }
            }

            SessionTransition::PortDetected { next_attempt } => {
                next.detected = true;
                let retry = match next.status {
                    SessionStatus::Idle | SessionStatus::Error => true,
                    SessionStatus::Paused => {
                        next.pause_reason == Some(PauseReason::ResourceMissing)
                    }
                    SessionStatus::Connecting | SessionStatus::Active => false,
                };
                let bridge_down = next.error == Some(MonitorError::BridgeDisconnected);
                if next.desired.is_running() && retry && !bridge_down && !next.close_pending {
                    next.error = None;
                    next.begin_attempt(next_attempt);
                }
            }

            SessionTransition::PortLost => {
                next.detected = false;
                if next.desired.is_running()
                    && matches!(
                        next.status,
                        SessionStatus::Active | SessionStatus::Connecting
                    )
                {
                    if next.status == SessionStatus::Active {
                        next.close_pending = true;
                    }
                    next.cancel_attempt();
                    next.pause(PauseReason::ResourceMissing);
                }
            }

            SessionTransition::CloseCompleted { next_attempt } => {
                next.close_pending = false;
                let waiting = next.status == SessionStatus::Paused
                    && matches!(
                        next.pause_reason,
                        Some(PauseReason::User) | Some(PauseReason::ResourceMissing)
                    );
                if next.desired.is_running() && waiting {
                    next.resume(next_attempt);
                }
            }

            SessionTransition::BridgeDisconnected => {
                next.cancel_attempt();
                next.close_pending = false;
                next.fail(MonitorError::BridgeDisconnected);
            }

            SessionTransition::BridgeReconnected { next_attempt } => {
                if next.error != Some(MonitorError::BridgeDisconnected) {
                    return next;
                }
                next.error = None;
                if next.desired.is_running() {
                    next.resume(next_attempt);
                } else {
                    next.pause(PauseReason::User);
                }
            }

            SessionTransition::Physical { state } => {
                if state.port != next.port {
                    return next;
                }
                return match state.state {
                    PhysicalStatus::Started => match state.attempt_id {
                        Some(id) => next.apply(SessionTransition::Opened { attempt_id: id }),
                        None => next,
                    },
                    PhysicalStatus::Failed => {
                        let error = state
                            .error
                            .unwrap_or_else(|| MonitorError::internal("monitor failed"));
                        match (next.status, state.attempt_id) {
                            (SessionStatus::Connecting, Some(id)) => {
                                next.apply(SessionTransition::OpenFailed {
                                    attempt_id: id,
                                    error,
                                })
                            }
                            (SessionStatus::Active, id)
                                if id.is_none() || id == next.last_completed_attempt_id =>
                            {
                                next.fail(error);
                                next
                            }
                            _ => next,
                        }
                    }
                    PhysicalStatus::Stopped => next.apply(SessionTransition::StreamClosed {
                        attempt_id: state.attempt_id,
                    }),
                };
            }

            SessionTransition::Migrate { to } => {
                next.port = to;
                next.detected = true;
            }
        }
        next
    }

    /// Try to get back to a running stream.
    fn resume(&mut self, next_attempt: AttemptId) {
        if self.close_pending {
            self.pause(PauseReason::User);
        } else if self.detected {
            self.begin_attempt(next_attempt);
        } else {
            self.pause(PauseReason::ResourceMissing);
        }
    }

    fn begin_attempt(&mut self, id: AttemptId) {
        if self.current_attempt_id.is_some() {
            return;
        }
        self.current_attempt_id = Some(id);
        self.open_pending = true;
        self.status = SessionStatus::Connecting;
        self.pause_reason = None;
    }

    fn complete_open(&mut self) {
        self.cancel_attempt();
        if self.desired.is_running() {
            self.status = SessionStatus::Active;
            self.pause_reason = None;
            self.error = None;
        } else {
            self.close_pending = true;
            self.pause(PauseReason::User);
        }
    }

    fn cancel_attempt(&mut self) {
        if let Some(id) = self.current_attempt_id.take() {
            self.last_completed_attempt_id =
                Some(self.last_completed_attempt_id.map_or(id, |last| last.max(id)));
        }
        self.open_pending = false;
    }

    fn pause(&mut self, reason: PauseReason) {
        self.status = SessionStatus::Paused;
        self.pause_reason = Some(reason);
    }

    fn fail(&mut self, error: MonitorError) {
        self.cancel_attempt();
        self.status = SessionStatus::Error;
        self.pause_reason = None;
        self.error = Some(error);
    }
}
