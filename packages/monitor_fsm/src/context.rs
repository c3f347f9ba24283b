//! Client-local logical monitor state.
//!
//! [`MonitorContext::apply`] is a pure reducer: it takes the current context
//! and one [`MonitorEvent`] and returns the next context. It owns no
//! resources; the connection adapter feeds it the same events it acts on so
//! the logical view can be replayed and tested without any transport.
//!
//! Attempt ids give a total order over open attempts. Only one attempt may
//! be in flight, and any completion that does not name the current attempt
//! (or the attempt that produced the active stream) leaves the context
//! unchanged.

use serde::{Deserialize, Serialize};

use crate::error::MonitorError;
use crate::port::PortIdentifier;

/// Identifies one open/connect try.
pub type AttemptId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    #[default]
    Stopped,
}

impl DesiredState {
    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitingReason {
    NoPortSelected,
    WaitingForDetection,
    PortTemporarilyMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PauseReason {
    User,
    Suspend,
    ResourceBusy,
    ResourceMissing,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LogicalState {
    #[default]
    Idle,
    WaitingForPort {
        reason: WaitingReason,
    },
    Connecting {
        port: PortIdentifier,
    },
    Active {
        port: PortIdentifier,
    },
    Paused {
        port: PortIdentifier,
        reason: PauseReason,
    },
    Error {
        port: Option<PortIdentifier>,
        error: MonitorError,
        resumable: bool,
    },
    Closed,
}

impl LogicalState {
    pub fn port(&self) -> Option<&PortIdentifier> {
        match self {
            Self::Connecting { port } | Self::Active { port } | Self::Paused { port, .. } => {
                Some(port)
            }
            Self::Error { port, .. } => port.as_ref(),
            Self::Idle | Self::WaitingForPort { .. } | Self::Closed => None,
        }
    }

    fn with_port(self, to: &PortIdentifier) -> Self {
        match self {
            Self::Connecting { .. } => Self::Connecting { port: to.clone() },
            Self::Active { .. } => Self::Active { port: to.clone() },
            Self::Paused { reason, .. } => Self::Paused {
                port: to.clone(),
                reason,
            },
            Self::Error {
                port: Some(_),
                error,
                resumable,
            } => Self::Error {
                port: Some(to.clone()),
                error,
                resumable,
            },
            other => other,
        }
    }
}

/// Inputs to the logical reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    PortSelected {
        port: Option<PortIdentifier>,
        detected: bool,
    },
    PortDetected {
        port: PortIdentifier,
    },
    PortLost {
        port: PortIdentifier,
    },
    UserStart,
    UserStop,
    OpenRequested {
        port: Option<PortIdentifier>,
        attempt_id: Option<AttemptId>,
    },
    OpenOk {
        port: Option<PortIdentifier>,
        attempt_id: Option<AttemptId>,
    },
    OpenFail {
        port: Option<PortIdentifier>,
        attempt_id: Option<AttemptId>,
        error: MonitorError,
    },
    StreamClosed {
        port: Option<PortIdentifier>,
        attempt_id: Option<AttemptId>,
    },
    BridgeDisconnected,
    /// The bridge re-enumerated the device at a new address.
    PortMigrated {
        from: PortIdentifier,
        to: PortIdentifier,
    },
    /// The owning surface is gone; every later event is ignored.
    Dispose,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorContext {
    pub logical: LogicalState,
    pub desired: DesiredState,
    pub current_attempt_id: Option<AttemptId>,
    pub last_completed_attempt_id: Option<AttemptId>,
    pub selected_port: Option<PortIdentifier>,
    pub selected_detected: bool,
}

impl MonitorContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event, returning the next context.
    pub fn apply(&self, event: MonitorEvent) -> Self {
        if self.logical == LogicalState::Closed {
            return self.clone();
        }

        let mut next = self.clone();
        match event {
            MonitorEvent::PortSelected { port, detected } => {
                next.cancel_attempt();
                next.selected_detected = port.is_some() && detected;
                next.selected_port = port;
                if next.desired.is_running() {
                    next.align(WaitingReason::WaitingForDetection);
                } else {
                    next.set_logical(next.stopped_state());
                }
            }

            MonitorEvent::PortDetected { port } => {
                if !next.is_selected(&port) {
                    return next;
                }
                next.selected_detected = true;
                let stuck = matches!(
                    next.logical,
                    LogicalState::Error {
                        resumable: false,
                        ..
                    }
                );
                if next.desired.is_running() && !stuck {
                    next.align(WaitingReason::WaitingForDetection);
                }
            }

            MonitorEvent::PortLost { port } => {
                if !next.is_selected(&port) {
                    return next;
                }
                next.selected_detected = false;
                if next.desired.is_running() {
                    next.set_logical(LogicalState::WaitingForPort {
                        reason: WaitingReason::PortTemporarilyMissing,
                    });
                } else if next.is_connecting() {
                    next.set_logical(LogicalState::Idle);
                }
            }

            MonitorEvent::UserStart => {
                next.desired = DesiredState::Running;
                if matches!(next.logical, LogicalState::Error { .. }) {
                    next.set_logical(LogicalState::Idle);
                }
                next.align(WaitingReason::WaitingForDetection);
            }

            MonitorEvent::UserStop => {
                next.desired = DesiredState::Stopped;
                next.set_logical(next.stopped_state());
            }

            MonitorEvent::OpenRequested { port, attempt_id } => {
                if next.current_attempt_id.is_some() {
                    return next;
                }
                let Some(port) = port.or_else(|| next.selected_port.clone()) else {
                    return next;
                };
                let id = attempt_id.unwrap_or_else(|| next.next_attempt_id());
                if id < next.next_attempt_id() {
                    return next;
                }
                next.begin_attempt(port, id);
            }

            MonitorEvent::OpenOk { port, attempt_id } => {
                if !next.is_in_flight(attempt_id) || !next.port_matches(port.as_ref()) {
                    return next;
                }
                let Some(port) = next.selected_port.clone() else {
                    return next;
                };
                next.set_logical(if next.desired.is_running() {
                    LogicalState::Active { port }
                } else {
                    LogicalState::Paused {
                        port,
                        reason: PauseReason::User,
                    }
                });
            }

            MonitorEvent::OpenFail {
                port,
                attempt_id,
                error,
            } => {
                if !next.is_in_flight(attempt_id) || !next.port_matches(port.as_ref()) {
                    return next;
                }
                let resumable = next.desired.is_running();
                next.set_logical(LogicalState::Error {
                    port: next.selected_port.clone(),
                    error,
                    resumable,
                });
            }

            MonitorEvent::StreamClosed { port, attempt_id } => {
                let streaming = match next.logical {
                    LogicalState::Connecting { .. } => next.is_in_flight(attempt_id),
                    LogicalState::Active { .. } => next.is_last_completed(attempt_id),
                    _ => false,
                };
                if !streaming || !next.port_matches(port.as_ref()) {
                    return next;
                }
                if next.desired.is_running() {
                    next.set_logical(LogicalState::WaitingForPort {
                        reason: WaitingReason::PortTemporarilyMissing,
                    });
                } else {
                    next.set_logical(next.stopped_state());
                }
            }

            MonitorEvent::BridgeDisconnected => {
                next.set_logical(LogicalState::Error {
                    port: next.selected_port.clone(),
                    error: MonitorError::BridgeDisconnected,
                    resumable: true,
                });
            }

            MonitorEvent::PortMigrated { from, to } => {
                if !next.is_selected(&from) {
                    return next;
                }
                next.selected_port = Some(to.clone());
                next.selected_detected = true;
                next.logical = next.logical.clone().with_port(&to);
            }

            MonitorEvent::Dispose => {
                next.set_logical(LogicalState::Closed);
            }
        }
        next
    }

    /// Apply a sequence of events in order.
    pub fn replay(&self, events: impl IntoIterator<Item = MonitorEvent>) -> Self {
        events
            .into_iter()
            .fold(self.clone(), |ctx, event| ctx.apply(event))
    }

    /// The id the next accepted `OpenRequested` without an explicit id gets.
    pub fn next_attempt_id(&self) -> AttemptId {
        self.last_completed_attempt_id.map_or(1, |id| id + 1)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.logical, LogicalState::Connecting { .. })
    }

    pub fn is_active(&self) -> bool {
        matches!(self.logical, LogicalState::Active { .. })
    }

    fn is_selected(&self, port: &PortIdentifier) -> bool {
        self.selected_port.as_ref() == Some(port)
    }

    /// A completion without a port is checked against the attempt id only.
    fn port_matches(&self, port: Option<&PortIdentifier>) -> bool {
        match port {
            Some(port) => self.is_selected(port),
            None => true,
        }
    }

    fn is_in_flight(&self, attempt_id: Option<AttemptId>) -> bool {
        match (self.current_attempt_id, attempt_id) {
            (Some(current), Some(id)) => current == id,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn is_last_completed(&self, attempt_id: Option<AttemptId>) -> bool {
        match attempt_id {
            Some(id) => self.last_completed_attempt_id == Some(id),
            None => true,
        }
    }

    /// Where a stopped monitor rests: paused on the selected port, or idle.
    fn stopped_state(&self) -> LogicalState {
        match &self.selected_port {
            Some(port) => LogicalState::Paused {
                port: port.clone(),
                reason: PauseReason::User,
            },
            None => LogicalState::Idle,
        }
    }

    fn begin_attempt(&mut self, port: PortIdentifier, id: AttemptId) {
        self.current_attempt_id = Some(id);
        self.logical = LogicalState::Connecting { port };
    }

    /// Retire the in-flight attempt; its id is never handed out again.
    fn cancel_attempt(&mut self) {
        if let Some(id) = self.current_attempt_id.take() {
            self.last_completed_attempt_id =
                Some(self.last_completed_attempt_id.map_or(id, |last| last.max(id)));
        }
    }

    fn set_logical(&mut self, logical: LogicalState) {
        if !matches!(logical, LogicalState::Connecting { .. }) {
            self.cancel_attempt();
        }
        self.logical = logical;
    }

    /// Move toward the running target for the selected port.
    fn align(&mut self, missing: WaitingReason) {
        let Some(port) = self.selected_port.clone() else {
            self.set_logical(LogicalState::WaitingForPort {
                reason: WaitingReason::NoPortSelected,
            });
            return;
        };
        if !self.selected_detected {
            self.set_logical(LogicalState::WaitingForPort { reason: missing });
            return;
        }
        let keep = match &self.logical {
            LogicalState::Connecting { port: p } => {
                *p == port && self.current_attempt_id.is_some()
            }
            LogicalState::Active { port: p } => *p == port,
            _ => false,
        };
        if !keep {
            self.cancel_attempt();
            let id = self.next_attempt_id();
            self.begin_attempt(port, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acm0() -> PortIdentifier {
        PortIdentifier::serial("/dev/ttyACM0")
    }

    fn running_on_acm0() -> MonitorContext {
        MonitorContext::new().replay([
            MonitorEvent::UserStart,
            MonitorEvent::PortSelected {
                port: Some(acm0()),
                detected: true,
            },
        ])
    }

    #[test]
    fn initial_state_is_idle() {
        let ctx = MonitorContext::new();
        assert_eq!(ctx.logical, LogicalState::Idle);
        assert_eq!(ctx.desired, DesiredState::Stopped);
        assert_eq!(ctx.next_attempt_id(), 1);
    }

    #[test]
    fn end_to_end_scenario() {
        let ctx = MonitorContext::new().apply(MonitorEvent::UserStart);
        assert_eq!(
            ctx.logical,
            LogicalState::WaitingForPort {
                reason: WaitingReason::NoPortSelected
            }
        );

        let ctx = ctx.apply(MonitorEvent::PortSelected {
            port: Some(acm0()),
            detected: false,
        });
        assert_eq!(
            ctx.logical,
            LogicalState::WaitingForPort {
                reason: WaitingReason::WaitingForDetection
            }
        );

        let ctx = ctx.apply(MonitorEvent::PortDetected { port: acm0() });
        assert_eq!(ctx.logical, LogicalState::Connecting { port: acm0() });
        let first = ctx.current_attempt_id.unwrap();

        let ctx = ctx.apply(MonitorEvent::OpenOk {
            port: Some(acm0()),
            attempt_id: Some(first),
        });
        assert_eq!(ctx.logical, LogicalState::Active { port: acm0() });
        assert_eq!(ctx.current_attempt_id, None);

        let ctx = ctx.apply(MonitorEvent::PortLost { port: acm0() });
        assert_eq!(
            ctx.logical,
            LogicalState::WaitingForPort {
                reason: WaitingReason::PortTemporarilyMissing
            }
        );
        assert_eq!(ctx.current_attempt_id, None);

        let ctx = ctx.apply(MonitorEvent::PortDetected { port: acm0() });
        assert_eq!(ctx.logical, LogicalState::Connecting { port: acm0() });
        assert!(ctx.current_attempt_id.unwrap() > first);
    }

    #[test]
    fn loss_while_connecting_cancels_attempt() {
        let ctx = running_on_acm0();
        let cancelled = ctx.current_attempt_id.unwrap();
        let ctx = ctx.apply(MonitorEvent::PortLost { port: acm0() });
        assert_eq!(ctx.current_attempt_id, None);

        // The late completion of the cancelled attempt is ignored.
        let after = ctx.apply(MonitorEvent::OpenOk {
            port: Some(acm0()),
            attempt_id: Some(cancelled),
        });
        assert_eq!(after, ctx);
    }

    #[test]
    fn stale_open_ok_is_ignored() {
        let ctx = running_on_acm0();
        let current = ctx.current_attempt_id.unwrap();
        let after = ctx.apply(MonitorEvent::OpenOk {
            port: Some(acm0()),
            attempt_id: Some(current + 7),
        });
        assert_eq!(after, ctx);
    }

    #[test]
    fn open_ok_for_other_port_is_ignored() {
        let ctx = running_on_acm0();
        let after = ctx.apply(MonitorEvent::OpenOk {
            port: Some(PortIdentifier::serial("/dev/ttyUSB0")),
            attempt_id: ctx.current_attempt_id,
        });
        assert_eq!(after, ctx);
    }

    #[test]
    fn stop_during_open_lands_in_paused() {
        let ctx = running_on_acm0();
        let id = ctx.current_attempt_id;
        let ctx = ctx.apply(MonitorEvent::UserStop);
        assert_eq!(
            ctx.logical,
            LogicalState::Paused {
                port: acm0(),
                reason: PauseReason::User
            }
        );
        // The cancelled attempt cannot resurrect the stream.
        let after = ctx.apply(MonitorEvent::OpenOk {
            port: Some(acm0()),
            attempt_id: id,
        });
        assert_eq!(after, ctx);
    }

    #[test]
    fn open_ok_while_stopped_pauses() {
        let ctx = MonitorContext::new()
            .apply(MonitorEvent::PortSelected {
                port: Some(acm0()),
                detected: true,
            })
            .apply(MonitorEvent::OpenRequested {
                port: None,
                attempt_id: None,
            });
        assert!(ctx.is_connecting());
        let ctx = ctx.apply(MonitorEvent::OpenOk {
            port: None,
            attempt_id: Some(1),
        });
        assert_eq!(
            ctx.logical,
            LogicalState::Paused {
                port: acm0(),
                reason: PauseReason::User
            }
        );
    }

    #[test]
    fn open_fail_is_resumable_when_running() {
        let ctx = running_on_acm0();
        let ctx = ctx.apply(MonitorEvent::OpenFail {
            port: Some(acm0()),
            attempt_id: ctx.current_attempt_id,
            error: MonitorError::PortBusy,
        });
        assert_eq!(
            ctx.logical,
            LogicalState::Error {
                port: Some(acm0()),
                error: MonitorError::PortBusy,
                resumable: true
            }
        );
        // Starting again clears the error and retries with a fresh attempt.
        let ctx = ctx.apply(MonitorEvent::UserStart);
        assert!(ctx.is_connecting());
        assert_eq!(ctx.current_attempt_id, Some(2));
    }

    #[test]
    fn second_open_request_is_rejected_while_in_flight() {
        let ctx = running_on_acm0();
        let after = ctx.apply(MonitorEvent::OpenRequested {
            port: None,
            attempt_id: Some(99),
        });
        assert_eq!(after, ctx);
    }

    #[test]
    fn explicit_attempt_ids_must_increase() {
        let ctx = MonitorContext::new()
            .apply(MonitorEvent::PortSelected {
                port: Some(acm0()),
                detected: true,
            })
            .apply(MonitorEvent::OpenRequested {
                port: None,
                attempt_id: Some(5),
            })
            .apply(MonitorEvent::OpenOk {
                port: None,
                attempt_id: Some(5),
            });
        assert_eq!(ctx.last_completed_attempt_id, Some(5));
        let after = ctx.apply(MonitorEvent::OpenRequested {
            port: None,
            attempt_id: Some(3),
        });
        assert_eq!(after, ctx);
    }

    #[test]
    fn stream_closed_while_running_waits_for_port() {
        let ctx = running_on_acm0();
        let id = ctx.current_attempt_id;
        let ctx = ctx.apply(MonitorEvent::OpenOk {
            port: None,
            attempt_id: id,
        });
        let ctx = ctx.apply(MonitorEvent::StreamClosed {
            port: Some(acm0()),
            attempt_id: id,
        });
        assert_eq!(
            ctx.logical,
            LogicalState::WaitingForPort {
                reason: WaitingReason::PortTemporarilyMissing
            }
        );
    }

    #[test]
    fn stream_closed_for_old_attempt_is_ignored() {
        let ctx = running_on_acm0();
        let id = ctx.current_attempt_id.unwrap();
        let ctx = ctx.apply(MonitorEvent::OpenOk {
            port: None,
            attempt_id: Some(id),
        });
        let after = ctx.apply(MonitorEvent::StreamClosed {
            port: None,
            attempt_id: Some(id - 1),
        });
        assert_eq!(after, ctx);
    }

    #[test]
    fn bridge_disconnect_is_always_resumable_error() {
        let ctx = running_on_acm0().apply(MonitorEvent::BridgeDisconnected);
        assert_eq!(
            ctx.logical,
            LogicalState::Error {
                port: Some(acm0()),
                error: MonitorError::BridgeDisconnected,
                resumable: true
            }
        );
        assert_eq!(ctx.current_attempt_id, None);
    }

    #[test]
    fn stop_is_idempotent() {
        let once = running_on_acm0().apply(MonitorEvent::UserStop);
        let twice = once.apply(MonitorEvent::UserStop);
        assert_eq!(once, twice);
    }

    #[test]
    fn selecting_a_port_while_stopped_pauses_on_it() {
        let ctx = MonitorContext::new().apply(MonitorEvent::PortSelected {
            port: Some(acm0()),
            detected: true,
        });
        assert_eq!(
            ctx.logical,
            LogicalState::Paused {
                port: acm0(),
                reason: PauseReason::User
            }
        );
        assert_eq!(ctx.current_attempt_id, None);

        // Same resting state as stopping with that port selected.
        let stopped = running_on_acm0().apply(MonitorEvent::UserStop);
        assert_eq!(stopped.logical, ctx.logical);

        let cleared = ctx.apply(MonitorEvent::PortSelected {
            port: None,
            detected: false,
        });
        assert_eq!(cleared.logical, LogicalState::Idle);
    }

    #[test]
    fn stop_without_port_is_idle() {
        let ctx = MonitorContext::new()
            .apply(MonitorEvent::UserStart)
            .apply(MonitorEvent::UserStop);
        assert_eq!(ctx.logical, LogicalState::Idle);
    }

    #[test]
    fn detection_of_unselected_port_is_ignored() {
        let ctx = running_on_acm0();
        let after = ctx.apply(MonitorEvent::PortLost {
            port: PortIdentifier::serial("/dev/ttyUSB3"),
        });
        assert_eq!(after, ctx);
    }

    #[test]
    fn migration_keeps_active_phase() {
        let ctx = running_on_acm0();
        let ctx = ctx.apply(MonitorEvent::OpenOk {
            port: None,
            attempt_id: ctx.current_attempt_id,
        });
        let acm1 = PortIdentifier::serial("/dev/ttyACM1");
        let ctx = ctx.apply(MonitorEvent::PortMigrated {
            from: acm0(),
            to: acm1.clone(),
        });
        assert_eq!(ctx.logical, LogicalState::Active { port: acm1.clone() });
        assert_eq!(ctx.selected_port, Some(acm1));
    }

    #[test]
    fn dispose_is_terminal() {
        let ctx = running_on_acm0().apply(MonitorEvent::Dispose);
        assert_eq!(ctx.logical, LogicalState::Closed);
        assert_eq!(ctx.current_attempt_id, None);
        assert_eq!(ctx.apply(MonitorEvent::UserStart), ctx);
    }

    #[test]
    fn logical_state_serde_tag() {
        let json = serde_json::to_value(LogicalState::WaitingForPort {
            reason: WaitingReason::PortTemporarilyMissing,
        })
        .unwrap();
        assert_eq!(json["type"], "waitingForPort");
        assert_eq!(json["reason"], "port-temporarily-missing");
    }
}
