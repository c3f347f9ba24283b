//! UI status projection.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::{LogicalState, MonitorContext, PauseReason, WaitingReason};
use crate::port::{DetectedPorts, PortIdentifier};
use crate::session::{MonitorSessionState, SessionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Idle,
    Pending,
    Connected,
    Suspended,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorView {
    pub status: MonitorStatus,
    pub started: bool,
    pub selected_detected: bool,
}

/// Derive the UI status from the registry's session for the selected port.
pub fn project(
    session: Option<&MonitorSessionState>,
    detected: &DetectedPorts,
    selected: Option<&PortIdentifier>,
    started: bool,
) -> MonitorView {
    let selected_detected = selected.is_some_and(|port| detected.contains_port(port));
    let missing = started && selected.is_some() && !selected_detected;

    let status = match session {
        Some(s) if s.status == SessionStatus::Error => MonitorStatus::Error,
        Some(s) if s.pause_reason == Some(PauseReason::ResourceBusy) => MonitorStatus::Error,
        Some(s) if s.status == SessionStatus::Active => MonitorStatus::Connected,
        Some(s) if s.status == SessionStatus::Connecting => MonitorStatus::Pending,
        Some(s)
            if matches!(
                s.pause_reason,
                Some(PauseReason::Suspend) | Some(PauseReason::ResourceMissing)
            ) =>
        {
            MonitorStatus::Suspended
        }
        _ if missing => MonitorStatus::Suspended,
        Some(s) if s.pause_reason == Some(PauseReason::User) && started => MonitorStatus::Pending,
        _ => MonitorStatus::Idle,
    };

    MonitorView {
        status,
        started,
        selected_detected,
    }
}

/// The same table, read from a client-local logical context.
pub fn project_logical(ctx: &MonitorContext) -> MonitorView {
    let started = ctx.desired.is_running();
    let status = match &ctx.logical {
        LogicalState::Idle | LogicalState::Closed => MonitorStatus::Idle,
        LogicalState::WaitingForPort {
            reason: WaitingReason::NoPortSelected,
        } => MonitorStatus::Idle,
        LogicalState::WaitingForPort { .. } => MonitorStatus::Suspended,
        LogicalState::Connecting { .. } => MonitorStatus::Pending,
        LogicalState::Active { .. } => MonitorStatus::Connected,
        LogicalState::Paused {
            reason: PauseReason::User,
            ..
        } => {
            if started {
                MonitorStatus::Pending
            } else {
                MonitorStatus::Idle
            }
        }
        LogicalState::Paused {
            reason: PauseReason::ResourceBusy,
            ..
        } => MonitorStatus::Error,
        LogicalState::Paused { .. } => MonitorStatus::Suspended,
        LogicalState::Error { .. } => MonitorStatus::Error,
    };
    MonitorView {
        status,
        started,
        selected_detected: ctx.selected_detected,
    }
}

/// Memoizing wrapper: equal projections return the same allocation.
#[derive(Debug, Default)]
pub struct ViewProjector {
    last: Option<Arc<MonitorView>>,
}

impl ViewProjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(
        &mut self,
        session: Option<&MonitorSessionState>,
        detected: &DetectedPorts,
        selected: Option<&PortIdentifier>,
        started: bool,
    ) -> Arc<MonitorView> {
        self.remember(project(session, detected, selected, started))
    }

    pub fn project_logical(&mut self, ctx: &MonitorContext) -> Arc<MonitorView> {
        self.remember(project_logical(ctx))
    }

    fn remember(&mut self, view: MonitorView) -> Arc<MonitorView> {
        match &self.last {
            Some(last) if **last == view => last.clone(),
            _ => {
                let view = Arc::new(view);
                self.last = Some(view.clone());
                view
            }
        }
    }
}
