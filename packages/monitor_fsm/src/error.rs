//! Typed monitor failures and the recovery each one implies.

use serde::{Deserialize, Serialize};

/// What a client should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Someone else is already servicing the stream; treat as attached.
    Attach,
    /// Retry once the transport to the bridge is back.
    Reconnect,
    /// Wait for the user to free the port and press play again.
    WaitForUser,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum MonitorError {
    #[error("monitor is already attached")]
    AlreadyAttached,

    #[error("port is busy")]
    PortBusy,

    #[error("bridge disconnected")]
    BridgeDisconnected,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl MonitorError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            Self::AlreadyAttached => "already_attached",
            Self::PortBusy => "port_busy",
            Self::BridgeDisconnected => "bridge_disconnected",
            Self::Internal { .. } => "internal",
        }
    }

    pub fn recovery(&self) -> RecoveryAction {
        match self {
            Self::AlreadyAttached => RecoveryAction::Attach,
            Self::PortBusy => RecoveryAction::WaitForUser,
            Self::BridgeDisconnected => RecoveryAction::Reconnect,
            Self::Internal { .. } => RecoveryAction::None,
        }
    }

    /// Race-absorbing errors that must never reach the user.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::AlreadyAttached)
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Internal { .. })
    }

    pub fn disables_auto_play(&self) -> bool {
        matches!(self, Self::PortBusy)
    }

    /// Classify a bridge HTTP response.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            409 => Self::AlreadyAttached,
            423 => Self::PortBusy,
            502..=504 => Self::BridgeDisconnected,
            _ => {
                let body = body.trim();
                if body.is_empty() {
                    Self::internal(format!("bridge responded with status {status}"))
                } else {
                    Self::internal(format!("bridge responded with status {status}: {body}"))
                }
            }
        }
    }

    /// Classify an error code string received in a control frame.
    pub fn from_code(code: &str, message: Option<&str>) -> Self {
        match code {
            "already_attached" => Self::AlreadyAttached,
            "port_busy" => Self::PortBusy,
            "bridge_disconnected" => Self::BridgeDisconnected,
            _ => Self::internal(message.unwrap_or(code)),
        }
    }

    /// Short text for display; never the raw transport message.
    pub fn user_message(&self) -> &str {
        match self {
            Self::AlreadyAttached => "Monitor already running",
            Self::PortBusy => "Port is busy",
            Self::BridgeDisconnected => "Connection to the monitor bridge was lost",
            Self::Internal { .. } => "Monitor failed",
        }
    }
}

/// Serializable error record for reporting a failure across the host boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub recovery: RecoveryAction,
}

impl From<&MonitorError> for ErrorResponse {
    fn from(err: &MonitorError) -> Self {
        Self {
            error: err.error_code().to_string(),
            message: err.to_string(),
            recovery: err.recovery(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(MonitorError::AlreadyAttached.error_code(), "already_attached");
        assert_eq!(MonitorError::PortBusy.error_code(), "port_busy");
        assert_eq!(
            MonitorError::internal("boom").error_code(),
            "internal"
        );
    }

    #[test]
    fn status_classification() {
        assert_eq!(MonitorError::from_status(423, ""), MonitorError::PortBusy);
        assert_eq!(
            MonitorError::from_status(409, "attached"),
            MonitorError::AlreadyAttached
        );
        assert_eq!(
            MonitorError::from_status(502, ""),
            MonitorError::BridgeDisconnected
        );
        assert!(matches!(
            MonitorError::from_status(500, "oops"),
            MonitorError::Internal { message } if message.contains("oops")
        ));
    }

    #[test]
    fn code_classification_roundtrips_error_code() {
        for err in [
            MonitorError::AlreadyAttached,
            MonitorError::PortBusy,
            MonitorError::BridgeDisconnected,
        ] {
            assert_eq!(MonitorError::from_code(err.error_code(), None), err);
        }
        assert_eq!(
            MonitorError::from_code("weird", Some("details")),
            MonitorError::internal("details")
        );
    }

    #[test]
    fn recovery_flags() {
        assert!(MonitorError::AlreadyAttached.is_benign());
        assert!(!MonitorError::PortBusy.is_benign());
        assert!(MonitorError::PortBusy.disables_auto_play());
        assert!(MonitorError::BridgeDisconnected.is_recoverable());
        assert!(!MonitorError::internal("x").is_recoverable());
        assert_eq!(
            MonitorError::BridgeDisconnected.recovery(),
            RecoveryAction::Reconnect
        );
    }

    #[test]
    fn serde_is_tagged_by_code() {
        let json = serde_json::to_value(MonitorError::internal("bad")).unwrap();
        assert_eq!(json["code"], "internal");
        assert_eq!(json["message"], "bad");
        let back: MonitorError = serde_json::from_value(json).unwrap();
        assert_eq!(back, MonitorError::internal("bad"));
    }

    #[test]
    fn error_response_from_error() {
        let resp = ErrorResponse::from(&MonitorError::PortBusy);
        assert_eq!(resp.error, "port_busy");
        assert_eq!(resp.recovery, RecoveryAction::WaitForUser);
    }
}
