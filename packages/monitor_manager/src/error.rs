use monitor_fsm::{MonitorError, PortKey};

/// Runtime plumbing failures. Anything that reaches a client is converted
/// into the typed [`MonitorError`] taxonomy first.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("{0} is gone")]
    ActorGone(&'static str),

    #[error("{0} didn't respond")]
    NoResponse(&'static str),

    #[error("request cancelled")]
    Cancelled,

    #[error("no session for {0}")]
    NoSession(PortKey),

    #[error("invalid bridge url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

impl From<ManagerError> for MonitorError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::Monitor(err) => err,
            ManagerError::ActorGone(_) | ManagerError::NoResponse(_) => {
                MonitorError::BridgeDisconnected
            }
            other => MonitorError::internal(other.to_string()),
        }
    }
}
