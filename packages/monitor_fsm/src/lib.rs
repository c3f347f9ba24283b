//! Pure state machines and value types for serial monitor sessions.
//!
//! Nothing in this crate performs I/O. It defines:
//!
//! - [`PortIdentifier`] / [`PortKey`] and the [`DetectedPorts`] snapshot
//! - [`MonitorContext`], the client-local logical reducer
//! - [`MonitorSessionState`], the per-port state kept by the session registry
//! - [`MonitorError`], the typed failure taxonomy
//! - [`view::project`], the UI status projection
//!
//! # Example
//!
//! ```
//! use monitor_fsm::{LogicalState, MonitorContext, MonitorEvent, PortIdentifier};
//!
//! let port = PortIdentifier::serial("/dev/ttyACM0");
//! let ctx = MonitorContext::new().replay([
//!     MonitorEvent::UserStart,
//!     MonitorEvent::PortSelected { port: Some(port.clone()), detected: true },
//! ]);
//! assert_eq!(ctx.logical, LogicalState::Connecting { port });
//! ```

pub mod context;
pub mod error;
pub mod port;
pub mod session;
pub mod view;

pub use context::{
    AttemptId, DesiredState, LogicalState, MonitorContext, MonitorEvent, PauseReason,
    WaitingReason,
};
pub use error::{ErrorResponse, MonitorError, RecoveryAction};
pub use port::{DetectedPort, DetectedPorts, PortIdentifier, PortKey};
pub use session::{
    ClientId, MonitorPhysicalState, MonitorSessionState, PhysicalStatus, SessionStatus,
    SessionTransition,
};
pub use view::{MonitorStatus, MonitorView, ViewProjector};
