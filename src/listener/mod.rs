//! Listener Module
//!
//! Multi-port TCP listening for the operator console:
//! - [`PortRegistry`]: add/remove/list ports, one accept loop each
//! - [`SessionFocus`]: the operator's selected (port, connection)
//! - Focus verbs: send, shell, stopshell, upload

mod accept;
mod error;
mod focus;
pub(crate) mod registry;

pub use accept::{ListenerHandle, ListenerStatus};
pub use error::ListenerError;
pub use focus::{SendOutcome, SessionFocus};
pub use registry::{PortRegistry, PortStatus, PortSummary};
