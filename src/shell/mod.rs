//! Shell bridge module
//!
//! Starts an interactive command interpreter for a connection and bridges
//! commands into it and scrubbed output back out. Two backends sit behind
//! one interface: a pseudo-terminal backed shell for unix connections and a
//! piped subprocess for windows connections.

mod bridge;
mod pipe;
mod pty;
pub mod scrub;
mod types;

pub use bridge::{ShellBridge, ShellOutput};
pub use scrub::{scrub, strip_command_echo};
pub use types::{Platform, ShellError, ShellKind};
