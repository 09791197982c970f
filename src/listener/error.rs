//! Listener errors

use crate::shell::ShellError;
use crate::transfer::TransferError;

/// Error type for registry and focus operations
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Port {0} is already being listened to")]
    AlreadyListening(u16),

    #[error("Port {0} is not being listened to")]
    NotListening(u16),

    #[error("No active connections for port {0}")]
    NoConnections(u16),

    #[error("Invalid connection ID {id} for port {port} ({count} connections)")]
    InvalidConnectionId { port: u16, id: usize, count: usize },

    #[error("No active connection")]
    NoFocus,

    #[error("Failed to listen on port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shell error: {0}")]
    Shell(#[from] ShellError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
}
