//! Operator Event System
//!
//! The core never prints. Everything the operator should see (live messages,
//! buffer replays, shell output, lifecycle notices) is emitted as an
//! [`OperatorEvent`] through an [`OperatorSink`]. The console renders them.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::sync::mpsc;

/// Event types emitted to the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorEvent {
    /// A listener was bound and its accept loop started
    ListenerStarted { port: u16 },
    /// A listener was removed by request
    ListenerStopped { port: u16 },
    /// A listener gave up after repeated accept failures
    ListenerFailed { port: u16, error: String },
    /// A peer connected
    ConnectionOpened { port: u16, peer: SocketAddr },
    /// A peer's read loop ended and it left the connection set
    ConnectionClosed { port: u16, peer: SocketAddr },
    /// Text received from a peer. `replayed` is set when it comes from the
    /// buffer on a focus switch rather than from the live read loop.
    Message {
        port: u16,
        peer: SocketAddr,
        text: String,
        replayed: bool,
    },
    /// A chunk that was not valid UTF-8 was dropped
    BinarySkipped {
        port: u16,
        peer: SocketAddr,
        bytes: usize,
    },
    /// Focus moved to a connection
    FocusChanged { port: u16, peer: SocketAddr },
    /// The focused connection went away
    FocusLost { port: u16, peer: SocketAddr },
    ShellStarted { peer: SocketAddr, shell: String },
    /// Local echo of a command submitted to the shell
    ShellCommand { peer: SocketAddr, command: String },
    ShellOutput { peer: SocketAddr, text: String },
    ShellError { peer: SocketAddr, text: String },
    ShellStopped { peer: SocketAddr },
    FileReceived { peer: SocketAddr, path: PathBuf },
    FileReceiveFailed { peer: SocketAddr, error: String },
}

impl fmt::Display for OperatorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListenerStarted { port } => write!(f, "Started listening on port {}", port),
            Self::ListenerStopped { port } => write!(f, "Stopped listening on port {}", port),
            Self::ListenerFailed { port, error } => {
                write!(f, "Error listening on port {}: {}", port, error)
            }
            Self::ConnectionOpened { port, peer } => {
                write!(f, "Connection received: {} (Port: {})", peer, port)
            }
            Self::ConnectionClosed { port, peer } => {
                write!(f, "Connection closed: {} (Port: {})", peer, port)
            }
            Self::Message { peer, text, .. } => write!(f, "{}: {}", peer, text.trim_end()),
            Self::BinarySkipped { peer, bytes, .. } => {
                write!(f, "Binary data received and skipped: {} ({} bytes)", peer, bytes)
            }
            Self::FocusChanged { peer, .. } => write!(f, "Switched to connection: {}", peer),
            Self::FocusLost { peer, .. } => write!(f, "Focused connection {} closed", peer),
            Self::ShellStarted { shell, .. } => {
                write!(f, "Shell started ({}). Type commands directly.", shell)
            }
            Self::ShellCommand { command, .. } => write!(f, "$ {}", command),
            Self::ShellOutput { text, .. } => write!(f, "{}", text),
            Self::ShellError { text, .. } => write!(f, "{}", text),
            Self::ShellStopped { .. } => write!(f, "Shell stopped. Returning to message mode."),
            Self::FileReceived { peer, path } => {
                write!(f, "File from {} saved to {}", peer, path.display())
            }
            Self::FileReceiveFailed { peer, error } => {
                write!(f, "File transfer from {} failed: {}", peer, error)
            }
        }
    }
}

/// Event emitter handed to every task of the core.
///
/// Wraps an optional channel sender; [`OperatorSink::noop`] drops events,
/// which is what most tests want.
#[derive(Clone, Default)]
pub struct OperatorSink {
    tx: Option<mpsc::UnboundedSender<OperatorEvent>>,
}

impl OperatorSink {
    /// Create a sink and the receiver the console drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OperatorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Create a no-op sink
    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// Emit an event
    pub fn emit(&self, event: OperatorEvent) {
        tracing::trace!(?event, "operator event");
        if let Some(ref tx) = self.tx {
            if tx.send(event).is_err() {
                tracing::debug!("Operator event receiver dropped");
            }
        }
    }
}
