//! Session Focus
//!
//! The operator addresses one connection at a time. Focus is stored as a
//! (port, peer address) key and re-resolved against the live connection set
//! on every use, so a connection torn down in the meantime turns into a
//! `NoFocus` error instead of a dangling reference.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use super::error::ListenerError;
use super::registry::PortRegistry;
use crate::events::OperatorEvent;
use crate::session::{Connection, ConnectionInfo, ConnectionSets};
use crate::shell::Platform;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFocus {
    port: Option<u16>,
    peer: Option<SocketAddr>,
}

impl SessionFocus {
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Focused connection's peer address; `None` once it has closed
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is(&self, port: u16, peer: SocketAddr) -> bool {
        self.port == Some(port) && self.peer == Some(peer)
    }

    pub(crate) fn set(&mut self, port: u16, peer: SocketAddr) {
        self.port = Some(port);
        self.peer = Some(peer);
    }

    /// Forget the connection, keep the port
    pub(crate) fn clear_connection(&mut self) {
        self.peer = None;
    }

    pub(crate) fn resolve(&self, sets: &ConnectionSets) -> Option<Arc<Connection>> {
        let (port, peer) = (self.port?, self.peer?);
        sets.find(port, peer).map(|(_, conn)| conn)
    }
}

/// What `send_message_to_current` did with the text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the peer as a plain message
    Sent,
    /// Submitted to the connection's shell
    ShellCommand,
}

impl PortRegistry {
    /// Focus connection `id` of `port` (the first one when `id` is `None`)
    /// and replay its buffered messages in receipt order.
    pub fn switch_session(
        &self,
        port: u16,
        id: Option<usize>,
    ) -> Result<ConnectionInfo, ListenerError> {
        let mut state = self.shared.state.lock();
        if !state.listeners.contains_key(&port) {
            return Err(ListenerError::NotListening(port));
        }

        let count = state.connections.count(port);
        if count == 0 {
            return Err(ListenerError::NoConnections(port));
        }

        let id = id.unwrap_or(0);
        let conn = state
            .connections
            .nth(port, id)
            .ok_or(ListenerError::InvalidConnectionId { port, id, count })?;

        let peer = conn.peer();
        state.focus.set(port, peer);
        info!("Focus switched to {} (port {}, id {})", peer, port, id);

        // Replay under the lock so no live message slips in between
        let sink = &self.shared.sink;
        sink.emit(OperatorEvent::FocusChanged { port, peer });
        for text in conn.buffered() {
            sink.emit(OperatorEvent::Message {
                port,
                peer,
                text,
                replayed: true,
            });
        }

        Ok(conn.info(id, true))
    }

    pub fn focus(&self) -> SessionFocus {
        self.shared.state.lock().focus
    }

    /// The focused connection, if it is still alive
    pub fn current(&self) -> Option<Arc<Connection>> {
        let state = self.shared.state.lock();
        state.focus.resolve(&state.connections)
    }

    fn require_current(&self) -> Result<Arc<Connection>, ListenerError> {
        self.current().ok_or(ListenerError::NoFocus)
    }

    /// Send `text` to the focused connection, or to its shell when one runs
    pub async fn send_message_to_current(&self, text: &str) -> Result<SendOutcome, ListenerError> {
        let conn = self.require_current()?;

        if conn.in_shell_mode() {
            conn.shell_command(text.as_bytes(), false).await?;
            return Ok(SendOutcome::ShellCommand);
        }

        conn.send(text.as_bytes()).await?;
        Ok(SendOutcome::Sent)
    }

    /// Start a shell on the focused connection. `platform` overrides its
    /// classification first.
    pub async fn start_shell_for_current(
        &self,
        platform: Option<Platform>,
    ) -> Result<(), ListenerError> {
        let conn = self.require_current()?;
        if let Some(platform) = platform {
            conn.set_platform(platform);
        }
        conn.start_shell(&self.shared.config.shell).await?;
        Ok(())
    }

    pub async fn stop_shell_for_current(&self) -> Result<(), ListenerError> {
        let conn = self.require_current()?;
        conn.stop_shell().await?;
        Ok(())
    }

    /// Upload a local file to the focused connection
    pub async fn send_file_to_current(&self, path: &Path) -> Result<String, ListenerError> {
        let conn = self.require_current()?;
        Ok(conn.send_file(path).await?)
    }
}
