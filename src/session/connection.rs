//! Connection
//!
//! Per-socket state for one accepted peer. The read half of the socket is
//! owned by the connection's read loop; everything else lives here and is
//! shared with the operator verbs.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio_util::sync::CancellationToken;

use crate::config::ShellConfig;
use crate::events::{OperatorEvent, OperatorSink};
use crate::shell::{Platform, ShellBridge, ShellError};
use crate::transfer::{self, TransferError};

/// Snapshot of a connection for listings
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Position in the port's insertion-ordered connection set
    pub id: usize,
    pub peer: SocketAddr,
    pub port: u16,
    pub connected_at: DateTime<Local>,
    pub connected_for: Duration,
    pub shell_mode: bool,
    pub platform: Platform,
    pub focused: bool,
}

pub struct Connection {
    peer: SocketAddr,
    port: u16,
    connected_at: DateTime<Local>,
    active: AtomicBool,
    shutdown: CancellationToken,
    platform: Mutex<Platform>,
    /// Received messages in receipt order, oldest dropped past `buffer_limit`
    buffer: Mutex<VecDeque<String>>,
    buffer_limit: usize,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// Lock order: `shell` before `writer`
    shell: tokio::sync::Mutex<Option<ShellBridge>>,
    /// Only changed while `shell` is held
    shell_mode: AtomicBool,
    sink: OperatorSink,
}

impl Connection {
    pub fn new(
        peer: SocketAddr,
        port: u16,
        writer: OwnedWriteHalf,
        buffer_limit: usize,
        sink: OperatorSink,
    ) -> Self {
        Self {
            peer,
            port,
            connected_at: Local::now(),
            active: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            platform: Mutex::new(Platform::host()),
            buffer: Mutex::new(VecDeque::new()),
            buffer_limit: buffer_limit.max(1),
            writer: tokio::sync::Mutex::new(writer),
            shell: tokio::sync::Mutex::new(None),
            shell_mode: AtomicBool::new(false),
            sink,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connected_at(&self) -> DateTime<Local> {
        self.connected_at
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Mark the connection inactive and wake its read loop.
    ///
    /// The socket stays open; the read loop closes it on its way out.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn platform(&self) -> Platform {
        *self.platform.lock()
    }

    pub fn set_platform(&self, platform: Platform) {
        *self.platform.lock() = platform;
    }

    pub fn in_shell_mode(&self) -> bool {
        self.shell_mode.load(Ordering::SeqCst)
    }

    /// Append a received message to the replay buffer
    pub fn push_message(&self, text: String) {
        let mut buffer = self.buffer.lock();
        buffer.push_back(text);
        while buffer.len() > self.buffer_limit {
            buffer.pop_front();
        }
    }

    /// Buffered messages in receipt order
    pub fn buffered(&self) -> Vec<String> {
        self.buffer.lock().iter().cloned().collect()
    }

    /// Write raw bytes to the peer
    pub async fn send(&self, data: &[u8]) -> std::io::Result<()> {
        if !self.is_active() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection is closing",
            ));
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await
    }

    /// Send a local file using the transfer framing
    pub async fn send_file(&self, path: &Path) -> Result<String, TransferError> {
        let mut writer = self.writer.lock().await;
        transfer::send_file(&mut *writer, path).await
    }

    /// Start a shell for this connection's platform.
    ///
    /// The startup banner goes to the peer and to the operator.
    pub async fn start_shell(&self, config: &ShellConfig) -> Result<(), ShellError> {
        let mut shell = self.shell.lock().await;
        if shell.is_some() {
            return Err(ShellError::AlreadyRunning);
        }

        let bridge = ShellBridge::start(self.platform(), config).await?;
        let label = bridge.label().to_string();
        *shell = Some(bridge);
        self.shell_mode.store(true, Ordering::SeqCst);

        let banner = format!("Shell started ({}). Type commands directly.\n", label);
        if let Err(e) = self.writer.lock().await.write_all(banner.as_bytes()).await {
            tracing::warn!("Failed to send shell banner to {}: {}", self.peer, e);
        }

        self.sink.emit(OperatorEvent::ShellStarted {
            peer: self.peer,
            shell: label,
        });
        Ok(())
    }

    /// Submit a command to the running shell.
    ///
    /// Output is always emitted to the operator; with `reply_to_peer` it is
    /// also written back to the peer. A failure leaves the shell running.
    pub async fn shell_command(&self, data: &[u8], reply_to_peer: bool) -> Result<(), ShellError> {
        let mut shell = self.shell.lock().await;
        let bridge = shell.as_mut().ok_or(ShellError::NotRunning)?;

        self.sink.emit(OperatorEvent::ShellCommand {
            peer: self.peer,
            command: String::from_utf8_lossy(data).trim().to_string(),
        });

        let output = bridge.submit(data).await?;

        if !output.stdout.is_empty() {
            if reply_to_peer {
                self.reply(&output.stdout).await;
            }
            self.sink.emit(OperatorEvent::ShellOutput {
                peer: self.peer,
                text: output.stdout,
            });
        }
        if !output.stderr.is_empty() {
            if reply_to_peer {
                self.reply(&output.stderr).await;
            }
            self.sink.emit(OperatorEvent::ShellError {
                peer: self.peer,
                text: output.stderr,
            });
        }

        Ok(())
    }

    async fn reply(&self, text: &str) {
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(text.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!("Failed to send shell output to {}: {}", self.peer, e);
        }
    }

    /// Stop the shell. Shell mode is cleared even when termination fails.
    pub async fn stop_shell(&self) -> Result<(), ShellError> {
        let bridge = {
            let mut shell = self.shell.lock().await;
            self.shell_mode.store(false, Ordering::SeqCst);
            shell.take()
        };
        let bridge = bridge.ok_or(ShellError::NotRunning)?;

        let result = bridge.stop().await;
        self.sink.emit(OperatorEvent::ShellStopped { peer: self.peer });
        result
    }

    /// Shut down the write half
    pub async fn close(&self) {
        if let Err(e) = self.writer.lock().await.shutdown().await {
            tracing::debug!("Shutdown of {} failed: {}", self.peer, e);
        }
    }

    pub fn info(&self, id: usize, focused: bool) -> ConnectionInfo {
        ConnectionInfo {
            id,
            peer: self.peer,
            port: self.port,
            connected_at: self.connected_at,
            connected_for: (Local::now() - self.connected_at)
                .to_std()
                .unwrap_or_default(),
            shell_mode: self.in_shell_mode(),
            platform: self.platform(),
            focused,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("port", &self.port)
            .field("active", &self.is_active())
            .field("shell_mode", &self.in_shell_mode())
            .finish()
    }
}

/// Connected loopback pair for tests: the connection and the peer's socket
#[cfg(test)]
pub(crate) async fn test_pair(
    port: u16,
    buffer_limit: usize,
    sink: OperatorSink,
) -> (std::sync::Arc<Connection>, tokio::net::TcpStream) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer = tokio::net::TcpStream::connect(listener.local_addr().unwrap())
        .await
        .unwrap();
    let (stream, addr) = listener.accept().await.unwrap();
    let (_read, write) = stream.into_split();
    let conn = Connection::new(addr, port, write, buffer_limit, sink);
    (std::sync::Arc::new(conn), peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_buffer_drops_oldest() {
        let (conn, _peer) = test_pair(9000, 2, OperatorSink::noop()).await;
        conn.push_message("a".into());
        conn.push_message("b".into());
        conn.push_message("c".into());
        assert_eq!(conn.buffered(), vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (conn, mut peer) = test_pair(9000, 10, OperatorSink::noop()).await;
        conn.send(b"world").await.unwrap();

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn test_send_after_deactivate_fails() {
        let (conn, _peer) = test_pair(9000, 10, OperatorSink::noop()).await;
        conn.deactivate();
        assert!(!conn.is_active());
        assert!(conn.shutdown_token().is_cancelled());
        assert!(conn.send(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_send_file_framing() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("hi.txt");
        tokio::fs::write(&path, b"hi").await.unwrap();

        let (conn, mut peer) = test_pair(9000, 10, OperatorSink::noop()).await;
        conn.send_file(&path).await.unwrap();
        conn.close().await;

        let mut wire = String::new();
        peer.read_to_string(&mut wire).await.unwrap();
        assert_eq!(wire, "FILE_TRANSFER:hi.txt:4\naGk=");
    }

    #[tokio::test]
    async fn test_stop_shell_without_shell() {
        let (conn, _peer) = test_pair(9000, 10, OperatorSink::noop()).await;
        assert!(matches!(conn.stop_shell().await, Err(ShellError::NotRunning)));
        assert!(!conn.in_shell_mode());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_mode_tracks_bridge() {
        let (sink, mut events) = OperatorSink::channel();
        let (conn, mut peer) = test_pair(9000, 10, sink).await;
        conn.set_platform(Platform::Windows);
        let config = ShellConfig {
            quiet_ms: 500,
            ..ShellConfig::default()
        };

        conn.start_shell(&config).await.unwrap();
        assert!(conn.in_shell_mode());
        assert!(matches!(
            conn.start_shell(&config).await,
            Err(ShellError::AlreadyRunning)
        ));

        conn.shell_command(b"echo hi\n", true).await.unwrap();

        conn.stop_shell().await.unwrap();
        assert!(!conn.in_shell_mode());
        conn.close().await;

        let mut wire = String::new();
        peer.read_to_string(&mut wire).await.unwrap();
        assert!(wire.starts_with("Shell started (/bin/sh)"));
        assert!(wire.ends_with("hi\n"));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&OperatorEvent::ShellOutput {
            peer: conn.peer(),
            text: "hi".into()
        }));
        assert_eq!(
            seen.last(),
            Some(&OperatorEvent::ShellStopped { peer: conn.peer() })
        );
    }
}
