//! Shell bridge
//!
//! [`ShellBridge`] owns one running interpreter behind a [`ShellBackend`] and
//! turns a submitted command into scrubbed output. Output is drained by
//! readiness: after a short settle delay the bridge keeps reading until the
//! shell has been quiet for `quiet` or the drain window closes. Slow output
//! that misses the window shows up with the next command.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::pipe::PipeShell;
use super::pty::PtyShell;
use super::scrub::{scrub, strip_command_echo};
use super::types::{Platform, ShellChunk, ShellError, ShellKind};
use crate::config::ShellConfig;

/// Output chunks queued between a shell's pump and the bridge
pub(crate) const OUTPUT_QUEUE_DEPTH: usize = 256;

/// Most output bytes collected for a single command
const MAX_DRAIN_BYTES: usize = 1024 * 1024;

/// Process side of a shell bridge
#[async_trait]
pub(crate) trait ShellBackend: Send {
    /// Write raw bytes to the interpreter's input
    async fn write_input(&mut self, data: &[u8]) -> Result<(), ShellError>;

    /// Terminate the interpreter and release its descriptors
    async fn terminate(&mut self, grace: Duration) -> Result<(), ShellError>;

    fn pid(&self) -> Option<u32>;
}

/// Result of one command submission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    /// The command as written, without its newline
    pub command: String,
    pub stdout: String,
    pub stderr: String,
}

/// A running interactive shell
pub struct ShellBridge {
    kind: ShellKind,
    label: String,
    backend: Box<dyn ShellBackend>,
    output: mpsc::Receiver<ShellChunk>,
    settle: Duration,
    quiet: Duration,
    window: Duration,
    grace: Duration,
    exited: bool,
}

impl ShellBridge {
    /// Start the interpreter that serves `platform`.
    ///
    /// Whatever the shell prints on startup (prompt, banners) is discarded.
    pub async fn start(platform: Platform, config: &ShellConfig) -> Result<Self, ShellError> {
        let kind = platform.shell_kind();
        let (backend, output, label) = match kind {
            ShellKind::Pty => {
                let (shell, rx) = PtyShell::spawn(&config.pty, config.read_chunk)?;
                (Box::new(shell) as Box<dyn ShellBackend>, rx, config.pty.label())
            }
            ShellKind::Pipe => {
                let (shell, rx) = PipeShell::spawn(&config.pipe, config.read_chunk)?;
                (Box::new(shell) as Box<dyn ShellBackend>, rx, config.pipe.label())
            }
        };

        let mut bridge = Self {
            kind,
            label,
            backend,
            output,
            settle: config.settle(),
            quiet: config.quiet(),
            window: config.drain_window(),
            grace: config.terminate_timeout(),
            exited: false,
        };

        tokio::time::sleep(bridge.settle).await;
        bridge.discard_pending();

        tracing::info!(
            "Shell bridge started: {} ({:?}, pid {:?})",
            bridge.label,
            bridge.kind,
            bridge.backend.pid()
        );
        Ok(bridge)
    }

    pub fn kind(&self) -> ShellKind {
        self.kind
    }

    /// Program name shown in the startup banner
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the interpreter's output streams have closed
    pub fn is_exited(&self) -> bool {
        self.exited
    }

    /// Submit one command and collect what it prints.
    ///
    /// A trailing newline is added when missing. On a PTY the terminal's
    /// echo of the command is removed from stdout.
    pub async fn submit(&mut self, data: &[u8]) -> Result<ShellOutput, ShellError> {
        if self.exited {
            return Err(ShellError::Exited);
        }

        let mut input = data.to_vec();
        if !input.ends_with(b"\n") {
            input.push(b'\n');
        }
        let command = String::from_utf8_lossy(&input).trim().to_string();

        self.backend.write_input(&input).await?;
        tokio::time::sleep(self.settle).await;

        let (stdout, stderr) = self.drain().await;
        let stdout = match self.kind {
            ShellKind::Pty => strip_command_echo(&scrub(&stdout), &command),
            ShellKind::Pipe => scrub(&stdout),
        };
        let stderr = scrub(&stderr);

        tracing::debug!(
            "Shell command {:?}: {} bytes out, {} bytes err",
            command,
            stdout.len(),
            stderr.len()
        );

        Ok(ShellOutput {
            command,
            stdout,
            stderr,
        })
    }

    /// Terminate the interpreter
    pub async fn stop(mut self) -> Result<(), ShellError> {
        tracing::info!("Stopping shell bridge: {}", self.label);
        self.backend.terminate(self.grace).await
    }

    /// Read until the shell goes quiet, the window closes or
    /// `MAX_DRAIN_BYTES` have been collected
    async fn drain(&mut self) -> (Vec<u8>, Vec<u8>) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let deadline = Instant::now() + self.window;

        loop {
            if stdout.len() + stderr.len() >= MAX_DRAIN_BYTES {
                tracing::debug!(
                    "Shell drain reached {} bytes, leaving the rest queued",
                    MAX_DRAIN_BYTES
                );
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::debug!("Shell drain window closed with output pending");
                break;
            }

            match tokio::time::timeout(self.quiet.min(remaining), self.output.recv()).await {
                Ok(Some(ShellChunk::Stdout(bytes))) => stdout.extend_from_slice(&bytes),
                Ok(Some(ShellChunk::Stderr(bytes))) => stderr.extend_from_slice(&bytes),
                Ok(None) => {
                    tracing::info!("Shell output closed, interpreter exited");
                    self.exited = true;
                    break;
                }
                Err(_) => break,
            }
        }

        (stdout, stderr)
    }

    fn discard_pending(&mut self) {
        loop {
            match self.output.try_recv() {
                Ok(_) => continue,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.exited = true;
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for ShellBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellBridge")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("pid", &self.backend.pid())
            .field("exited", &self.exited)
            .finish()
    }
}
