//! PTY-backed shell
//!
//! Wraps portable-pty: the shell runs on a freshly allocated pseudo-terminal
//! as the leader of its own session and process group, with a minimal
//! environment. A blocking read pump forwards terminal output into the
//! bridge's channel.

use std::io::{Read, Write};

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use super::bridge::{ShellBackend, OUTPUT_QUEUE_DEPTH};
use super::types::{ShellChunk, ShellError};
use crate::config::ShellProgram;

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Prompt handed to the shell; simple enough for the scrubber to remove
const SHELL_PROMPT: &str = "$ ";
const TERM_TYPE: &str = "xterm-256color";

pub(crate) struct PtyShell {
    /// Dropping the master releases the terminal descriptors
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
}

impl PtyShell {
    /// Spawn `program` on a new PTY and start the read pump
    pub(crate) fn spawn(
        program: &ShellProgram,
        read_chunk: usize,
    ) -> Result<(Self, mpsc::Receiver<ShellChunk>), ShellError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ShellError::CreateFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&program.path);
        for arg in &program.args {
            cmd.arg(arg);
        }

        // Minimal environment: only what an interactive shell needs
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        if let Ok(home) = std::env::var("HOME") {
            cmd.cwd(&home);
            cmd.env("HOME", home);
        }
        cmd.env("TERM", TERM_TYPE);
        cmd.env("PS1", SHELL_PROMPT);

        tracing::info!("Spawning PTY shell: {:?}", program.path);

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            tracing::error!("Failed to spawn PTY shell: {}", e);
            ShellError::SpawnFailed(e.to_string())
        })?;
        // The child holds its own copy of the slave side
        drop(pair.slave);

        tracing::info!("PTY shell spawned, PID: {:?}", child.process_id());

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ShellError::PtySystemError(format!("Failed to clone reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ShellError::PtySystemError(format!("Failed to take writer: {}", e)))?;

        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
        let chunk_size = read_chunk.max(1);
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; chunk_size];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        tracing::debug!("PTY read pump: EOF");
                        break;
                    }
                    Ok(n) => {
                        // Blocks while the queue is full; the PTY then fills and
                        // stalls the shell
                        if tx.blocking_send(ShellChunk::Stdout(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO once the last slave descriptor is closed
                        tracing::debug!("PTY read pump exited: {}", e);
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                master: Some(pair.master),
                writer: Some(writer),
                child: Some(child),
            },
            rx,
        ))
    }
}

#[async_trait]
impl ShellBackend for PtyShell {
    async fn write_input(&mut self, data: &[u8]) -> Result<(), ShellError> {
        let writer = self.writer.as_mut().ok_or(ShellError::NotRunning)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    async fn terminate(&mut self, grace: std::time::Duration) -> Result<(), ShellError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        #[cfg(unix)]
        let result = match child.process_id() {
            Some(pid) => {
                // The shell is a session leader, so its PID is also its PGID
                let pgid = Pid::from_raw(pid as i32);
                if let Err(e) = killpg(pgid, Signal::SIGTERM) {
                    tracing::warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
                }
                // Interactive shells ignore SIGTERM
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                    tracing::debug!("SIGKILL to process group {} (may have already exited): {}", pid, e);
                }
                Ok(())
            }
            None => child
                .kill()
                .map_err(|e| ShellError::PtySystemError(e.to_string())),
        };

        #[cfg(not(unix))]
        let result = child
            .kill()
            .map_err(|e| ShellError::PtySystemError(e.to_string()));

        // Release the PTY descriptors; the read pump sees EOF/EIO and exits
        self.writer = None;
        self.master = None;

        // Reap the child off the async thread
        let reap = tokio::task::spawn_blocking(move || child.wait());
        if tokio::time::timeout(grace, reap).await.is_err() {
            tracing::warn!("PTY shell did not exit within {:?}", grace);
        }

        result
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.process_id())
    }
}

impl Drop for PtyShell {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        tracing::debug!("Dropping PTY shell, killing process group");

        #[cfg(unix)]
        if let Some(pid) = child.process_id() {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            return;
        }

        let _ = child.kill();
    }
}
