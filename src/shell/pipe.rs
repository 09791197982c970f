//! Piped subprocess shell
//!
//! Used for windows connections: the interpreter runs with stdin, stdout and
//! stderr as pipes and no console window. Output from both streams is pumped
//! into the bridge's channel, tagged by stream.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

use super::bridge::{ShellBackend, OUTPUT_QUEUE_DEPTH};
use super::types::{ShellChunk, ShellError};
use crate::config::ShellProgram;

#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// CREATE_NO_WINDOW
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

pub(crate) struct PipeShell {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl PipeShell {
    /// Spawn `program` with piped stdio and start one pump per output stream
    pub(crate) fn spawn(
        program: &ShellProgram,
        read_chunk: usize,
    ) -> Result<(Self, mpsc::Receiver<ShellChunk>), ShellError> {
        let mut cmd = Command::new(&program.path);
        cmd.args(&program.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        tracing::info!("Spawning piped shell: {:?}", program.path);

        let mut child = cmd.spawn().map_err(|e| {
            tracing::error!("Failed to spawn piped shell: {}", e);
            ShellError::SpawnFailed(e.to_string())
        })?;

        tracing::info!("Piped shell spawned, PID: {:?}", child.id());

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ShellError::SpawnFailed("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ShellError::SpawnFailed("stderr not captured".into()))?;

        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
        let chunk_size = read_chunk.max(1);
        tokio::spawn(pump(stdout, tx.clone(), chunk_size, ShellChunk::Stdout));
        tokio::spawn(pump(stderr, tx, chunk_size, ShellChunk::Stderr));

        Ok((
            Self {
                child: Some(child),
                stdin,
            },
            rx,
        ))
    }
}

/// Forward one output stream until EOF or until the bridge goes away
async fn pump<R>(
    mut stream: R,
    tx: mpsc::Sender<ShellChunk>,
    chunk_size: usize,
    wrap: fn(Vec<u8>) -> ShellChunk,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Shell output pump exited: {}", e);
                break;
            }
        }
    }
}

#[async_trait]
impl ShellBackend for PipeShell {
    async fn write_input(&mut self, data: &[u8]) -> Result<(), ShellError> {
        let stdin = self.stdin.as_mut().ok_or(ShellError::NotRunning)?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn terminate(&mut self, grace: Duration) -> Result<(), ShellError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        // Closing stdin alone ends most interpreters
        self.stdin = None;

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!("SIGTERM to shell {} failed: {}", pid, e);
            }
        }

        #[cfg(not(unix))]
        if let Err(e) = child.start_kill() {
            tracing::debug!("Failed to signal shell: {}", e);
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("Piped shell exited: {}", status);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::warn!("Piped shell did not exit within {:?}, killing", grace);
                child.kill().await?;
                Ok(())
            }
        }
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }
}
