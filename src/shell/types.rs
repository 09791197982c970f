//! Shell bridge types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error type for shell bridge operations
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("Shell is already running")]
    AlreadyRunning,

    #[error("Shell is not running")]
    NotRunning,

    #[error("Failed to create PTY: {0}")]
    CreateFailed(String),

    #[error("Failed to spawn shell: {0}")]
    SpawnFailed(String),

    #[error("PTY system error: {0}")]
    PtySystemError(String),

    #[error("Shell process exited")]
    Exited,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Platform classification of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    /// Classification of the machine we are running on
    pub fn host() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }

    /// Which shell backend serves this platform
    pub fn shell_kind(self) -> ShellKind {
        match self {
            Platform::Unix => ShellKind::Pty,
            Platform::Windows => ShellKind::Pipe,
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Unix => f.write_str("unix"),
            Platform::Windows => f.write_str("windows"),
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unix" | "linux" | "macos" => Ok(Platform::Unix),
            "windows" | "win" => Ok(Platform::Windows),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

/// Shell backend variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    /// Interactive shell on a pseudo-terminal
    Pty,
    /// Interactive shell with piped stdin/stdout/stderr
    Pipe,
}

/// One piece of shell output, tagged with the stream it came from
#[derive(Debug)]
pub(crate) enum ShellChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}
