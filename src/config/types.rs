//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// A shell executable plus the arguments it is started with
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellProgram {
    /// Full path (or name resolved through PATH) of the executable
    pub path: PathBuf,
    pub args: Vec<String>,
}

impl ShellProgram {
    pub fn new(path: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            path: path.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Human-readable label used in the startup banner
    pub fn label(&self) -> String {
        self.path.display().to_string()
    }
}

// Platform-specific pipe shells
#[cfg(windows)]
const PIPE_SHELL_PATH: &str = "powershell.exe";
#[cfg(windows)]
const PIPE_SHELL_ARGS: &[&str] = &[
    "-NoLogo",
    "-NoProfile",
    "-ExecutionPolicy",
    "Bypass",
    "-Command",
    "-",
];

#[cfg(not(windows))]
const PIPE_SHELL_PATH: &str = "/bin/sh";
#[cfg(not(windows))]
const PIPE_SHELL_ARGS: &[&str] = &[];

/// Shell bridge settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell started on a pseudo-terminal (unix connections)
    pub pty: ShellProgram,
    /// Shell started with piped stdio (windows connections)
    pub pipe: ShellProgram,
    /// Delay between writing a command and starting to drain output
    pub settle_ms: u64,
    /// Drain stops once no output arrives for this long
    pub quiet_ms: u64,
    /// Hard upper bound on a single drain
    pub drain_window_ms: u64,
    /// Size of each read from the shell's output
    pub read_chunk: usize,
    /// Grace period before a piped shell is force-killed
    pub terminate_timeout_ms: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            pty: ShellProgram::new("/bin/bash", &["--norc", "--noprofile"]),
            pipe: ShellProgram::new(PIPE_SHELL_PATH, PIPE_SHELL_ARGS),
            settle_ms: 100,
            quiet_ms: 150,
            drain_window_ms: 2000,
            read_chunk: 4096,
            terminate_timeout_ms: 5000,
        }
    }
}

impl ShellConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn quiet(&self) -> Duration {
        Duration::from_millis(self.quiet_ms)
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

/// Top-level console configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PortdeckConfig {
    pub version: u32,
    /// Interface listeners bind to
    pub bind_address: String,
    /// Directory holding one append-only log per (port, peer)
    pub log_dir: PathBuf,
    /// Directory received files are written to
    pub downloads_dir: PathBuf,
    /// Bytes requested per socket read
    pub read_chunk_size: usize,
    /// Messages kept per connection for replay on focus switch
    pub buffer_limit: usize,
    pub shell: ShellConfig,
}

impl Default for PortdeckConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            bind_address: "0.0.0.0".to_string(),
            log_dir: PathBuf::from("logs"),
            downloads_dir: PathBuf::from("downloads"),
            read_chunk_size: 1024,
            buffer_limit: 1000,
            shell: ShellConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PortdeckConfig =
            serde_json::from_str(r#"{"bind_address": "127.0.0.1", "shell": {"settle_ms": 5}}"#)
                .unwrap();
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.shell.settle_ms, 5);
        assert_eq!(config.shell.quiet_ms, 150);
        assert_eq!(config.shell.pty.path, PathBuf::from("/bin/bash"));
    }

    #[test]
    fn test_pty_shell_skips_startup_files() {
        let shell = ShellConfig::default();
        assert!(shell.pty.args.contains(&"--norc".to_string()));
        assert!(shell.pty.args.contains(&"--noprofile".to_string()));
    }
}
