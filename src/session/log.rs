//! Per-connection session log
//!
//! One append-only file per (port, peer):
//! `<logdir>/port_<port>_<ip>_<remoteport>.log`, one `[timestamp] message`
//! line per received message.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
pub struct SessionLog {
    path: PathBuf,
}

impl SessionLog {
    pub fn new(log_dir: &Path, port: u16, peer: SocketAddr) -> Self {
        let file_name = format!("port_{}_{}_{}.log", port, peer.ip(), peer.port());
        Self {
            path: log_dir.join(file_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. The file and its directory are created on first use.
    pub async fn append(&self, message: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let line = format!(
            "[{}] {}\n",
            Local::now().format(TIMESTAMP_FORMAT),
            message.trim_end_matches(['\n', '\r'])
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}
