//! Configuration Storage
//!
//! Handles reading/writing the console configuration file.
//! Config location: ~/.portdeck/config.json

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{PortdeckConfig, CONFIG_VERSION};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Get the portdeck configuration directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".portdeck"))
        .ok_or(StorageError::NoConfigDir)
}

/// Get the default config file path
pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("config.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: config_file()?,
        })
    }

    /// Create storage manager with custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load configuration from disk.
    /// Returns the default config if the file doesn't exist or is corrupted.
    pub async fn load(&self) -> Result<PortdeckConfig, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<PortdeckConfig>(&contents) {
                Ok(config) => {
                    if config.version > CONFIG_VERSION {
                        return Err(StorageError::VersionTooNew {
                            found: config.version,
                            supported: CONFIG_VERSION,
                        });
                    }
                    Ok(config)
                }
                Err(e) => {
                    tracing::warn!("Config file {:?} corrupted, using defaults: {}", self.path, e);
                    Ok(PortdeckConfig::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PortdeckConfig::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Save configuration to disk
    pub async fn save(&self, config: &PortdeckConfig) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to temp file first, then rename (atomic write)
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    /// Get config file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("config.json"));

        let config = storage.load().await.unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.bind_address, "0.0.0.0");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("nested").join("config.json"));

        let mut config = PortdeckConfig::default();
        config.buffer_limit = 7;
        config.downloads_dir = PathBuf::from("/tmp/incoming");

        storage.save(&config).await.unwrap();

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded.buffer_limit, 7);
        assert_eq!(loaded.downloads_dir, PathBuf::from("/tmp/incoming"));
    }

    #[tokio::test]
    async fn test_corrupted_file_falls_back_to_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let config = ConfigStorage::with_path(path).load().await.unwrap();
        assert_eq!(config.read_chunk_size, 1024);
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        tokio::fs::write(&path, r#"{"version": 99}"#).await.unwrap();

        let result = ConfigStorage::with_path(path).load().await;
        assert!(matches!(
            result,
            Err(StorageError::VersionTooNew { found: 99, .. })
        ));
    }
}
