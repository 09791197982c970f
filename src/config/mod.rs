//! Configuration Management Module
//!
//! Console settings: listener bind address, session log and download
//! directories, buffer limits and shell bridge tuning.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, ConfigStorage, StorageError};
pub use types::{PortdeckConfig, ShellConfig, ShellProgram, CONFIG_VERSION};
