//! Session Management Module
//!
//! Everything that belongs to one accepted peer:
//! - [`Connection`] state (replay buffer, shell bridge, platform, liveness)
//! - Insertion-ordered [`ConnectionSets`] per port
//! - The per-connection read loop
//! - Append-only session logs

mod connection;
mod log;
mod manager;
pub(crate) mod reader;

pub use connection::{Connection, ConnectionInfo};
pub use log::SessionLog;
pub use manager::ConnectionSets;

#[cfg(test)]
pub(crate) use connection::test_pair;
