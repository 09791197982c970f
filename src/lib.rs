//! Portdeck - multi-port listener console
//!
//! Listens on many TCP ports at once, tracks every inbound connection per
//! port, lets the operator focus one connection at a time, bridges an
//! interactive shell through it and moves files in both directions.

pub mod config;
pub mod console;
pub mod events;
pub mod listener;
pub mod session;
pub mod shell;
pub mod transfer;

pub use config::PortdeckConfig;
pub use events::{OperatorEvent, OperatorSink};
pub use listener::{ListenerError, PortRegistry};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging. Diagnostics go to stderr; stdout belongs to the console.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
