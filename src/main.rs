use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use portdeck::config::{ConfigStorage, PortdeckConfig};
use portdeck::{OperatorSink, PortRegistry};

#[derive(Parser, Debug)]
#[command(name = "portdeck", version, about = "Multi-port listener console")]
struct Args {
    /// Config file (default: ~/.portdeck/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Interface listeners bind to
    #[arg(long)]
    bind: Option<String>,

    /// Directory for per-connection session logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Directory received files are written to
    #[arg(long)]
    downloads_dir: Option<PathBuf>,

    /// Port to start listening on at startup (repeatable)
    #[arg(short, long = "port")]
    ports: Vec<u16>,

    /// Write the effective configuration back to the config file
    #[arg(long)]
    save_config: bool,
}

impl Args {
    fn apply(&self, config: &mut PortdeckConfig) {
        if let Some(ref bind) = self.bind {
            config.bind_address = bind.clone();
        }
        if let Some(ref dir) = self.log_dir {
            config.log_dir = dir.clone();
        }
        if let Some(ref dir) = self.downloads_dir {
            config.downloads_dir = dir.clone();
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    portdeck::init_logging();
    let args = Args::parse();

    let storage = match args.config.clone() {
        Some(path) => ConfigStorage::with_path(path),
        None => match ConfigStorage::new() {
            Ok(storage) => storage,
            Err(e) => {
                tracing::error!("{}", e);
                return ExitCode::FAILURE;
            }
        },
    };

    let mut config = match storage.load().await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config {:?}: {}", storage.path(), e);
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut config);

    if args.save_config {
        match storage.save(&config).await {
            Ok(()) => tracing::info!("Config saved to {:?}", storage.path()),
            Err(e) => tracing::warn!("Failed to save config {:?}: {}", storage.path(), e),
        }
    }

    let (sink, events) = OperatorSink::channel();
    let registry = PortRegistry::new(config, sink);

    for port in &args.ports {
        if let Err(e) = registry.add_port(*port).await {
            eprintln!("[!] {}", e);
        }
    }

    if let Err(e) = portdeck::console::run(registry, events).await {
        tracing::error!("Console error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "portdeck",
            "--bind",
            "127.0.0.1",
            "--log-dir",
            "/var/log/portdeck",
            "-p",
            "9000",
            "--port",
            "9001",
        ]);
        let mut config = PortdeckConfig::default();
        args.apply(&mut config);

        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.log_dir, PathBuf::from("/var/log/portdeck"));
        assert_eq!(config.downloads_dir, PathBuf::from("downloads"));
        assert_eq!(args.ports, vec![9000, 9001]);
    }
}
