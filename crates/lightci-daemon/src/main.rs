//! ciod - lightci pipeline execution daemon.
//!
//! Main entry point for the daemon binary.

use clap::Parser;
use lightci_daemon::{Daemon, DaemonConfig};
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

/// Precedence: CLI flags > environment variables > `--config` file > defaults.
#[derive(Parser, Debug)]
#[command(name = "ciod", about = "lightci pipeline execution daemon")]
struct Cli {
    /// Path to a key=value config file.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// HTTP port to bind on 127.0.0.1.
    #[arg(long)]
    http_port: Option<u16>,
}

fn main() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match DaemonConfig::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                error!("failed to load config file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => DaemonConfig::default(),
    };
    config.apply_env();
    if let Some(port) = cli.http_port {
        config.http_port = port;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        match Daemon::new(config).await {
            Ok(daemon) => {
                let daemon = std::sync::Arc::new(daemon);
                let signal_daemon = std::sync::Arc::clone(&daemon);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("received SIGINT");
                        signal_daemon.shutdown();
                    }
                });

                if let Err(e) = daemon.run().await {
                    error!("daemon error: {}", e);
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {}", e);
                std::process::exit(1);
            }
        }
    });
}
