//! meshregd — the meshreg daemon.
//!
//! One binary, two roles:
//! - **meta**: lease manager, slot table manager, lease sweeper and the
//!   meta RPC router
//! - **session**: membership renewal, change dispatcher, push worker and
//!   the session API
//!
//! # Usage
//!
//! ```text
//! meshregd meta --port 9615 --config /etc/meshreg/meshreg.toml
//! meshregd session --port 9600 --config /etc/meshreg/meshreg.toml
//! ```

mod meta_mode;
mod session_mode;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use meshreg_core::RegistryConfig;

#[derive(Parser)]
#[command(name = "meshregd", about = "meshreg service registry daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a meta node (membership, slot table, heartbeats).
    Meta {
        /// Port to listen on.
        #[arg(long, default_value = "9615")]
        port: u16,

        /// Path to meshreg.toml.
        #[arg(long, default_value = "meshreg.toml")]
        config: PathBuf,
    },
    /// Run a session node (client subscriptions and pushes).
    Session {
        /// Port the session API listens on.
        #[arg(long, default_value = "9600")]
        port: u16,

        /// Path to meshreg.toml.
        #[arg(long, default_value = "meshreg.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,meshregd=debug,meshreg=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Meta { port, config } => meta_mode::run_meta(port, load_config(&config)?).await,
        Command::Session { port, config } => {
            session_mode::run_session(port, load_config(&config)?).await
        }
    }
}

/// Load `path`, falling back to defaults when the file does not exist.
fn load_config(path: &Path) -> anyhow::Result<RegistryConfig> {
    if path.exists() {
        let config = RegistryConfig::from_file(path)?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    } else {
        warn!(path = %path.display(), "configuration file not found, using defaults");
        Ok(RegistryConfig::default())
    }
}
