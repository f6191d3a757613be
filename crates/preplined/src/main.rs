//! preplined — the Prepline daemon.
//!
//! Single binary that assembles every Prepline subsystem:
//! - State store (redb): traffic history and the decision log
//! - Node registry
//! - Traffic observer, pattern predictor, warm-pool sizer
//! - Router with per-pool admission queues
//! - Pre-warm scheduler and per-node command mailboxes
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! preplined run --config /etc/prepline/prepline.toml --port 8470
//! preplined run --demo --data-dir /tmp/prepline
//! preplined check-config --config prepline.toml
//! ```

mod daemon;
mod demo;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use prepline_core::{PreplineConfig, SystemClock};
use prepline_state::StateStore;

use crate::daemon::Daemon;

const DEFAULT_LOG_FILTER: &str = "info,preplined=debug,prepline=debug";

#[derive(Parser)]
#[command(name = "preplined", about = "Prepline function router and pre-warm scheduler")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the router, the background loops, and the API server.
    Run {
        /// Path to prepline.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides `server.port`).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides `server.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Seed synthetic history, sample functions, and simulated nodes.
        #[arg(long)]
        demo: bool,
    },

    /// Parse and validate a config file, then print it with defaults filled in.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },

    /// Print the default configuration.
    DefaultConfig,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            demo,
        } => {
            let mut config = match config {
                Some(path) => PreplineConfig::from_file(&path)?,
                None => PreplineConfig::default(),
            };
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(dir) = data_dir {
                config.server.data_dir = dir.display().to_string();
            }
            run(config, demo).await
        }
        Command::CheckConfig { config } => {
            let parsed = PreplineConfig::from_file(&config)?;
            println!("{}", parsed.to_toml_string()?);
            Ok(())
        }
        Command::DefaultConfig => {
            println!("{}", PreplineConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config: PreplineConfig, demo: bool) -> anyhow::Result<()> {
    info!(demo, "Prepline daemon starting");

    let data_dir = PathBuf::from(&config.server.data_dir);
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("prepline.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let daemon = Daemon::assemble(config, store, SystemClock::shared(), demo)?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server starting");
    daemon.serve(listener).await?;

    info!("Prepline daemon stopped");
    Ok(())
}
