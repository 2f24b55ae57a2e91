//! The cutover daemon.
//!
//! Single binary that assembles all cutover subsystems:
//! - State store (redb)
//! - Routing target pairs behind the local router
//! - Deployment groups with their lifecycle validators
//! - Pipeline orchestrator + approval gate
//! - REST API
//!
//! # Usage
//!
//! ```text
//! cutoverd init --output cutover.toml --image registry.example.com/app:v1
//! cutoverd run --config cutover.toml --port 8480 --data-dir /var/lib/cutover
//! ```

mod daemon;

use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tracing::info;

use cutover_core::CutoverConfig;

#[derive(Parser)]
#[command(name = "cutoverd", about = "Cutover daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Run {
        /// Path to cutover.toml.
        #[arg(long, default_value = "cutover.toml")]
        config: PathBuf,

        /// Port to listen on (overrides `[daemon] port`).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides `[daemon] data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Write a starter cutover.toml with a latest and a stable group.
    Init {
        #[arg(long, default_value = "cutover.toml")]
        output: PathBuf,

        /// Image the source stage renders into the task spec.
        #[arg(long, default_value = "registry.example.com/app:latest")]
        image: String,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new("info,cutoverd=debug,cutover=debug")
                }),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
        } => {
            let cfg = CutoverConfig::from_file(&config)?;
            info!(path = %config.display(), groups = cfg.groups.len(), "configuration loaded");
            let port = port.unwrap_or_else(|| cfg.port());
            let data_dir = data_dir.unwrap_or_else(|| cfg.data_dir());
            daemon::run_daemon(cfg, port, data_dir).await
        }
        Command::Init {
            output,
            image,
            force,
        } => {
            if output.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", output.display());
            }
            let content = CutoverConfig::scaffold(&image).to_toml_string()?;
            std::fs::write(&output, content)?;
            println!("wrote {}", output.display());
            Ok(())
        }
    }
}
