//! Anchor simulation CLI
//!
//! Drives the anchor engine against in-memory collaborators and prints every
//! event the caller would receive as JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use anchor_sync::AnchorSyncConfig;

mod scenario;

use scenario::Simulation;

#[derive(Parser)]
#[command(name = "anchor-sim")]
#[command(about = "Anchor Sync - simulate anchor hosting and resolving", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Place an anchor and host it
    Host {
        /// Anchor name
        #[arg(short, long, default_value = "plane1")]
        name: String,

        /// Time-to-live in days
        #[arg(short, long)]
        ttl: Option<u32>,
    },

    /// Resolve a previously hosted anchor
    Resolve {
        /// Cloud identifier to resolve
        #[arg(long)]
        cloud_id: String,

        /// Name the caller registers the resolved anchor under
        #[arg(short, long, default_value = "resolved")]
        name: String,
    },

    /// Host an anchor, then resolve it again under a new name
    Roundtrip {
        /// Anchor name
        #[arg(short, long, default_value = "plane1")]
        name: String,

        /// Time-to-live in days
        #[arg(short, long)]
        ttl: Option<u32>,
    },

    /// Print the effective configuration
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<AnchorSyncConfig> {
    let mut config = match path {
        Some(path) => AnchorSyncConfig::load_from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => AnchorSyncConfig::default(),
    };
    config.merge_with_env()?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Host { name, ttl } => {
            let sim = Simulation::start(config, None)?;
            sim.host(&name, ttl).await?;
            sim.finish().await;
        }

        Commands::Resolve { cloud_id, name } => {
            let sim = Simulation::start(config, Some(&cloud_id))?;
            sim.resolve(&cloud_id, &name).await?;
            sim.finish().await;
        }

        Commands::Roundtrip { name, ttl } => {
            let sim = Simulation::start(config, None)?;
            let cloud_id = sim.host(&name, ttl).await?;
            sim.resolve(&cloud_id, &format!("{name}-copy")).await?;
            sim.finish().await;
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
