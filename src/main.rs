use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use launchpad::config::AppConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "launchpad")]
#[command(version, about = "Preview and deployment orchestrator for generated apps")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a launchpad.toml (defaults to ./launchpad.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP control service and the garbage collector
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Proxy unmatched requests to the local interactive preview
        #[arg(long)]
        local_preview: bool,
    },
    /// Create the database and its schema
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Run one garbage collection pass and print what was reclaimed
    Sweep {
        /// Only destroy expired previews
        #[arg(long, conflicts_with = "workspaces_only")]
        previews_only: bool,

        /// Only delete stale workspaces
        #[arg(long)]
        workspaces_only: bool,
    },
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the resolved configuration with secrets redacted
    Show,
    /// Write a default launchpad.toml to the working directory
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let config = AppConfig::load(cli.config.as_deref(), &cwd)?;
    let _log_guard = launchpad::logging::init(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Serve {
            port,
            local_preview,
        } => cmd::cmd_serve(config, *port, *local_preview).await?,
        Commands::InitDb { db_path } => cmd::cmd_init_db(&config, db_path.clone())?,
        Commands::Sweep {
            previews_only,
            workspaces_only,
        } => cmd::cmd_sweep(&config, *previews_only, *workspaces_only).await?,
        Commands::Config { command } => cmd::cmd_config(&cwd, &config, command.clone())?,
    }

    Ok(())
}
