//! Kino Analytics CLI - Playback Session Replay
//!
//! Features:
//! - Replay scripted player sessions through the collector
//! - Dry runs that print samples instead of posting them
//! - Configuration validation

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;
mod script;

/// Kino Analytics - Playback telemetry toolkit
#[derive(Parser)]
#[command(name = "kino-analytics")]
#[command(author = "Purple Squirrel Media")]
#[command(version)]
#[command(about = "Replay playback sessions through the Kino analytics collector", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json, table)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Collector configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a session script with real timers
    Simulate {
        /// Path to the session script (JSON array of steps)
        script: PathBuf,

        /// Override the collector base URL
        #[arg(short, long)]
        backend_url: Option<String>,

        /// Print samples as JSON lines instead of posting them
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate and print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for samples and reports
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .init();
    kino_collector::init();

    match cli.command {
        Commands::Simulate { script, backend_url, dry_run } => {
            commands::simulate(&script, cli.config.as_deref(), backend_url.as_deref(), dry_run, &cli.format)
                .await?;
        }
        Commands::Config => {
            commands::show_config(cli.config.as_deref(), &cli.format)?;
        }
    }

    Ok(())
}
