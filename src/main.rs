// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use depthshare::SourceFlags;
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "depthshare")]
#[command(about = "Shared access to multi-stream depth sensors")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available devices
    List {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Stream frames from a device with one or more consumers
    Stream {
        /// Device index to use (from 'depthshare list')
        #[arg(short, long, default_value = "0")]
        device: usize,

        /// Comma-separated sources, e.g. "color,depth,color-mapped-depth"
        #[arg(short, long, default_value = "color,depth")]
        sources: SourceFlags,

        /// Stop after this many frames (0 = until Ctrl+C)
        #[arg(short, long, default_value = "100")]
        frames: u64,

        /// Number of concurrent consumers sharing the device
        #[arg(short, long, default_value = "1")]
        consumers: usize,

        /// Helper service priority level requested by the first consumer
        #[arg(short, long)]
        priority: Option<i64>,
    },

    /// Save one frame of a device to disk
    Snapshot {
        /// Device index to use (from 'depthshare list')
        #[arg(short, long, default_value = "0")]
        device: usize,

        /// Comma-separated sources to capture
        #[arg(short, long, default_value = "all")]
        sources: SourceFlags,

        /// Output directory (default: ~/Pictures/depthshare)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the configuration, optionally writing the defaults
    Config {
        /// Write the current configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=depthshare=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let config = depthshare::Config::load();

    match cli.command {
        Commands::List { json } => cli::list_devices(&config, json),
        Commands::Stream {
            device,
            sources,
            frames,
            consumers,
            priority,
        } => cli::stream(
            &config,
            cli::StreamOptions {
                device,
                sources,
                frames,
                consumers,
                priority,
            },
        ),
        Commands::Snapshot {
            device,
            sources,
            output,
        } => cli::snapshot(&config, device, sources, output),
        Commands::Config { save } => cli::show_config(&config, save),
    }
}
