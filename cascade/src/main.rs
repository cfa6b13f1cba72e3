// Copyright (c) 2024 Botho Foundation

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cascade::{commands, config, telemetry};

#[derive(Parser)]
#[command(name = "cascade")]
#[command(about = "A relay of a fixed mix cascade", long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.cascade/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config for a relay at the given cascade position
    Init {
        /// Relays before this one (0 for the first relay)
        #[arg(long, default_value_t = 0)]
        previous_hops: u32,

        /// Relays after this one (0 for the last relay)
        #[arg(long, default_value_t = 0)]
        further_hops: u32,

        /// Edge address of the next relay
        #[arg(long)]
        upstream: Option<String>,
    },

    /// Run the relay
    Run,

    /// Print a fresh pre-shared edge key
    Keygen,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init_tracing(cli.verbose)?;

    let config_path = match cli.config {
        Some(path) => PathBuf::from(path),
        None => config::default_config_path()?,
    };

    match cli.command {
        Commands::Init {
            previous_hops,
            further_hops,
            upstream,
        } => commands::init::run(&config_path, previous_hops, further_hops, upstream),
        Commands::Run => commands::run::run(&config_path),
        Commands::Keygen => commands::keygen::run(),
    }
}
