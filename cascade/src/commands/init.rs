// Copyright (c) 2024 Botho Foundation

use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::info;

use crate::config::Config;

/// Run the init command
pub fn run(
    config_path: &Path,
    previous_hops: u32,
    further_hops: u32,
    upstream: Option<String>,
) -> Result<()> {
    if Config::exists(config_path) {
        bail!(
            "Config already exists at {}\nUse a different --config path or delete the existing config.",
            config_path.display()
        );
    }

    let config = Config::new(previous_hops, further_hops, upstream);
    config
        .validate()
        .context("Refusing to write an invalid config")?;
    config.save(config_path)?;

    info!("Relay initialized at {}", config_path.display());
    println!("\nRelay configuration created.");
    println!("Config saved to: {}", config_path.display());
    println!("\nThis relay will:");
    if config.is_first() {
        println!(
            "  - Accept clients on {}:{}",
            config.listener.bind_address, config.listener.port
        );
    } else {
        println!("  - Accept the previous relay on {}", config.downstream.listen);
    }
    match &config.upstream.address {
        Some(addr) if !config.is_last() => println!("  - Forward mixed requests to {}", addr),
        _ => println!("  - Deliver mixed requests to the destination and size replies"),
    }
    if !(config.is_first() && config.is_last()) {
        println!("\nNext steps:");
        println!("  1. Run 'cascade keygen' once and add the [keys] section to every relay");
        println!("  2. Run 'cascade run' on each relay, last relay first");
    }

    Ok(())
}
