// Copyright (c) 2024 Botho Foundation

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::crypto::{KeyExchange, LocalKeyExchange, PresharedKeys};
use crate::node::RelayNode;

/// Interval between status log lines
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Run the relay until Ctrl+C
pub fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path).context("No config found. Run 'cascade init' first.")?;
    config.validate().context("Invalid configuration")?;

    let key_exchange: Arc<dyn KeyExchange> = match config.edge_key()? {
        Some(key) => Arc::new(PresharedKeys::new(key)),
        None if config.is_first() && config.is_last() => Arc::new(LocalKeyExchange::new()),
        None => bail!("Relays with neighbours need a [keys] section (see 'cascade keygen')"),
    };

    let mut node = RelayNode::start(&config, key_exchange).context("Failed to start relay")?;

    let shutdown = node.shutdown_signal().clone();
    ctrlc::set_handler(move || shutdown.trigger()).context("Failed to install Ctrl+C handler")?;

    if let Some(addr) = node.listener_addr() {
        println!("Accepting clients on {}", addr);
    }
    if let Some(addr) = node.downstream_addr() {
        println!("Accepting the previous relay on {}", addr);
    }
    println!("Cascade relay running. Press Ctrl+C to stop.");

    while !node.shutdown_signal().sleep(STATUS_INTERVAL) {
        let status = node.status();
        info!(
            channels = status.channels,
            request_round = status.request_round,
            reply_round = status.reply_round,
            queues = ?status.queue_depths,
            upstream_connected = ?status.upstream_connected,
            downstream_connected = ?status.downstream_connected,
            "Relay status"
        );
    }

    info!("Shutting down");
    node.shutdown();
    Ok(())
}
