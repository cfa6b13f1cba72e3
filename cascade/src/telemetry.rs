// Copyright (c) 2024 Botho Foundation

//! Log output configuration.
//!
//! The binary installs a console subscriber whose filter comes from
//! `RUST_LOG` when set:
//!
//! ```text
//! RUST_LOG=cascade::network=debug,info cascade run
//! ```
//!
//! Without `RUST_LOG` the level is INFO, or DEBUG with `--verbose`.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter used when `RUST_LOG` is unset or invalid.
pub fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::new(if verbose { "debug" } else { "info" })
}

/// Initialize the global tracing subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_tracing(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbose));

    let fmt_layer = fmt::layer().with_target(false).with_thread_names(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}
