// Copyright (c) 2024 Botho Foundation

//! Cascade relay library - one mix node in a fixed chain of relays.
//!
//! This library provides the I/O and inter-node multiplexing core of a mix
//! relay: the client-facing listener, the encrypted multiplexed links to the
//! neighbouring relays, the queues that hand messages to and from the mixing
//! strategy, and the reply sizing decision on the relay next to the
//! destination.
//!
//! # Architecture
//!
//! ```text
//!  clients ──► ClientListener ──► unprocessed requests ──► BatchMixer
//!                                                             │
//!                 processed requests ◄────────────────────────┘
//!                        │
//!                        ▼
//!                  UpstreamLink ════ encrypted edge ════► DownstreamLink (next relay)
//!                        │
//!                        ▼
//!            unprocessed replies ──► BatchMixer ──► processed replies ──► ReplyDrain ──► clients
//! ```
//!
//! On the last relay the processed requests go to a [`mixing::Destination`]
//! and the [`mixing::ReplySizer`] decides when and how large each round of
//! replies is.

#![deny(clippy::print_stdout)]
#![warn(missing_docs)]

pub mod channel;
pub mod config;
pub mod crypto;
pub mod message;
pub mod metrics;
pub mod mixing;
pub mod network;
pub mod node;
pub mod queue;
pub mod telemetry;

// Re-export commands module for CLI binary
pub mod commands;

pub use channel::{Channel, ChannelId, ChannelRegistry, RegistryError};
pub use config::Config;
pub use message::{Framing, MessageType, MixMessage};
pub use node::{NodeError, RelayNode};
pub use queue::{MixQueues, Shutdown};
