// Copyright (c) 2024 Botho Foundation

//! Processing between the I/O core's queues.
//!
//! - [`BatchMixer`]: threshold mix for both directions
//! - [`ReplySizer`]: reply size and timing decision on the last relay
//! - [`Destination`] / [`ExitRunner`]: consumer of mixed requests on the
//!   last relay
//!
//! Any other strategy can take the mixer's place by working the same four
//! queues of [`crate::queue::MixQueues`].

mod batch;
mod destination;
pub mod reply_sizing;

pub use batch::{BatchMixer, MixerConfig};
pub use destination::{Destination, ExitRunner, LoopbackDestination};
pub use reply_sizing::{FlushTrigger, ReplySizer, ReplySizingConfig, SizingPhase};
