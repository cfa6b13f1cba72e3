// Copyright (c) 2024 Botho Foundation

//! Network layer of the relay.
//!
//! - [`listener`]: client-facing readiness loop
//! - [`link`]: multiplexed links to the neighbouring relays
//! - [`frame`]: wire codec shared by both
//! - [`limiter`]: client connection caps

mod error;
pub mod frame;
pub mod limiter;
pub mod link;
pub mod listener;

pub use error::{FrameError, LinkError, ListenerError};
pub use limiter::{ConnectionLimiter, LimitExceeded};
pub use link::{DownstreamConfig, DownstreamLink, EdgeIdTable, UpstreamConfig, UpstreamLink};
pub use listener::{ClientListener, ListenerConfig};
