// Copyright (c) 2024 Botho Foundation

//! Encrypted multiplexed links between adjacent relays.
//!
//! Each cascade edge carries every channel over one persistent TCP stream.
//! The relay upstream of the edge (closer to the clients) dials; the relay
//! downstream listens, generates the edge key and publishes it. Channel ids
//! are re-randomized per edge by [`EdgeIdTable`].

mod connection;
mod downstream;
mod table;
mod upstream;

pub use connection::EdgeConnection;
pub use downstream::{DownstreamConfig, DownstreamLink};
pub use table::EdgeIdTable;
pub use upstream::{UpstreamConfig, UpstreamLink};
