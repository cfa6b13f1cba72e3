// Copyright (c) 2024 Botho Foundation

//! Per-edge channel id translation.

use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;

use crate::channel::ChannelId;

#[derive(Debug, Default)]
struct Maps {
    by_local: HashMap<ChannelId, ChannelId>,
    by_edge: HashMap<ChannelId, ChannelId>,
}

/// Bidirectional map between local channel ids and the ids used on one edge.
///
/// The upstream side of an edge draws the edge id at random when a channel is
/// established; the downstream side records whatever id it receives.
#[derive(Debug, Default)]
pub struct EdgeIdTable {
    maps: RwLock<Maps>,
}

impl EdgeIdTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `local` to a fresh random edge id.
    ///
    /// An existing mapping for `local` is replaced.
    pub fn allocate<R: Rng + ?Sized>(&self, local: ChannelId, rng: &mut R) -> ChannelId {
        let mut maps = self.maps.write();
        if let Some(old) = maps.by_local.remove(&local) {
            maps.by_edge.remove(&old);
        }
        let edge = loop {
            let candidate = ChannelId::random(rng);
            if !maps.by_edge.contains_key(&candidate) {
                break candidate;
            }
        };
        maps.by_local.insert(local, edge);
        maps.by_edge.insert(edge, local);
        edge
    }

    /// Record a mapping chosen by the peer.
    ///
    /// Returns `false` if either id is already mapped.
    pub fn insert(&self, edge: ChannelId, local: ChannelId) -> bool {
        let mut maps = self.maps.write();
        if maps.by_edge.contains_key(&edge) || maps.by_local.contains_key(&local) {
            return false;
        }
        maps.by_edge.insert(edge, local);
        maps.by_local.insert(local, edge);
        true
    }

    /// Edge id of a local channel.
    pub fn edge_id(&self, local: ChannelId) -> Option<ChannelId> {
        self.maps.read().by_local.get(&local).copied()
    }

    /// Local channel of an edge id.
    pub fn local_id(&self, edge: ChannelId) -> Option<ChannelId> {
        self.maps.read().by_edge.get(&edge).copied()
    }

    /// Check whether an edge id is mapped.
    pub fn contains_edge(&self, edge: ChannelId) -> bool {
        self.maps.read().by_edge.contains_key(&edge)
    }

    /// Forget a mapping by local id, returning the edge id.
    pub fn remove_local(&self, local: ChannelId) -> Option<ChannelId> {
        let mut maps = self.maps.write();
        let edge = maps.by_local.remove(&local)?;
        maps.by_edge.remove(&edge);
        Some(edge)
    }

    /// Forget a mapping by edge id, returning the local id.
    pub fn remove_edge(&self, edge: ChannelId) -> Option<ChannelId> {
        let mut maps = self.maps.write();
        let local = maps.by_edge.remove(&edge)?;
        maps.by_local.remove(&local);
        Some(local)
    }

    /// Number of mapped channels.
    pub fn len(&self) -> usize {
        self.maps.read().by_local.len()
    }

    /// Check whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.maps.read().by_local.is_empty()
    }
}
