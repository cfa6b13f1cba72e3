// Copyright (c) 2024 Botho Foundation

//! Concurrent table of the channels known to this relay.

use parking_lot::RwLock;
use rand::Rng;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tracing::debug;

use super::{Channel, ChannelId, DEFAULT_PROXY_CAPACITY};

/// Errors returned by [`ChannelRegistry`] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A channel with this id is already registered.
    #[error("channel {0} already exists")]
    AlreadyExists(ChannelId),

    /// No channel with this id is registered.
    #[error("channel {0} not found")]
    NotFound(ChannelId),
}

/// Thread-safe map from [`ChannelId`] to [`Channel`].
///
/// The registry also carries the round counters. Starting a new round clears
/// the per-channel round flags and bumps the counter, which lets the I/O
/// threads notice that deferred reads may resume.
#[derive(Debug)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ChannelId, Arc<Channel>>>,
    request_round: AtomicU64,
    reply_round: AtomicU64,
    proxy_capacity: usize,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_proxy_capacity(DEFAULT_PROXY_CAPACITY)
    }

    /// Create an empty registry whose channels use the given proxy capacity.
    pub fn with_proxy_capacity(proxy_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            request_round: AtomicU64::new(0),
            reply_round: AtomicU64::new(0),
            proxy_capacity,
        }
    }

    /// Register a new channel under `id`.
    pub fn create(&self, id: ChannelId) -> Result<Arc<Channel>, RegistryError> {
        let mut channels = self.channels.write();
        if channels.contains_key(&id) {
            return Err(RegistryError::AlreadyExists(id));
        }
        let channel = Arc::new(Channel::with_proxy_capacity(id, self.proxy_capacity));
        channels.insert(id, Arc::clone(&channel));
        debug!(channel = %id, total = channels.len(), "Channel created");
        Ok(channel)
    }

    /// Register a new channel under a fresh random id.
    pub fn create_random<R: Rng + ?Sized>(&self, rng: &mut R) -> Arc<Channel> {
        loop {
            if let Ok(channel) = self.create(ChannelId::random(rng)) {
                return channel;
            }
        }
    }

    /// Look up a channel.
    pub fn lookup(&self, id: ChannelId) -> Result<Arc<Channel>, RegistryError> {
        self.channels
            .read()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    /// Remove a channel.
    ///
    /// Removing an unknown channel reports [`RegistryError::NotFound`] and
    /// changes nothing, so teardown paths may call this unconditionally.
    pub fn remove(&self, id: ChannelId) -> Result<(), RegistryError> {
        let mut channels = self.channels.write();
        match channels.remove(&id) {
            Some(_) => {
                debug!(channel = %id, total = channels.len(), "Channel removed");
                Ok(())
            }
            None => Err(RegistryError::NotFound(id)),
        }
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    /// Check whether no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }

    /// Snapshot of all registered channels.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }

    /// Snapshot of the channels that completed the establish handshake.
    pub fn established_channels(&self) -> Vec<Arc<Channel>> {
        self.channels
            .read()
            .values()
            .filter(|c| c.is_established())
            .cloned()
            .collect()
    }

    /// Close the current request round.
    ///
    /// Every channel may contribute one request to the next round.
    pub fn begin_request_round(&self) -> u64 {
        for channel in self.channels.read().values() {
            channel.clear_request_round();
        }
        self.request_round.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Close the current reply round.
    pub fn begin_reply_round(&self) -> u64 {
        for channel in self.channels.read().values() {
            channel.clear_reply_round();
        }
        self.reply_round.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of request rounds closed so far.
    pub fn request_round(&self) -> u64 {
        self.request_round.load(Ordering::Acquire)
    }

    /// Number of reply rounds closed so far.
    pub fn reply_round(&self) -> u64 {
        self.reply_round.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::thread;

    #[test]
    fn test_create_lookup_remove() {
        let registry = ChannelRegistry::new();
        let id = ChannelId::new(10);

        let channel = registry.create(id).unwrap();
        assert_eq!(channel.id(), id);
        assert_eq!(registry.lookup(id).unwrap().id(), id);
        assert_eq!(registry.len(), 1);

        registry.remove(id).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.lookup(id).unwrap_err(), RegistryError::NotFound(id));
    }

    #[test]
    fn test_create_duplicate_rejected() {
        let registry = ChannelRegistry::new();
        let id = ChannelId::new(10);
        registry.create(id).unwrap();
        assert_eq!(registry.create(id).unwrap_err(), RegistryError::AlreadyExists(id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ChannelRegistry::new();
        let id = ChannelId::new(10);
        registry.create(id).unwrap();

        assert!(registry.remove(id).is_ok());
        assert_eq!(registry.remove(id), Err(RegistryError::NotFound(id)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_create_random_unique() {
        let registry = ChannelRegistry::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..100 {
            registry.create_random(&mut rng);
        }
        assert_eq!(registry.len(), 100);
    }

    #[test]
    fn test_begin_request_round_clears_flags() {
        let registry = ChannelRegistry::new();
        let a = registry.create(ChannelId::new(1)).unwrap();
        let b = registry.create(ChannelId::new(2)).unwrap();
        assert!(a.try_claim_request());
        assert!(b.try_claim_request());
        assert!(b.try_claim_reply());

        assert_eq!(registry.begin_request_round(), 1);
        assert_eq!(registry.request_round(), 1);
        assert!(!a.has_request_in_round());
        assert!(!b.has_request_in_round());
        // Reply round is untouched
        assert!(b.has_reply_in_round());

        registry.begin_reply_round();
        assert!(!b.has_reply_in_round());
        assert_eq!(registry.reply_round(), 1);
    }

    #[test]
    fn test_established_channels_filter() {
        let registry = ChannelRegistry::new();
        let a = registry.create(ChannelId::new(1)).unwrap();
        registry.create(ChannelId::new(2)).unwrap();
        a.set_established();

        let established = registry.established_channels();
        assert_eq!(established.len(), 1);
        assert_eq!(established[0].id(), ChannelId::new(1));
    }

    #[test]
    fn test_concurrent_create_remove() {
        let registry = Arc::new(ChannelRegistry::new());
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..250u32 {
                        let id = ChannelId::new(t * 1000 + i);
                        registry.create(id).unwrap();
                        if i % 2 == 0 {
                            registry.remove(id).unwrap();
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 4 * 125);
    }
}
