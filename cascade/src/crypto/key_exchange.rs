// Copyright (c) 2024 Botho Foundation

//! Edge key bootstrap.
//!
//! The listening side of an edge proposes a fresh [`EdgeKey`] and publishes
//! it; the connecting side fetches it from the peer once before any traffic
//! flows. How the key actually travels is up to the [`KeyExchange`]
//! implementation.

use displaydoc::Display;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info};

use super::EdgeKey;

/// Default time a fetch waits for the peer to publish its key.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the key exchange service.
#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum KeyExchangeError {
    /// No edge key published for {0}
    NotPublished(SocketAddr),

    /// Key exchange unavailable: {0}
    Unavailable(String),
}

/// Side-channel service distributing the shared key of each edge.
pub trait KeyExchange: Send + Sync {
    /// Fetch the key published by the relay listening at `peer`.
    ///
    /// `info_port` is the port of the peer's key information service.
    fn fetch_edge_key(&self, peer: SocketAddr, info_port: u16) -> Result<EdgeKey, KeyExchangeError>;

    /// Publish the key for the edge this relay accepts on `listen`.
    ///
    /// Returns the key actually in effect for the edge, which is `proposed`
    /// unless the implementation pins a key of its own.
    fn publish_edge_key(
        &self,
        listen: SocketAddr,
        proposed: EdgeKey,
    ) -> Result<EdgeKey, KeyExchangeError>;
}

/// Key exchange backed by a key configured out of band on every relay.
#[derive(Debug, Clone)]
pub struct PresharedKeys {
    key: EdgeKey,
}

impl PresharedKeys {
    /// Use `key` for every edge.
    pub fn new(key: EdgeKey) -> Self {
        Self { key }
    }
}

impl KeyExchange for PresharedKeys {
    fn fetch_edge_key(&self, peer: SocketAddr, _info_port: u16) -> Result<EdgeKey, KeyExchangeError> {
        debug!(%peer, "Using pre-shared edge key");
        Ok(self.key.clone())
    }

    fn publish_edge_key(
        &self,
        listen: SocketAddr,
        _proposed: EdgeKey,
    ) -> Result<EdgeKey, KeyExchangeError> {
        debug!(%listen, "Pre-shared edge key pinned, proposal discarded");
        Ok(self.key.clone())
    }
}

/// In-process key exchange shared by relays living in one process.
///
/// Fetches block until the listening relay has published, up to a timeout.
#[derive(Debug, Clone)]
pub struct LocalKeyExchange {
    inner: Arc<LocalInner>,
    fetch_timeout: Duration,
}

#[derive(Debug, Default)]
struct LocalInner {
    keys: Mutex<HashMap<SocketAddr, EdgeKey>>,
    published: Condvar,
}

impl Default for LocalKeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalKeyExchange {
    /// Create an empty exchange.
    pub fn new() -> Self {
        Self::with_fetch_timeout(DEFAULT_FETCH_TIMEOUT)
    }

    /// Create an empty exchange whose fetches give up after `fetch_timeout`.
    pub fn with_fetch_timeout(fetch_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(LocalInner::default()),
            fetch_timeout,
        }
    }
}

impl KeyExchange for LocalKeyExchange {
    fn fetch_edge_key(&self, peer: SocketAddr, _info_port: u16) -> Result<EdgeKey, KeyExchangeError> {
        let deadline = Instant::now() + self.fetch_timeout;
        let mut keys = self.inner.keys.lock();
        loop {
            if let Some(key) = keys.get(&peer) {
                return Ok(key.clone());
            }
            if self
                .inner
                .published
                .wait_until(&mut keys, deadline)
                .timed_out()
            {
                return keys
                    .get(&peer)
                    .cloned()
                    .ok_or(KeyExchangeError::NotPublished(peer));
            }
        }
    }

    fn publish_edge_key(
        &self,
        listen: SocketAddr,
        proposed: EdgeKey,
    ) -> Result<EdgeKey, KeyExchangeError> {
        self.inner.keys.lock().insert(listen, proposed.clone());
        self.inner.published.notify_all();
        info!(%listen, key = ?proposed, "Edge key published");
        Ok(proposed)
    }
}
