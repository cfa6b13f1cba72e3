// Copyright (c) 2024 Botho Foundation

//! Channels: one client's logical session through the cascade.
//!
//! A channel is identified locally by a random [`ChannelId`]. Each cascade
//! edge re-identifies the channel with its own random id (see
//! [`crate::network::link::EdgeIdTable`]) so that adjacent relays never share
//! the identifier space of any other edge.
//!
//! The per-round flags enforce the central mixing invariant: within one round
//! a channel contributes at most one request and receives at most one reply.

mod proxy;
mod registry;

pub use proxy::{ProxyBuffers, DEFAULT_PROXY_CAPACITY};
pub use registry::{ChannelRegistry, RegistryError};

use parking_lot::Mutex;
use rand::Rng;
use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

/// Length of a channel identifier on the wire.
pub const CHANNEL_ID_LEN: usize = 4;

/// Locally unique identifier of a channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u32);

impl ChannelId {
    /// Create a channel id from its raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Draw a random channel id.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.gen())
    }

    /// Get the raw value.
    #[inline]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Big-endian wire encoding.
    pub fn to_be_bytes(&self) -> [u8; CHANNEL_ID_LEN] {
        self.0.to_be_bytes()
    }

    /// Decode from the big-endian wire encoding.
    pub fn from_be_bytes(bytes: [u8; CHANNEL_ID_LEN]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({:08x})", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// State of one channel on this relay.
///
/// Channels are shared between the I/O threads and the mixing threads through
/// [`ChannelRegistry`], so every flag is atomic and the proxy buffers sit
/// behind a mutex. Socket buffers are *not* stored here: they are owned by the
/// thread that performs I/O on the socket.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,

    /// Completed the establish handshake on this hop.
    established: AtomicBool,

    /// Already contributed a request to the round being collected.
    has_request_in_round: AtomicBool,

    /// Already received a reply in the reply round being collected.
    has_reply_in_round: AtomicBool,

    last_activity: Mutex<Instant>,

    /// Destination-side plaintext buffers (only used on the last relay).
    proxy: Mutex<ProxyBuffers>,
}

impl Channel {
    /// Create a new, not yet established channel.
    pub fn new(id: ChannelId) -> Self {
        Self::with_proxy_capacity(id, DEFAULT_PROXY_CAPACITY)
    }

    /// Create a channel whose proxy buffers hold at most `capacity` bytes each.
    pub fn with_proxy_capacity(id: ChannelId, capacity: usize) -> Self {
        Self {
            id,
            established: AtomicBool::new(false),
            has_request_in_round: AtomicBool::new(false),
            has_reply_in_round: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            proxy: Mutex::new(ProxyBuffers::new(capacity)),
        }
    }

    /// Get the channel id.
    #[inline]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Check whether the establish message has been seen on this hop.
    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    /// Mark the channel as established.
    pub fn set_established(&self) {
        self.established.store(true, Ordering::Release);
    }

    /// Claim this channel's single request slot in the current round.
    ///
    /// Returns `false` if the channel already holds a request for the round.
    pub fn try_claim_request(&self) -> bool {
        self.has_request_in_round
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim this channel's single reply slot in the current reply round.
    ///
    /// Returns `false` if the channel already received a reply for the round.
    pub fn try_claim_reply(&self) -> bool {
        self.has_reply_in_round
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Check whether a request is held for the current round.
    pub fn has_request_in_round(&self) -> bool {
        self.has_request_in_round.load(Ordering::Acquire)
    }

    /// Check whether a reply was delivered in the current reply round.
    pub fn has_reply_in_round(&self) -> bool {
        self.has_reply_in_round.load(Ordering::Acquire)
    }

    pub(crate) fn clear_request_round(&self) {
        self.has_request_in_round.store(false, Ordering::Release);
    }

    pub(crate) fn clear_reply_round(&self) {
        self.has_reply_in_round.store(false, Ordering::Release);
    }

    /// Record activity on the channel.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time of the last recorded activity.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Bytes waiting in the proxy buffer to be returned as replies.
    pub fn buffered_reply_bytes(&self) -> usize {
        self.proxy.lock().reply_len()
    }

    /// Append destination data to the reply buffer.
    ///
    /// Returns the number of bytes accepted; the buffer never drops data, so
    /// callers retry the remainder once a reply round has drained it.
    pub fn push_reply_data(&self, data: &[u8]) -> usize {
        self.proxy.lock().push_reply(data)
    }

    /// Take exactly `len` bytes of reply data, zero padded.
    ///
    /// Returns the chunk and the number of bytes that were real data.
    pub fn take_reply_chunk(&self, len: usize) -> (Vec<u8>, usize) {
        self.proxy.lock().take_reply(len)
    }

    /// Append client data destined for the destination.
    pub fn push_request_data(&self, data: &[u8]) -> usize {
        self.proxy.lock().push_request(data)
    }

    /// Drain all client data buffered for the destination.
    pub fn drain_request_data(&self) -> Vec<u8> {
        self.proxy.lock().drain_requests()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::time::Duration;

    #[test]
    fn test_channel_id_wire_encoding() {
        let id = ChannelId::new(0xDEAD_BEEF);
        assert_eq!(id.to_be_bytes(), [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(ChannelId::from_be_bytes(id.to_be_bytes()), id);
    }

    #[test]
    fn test_channel_id_display() {
        let id = ChannelId::new(0x42);
        assert_eq!(id.to_string(), "00000042");
        assert_eq!(format!("{:?}", id), "ChannelId(00000042)");
    }

    #[test]
    fn test_channel_id_random_is_deterministic_with_seed() {
        let mut rng1 = ChaCha8Rng::seed_from_u64(7);
        let mut rng2 = ChaCha8Rng::seed_from_u64(7);
        assert_eq!(ChannelId::random(&mut rng1), ChannelId::random(&mut rng2));
    }

    #[test]
    fn test_request_slot_claimed_once_per_round() {
        let channel = Channel::new(ChannelId::new(1));
        assert!(channel.try_claim_request());
        assert!(!channel.try_claim_request());
        assert!(channel.has_request_in_round());

        channel.clear_request_round();
        assert!(channel.try_claim_request());
    }

    #[test]
    fn test_reply_slot_independent_of_request_slot() {
        let channel = Channel::new(ChannelId::new(1));
        assert!(channel.try_claim_request());
        assert!(channel.try_claim_reply());
        assert!(!channel.try_claim_reply());

        channel.clear_reply_round();
        assert!(!channel.has_reply_in_round());
        assert!(channel.has_request_in_round());
    }

    #[test]
    fn test_established_flag() {
        let channel = Channel::new(ChannelId::new(9));
        assert!(!channel.is_established());
        channel.set_established();
        assert!(channel.is_established());
    }

    #[test]
    fn test_touch_updates_activity() {
        let channel = Channel::new(ChannelId::new(3));
        let before = channel.last_activity();
        std::thread::sleep(Duration::from_millis(5));
        channel.touch();
        assert!(channel.last_activity() > before);
    }
}
