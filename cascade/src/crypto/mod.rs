// Copyright (c) 2024 Botho Foundation

//! Header block encryption for inter-relay edges.
//!
//! Each edge shares one [`EdgeKey`] (AES-128 key and 16-byte IV). Every
//! multiplex header block is encrypted with AES-128 in counter mode used as a
//! continuous keystream: each call advances the cipher, so both ends must
//! process header blocks in the same order and from the same starting point.
//!
//! The keystream position is scoped to one TCP connection. After a reconnect
//! both ends call [`HeaderCipher::reset`] before touching the new stream.
//!
//! Requests and replies travel the same edge in opposite directions. Each
//! [`Direction`] starts its counter from a different IV, so the two streams
//! never share keystream blocks.
//!
//! # Security
//!
//! Only the header block is encrypted here and nothing is authenticated. Bulk
//! payload confidentiality comes from the mixing layer above this core.

mod key_exchange;

pub use key_exchange::{
    KeyExchange, KeyExchangeError, LocalKeyExchange, PresharedKeys, DEFAULT_FETCH_TIMEOUT,
};

use aes::{
    cipher::{KeyIvInit, StreamCipher},
    Aes128,
};
use ctr::Ctr128BE;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes128Ctr = Ctr128BE<Aes128>;

/// Cipher block size in bytes.
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// Edge key length in bytes.
pub const EDGE_KEY_LEN: usize = 16;

/// Edge IV length in bytes.
pub const EDGE_IV_LEN: usize = 16;

/// Errors from key parsing and cipher setup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// Key or IV had the wrong length.
    #[error("invalid key material length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Key or IV was not valid hex.
    #[error("invalid hex key material: {0}")]
    InvalidHex(String),

    /// Buffer is not a whole cipher block.
    #[error("header block must be {CIPHER_BLOCK_SIZE} bytes, got {0}")]
    NotABlock(usize),
}

/// Shared key material of one cascade edge.
///
/// The key is zeroed from memory when dropped and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct EdgeKey {
    key: [u8; EDGE_KEY_LEN],
    iv: [u8; EDGE_IV_LEN],
}

impl EdgeKey {
    /// Create from raw key and IV.
    pub fn new(key: [u8; EDGE_KEY_LEN], iv: [u8; EDGE_IV_LEN]) -> Self {
        Self { key, iv }
    }

    /// Generate a fresh random key and IV.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut key = [0u8; EDGE_KEY_LEN];
        let mut iv = [0u8; EDGE_IV_LEN];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    /// Parse from hex strings.
    pub fn from_hex(key: &str, iv: &str) -> Result<Self, CipherError> {
        Ok(Self {
            key: decode_hex_array(key)?,
            iv: decode_hex_array(iv)?,
        })
    }

    /// Hex encoding of the key and the IV.
    pub fn to_hex(&self) -> (String, String) {
        (hex::encode(self.key), hex::encode(self.iv))
    }

    /// Raw key bytes.
    pub fn key(&self) -> &[u8; EDGE_KEY_LEN] {
        &self.key
    }

    /// Raw IV bytes.
    pub fn iv(&self) -> &[u8; EDGE_IV_LEN] {
        &self.iv
    }

    /// Counter start of the keystream for `direction`.
    fn direction_iv(&self, direction: Direction) -> [u8; EDGE_IV_LEN] {
        let mut iv = self.iv;
        if direction == Direction::Replies {
            iv[0] ^= REPLY_IV_MASK;
        }
        iv
    }
}

fn decode_hex_array<const N: usize>(s: &str) -> Result<[u8; N], CipherError> {
    let bytes = hex::decode(s.trim()).map_err(|e| CipherError::InvalidHex(e.to_string()))?;
    if bytes.len() != N {
        return Err(CipherError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        });
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

impl fmt::Debug for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log the actual key - show a hash fingerprint instead
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        hasher.update(self.iv);
        let hash = hasher.finalize();
        write!(f, "EdgeKey(sha256:{})", hex::encode(&hash[..4]))
    }
}

/// Bit flipped in the first IV byte for the reply direction.
const REPLY_IV_MASK: u8 = 0x80;

/// Direction of travel on an edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Previous relay to next relay.
    Requests,
    /// Next relay back to previous relay.
    Replies,
}

/// Stateful keystream cipher for multiplex header blocks.
///
/// Encryption and decryption are the same operation. A sender and the
/// matching receiver stay in step as long as both see the same sequence of
/// blocks since their last [`reset`](Self::reset) and were built for the
/// same [`Direction`].
pub struct HeaderCipher {
    key: EdgeKey,
    direction: Direction,
    stream: Aes128Ctr,
    blocks: u64,
}

impl HeaderCipher {
    /// Initialize a cipher at the start of the keystream of `direction`.
    pub fn new(key: &EdgeKey, direction: Direction) -> Self {
        Self {
            key: key.clone(),
            direction,
            stream: Self::keystream(key, direction),
            blocks: 0,
        }
    }

    fn keystream(key: &EdgeKey, direction: Direction) -> Aes128Ctr {
        Aes128Ctr::new(&key.key.into(), &key.direction_iv(direction).into())
    }

    /// Direction this cipher serves.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Return to the start of the keystream, as after a fresh connection.
    pub fn reset(&mut self) {
        self.stream = Self::keystream(&self.key, self.direction);
        self.blocks = 0;
    }

    /// Encrypt or decrypt one header block in place, advancing the keystream.
    pub fn apply_block(&mut self, block: &mut [u8]) -> Result<(), CipherError> {
        if block.len() != CIPHER_BLOCK_SIZE {
            return Err(CipherError::NotABlock(block.len()));
        }
        self.stream.apply_keystream(block);
        self.blocks += 1;
        Ok(())
    }

    /// Number of blocks processed since the last reset.
    pub fn blocks_processed(&self) -> u64 {
        self.blocks
    }
}

impl fmt::Debug for HeaderCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderCipher")
            .field("key", &self.key)
            .field("direction", &self.direction)
            .field("blocks", &self.blocks)
            .finish()
    }
}
