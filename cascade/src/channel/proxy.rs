// Copyright (c) 2024 Botho Foundation

//! Destination-side buffers of a channel on the last relay.

use std::collections::VecDeque;

/// Default capacity of each proxy buffer in bytes.
pub const DEFAULT_PROXY_CAPACITY: usize = 64 * 1024;

/// Plaintext buffers between a channel and the destination-facing component.
///
/// `requests` holds client data not yet consumed by the destination and
/// `replies` holds destination data not yet returned in a reply round.
#[derive(Debug)]
pub struct ProxyBuffers {
    requests: VecDeque<u8>,
    replies: VecDeque<u8>,
    capacity: usize,
}

impl ProxyBuffers {
    /// Create empty buffers holding at most `capacity` bytes each.
    pub fn new(capacity: usize) -> Self {
        Self {
            requests: VecDeque::new(),
            replies: VecDeque::new(),
            capacity,
        }
    }

    /// Bytes waiting to be returned as replies.
    pub fn reply_len(&self) -> usize {
        self.replies.len()
    }

    /// Bytes waiting to be consumed by the destination.
    pub fn request_len(&self) -> usize {
        self.requests.len()
    }

    /// Append reply data, returning how many bytes fit.
    pub fn push_reply(&mut self, data: &[u8]) -> usize {
        let accepted = data.len().min(self.capacity - self.replies.len());
        self.replies.extend(&data[..accepted]);
        accepted
    }

    /// Append request data, returning how many bytes fit.
    pub fn push_request(&mut self, data: &[u8]) -> usize {
        let accepted = data.len().min(self.capacity - self.requests.len());
        self.requests.extend(&data[..accepted]);
        accepted
    }

    /// Take exactly `len` bytes of reply data, zero padding past the end.
    ///
    /// Returns the chunk and how many leading bytes were real data.
    pub fn take_reply(&mut self, len: usize) -> (Vec<u8>, usize) {
        let available = self.replies.len().min(len);
        let mut chunk: Vec<u8> = self.replies.drain(..available).collect();
        chunk.resize(len, 0);
        (chunk, available)
    }

    /// Drain all buffered request data.
    pub fn drain_requests(&mut self) -> Vec<u8> {
        self.requests.drain(..).collect()
    }
}
