// Copyright (c) 2024 Botho Foundation

//! Counters for the relay components.
//!
//! Each component owns an `Arc` of its metrics struct and bumps relaxed
//! atomics; `snapshot()` copies them out for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics of the client-facing listener.
#[derive(Debug, Default)]
pub struct ListenerMetrics {
    /// Client connections accepted.
    pub accepted: AtomicU64,
    /// Client connections refused by a connection cap.
    pub rejected: AtomicU64,
    /// Requests handed to the mixing strategy.
    pub requests_enqueued: AtomicU64,
    /// Replies fully written to clients.
    pub replies_written: AtomicU64,
    /// Reads deferred because the channel already sent in this round.
    pub deferred_reads: AtomicU64,
    /// Frames with an unexpected length.
    pub protocol_faults: AtomicU64,
    /// Channels torn down after disconnect or I/O error.
    pub disconnects: AtomicU64,
}

impl ListenerMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> ListenerMetricsSnapshot {
        ListenerMetricsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            requests_enqueued: self.requests_enqueued.load(Ordering::Relaxed),
            replies_written: self.replies_written.load(Ordering::Relaxed),
            deferred_reads: self.deferred_reads.load(Ordering::Relaxed),
            protocol_faults: self.protocol_faults.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`ListenerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerMetricsSnapshot {
    /// Client connections accepted.
    pub accepted: u64,
    /// Client connections refused.
    pub rejected: u64,
    /// Requests handed to the mixing strategy.
    pub requests_enqueued: u64,
    /// Replies fully written to clients.
    pub replies_written: u64,
    /// Deferred reads.
    pub deferred_reads: u64,
    /// Frames with an unexpected length.
    pub protocol_faults: u64,
    /// Channels torn down.
    pub disconnects: u64,
}

/// Metrics of one inter-relay edge.
#[derive(Debug, Default)]
pub struct LinkMetrics {
    /// Frames written to the edge.
    pub frames_sent: AtomicU64,
    /// Frames read from the edge and accepted.
    pub frames_received: AtomicU64,
    /// Bytes written, length prefixes included.
    pub bytes_sent: AtomicU64,
    /// Bytes read, length prefixes included.
    pub bytes_received: AtomicU64,
    /// Connections (re)established.
    pub connections: AtomicU64,
    /// Frames discarded as protocol faults.
    pub protocol_faults: AtomicU64,
    /// Payload bytes skipped to stay aligned.
    pub skipped_bytes: AtomicU64,
}

impl LinkMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self, skipped: usize) {
        self.protocol_faults.fetch_add(1, Ordering::Relaxed);
        self.skipped_bytes.fetch_add(skipped as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> LinkMetricsSnapshot {
        LinkMetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            protocol_faults: self.protocol_faults.load(Ordering::Relaxed),
            skipped_bytes: self.skipped_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`LinkMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkMetricsSnapshot {
    /// Frames written.
    pub frames_sent: u64,
    /// Frames accepted.
    pub frames_received: u64,
    /// Bytes written.
    pub bytes_sent: u64,
    /// Bytes read.
    pub bytes_received: u64,
    /// Connections established.
    pub connections: u64,
    /// Frames discarded.
    pub protocol_faults: u64,
    /// Bytes skipped.
    pub skipped_bytes: u64,
}

/// Metrics of the reply sizing decision.
#[derive(Debug, Default)]
pub struct SizingMetrics {
    /// Rounds flushed because enough channels were filled.
    pub early_flushes: AtomicU64,
    /// Rounds flushed because the timeout elapsed.
    pub timeout_flushes: AtomicU64,
    /// Replies produced.
    pub replies: AtomicU64,
    /// Padding bytes added to replies.
    pub padding_bytes: AtomicU64,
    /// Reply size chosen in the last round.
    pub last_reply_size: AtomicU64,
}

impl SizingMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> SizingMetricsSnapshot {
        SizingMetricsSnapshot {
            early_flushes: self.early_flushes.load(Ordering::Relaxed),
            timeout_flushes: self.timeout_flushes.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            padding_bytes: self.padding_bytes.load(Ordering::Relaxed),
            last_reply_size: self.last_reply_size.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`SizingMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizingMetricsSnapshot {
    /// Early flushes.
    pub early_flushes: u64,
    /// Timeout flushes.
    pub timeout_flushes: u64,
    /// Replies produced.
    pub replies: u64,
    /// Padding bytes.
    pub padding_bytes: u64,
    /// Last chosen reply size.
    pub last_reply_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_metrics_snapshot() {
        let metrics = LinkMetrics::new();
        metrics.record_sent(100);
        metrics.record_sent(50);
        metrics.record_received(20);
        metrics.record_fault(12);
        metrics.record_connection();

        let snap = metrics.snapshot();
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.frames_received, 1);
        assert_eq!(snap.protocol_faults, 1);
        assert_eq!(snap.skipped_bytes, 12);
        assert_eq!(snap.connections, 1);
    }

    #[test]
    fn test_listener_metrics_snapshot() {
        let metrics = ListenerMetrics::new();
        ListenerMetrics::inc(&metrics.accepted);
        ListenerMetrics::inc(&metrics.accepted);
        ListenerMetrics::inc(&metrics.rejected);

        let snap = metrics.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.disconnects, 0);
    }
}
