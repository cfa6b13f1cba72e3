// Copyright (c) 2024 Botho Foundation

//! Reply size and timing decision on the last relay.
//!
//! Every reply of a round has the same size, so a passive observer learns
//! nothing from reply lengths. The size follows the traffic actually waiting
//! in the channels' proxy buffers:
//!
//! 1. Every poll interval, sample the buffered reply bytes of each channel.
//! 2. Flush early once enough channels hold enough data, otherwise once the
//!    round timeout has elapsed.
//! 3. Take the weighted median of the sampled volumes, round it to the
//!    cipher block size (reply header included) and cap it at the maximum
//!    reply length.
//! 4. Give every channel exactly one reply of that size, zero padded.
//! 5. Close the reply round and tell the reply mixer how many replies it
//!    belongs to with a batch size marker.
//!
//! # Example
//!
//! ```
//! use cascade::mixing::reply_sizing::{adjust_to_block, weighted_median};
//!
//! let median = weighted_median(&[0, 50, 200], 0.5);
//! assert_eq!(median, 50.0);
//! assert_eq!(adjust_to_block(50, 16, 4, 1024), 44);
//! ```

use std::{
    io,
    sync::{
        atomic::Ordering,
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, info};

use crate::{
    channel::{Channel, ChannelRegistry},
    message::{encode_reply_payload, MixMessage},
    metrics::SizingMetrics,
    queue::{MixQueues, QueueError, Shutdown},
};

/// Settings of the reply sizing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplySizingConfig {
    /// Interval between volume samples.
    pub poll_interval: Duration,
    /// Buffered bytes at which a channel counts as filled.
    pub min_volume: usize,
    /// Fraction of filled channels that triggers an early flush.
    pub min_fraction: f64,
    /// Longest time between two flushes.
    pub timeout: Duration,
    /// Quantile `g` of the weighted median, in `[0, 1]`.
    pub weight: f64,
    /// Cipher block size replies are aligned to.
    pub block_size: usize,
    /// Fixed overhead in front of the reply data.
    pub header_len: usize,
    /// Largest reply payload, header included.
    pub max_reply_len: usize,
}

/// Weighted median of ascending `sorted` volumes at quantile `g`.
///
/// Linear interpolation between the order statistics bracketing the 1-based
/// position `g·(n−1)+1`. Returns 0 for no samples.
pub fn weighted_median(sorted: &[usize], g: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let g = g.clamp(0.0, 1.0);
    let pos = g * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    let a = sorted[lo] as f64;
    let b = sorted[hi] as f64;
    a + frac * (b - a)
}

/// Align a reply data size to whole cipher blocks.
///
/// `size + header_len` is rounded to the nearest multiple of `block_size`
/// (halves round up), kept at one block or more, and reduced one block at a
/// time while it exceeds `max_reply_len`. Returns the data size, header
/// excluded.
pub fn adjust_to_block(size: usize, block_size: usize, header_len: usize, max_reply_len: usize) -> usize {
    let total = size + header_len;
    let mut rounded = ((total + block_size / 2) / block_size) * block_size;
    rounded = rounded.max(block_size);
    while rounded > max_reply_len && rounded > block_size {
        rounded -= block_size;
    }
    rounded.saturating_sub(header_len)
}

/// Check whether at least `min_fraction` of the channels hold `min_volume`
/// bytes or more.
pub fn should_flush(volumes: &[usize], min_volume: usize, min_fraction: f64) -> bool {
    if volumes.is_empty() {
        return false;
    }
    let filled = volumes.iter().filter(|&&v| v >= min_volume).count();
    filled as f64 >= min_fraction * volumes.len() as f64
}

/// Phase of the sizing loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizingPhase {
    /// Sampling volumes.
    Collecting,
    /// Computing the reply size.
    Deciding,
    /// Cutting and enqueueing replies.
    Flushing,
}

/// Why a round was flushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Enough channels were filled.
    Volume,
    /// The round timeout elapsed.
    Timeout,
}

/// Reply sizing decision of the last relay.
#[derive(Debug)]
pub struct ReplySizer {
    config: ReplySizingConfig,
    registry: Arc<ChannelRegistry>,
    queues: MixQueues,
    metrics: Arc<SizingMetrics>,
    phase: SizingPhase,
    round_start: Instant,
}

impl ReplySizer {
    /// Create a sizer; its first round starts now.
    pub fn new(
        config: ReplySizingConfig,
        registry: Arc<ChannelRegistry>,
        queues: MixQueues,
        metrics: Arc<SizingMetrics>,
    ) -> Self {
        Self {
            config,
            registry,
            queues,
            metrics,
            phase: SizingPhase::Collecting,
            round_start: Instant::now(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SizingPhase {
        self.phase
    }

    /// Reply data size for the sampled `volumes`.
    pub fn decide(&self, volumes: &[usize]) -> usize {
        let mut sorted = volumes.to_vec();
        sorted.sort_unstable();
        let median = weighted_median(&sorted, self.config.weight).round() as usize;
        adjust_to_block(
            median,
            self.config.block_size,
            self.config.header_len,
            self.config.max_reply_len,
        )
    }

    /// Take one sample and flush if due.
    ///
    /// Returns the reply size and trigger of a flushed round.
    pub fn poll_once(&mut self) -> Result<Option<(usize, FlushTrigger)>, QueueError> {
        self.phase = SizingPhase::Collecting;
        let channels = self.registry.established_channels();
        if channels.is_empty() {
            self.round_start = Instant::now();
            return Ok(None);
        }
        let volumes: Vec<usize> = channels.iter().map(|c| c.buffered_reply_bytes()).collect();

        let trigger = if should_flush(&volumes, self.config.min_volume, self.config.min_fraction) {
            FlushTrigger::Volume
        } else if self.round_start.elapsed() >= self.config.timeout {
            FlushTrigger::Timeout
        } else {
            return Ok(None);
        };

        self.phase = SizingPhase::Deciding;
        let size = self.decide(&volumes);

        self.phase = SizingPhase::Flushing;
        let replies = self.flush_round(&channels, size)?;
        let round = self.registry.begin_reply_round();
        self.queues.enqueue_reply(MixMessage::BatchSize {
            size: replies as u32,
        })?;
        self.round_start = Instant::now();
        self.phase = SizingPhase::Collecting;

        match trigger {
            FlushTrigger::Volume => self.metrics.early_flushes.fetch_add(1, Ordering::Relaxed),
            FlushTrigger::Timeout => self.metrics.timeout_flushes.fetch_add(1, Ordering::Relaxed),
        };
        self.metrics
            .last_reply_size
            .store(size as u64, Ordering::Relaxed);
        debug!(size, replies, round, ?trigger, "Reply round flushed");
        Ok(Some((size, trigger)))
    }

    /// Give every channel one reply of `size` data bytes.
    ///
    /// Channels that already got a reply in the current reply round are
    /// skipped. Returns the number of replies enqueued.
    pub fn flush_round(&self, channels: &[Arc<Channel>], size: usize) -> Result<usize, QueueError> {
        let mut replies = 0;
        for channel in channels {
            if !channel.try_claim_reply() {
                debug!(channel = %channel.id(), "Reply already sent in round, skipped");
                continue;
            }
            let (chunk, valid) = channel.take_reply_chunk(size);
            self.metrics
                .padding_bytes
                .fetch_add((size - valid) as u64, Ordering::Relaxed);
            self.metrics.replies.fetch_add(1, Ordering::Relaxed);
            self.queues.enqueue_reply(MixMessage::Reply {
                channel: channel.id(),
                payload: encode_reply_payload(&chunk, valid),
            })?;
            replies += 1;
        }
        Ok(replies)
    }

    /// Run the sizing loop on its own thread until shutdown.
    pub fn spawn(mut self, shutdown: Shutdown) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("reply-sizing".to_string())
            .spawn(move || {
                info!(
                    weight = self.config.weight,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Reply sizing started"
                );
                while !shutdown.sleep(self.config.poll_interval) {
                    if self.poll_once().is_err() {
                        break;
                    }
                }
                debug!("Reply sizing stopped");
            })
    }
}
