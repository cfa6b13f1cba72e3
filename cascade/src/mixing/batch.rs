// Copyright (c) 2024 Botho Foundation

//! Threshold batch mixer.
//!
//! Requests are collected until the round size is reached or the round
//! timeout expires, shuffled, stripped of this relay's processing header and
//! submitted, preceded by a batch size message when another relay follows.
//! Behind the first relay, the batch size markers the downstream link
//! enqueues close the round announced by the previous relay and set the size
//! of the next one.
//!
//! Replies are collected until every established channel has one or the
//! timeout expires, then shuffled and submitted. On the last relay the reply
//! sizer closes each reply round with a batch size marker instead. Releases
//! pass straight through.

use rand::seq::SliceRandom;
use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, warn};

use crate::{
    channel::ChannelRegistry,
    message::MixMessage,
    queue::{MixQueues, QueueError},
};

/// Settings of the batch mixer.
#[derive(Debug, Clone)]
pub struct MixerConfig {
    /// Requests that fill a round, until the previous relay announces one.
    pub round_size: usize,
    /// Longest time a partial round is held back.
    pub round_timeout: Duration,
    /// Processing header bytes this relay strips from each request.
    pub header_unit: usize,
    /// This relay is the first of the cascade and owns the request rounds.
    pub is_first: bool,
    /// This relay is the last of the cascade.
    pub is_last: bool,
}

/// Running request and reply mixing threads.
#[derive(Debug)]
pub struct BatchMixer {
    threads: Vec<JoinHandle<()>>,
}

impl BatchMixer {
    /// Spawn both mixing threads.
    pub fn start(
        config: MixerConfig,
        registry: Arc<ChannelRegistry>,
        queues: MixQueues,
    ) -> io::Result<Self> {
        let requests = RequestMixer {
            round_size: config.round_size.max(1),
            config: config.clone(),
            registry: Arc::clone(&registry),
            queues: queues.clone(),
        };
        let replies = ReplyMixer {
            round_timeout: config.round_timeout,
            is_last: config.is_last,
            registry,
            queues,
        };

        let threads = vec![
            thread::Builder::new()
                .name("mix-requests".to_string())
                .spawn(move || requests.run())?,
            thread::Builder::new()
                .name("mix-replies".to_string())
                .spawn(move || replies.run())?,
        ];
        Ok(Self { threads })
    }

    /// Join both threads once the shutdown signal has fired.
    pub fn stop(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                error!("Mixer thread panicked");
            }
        }
    }
}

/// Time left of a round that started at `started`.
fn remaining(started: Option<Instant>, timeout: Duration) -> Duration {
    match started {
        Some(t) => timeout.saturating_sub(t.elapsed()),
        None => timeout,
    }
}

struct RequestMixer {
    config: MixerConfig,
    registry: Arc<ChannelRegistry>,
    queues: MixQueues,
    round_size: usize,
}

impl RequestMixer {
    fn run(mut self) {
        let mut batch = Vec::new();
        let mut started = None;

        loop {
            let wait = remaining(started, self.config.round_timeout);
            let flush = match self.queues.take_next_request_timeout(wait) {
                Ok(msg @ MixMessage::ChannelRelease { .. }) => {
                    if self.queues.submit_request(msg).is_err() {
                        break;
                    }
                    false
                }
                Ok(MixMessage::BatchSize { size }) => {
                    // The previous relay's next round starts here
                    if size > 0 {
                        self.round_size = size as usize;
                    }
                    !batch.is_empty()
                }
                Ok(msg) if msg.is_channel_request() => {
                    started.get_or_insert_with(Instant::now);
                    batch.push(msg);
                    batch.len() >= self.round_size
                }
                Ok(other) => {
                    warn!(kind = %other.message_type(), "Unexpected message in request queue, dropped");
                    false
                }
                Err(QueueError::Timeout) => !batch.is_empty(),
                Err(QueueError::Shutdown) => break,
            };

            if flush {
                if self.flush(&mut batch).is_err() {
                    break;
                }
                started = None;
            }
        }
        debug!("Request mixer stopped");
    }

    fn flush(&self, batch: &mut Vec<MixMessage>) -> Result<(), QueueError> {
        batch.shuffle(&mut rand::thread_rng());
        let size = batch.len();

        if !self.config.is_last {
            self.queues
                .submit_request(MixMessage::BatchSize { size: size as u32 })?;
        }
        for mut msg in batch.drain(..) {
            msg.strip_header(self.config.header_unit);
            self.queues.submit_request(msg)?;
        }
        if self.config.is_first {
            let round = self.registry.begin_request_round();
            debug!(size, round, "Request round flushed");
        } else {
            debug!(size, "Request round flushed");
        }
        Ok(())
    }
}

struct ReplyMixer {
    round_timeout: Duration,
    is_last: bool,
    registry: Arc<ChannelRegistry>,
    queues: MixQueues,
}

impl ReplyMixer {
    fn run(self) {
        let mut batch = Vec::new();
        let mut started = None;

        loop {
            let wait = remaining(started, self.round_timeout);
            let flush = match self.queues.take_next_reply_timeout(wait) {
                Ok(msg @ MixMessage::Reply { .. }) => {
                    started.get_or_insert_with(Instant::now);
                    batch.push(msg);
                    !self.is_last
                        && batch.len() >= self.registry.established_channels().len().max(1)
                }
                Ok(MixMessage::BatchSize { size }) if self.is_last => {
                    if batch.len() != size as usize {
                        warn!(expected = size, actual = batch.len(), "Reply round size mismatch");
                    }
                    !batch.is_empty()
                }
                Ok(other) => {
                    warn!(kind = %other.message_type(), "Unexpected message in reply queue, dropped");
                    false
                }
                Err(QueueError::Timeout) => !batch.is_empty(),
                Err(QueueError::Shutdown) => break,
            };

            if flush {
                if self.flush(&mut batch).is_err() {
                    break;
                }
                started = None;
            }
        }
        debug!("Reply mixer stopped");
    }

    fn flush(&self, batch: &mut Vec<MixMessage>) -> Result<(), QueueError> {
        batch.shuffle(&mut rand::thread_rng());
        let size = batch.len();
        for msg in batch.drain(..) {
            self.queues.submit_reply(msg)?;
        }
        if self.is_last {
            debug!(size, "Reply round flushed");
        } else {
            let round = self.registry.begin_reply_round();
            debug!(size, round, "Reply round flushed");
        }
        Ok(())
    }
}
