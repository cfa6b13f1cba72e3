// Copyright (c) 2024 Botho Foundation

//! Queues between the I/O core and the mixing strategy.
//!
//! ```text
//!   I/O core ──enqueue_request──► unprocessed requests ──take_next_request──► strategy
//!   strategy ──submit_request───► processed requests   ──next_processed_request──► I/O core
//!   I/O core ──enqueue_reply────► unprocessed replies  ──take_next_reply────► strategy
//!   strategy ──submit_reply─────► processed replies    ──next_processed_reply──► I/O core
//! ```
//!
//! Every queue is bounded. A full queue blocks the producer instead of
//! dropping, so overload turns into backpressure on the sockets. Every
//! blocking operation also returns once the shared [`Shutdown`] fires.

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;

use crate::message::MixMessage;

/// Default capacity of each queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Errors from blocking queue operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The relay is shutting down.
    #[error("relay is shutting down")]
    Shutdown,

    /// Nothing arrived before the timeout.
    #[error("timed out waiting for a message")]
    Timeout,
}

/// Process-wide stop signal shared by every relay thread.
///
/// Triggering drops the only sender of an internal channel; every receiver
/// waiting in a `select!` on [`Shutdown::signal`] then wakes up.
#[derive(Clone, Debug)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    signal: Receiver<()>,
    trigger: Arc<Mutex<Option<Sender<()>>>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            signal: rx,
            trigger: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.trigger.lock().take();
    }

    /// Check whether the signal fired.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Receiver that becomes ready (disconnected) once the signal fires.
    pub fn signal(&self) -> &Receiver<()> {
        &self.signal
    }

    /// Sleep for `duration` or until the signal fires.
    ///
    /// Returns `true` if the signal fired.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        select! {
            recv(self.signal) -> _ => true,
            default(duration) => self.is_triggered(),
        }
    }
}

/// One bounded, blocking message queue.
#[derive(Clone, Debug)]
pub struct MixQueue {
    tx: Sender<MixMessage>,
    rx: Receiver<MixMessage>,
}

impl MixQueue {
    /// Create a queue holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    /// Enqueue, blocking while the queue is full.
    pub fn push(&self, msg: MixMessage, shutdown: &Shutdown) -> Result<(), QueueError> {
        select! {
            send(self.tx, msg) -> res => res.map_err(|_| QueueError::Shutdown),
            recv(shutdown.signal()) -> _ => Err(QueueError::Shutdown),
        }
    }

    /// Dequeue, blocking while the queue is empty.
    pub fn pop(&self, shutdown: &Shutdown) -> Result<MixMessage, QueueError> {
        select! {
            recv(self.rx) -> msg => msg.map_err(|_| QueueError::Shutdown),
            recv(shutdown.signal()) -> _ => Err(QueueError::Shutdown),
        }
    }

    /// Dequeue, waiting at most `timeout`.
    pub fn pop_timeout(
        &self,
        shutdown: &Shutdown,
        timeout: Duration,
    ) -> Result<MixMessage, QueueError> {
        select! {
            recv(self.rx) -> msg => msg.map_err(|_| QueueError::Shutdown),
            recv(shutdown.signal()) -> _ => Err(QueueError::Shutdown),
            default(timeout) => Err(QueueError::Timeout),
        }
    }

    /// Dequeue without blocking.
    pub fn try_pop(&self) -> Option<MixMessage> {
        self.rx.try_recv().ok()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Check whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// The four queues of a relay plus its shutdown signal.
#[derive(Clone, Debug)]
pub struct MixQueues {
    unprocessed_requests: MixQueue,
    processed_requests: MixQueue,
    unprocessed_replies: MixQueue,
    processed_replies: MixQueue,
    shutdown: Shutdown,
}

impl MixQueues {
    /// Create the four queues, each holding at most `capacity` messages.
    pub fn new(capacity: usize, shutdown: Shutdown) -> Self {
        Self {
            unprocessed_requests: MixQueue::new(capacity),
            processed_requests: MixQueue::new(capacity),
            unprocessed_replies: MixQueue::new(capacity),
            processed_replies: MixQueue::new(capacity),
            shutdown,
        }
    }

    /// Shutdown signal shared by the queues.
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    // I/O core side

    /// Hand an inbound request to the strategy.
    pub fn enqueue_request(&self, msg: MixMessage) -> Result<(), QueueError> {
        self.unprocessed_requests.push(msg, &self.shutdown)
    }

    /// Hand an inbound reply to the strategy.
    pub fn enqueue_reply(&self, msg: MixMessage) -> Result<(), QueueError> {
        self.unprocessed_replies.push(msg, &self.shutdown)
    }

    /// Next mixed request to transmit.
    pub fn next_processed_request(&self) -> Result<MixMessage, QueueError> {
        self.processed_requests.pop(&self.shutdown)
    }

    /// Next mixed reply to transmit.
    pub fn next_processed_reply(&self) -> Result<MixMessage, QueueError> {
        self.processed_replies.pop(&self.shutdown)
    }

    // Strategy side

    /// Next request waiting to be mixed.
    pub fn take_next_request(&self) -> Result<MixMessage, QueueError> {
        self.unprocessed_requests.pop(&self.shutdown)
    }

    /// Next request waiting to be mixed, waiting at most `timeout`.
    pub fn take_next_request_timeout(&self, timeout: Duration) -> Result<MixMessage, QueueError> {
        self.unprocessed_requests.pop_timeout(&self.shutdown, timeout)
    }

    /// Next reply waiting to be mixed.
    pub fn take_next_reply(&self) -> Result<MixMessage, QueueError> {
        self.unprocessed_replies.pop(&self.shutdown)
    }

    /// Next reply waiting to be mixed, waiting at most `timeout`.
    pub fn take_next_reply_timeout(&self, timeout: Duration) -> Result<MixMessage, QueueError> {
        self.unprocessed_replies.pop_timeout(&self.shutdown, timeout)
    }

    /// Submit a mixed request for transmission.
    pub fn submit_request(&self, msg: MixMessage) -> Result<(), QueueError> {
        self.processed_requests.push(msg, &self.shutdown)
    }

    /// Submit a mixed reply for transmission.
    pub fn submit_reply(&self, msg: MixMessage) -> Result<(), QueueError> {
        self.processed_replies.push(msg, &self.shutdown)
    }

    /// Queue lengths: unprocessed/processed requests, unprocessed/processed replies.
    pub fn depths(&self) -> [usize; 4] {
        [
            self.unprocessed_requests.len(),
            self.processed_requests.len(),
            self.unprocessed_replies.len(),
            self.processed_replies.len(),
        ]
    }
}
