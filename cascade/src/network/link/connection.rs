// Copyright (c) 2024 Botho Foundation

//! The single TCP connection of an edge, shared by its sender and receiver.
//!
//! Every installed stream gets a new generation number. A thread that sees
//! its stream fail invalidates that generation; exactly one thread wins the
//! invalidation and is responsible for bringing a new stream up (the upstream
//! side dials, the downstream side waits for its acceptor). Both threads
//! reset their header cipher whenever the generation they hold changes.

use parking_lot::{Condvar, Mutex};
use std::{
    net::{Shutdown as SocketShutdown, TcpStream},
    time::Duration,
};
use tracing::debug;

use crate::{network::LinkError, queue::Shutdown};

/// Interval at which waiting threads re-check the shutdown signal.
const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct ConnState {
    stream: Option<TcpStream>,
    generation: u64,
    closed: bool,
}

/// Connection slot of one edge.
#[derive(Debug)]
pub struct EdgeConnection {
    state: Mutex<ConnState>,
    changed: Condvar,
    shutdown: Shutdown,
}

impl EdgeConnection {
    /// Create a slot with no stream.
    pub fn new(shutdown: Shutdown) -> Self {
        Self {
            state: Mutex::new(ConnState::default()),
            changed: Condvar::new(),
            shutdown,
        }
    }

    /// Install a freshly connected stream, replacing any previous one.
    ///
    /// Returns the new generation.
    pub fn install(&self, stream: TcpStream) -> u64 {
        let mut state = self.state.lock();
        if let Some(old) = state.stream.take() {
            let _ = old.shutdown(SocketShutdown::Both);
        }
        if state.closed {
            let _ = stream.shutdown(SocketShutdown::Both);
            return state.generation;
        }
        state.stream = Some(stream);
        state.generation += 1;
        debug!(generation = state.generation, "Edge stream installed");
        self.changed.notify_all();
        state.generation
    }

    /// Wait for a live stream.
    ///
    /// Returns a handle to the stream and its generation.
    pub fn wait_connected(&self) -> Result<(TcpStream, u64), LinkError> {
        let mut state = self.state.lock();
        loop {
            if state.closed || self.shutdown.is_triggered() {
                return Err(LinkError::Shutdown);
            }
            if let Some(stream) = &state.stream {
                return Ok((stream.try_clone()?, state.generation));
            }
            self.changed.wait_for(&mut state, WAIT_SLICE);
        }
    }

    /// Mark the stream of `generation` as failed.
    ///
    /// Returns `true` for the one caller that took the stream down; that
    /// caller owns reconnection. Returns `false` if the generation was already
    /// replaced or invalidated.
    pub fn invalidate(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        match state.stream.take() {
            Some(stream) => {
                let _ = stream.shutdown(SocketShutdown::Both);
                debug!(generation, "Edge stream invalidated");
                true
            }
            None => false,
        }
    }

    /// Check whether a stream is installed.
    pub fn is_connected(&self) -> bool {
        self.state.lock().stream.is_some()
    }

    /// Check whether the slot was closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed || self.shutdown.is_triggered()
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Shut the stream down for good and wake every waiter.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        if let Some(stream) = state.stream.take() {
            let _ = stream.shutdown(SocketShutdown::Both);
        }
        self.changed.notify_all();
    }
}
