// Copyright (c) 2024 Botho Foundation

//! Client-facing listener.
//!
//! One I/O thread owns every client socket and drives them from a mio
//! readiness loop. A second thread drains processed replies and hands them to
//! the I/O thread through a bounded channel, waking the poll with a
//! [`Waker`].
//!
//! Each client connection is one channel. Clients send `[u32 len][payload]`
//! frames whose length is fixed by the channel phase: the first frame is the
//! establish payload, every later one a steady-state message. A channel that
//! already sent its message for the current round is not read from at all
//! until the round closes, so excess traffic waits in the client's socket
//! instead of in relay memory.
//!
//! A frame of the wrong length is discarded using its length prefix and the
//! channel stays open. Only a prefix above `max_frame_len` closes it, since
//! the stream can no longer be trusted to realign.

use crossbeam_channel::{bounded, select, Receiver, Sender};
use mio::{
    event::Event,
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Registry, Token, Waker,
};
use std::{
    collections::HashMap,
    io::{self, Read, Write},
    mem,
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info, warn};

use crate::{
    channel::{Channel, ChannelId, ChannelRegistry},
    message::{Framing, MessageType, MixMessage},
    metrics::ListenerMetrics,
    network::{
        frame::{encode_client_frame, LENGTH_PREFIX_LEN},
        ConnectionLimiter, ListenerError,
    },
    queue::{MixQueues, QueueError, Shutdown, DEFAULT_QUEUE_CAPACITY},
};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CLIENT: usize = 2;
/// Bytes of a discarded frame read per step.
const DISCARD_CHUNK: usize = 4096;

/// Settings of the client listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind.
    pub bind: SocketAddr,
    /// Connections accepted per readiness cycle at most.
    pub backlog: usize,
    /// Longest wait for readiness events before housekeeping runs.
    pub accept_timeout: Duration,
    /// Maximum client connections.
    pub max_connections: usize,
    /// Maximum client connections per IP address (0 = unlimited).
    pub max_connections_per_ip: u32,
    /// Payload sizes at this relay.
    pub framing: Framing,
    /// Largest client frame skipped instead of closing the channel.
    pub max_frame_len: usize,
    /// This relay is also the last of the cascade.
    pub is_last: bool,
}

/// Running client listener.
#[derive(Debug)]
pub struct ClientListener {
    local_addr: SocketAddr,
    waker: Arc<Waker>,
    limiter: Arc<ConnectionLimiter>,
    metrics: Arc<ListenerMetrics>,
    threads: Vec<JoinHandle<()>>,
}

impl ClientListener {
    /// Bind and spawn the I/O and reply drain threads.
    ///
    /// A bind failure is returned to the caller.
    pub fn start(
        config: ListenerConfig,
        registry: Arc<ChannelRegistry>,
        queues: MixQueues,
        shutdown: Shutdown,
    ) -> Result<Self, ListenerError> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.bind).map_err(|source| ListenerError::Bind {
            addr: config.bind,
            source,
        })?;
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let limiter = Arc::new(ConnectionLimiter::new(
            config.max_connections,
            config.max_connections_per_ip,
        ));
        let metrics = Arc::new(ListenerMetrics::new());
        let (outbox_tx, outbox_rx) = bounded(DEFAULT_QUEUE_CAPACITY);

        let event_loop = EventLoop {
            poll,
            listener,
            conns: HashMap::new(),
            tokens: HashMap::new(),
            next_token: FIRST_CLIENT,
            outbox: outbox_rx,
            seen_round: registry.request_round(),
            core: Core {
                framing: config.framing,
                max_frame_len: config.max_frame_len,
                is_last: config.is_last,
                registry,
                queues: queues.clone(),
                limiter: Arc::clone(&limiter),
                metrics: Arc::clone(&metrics),
            },
            backlog: config.backlog.max(1),
            accept_timeout: config.accept_timeout,
            shutdown: shutdown.clone(),
        };
        let drain = ReplyDrain {
            queues,
            outbox: outbox_tx,
            waker: Arc::clone(&waker),
            shutdown,
        };

        let threads = vec![
            thread::Builder::new()
                .name("client-io".to_string())
                .spawn(move || event_loop.run())?,
            thread::Builder::new()
                .name("reply-drain".to_string())
                .spawn(move || drain.run())?,
        ];

        info!(listen = %local_addr, "Client listener started");
        Ok(Self {
            local_addr,
            waker,
            limiter,
            metrics,
            threads,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Listener metrics.
    pub fn metrics(&self) -> &Arc<ListenerMetrics> {
        &self.metrics
    }

    /// Number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.limiter.total_connections()
    }

    /// Join both threads once the shutdown signal has fired.
    pub fn stop(self) {
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake client I/O thread");
        }
        for handle in self.threads {
            if handle.join().is_err() {
                error!("Client listener thread panicked");
            }
        }
    }
}

/// Reasons a client connection is torn down.
#[derive(Debug)]
enum ConnFault {
    Closed,
    Io(io::Error),
    TooLong { len: usize, max: usize },
    Shutdown,
}

impl From<io::Error> for ConnFault {
    fn from(e: io::Error) -> Self {
        ConnFault::Io(e)
    }
}

impl From<QueueError> for ConnFault {
    fn from(_: QueueError) -> Self {
        ConnFault::Shutdown
    }
}

/// Shared, read-only context of the I/O thread.
struct Core {
    framing: Framing,
    max_frame_len: usize,
    is_last: bool,
    registry: Arc<ChannelRegistry>,
    queues: MixQueues,
    limiter: Arc<ConnectionLimiter>,
    metrics: Arc<ListenerMetrics>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadStage {
    Prefix,
    Payload,
    Discard { remaining: usize },
}

/// One client socket and its buffers. Only the I/O thread touches it.
struct ClientConnection {
    token: Token,
    stream: TcpStream,
    peer: SocketAddr,
    channel: Arc<Channel>,

    stage: ReadStage,
    inbound: Vec<u8>,
    filled: usize,
    read_paused: bool,

    outbound: Vec<u8>,
    written: usize,
    pending_replies: u64,

    registered: Option<Interest>,
}

impl ClientConnection {
    fn new(token: Token, stream: TcpStream, peer: SocketAddr, channel: Arc<Channel>) -> Self {
        Self {
            token,
            stream,
            peer,
            channel,
            stage: ReadStage::Prefix,
            inbound: vec![0; LENGTH_PREFIX_LEN],
            filled: 0,
            read_paused: false,
            outbound: Vec::new(),
            written: 0,
            pending_replies: 0,
            registered: None,
        }
    }

    /// Payload length of the next frame for the channel's phase.
    fn expected_len(&self, framing: &Framing) -> usize {
        let kind = if self.channel.is_established() {
            MessageType::ChannelMessage
        } else {
            MessageType::ChannelEstablish
        };
        framing.inbound_len(kind).unwrap_or(0)
    }

    /// Read until the socket would block or the channel has sent for this round.
    fn on_readable(&mut self, core: &Core) -> Result<(), ConnFault> {
        loop {
            if self.stage == ReadStage::Prefix
                && self.filled == 0
                && self.channel.has_request_in_round()
            {
                if !self.read_paused {
                    self.read_paused = true;
                    ListenerMetrics::inc(&core.metrics.deferred_reads);
                    debug!(channel = %self.channel.id(), "Read deferred to next round");
                }
                return Ok(());
            }

            match self.stream.read(&mut self.inbound[self.filled..]) {
                Ok(0) => return Err(ConnFault::Closed),
                Ok(n) => {
                    self.filled += n;
                    if self.filled == self.inbound.len() {
                        self.complete_stage(core)?;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn complete_stage(&mut self, core: &Core) -> Result<(), ConnFault> {
        match self.stage {
            ReadStage::Prefix => {
                let mut len = [0u8; LENGTH_PREFIX_LEN];
                len.copy_from_slice(&self.inbound);
                let actual = u32::from_be_bytes(len) as usize;
                let expected = self.expected_len(&core.framing);
                if actual > core.max_frame_len {
                    return Err(ConnFault::TooLong {
                        len: actual,
                        max: core.max_frame_len,
                    });
                }
                self.filled = 0;
                if actual != expected {
                    ListenerMetrics::inc(&core.metrics.protocol_faults);
                    warn!(
                        channel = %self.channel.id(),
                        peer = %self.peer,
                        expected,
                        actual,
                        "Client frame length mismatch, skipping"
                    );
                    self.discard(actual);
                    return Ok(());
                }
                self.stage = ReadStage::Payload;
                self.inbound = vec![0; actual];
            }
            ReadStage::Discard { remaining } => {
                self.filled = 0;
                self.discard(remaining - self.inbound.len());
            }
            ReadStage::Payload => {
                let payload = mem::replace(&mut self.inbound, vec![0; LENGTH_PREFIX_LEN]);
                self.stage = ReadStage::Prefix;
                self.filled = 0;

                let channel = self.channel.id();
                if !self.channel.try_claim_request() {
                    warn!(%channel, "Second message in round, dropped");
                    return Ok(());
                }
                let msg = if self.channel.is_established() {
                    MixMessage::ChannelMessage { channel, payload }
                } else {
                    self.channel.set_established();
                    MixMessage::ChannelEstablish { channel, payload }
                };
                self.channel.touch();
                core.queues.enqueue_request(msg)?;
                ListenerMetrics::inc(&core.metrics.requests_enqueued);
            }
        }
        Ok(())
    }

    /// Skip the next `remaining` bytes, then expect a length prefix again.
    fn discard(&mut self, remaining: usize) {
        if remaining == 0 {
            self.stage = ReadStage::Prefix;
            self.inbound = vec![0; LENGTH_PREFIX_LEN];
        } else {
            self.stage = ReadStage::Discard { remaining };
            self.inbound = vec![0; remaining.min(DISCARD_CHUNK)];
        }
    }

    /// Append a length-prefixed reply to the outbound buffer.
    fn stage_reply(&mut self, payload: &[u8]) {
        self.outbound.extend_from_slice(&encode_client_frame(payload));
        self.pending_replies += 1;
    }

    /// Write as much of the outbound buffer as the socket takes.
    fn on_writable(&mut self, core: &Core) -> Result<(), ConnFault> {
        while self.written < self.outbound.len() {
            match self.stream.write(&self.outbound[self.written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.outbound.clear();
        self.written = 0;
        core.metrics
            .replies_written
            .fetch_add(mem::take(&mut self.pending_replies), Ordering::Relaxed);
        Ok(())
    }

    /// Register the interest matching the connection's state.
    fn update_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let mut want = None;
        if !self.read_paused {
            want = Some(Interest::READABLE);
        }
        if self.written < self.outbound.len() {
            want = Some(want.map_or(Interest::WRITABLE, |i: Interest| i | Interest::WRITABLE));
        }
        match (self.registered, want) {
            (None, None) => {}
            (Some(_), None) => registry.deregister(&mut self.stream)?,
            (None, Some(interest)) => registry.register(&mut self.stream, self.token, interest)?,
            (Some(current), Some(interest)) if current != interest => {
                registry.reregister(&mut self.stream, self.token, interest)?
            }
            (Some(_), Some(_)) => {}
        }
        self.registered = want;
        Ok(())
    }
}

struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    conns: HashMap<Token, ClientConnection>,
    tokens: HashMap<ChannelId, Token>,
    next_token: usize,
    outbox: Receiver<(ChannelId, Vec<u8>)>,
    seen_round: u64,
    core: Core,
    backlog: usize,
    accept_timeout: Duration,
    shutdown: Shutdown,
}

impl EventLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(1024);
        let mut accept_pending = false;
        let mut rng = rand::thread_rng();

        while !self.shutdown.is_triggered() {
            let timeout = if accept_pending {
                Duration::ZERO
            } else {
                self.accept_timeout
            };
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Client poll failed");
                break;
            }

            let mut accept_now = accept_pending;
            for event in events.iter() {
                match event.token() {
                    LISTENER => accept_now = true,
                    WAKER => {}
                    token => self.on_event(token, event),
                }
            }
            if accept_now {
                accept_pending = self.accept_batch(&mut rng);
            }
            self.deliver_replies();
            self.resume_deferred();
        }

        self.close_all();
        debug!("Client I/O thread stopped");
    }

    /// Accept up to `backlog` connections. Returns `true` if more may be waiting.
    fn accept_batch(&mut self, rng: &mut impl rand::Rng) -> bool {
        for _ in 0..self.backlog {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Client accept failed");
                    return false;
                }
            };

            if self.core.limiter.try_connect(peer.ip()).is_err() {
                ListenerMetrics::inc(&self.core.metrics.rejected);
                continue;
            }
            let _ = stream.set_nodelay(true);

            let channel = self.core.registry.create_random(rng);
            let token = Token(self.next_token);
            self.next_token += 1;

            let mut conn = ClientConnection::new(token, stream, peer, Arc::clone(&channel));
            if let Err(e) = conn.update_interest(self.poll.registry()) {
                warn!(%peer, error = %e, "Failed to register client");
                self.core.limiter.disconnect(&peer.ip());
                let _ = self.core.registry.remove(channel.id());
                continue;
            }
            self.tokens.insert(channel.id(), token);
            self.conns.insert(token, conn);
            ListenerMetrics::inc(&self.core.metrics.accepted);
            debug!(%peer, channel = %channel.id(), "Client connected");
        }
        true
    }

    fn on_event(&mut self, token: Token, event: &Event) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        let mut result = Ok(());
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            result = conn.on_readable(&self.core);
        }
        if result.is_ok() && event.is_writable() {
            result = conn.on_writable(&self.core);
        }
        let result = result.and_then(|()| {
            conn.update_interest(self.poll.registry())
                .map_err(ConnFault::from)
        });
        if let Err(fault) = result {
            self.teardown(token, fault);
        }
    }

    /// Move replies handed over by the drain thread into client buffers.
    fn deliver_replies(&mut self) {
        while let Ok((channel, payload)) = self.outbox.try_recv() {
            let Some(token) = self.tokens.get(&channel).copied() else {
                debug!(%channel, "Reply for disconnected client dropped");
                continue;
            };
            let Some(conn) = self.conns.get_mut(&token) else {
                continue;
            };
            conn.stage_reply(&payload);
            let result = conn.on_writable(&self.core).and_then(|()| {
                conn.update_interest(self.poll.registry())
                    .map_err(ConnFault::from)
            });
            if let Err(fault) = result {
                self.teardown(token, fault);
            }
        }
    }

    /// Re-arm reads paused in a round that has since closed.
    fn resume_deferred(&mut self) {
        let round = self.core.registry.request_round();
        if round == self.seen_round {
            return;
        }
        self.seen_round = round;

        let paused: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, c)| c.read_paused)
            .map(|(t, _)| *t)
            .collect();
        for token in paused {
            let Some(conn) = self.conns.get_mut(&token) else {
                continue;
            };
            conn.read_paused = false;
            let result = conn.on_readable(&self.core).and_then(|()| {
                conn.update_interest(self.poll.registry())
                    .map_err(ConnFault::from)
            });
            if let Err(fault) = result {
                self.teardown(token, fault);
            }
        }
    }

    /// Remove a client: deregister, release the channel downstream, forget it.
    fn teardown(&mut self, token: Token, fault: ConnFault) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        let channel = conn.channel.id();
        match &fault {
            ConnFault::Closed => debug!(%channel, peer = %conn.peer, "Client disconnected"),
            ConnFault::Io(e) => warn!(%channel, peer = %conn.peer, error = %e, "Client I/O error"),
            ConnFault::TooLong { len, max } => {
                ListenerMetrics::inc(&self.core.metrics.protocol_faults);
                warn!(%channel, peer = %conn.peer, len, max, "Client frame too long");
            }
            ConnFault::Shutdown => {}
        }

        if conn.registered.is_some() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
        self.tokens.remove(&channel);
        self.core.limiter.disconnect(&conn.peer.ip());

        if !self.core.is_last && !matches!(fault, ConnFault::Shutdown) {
            if let Err(e) = self
                .core
                .queues
                .enqueue_request(MixMessage::ChannelRelease { channel })
            {
                debug!(%channel, error = %e, "Release not enqueued");
            }
        }
        let _ = self.core.registry.remove(channel);
        ListenerMetrics::inc(&self.core.metrics.disconnects);
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        for token in tokens {
            self.teardown(token, ConnFault::Shutdown);
        }
    }
}

/// Moves processed replies from the reply queue to the I/O thread.
struct ReplyDrain {
    queues: MixQueues,
    outbox: Sender<(ChannelId, Vec<u8>)>,
    waker: Arc<Waker>,
    shutdown: Shutdown,
}

impl ReplyDrain {
    fn run(self) {
        loop {
            let (channel, payload) = match self.queues.next_processed_reply() {
                Ok(MixMessage::Reply { channel, payload }) => (channel, payload),
                Ok(other) => {
                    warn!(kind = %other.message_type(), "Non-reply in the reply queue, dropped");
                    continue;
                }
                Err(_) => break,
            };
            let sent = select! {
                send(self.outbox, (channel, payload)) -> res => res.is_ok(),
                recv(self.shutdown.signal()) -> _ => false,
            };
            if !sent {
                break;
            }
            if let Err(e) = self.waker.wake() {
                warn!(error = %e, "Failed to wake client I/O thread");
            }
        }
        debug!("Reply drain stopped");
    }
}
