// Copyright (c) 2024 Botho Foundation

//! Link from the previous relay of the cascade to this relay.
//!
//! The acceptor thread takes the previous relay's connection (and every
//! reconnection). The receiver thread turns the multiplexed stream into local
//! channels and requests; the sender thread multiplexes replies back.
//!
//! The previous relay opens every round with a batch size message. The
//! receiver closes the local request round there and hands the marker to the
//! mixer, so the next round's messages are accepted even while this relay is
//! still mixing the last one.

use mio::{Events, Interest, Poll, Token, Waker};
use std::{
    io::{self, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info, warn};

use crate::{
    channel::{Channel, ChannelId, ChannelRegistry},
    crypto::{Direction, EdgeKey, HeaderCipher, KeyExchange},
    message::{Framing, MessageType, MixMessage},
    metrics::LinkMetrics,
    network::{
        frame::{
            encode_frame, frame_len, read_frame_head, read_payload, skip_payload, FrameHead,
            MultiplexHeader, HEADER_LEN,
        },
        LinkError,
    },
    queue::{MixQueues, Shutdown},
};

use super::{EdgeConnection, EdgeIdTable};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// Longest readiness wait before the acceptor re-checks for shutdown.
const ACCEPT_WAIT: Duration = Duration::from_millis(250);

/// Settings of the downstream link.
#[derive(Debug, Clone)]
pub struct DownstreamConfig {
    /// Address the edge listener binds to.
    pub listen: SocketAddr,
    /// Largest frame accepted from the previous relay.
    pub max_frame_len: usize,
    /// Payload sizes at this relay.
    pub framing: Framing,
    /// This relay is the last of the cascade.
    pub is_last: bool,
}

/// Running downstream link.
#[derive(Debug)]
pub struct DownstreamLink {
    local_addr: SocketAddr,
    conn: Arc<EdgeConnection>,
    table: Arc<EdgeIdTable>,
    metrics: Arc<LinkMetrics>,
    waker: Arc<Waker>,
    threads: Vec<JoinHandle<()>>,
}

impl DownstreamLink {
    /// Bind the edge listener, publish a fresh edge key and spawn the
    /// acceptor, receiver and sender threads.
    pub fn start(
        config: DownstreamConfig,
        key_exchange: &dyn KeyExchange,
        registry: Arc<ChannelRegistry>,
        queues: MixQueues,
        shutdown: Shutdown,
    ) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(config.listen).map_err(|source| LinkError::Bind {
            addr: config.listen,
            source,
        })?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let poll = Poll::new()?;
        let mut readiness = mio::net::TcpListener::from_std(listener.try_clone()?);
        poll.registry()
            .register(&mut readiness, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let key = key_exchange.publish_edge_key(local_addr, EdgeKey::random(&mut rand::thread_rng()))?;
        info!(listen = %local_addr, "Edge listener ready for previous relay");

        let conn = Arc::new(EdgeConnection::new(shutdown));
        let table = Arc::new(EdgeIdTable::new());
        let metrics = Arc::new(LinkMetrics::new());

        let acceptor = Acceptor {
            poll,
            _readiness: readiness,
            listener,
            conn: Arc::clone(&conn),
            metrics: Arc::clone(&metrics),
        };
        let receiver = Receiver {
            key: key.clone(),
            conn: Arc::clone(&conn),
            table: Arc::clone(&table),
            registry,
            queues: queues.clone(),
            metrics: Arc::clone(&metrics),
            framing: config.framing,
            is_last: config.is_last,
            max_frame_len: config.max_frame_len,
        };
        let sender = Sender {
            key,
            conn: Arc::clone(&conn),
            table: Arc::clone(&table),
            queues,
            metrics: Arc::clone(&metrics),
        };

        let threads = vec![
            thread::Builder::new()
                .name("downstream-accept".to_string())
                .spawn(move || acceptor.run())?,
            thread::Builder::new()
                .name("downstream-recv".to_string())
                .spawn(move || receiver.run())?,
            thread::Builder::new()
                .name("downstream-send".to_string())
                .spawn(move || sender.run())?,
        ];

        Ok(Self {
            local_addr,
            conn,
            table,
            metrics,
            waker,
            threads,
        })
    }

    /// Address the edge listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Edge id translation table of this link.
    pub fn table(&self) -> &Arc<EdgeIdTable> {
        &self.table
    }

    /// Link metrics.
    pub fn metrics(&self) -> &Arc<LinkMetrics> {
        &self.metrics
    }

    /// Check whether the previous relay is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Drop the current stream, forcing the previous relay to reconnect.
    pub fn drop_connection(&self) -> bool {
        self.conn.invalidate(self.conn.generation())
    }

    /// Close the edge and join all threads.
    pub fn stop(self) {
        self.conn.close();
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake edge acceptor");
        }
        for handle in self.threads {
            if handle.join().is_err() {
                error!("Downstream link thread panicked");
            }
        }
    }
}

/// Waits for readiness on a registered clone of the edge listener, then
/// accepts blocking streams from the listener itself.
struct Acceptor {
    poll: Poll,
    _readiness: mio::net::TcpListener,
    listener: TcpListener,
    conn: Arc<EdgeConnection>,
    metrics: Arc<LinkMetrics>,
}

impl Acceptor {
    fn run(mut self) {
        let mut events = Events::with_capacity(8);
        while !self.conn.is_closed() {
            if let Err(e) = self.poll.poll(&mut events, Some(ACCEPT_WAIT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Edge poll failed");
                break;
            }
            if events.iter().any(|event| event.token() == LISTENER) {
                self.accept_all();
            }
        }
        debug!("Downstream acceptor stopped");
    }

    /// Accept until the listener would block.
    fn accept_all(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = Self::prepare(&stream) {
                        warn!(%peer, error = %e, "Failed to configure edge stream");
                        continue;
                    }
                    let generation = self.conn.install(stream);
                    self.metrics.record_connection();
                    info!(%peer, generation, "Previous relay connected");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Edge accept failed");
                    return;
                }
            }
        }
    }

    fn prepare(stream: &TcpStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)
    }
}

struct Receiver {
    key: EdgeKey,
    conn: Arc<EdgeConnection>,
    table: Arc<EdgeIdTable>,
    registry: Arc<ChannelRegistry>,
    queues: MixQueues,
    metrics: Arc<LinkMetrics>,
    framing: Framing,
    is_last: bool,
    max_frame_len: usize,
}

impl Receiver {
    fn run(self) {
        let mut cipher = HeaderCipher::new(&self.key, Direction::Requests);
        let mut generation = 0u64;

        loop {
            let (mut stream, gen) = match self.conn.wait_connected() {
                Ok(conn) => conn,
                Err(_) => break,
            };
            if gen != generation {
                cipher.reset();
                generation = gen;
            }

            match self.receive_one(&mut stream, &mut cipher) {
                Ok(()) => {}
                Err(LinkError::Shutdown) => break,
                Err(e) => {
                    if self.conn.is_closed() {
                        break;
                    }
                    warn!(error = %e, "Stream from previous relay lost, awaiting reconnect");
                    self.conn.invalidate(gen);
                }
            }
        }
        debug!("Downstream receiver stopped");
    }

    fn receive_one(
        &self,
        stream: &mut TcpStream,
        cipher: &mut HeaderCipher,
    ) -> Result<(), LinkError> {
        let head = read_frame_head(stream, cipher, self.max_frame_len)?;
        match head.header.message_type() {
            Some(MessageType::ChannelEstablish) => self.on_establish(stream, &head),
            Some(MessageType::ChannelMessage) => self.on_message(stream, &head),
            Some(MessageType::ChannelRelease) => self.on_release(stream, &head),
            Some(MessageType::BatchSize) => self.on_batch_size(stream, &head),
            Some(MessageType::Reply) | None => {
                warn!(kind = head.header.kind, "Unexpected message from previous relay, skipping");
                self.fault(stream, &head)
            }
        }
    }

    /// Skip the frame and count it as a protocol fault.
    fn fault(&self, stream: &mut TcpStream, head: &FrameHead) -> Result<(), LinkError> {
        let skipped = skip_payload(stream, head)?;
        self.metrics.record_fault(skipped);
        Ok(())
    }

    /// Read a fixed-size payload, or `None` if the frame has the wrong size.
    fn read_fixed(
        &self,
        stream: &mut TcpStream,
        head: &FrameHead,
        kind: MessageType,
    ) -> Result<Option<Vec<u8>>, LinkError> {
        let Some(expected) = self.framing.inbound_len(kind) else {
            return Ok(None);
        };
        if head.payload_len() != frame_len(expected) - HEADER_LEN {
            warn!(
                kind = %kind,
                expected,
                actual = head.payload_len(),
                "Payload length mismatch, skipping"
            );
            return Ok(None);
        }
        let mut payload = read_payload(stream, head)?;
        payload.truncate(expected);
        self.metrics.record_received(head.wire_len());
        Ok(Some(payload))
    }

    fn on_establish(&self, stream: &mut TcpStream, head: &FrameHead) -> Result<(), LinkError> {
        let edge = head.header.edge_id();
        if self.table.contains_edge(edge) {
            warn!(edge = %edge, "Establish for existing channel, skipping");
            return self.fault(stream, head);
        }
        let Some(payload) = self.read_fixed(stream, head, MessageType::ChannelEstablish)? else {
            return self.fault(stream, head);
        };

        let channel = self.registry.create_random(&mut rand::thread_rng());
        self.table.insert(edge, channel.id());
        channel.set_established();
        channel.try_claim_request();
        channel.touch();
        debug!(edge = %edge, channel = %channel.id(), "Channel established by previous relay");

        self.queues.enqueue_request(MixMessage::ChannelEstablish {
            channel: channel.id(),
            payload,
        })?;
        Ok(())
    }

    fn on_message(&self, stream: &mut TcpStream, head: &FrameHead) -> Result<(), LinkError> {
        let edge = head.header.edge_id();
        let Some(channel) = self.lookup(edge) else {
            warn!(edge = %edge, "Message for unknown channel, skipping");
            return self.fault(stream, head);
        };
        if channel.has_request_in_round() {
            warn!(channel = %channel.id(), "Second message in round, skipping");
            return self.fault(stream, head);
        }
        let Some(payload) = self.read_fixed(stream, head, MessageType::ChannelMessage)? else {
            return self.fault(stream, head);
        };
        if !channel.try_claim_request() {
            warn!(channel = %channel.id(), "Second message in round, dropped");
            return Ok(());
        }

        channel.touch();
        self.queues.enqueue_request(MixMessage::ChannelMessage {
            channel: channel.id(),
            payload,
        })?;
        Ok(())
    }

    /// Open the round the previous relay announces.
    fn on_batch_size(&self, stream: &mut TcpStream, head: &FrameHead) -> Result<(), LinkError> {
        skip_payload(stream, head)?;
        self.metrics.record_received(head.wire_len());

        let size = head.header.field;
        let round = self.registry.begin_request_round();
        debug!(size, round, "Round opened by previous relay");
        self.queues.enqueue_request(MixMessage::BatchSize { size })?;
        Ok(())
    }

    fn on_release(&self, stream: &mut TcpStream, head: &FrameHead) -> Result<(), LinkError> {
        skip_payload(stream, head)?;
        self.metrics.record_received(head.wire_len());

        let edge = head.header.edge_id();
        let Some(local) = self.table.remove_edge(edge) else {
            debug!(edge = %edge, "Release for unknown channel ignored");
            return Ok(());
        };
        if !self.is_last {
            self.queues
                .enqueue_request(MixMessage::ChannelRelease { channel: local })?;
        }
        let _ = self.registry.remove(local);
        debug!(edge = %edge, channel = %local, "Channel released by previous relay");
        Ok(())
    }

    fn lookup(&self, edge: ChannelId) -> Option<Arc<Channel>> {
        self.table
            .local_id(edge)
            .and_then(|local| self.registry.lookup(local).ok())
    }
}

struct Sender {
    key: EdgeKey,
    conn: Arc<EdgeConnection>,
    table: Arc<EdgeIdTable>,
    queues: MixQueues,
    metrics: Arc<LinkMetrics>,
}

impl Sender {
    fn run(self) {
        let mut cipher = HeaderCipher::new(&self.key, Direction::Replies);
        let mut generation = 0u64;

        loop {
            let msg = match self.queues.next_processed_reply() {
                Ok(msg) => msg,
                Err(_) => break,
            };
            let (channel, payload) = match msg {
                MixMessage::Reply { channel, payload } => (channel, payload),
                other => {
                    warn!(kind = %other.message_type(), "Non-reply in the reply queue, dropped");
                    continue;
                }
            };
            let Some(edge) = self.table.edge_id(channel) else {
                debug!(channel = %channel, "Reply for released channel dropped");
                continue;
            };
            let header = MultiplexHeader::channel(MessageType::Reply, edge);

            match self.send(&mut cipher, &mut generation, header, &payload) {
                Ok(()) => {}
                Err(LinkError::Shutdown) => break,
                Err(e) => error!(error = %e, "Failed to encode frame for previous relay"),
            }
        }
        debug!("Downstream sender stopped");
    }

    /// Write one frame, waiting for the previous relay to reconnect on failure.
    fn send(
        &self,
        cipher: &mut HeaderCipher,
        generation: &mut u64,
        header: MultiplexHeader,
        payload: &[u8],
    ) -> Result<(), LinkError> {
        loop {
            let (mut stream, gen) = self.conn.wait_connected()?;
            if gen != *generation {
                cipher.reset();
                *generation = gen;
            }
            let frame = encode_frame(cipher, header, payload)?;
            match stream.write_all(&frame) {
                Ok(()) => {
                    self.metrics.record_sent(frame.len());
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "Write to previous relay failed, awaiting reconnect");
                    self.conn.invalidate(gen);
                }
            }
        }
    }
}
