// Copyright (c) 2024 Botho Foundation

//! Link from this relay to the next relay of the cascade.
//!
//! The sender thread multiplexes processed requests onto the edge; the
//! receiver thread demultiplexes replies. Both share one [`EdgeConnection`]
//! and redial the next relay whenever the stream fails.

use std::{
    io::Write,
    net::{SocketAddr, TcpStream},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info, warn};

use crate::{
    channel::ChannelRegistry,
    crypto::{Direction, EdgeKey, HeaderCipher, KeyExchange},
    message::{MessageType, MixMessage},
    metrics::LinkMetrics,
    network::{
        frame::{encode_frame, read_frame_head, read_payload, skip_payload, MultiplexHeader},
        LinkError,
    },
    queue::{MixQueues, Shutdown},
};

use super::{EdgeConnection, EdgeIdTable};

/// Time allowed for one TCP connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings of the upstream link.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Edge listener of the next relay.
    pub peer: SocketAddr,
    /// Key information port of the next relay.
    pub info_port: u16,
    /// Pause between reconnect attempts.
    pub reconnect_backoff: Duration,
    /// Largest frame accepted from the next relay.
    pub max_frame_len: usize,
}

/// Dials the next relay until a stream is up.
#[derive(Debug)]
struct Dialer {
    peer: SocketAddr,
    backoff: Duration,
    conn: Arc<EdgeConnection>,
    metrics: Arc<LinkMetrics>,
}

impl Dialer {
    fn dial(&self) -> Result<(), LinkError> {
        let mut attempts = 0u64;
        loop {
            if self.conn.is_closed() {
                return Err(LinkError::Shutdown);
            }
            match TcpStream::connect_timeout(&self.peer, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let generation = self.conn.install(stream);
                    self.metrics.record_connection();
                    info!(peer = %self.peer, generation, "Connected to next relay");
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    warn!(peer = %self.peer, attempts, error = %e, "Connect to next relay failed, retrying");
                    // Sleep in slices so close() is noticed promptly
                    let mut waited = Duration::ZERO;
                    while waited < self.backoff {
                        if self.conn.is_closed() {
                            return Err(LinkError::Shutdown);
                        }
                        let slice = (self.backoff - waited).min(Duration::from_millis(50));
                        thread::sleep(slice);
                        waited += slice;
                    }
                }
            }
        }
    }

    /// Handle a failure seen on `generation`.
    fn recover(&self, generation: u64) -> Result<(), LinkError> {
        if self.conn.invalidate(generation) {
            self.dial()
        } else {
            Ok(())
        }
    }
}

/// Running upstream link.
#[derive(Debug)]
pub struct UpstreamLink {
    conn: Arc<EdgeConnection>,
    table: Arc<EdgeIdTable>,
    metrics: Arc<LinkMetrics>,
    threads: Vec<JoinHandle<()>>,
}

impl UpstreamLink {
    /// Fetch the edge key and spawn the sender and receiver threads.
    ///
    /// The sender dials the next relay; until then both threads wait.
    pub fn start(
        config: UpstreamConfig,
        key_exchange: &dyn KeyExchange,
        registry: Arc<ChannelRegistry>,
        queues: MixQueues,
        shutdown: Shutdown,
    ) -> Result<Self, LinkError> {
        let key = key_exchange.fetch_edge_key(config.peer, config.info_port)?;
        info!(peer = %config.peer, key = ?key, "Fetched edge key from next relay");

        let conn = Arc::new(EdgeConnection::new(shutdown));
        let table = Arc::new(EdgeIdTable::new());
        let metrics = Arc::new(LinkMetrics::new());
        let dialer = Arc::new(Dialer {
            peer: config.peer,
            backoff: config.reconnect_backoff,
            conn: Arc::clone(&conn),
            metrics: Arc::clone(&metrics),
        });

        let sender = Sender {
            key: key.clone(),
            dialer: Arc::clone(&dialer),
            table: Arc::clone(&table),
            queues: queues.clone(),
            metrics: Arc::clone(&metrics),
        };
        let receiver = Receiver {
            key,
            dialer,
            table: Arc::clone(&table),
            registry,
            queues,
            metrics: Arc::clone(&metrics),
            max_frame_len: config.max_frame_len,
        };

        let threads = vec![
            thread::Builder::new()
                .name("upstream-send".to_string())
                .spawn(move || sender.run())?,
            thread::Builder::new()
                .name("upstream-recv".to_string())
                .spawn(move || receiver.run())?,
        ];

        Ok(Self {
            conn,
            table,
            metrics,
            threads,
        })
    }

    /// Edge id translation table of this link.
    pub fn table(&self) -> &Arc<EdgeIdTable> {
        &self.table
    }

    /// Link metrics.
    pub fn metrics(&self) -> &Arc<LinkMetrics> {
        &self.metrics
    }

    /// Check whether the edge stream is currently up.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Close the edge and join both threads.
    pub fn stop(self) {
        self.conn.close();
        for handle in self.threads {
            if handle.join().is_err() {
                error!("Upstream link thread panicked");
            }
        }
    }
}

struct Sender {
    key: EdgeKey,
    dialer: Arc<Dialer>,
    table: Arc<EdgeIdTable>,
    queues: MixQueues,
    metrics: Arc<LinkMetrics>,
}

impl Sender {
    fn run(self) {
        if self.dialer.dial().is_err() {
            return;
        }
        let mut cipher = HeaderCipher::new(&self.key, Direction::Requests);
        let mut generation = 0u64;
        let mut rng = rand::thread_rng();

        loop {
            let msg = match self.queues.next_processed_request() {
                Ok(msg) => msg,
                Err(_) => break,
            };

            let (header, payload) = match &msg {
                MixMessage::ChannelEstablish { channel, payload } => {
                    let edge = self.table.allocate(*channel, &mut rng);
                    (
                        MultiplexHeader::channel(MessageType::ChannelEstablish, edge),
                        payload.as_slice(),
                    )
                }
                MixMessage::ChannelMessage { channel, payload } => {
                    let Some(edge) = self.table.edge_id(*channel) else {
                        warn!(channel = %channel, "Message for channel unknown upstream, dropped");
                        continue;
                    };
                    (
                        MultiplexHeader::channel(MessageType::ChannelMessage, edge),
                        payload.as_slice(),
                    )
                }
                MixMessage::ChannelRelease { channel } => {
                    let Some(edge) = self.table.edge_id(*channel) else {
                        debug!(channel = %channel, "Release for channel never established upstream");
                        continue;
                    };
                    (
                        MultiplexHeader::channel(MessageType::ChannelRelease, edge),
                        &[][..],
                    )
                }
                MixMessage::BatchSize { size } => (MultiplexHeader::batch_size(*size), &[][..]),
                MixMessage::Reply { channel, .. } => {
                    warn!(channel = %channel, "Reply in the request queue, dropped");
                    continue;
                }
            };

            match self.send(&mut cipher, &mut generation, header, payload) {
                Ok(()) => {}
                Err(LinkError::Shutdown) => break,
                Err(e) => {
                    error!(error = %e, "Failed to encode frame for next relay");
                    continue;
                }
            }

            if let MixMessage::ChannelRelease { channel } = msg {
                self.table.remove_local(channel);
            }
        }
        debug!("Upstream sender stopped");
    }

    /// Write one frame, retrying on fresh connections until it goes out.
    fn send(
        &self,
        cipher: &mut HeaderCipher,
        generation: &mut u64,
        header: MultiplexHeader,
        payload: &[u8],
    ) -> Result<(), LinkError> {
        loop {
            let (mut stream, gen) = self.dialer.conn.wait_connected()?;
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
                    warn!(peer = %self.dialer.peer, error = %e, "Write to next relay failed, reconnecting");
                    self.dialer.recover(gen)?;
                }
            }
        }
    }
}

struct Receiver {
    key: EdgeKey,
    dialer: Arc<Dialer>,
    table: Arc<EdgeIdTable>,
    registry: Arc<ChannelRegistry>,
    queues: MixQueues,
    metrics: Arc<LinkMetrics>,
    max_frame_len: usize,
}

impl Receiver {
    fn run(self) {
        let mut cipher = HeaderCipher::new(&self.key, Direction::Replies);
        let mut generation = 0u64;

        loop {
            let (mut stream, gen) = match self.dialer.conn.wait_connected() {
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
                    if self.dialer.conn.is_closed() {
                        break;
                    }
                    warn!(peer = %self.dialer.peer, error = %e, "Read from next relay failed, reconnecting");
                    if self.dialer.recover(gen).is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Upstream receiver stopped");
    }

    fn receive_one(
        &self,
        stream: &mut TcpStream,
        cipher: &mut HeaderCipher,
    ) -> Result<(), LinkError> {
        let head = read_frame_head(stream, cipher, self.max_frame_len)?;

        if head.header.message_type() != Some(MessageType::Reply) {
            warn!(kind = head.header.kind, "Unexpected message from next relay, skipping");
            let skipped = skip_payload(stream, &head)?;
            self.metrics.record_fault(skipped);
            return Ok(());
        }

        let edge = head.header.edge_id();
        let channel = self
            .table
            .local_id(edge)
            .and_then(|local| self.registry.lookup(local).ok());
        let Some(channel) = channel else {
            warn!(edge = %edge, "Reply for unknown channel, skipping");
            let skipped = skip_payload(stream, &head)?;
            self.metrics.record_fault(skipped);
            return Ok(());
        };
        if !channel.try_claim_reply() {
            warn!(channel = %channel.id(), "Second reply in round, skipping");
            let skipped = skip_payload(stream, &head)?;
            self.metrics.record_fault(skipped);
            return Ok(());
        }

        let payload = read_payload(stream, &head)?;
        self.metrics.record_received(head.wire_len());
        channel.touch();
        self.queues.enqueue_reply(MixMessage::Reply {
            channel: channel.id(),
            payload,
        })?;
        Ok(())
    }
}
