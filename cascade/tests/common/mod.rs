// Copyright (c) 2024 Botho Foundation
//
//! Common utilities for the socket-level integration tests.
//!
//! Every relay binds to `127.0.0.1:0`; tests read the actual addresses back
//! from the running components.
//!
//! # Example
//!
//! ```ignore
//! let cascade = TestCascade::start(3);
//! let mut client = TestClient::connect(cascade.client_addr());
//! client.send(&vec![1; cascade.establish_len()]);
//! let data = client.recv_data_until(ECHO_LEN, TIMEOUT);
//! ```

#![allow(dead_code)]

use cascade::{
    crypto::LocalKeyExchange,
    message::{decode_reply_payload, MessageType},
    network::frame::encode_client_frame,
    Config, Framing, RelayNode,
};
use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

/// Upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Processing header bytes per relay.
pub const HEADER_UNIT: usize = 4;

/// Establish payload after every relay stripped its header.
pub const ESTABLISH_BASE: usize = 12;

/// Message payload after every relay stripped its header.
pub const MESSAGE_BASE: usize = 28;

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Config of a relay at the given position, bound to loopback and tuned for
/// fast rounds.
pub fn local_config(previous_hops: u32, further_hops: u32) -> Config {
    let mut config = Config::new(previous_hops, further_hops, None);
    config.listener.bind_address = "127.0.0.1".to_string();
    config.listener.port = 0;
    config.downstream.listen = "127.0.0.1:0".to_string();
    config.upstream.reconnect_backoff_ms = 50;
    config.framing.header_unit = HEADER_UNIT;
    config.framing.establish_base = ESTABLISH_BASE;
    config.framing.message_base = MESSAGE_BASE;
    config.framing.max_reply_len = 256;
    config.mixing.round_size = 1;
    config.mixing.round_timeout_ms = 100;
    config.reply.poll_interval_ms = 10;
    config.reply.min_volume = 1;
    config.reply.min_fraction = 0.5;
    config.reply.timeout_ms = 300;
    config
}

/// Payload sizes a relay at `further_hops` expects.
pub fn framing(further_hops: u32) -> Framing {
    Framing {
        header_unit: HEADER_UNIT,
        establish_base: ESTABLISH_BASE,
        message_base: MESSAGE_BASE,
        further_hops,
    }
}

/// Relays of one cascade running in this process.
pub struct TestCascade {
    /// Relays from first to last.
    pub relays: Vec<RelayNode>,
}

impl TestCascade {
    /// Start `len` relays sharing one in-process key exchange.
    ///
    /// Relays start from the last to the first so every edge key is
    /// published before it is fetched.
    pub fn start(len: u32) -> Self {
        Self::start_with(len, |_, _| {})
    }

    /// Like [`TestCascade::start`], adjusting each relay's config first.
    pub fn start_with(len: u32, adjust: impl Fn(u32, &mut Config)) -> Self {
        assert!(len > 0);
        let key_exchange = Arc::new(LocalKeyExchange::with_fetch_timeout(TIMEOUT));
        let mut relays = Vec::new();
        let mut next_edge: Option<SocketAddr> = None;

        for position in (0..len).rev() {
            let mut config = local_config(position, len - 1 - position);
            config.upstream.address = next_edge.map(|addr| addr.to_string());
            adjust(position, &mut config);

            let relay = RelayNode::start(&config, key_exchange.clone()).unwrap();
            next_edge = relay.downstream_addr();
            relays.push(relay);
        }
        relays.reverse();
        Self { relays }
    }

    /// Address clients connect to.
    pub fn client_addr(&self) -> SocketAddr {
        self.relays[0].listener_addr().unwrap()
    }

    /// Establish payload length a client sends.
    pub fn establish_len(&self) -> usize {
        framing(self.relays.len() as u32 - 1)
            .inbound_len(MessageType::ChannelEstablish)
            .unwrap()
    }

    /// Message payload length a client sends.
    pub fn message_len(&self) -> usize {
        framing(self.relays.len() as u32 - 1)
            .inbound_len(MessageType::ChannelMessage)
            .unwrap()
    }

    /// Wait until every edge between the relays is up.
    pub fn wait_linked(&self) -> bool {
        wait_for(TIMEOUT, || {
            self.relays.iter().all(|relay| {
                let status = relay.status();
                status.upstream_connected.unwrap_or(true)
                    && status.downstream_connected.unwrap_or(true)
            })
        })
    }

    /// Stop every relay.
    pub fn stop(mut self) {
        for relay in &mut self.relays {
            relay.shutdown();
        }
    }
}

/// Blocking client speaking the length-prefixed client protocol.
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    /// Connect to a first relay.
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream.set_nodelay(true).unwrap();
        Self { stream }
    }

    /// Send one frame.
    pub fn send(&mut self, payload: &[u8]) {
        self.stream.write_all(&encode_client_frame(payload)).unwrap();
    }

    /// Write bytes as they are, without framing.
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Receive one frame's payload.
    pub fn recv(&mut self) -> io::Result<Vec<u8>> {
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len)?;
        let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
        self.stream.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Collect reply data, dropping padding, until `len` bytes arrived.
    pub fn recv_data_until(&mut self, len: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut data = Vec::new();
        while data.len() < len && Instant::now() < deadline {
            let payload = self.recv().unwrap();
            data.extend_from_slice(decode_reply_payload(&payload).unwrap());
        }
        data
    }

    /// Check whether the relay closed the connection.
    pub fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return true,
                Err(_) => return false,
            }
        }
    }

    /// Close the connection.
    pub fn close(self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
