// Copyright (c) 2024 Botho Foundation

//! Integration tests for the client-facing listener on a single relay
//! cascade (first and last relay at once).

mod common;

use common::*;
use std::time::Duration;

#[test]
fn test_single_relay_echoes_requests() {
    let cascade = TestCascade::start(1);
    let mut client = TestClient::connect(cascade.client_addr());

    let establish: Vec<u8> = (0..cascade.establish_len() as u8).collect();
    client.send(&establish);
    let data = client.recv_data_until(ESTABLISH_BASE, TIMEOUT);
    assert_eq!(data, establish[HEADER_UNIT..]);

    let message = vec![0xab; cascade.message_len()];
    client.send(&message);
    let data = client.recv_data_until(MESSAGE_BASE, TIMEOUT);
    assert_eq!(data, message[HEADER_UNIT..]);

    let listener = cascade.relays[0].status().listener.unwrap();
    assert_eq!(listener.accepted, 1);
    assert_eq!(listener.requests_enqueued, 2);
    assert!(wait_for(TIMEOUT, || {
        cascade.relays[0].status().listener.unwrap().replies_written >= 2
    }));

    client.close();
    cascade.stop();
}

#[test]
fn test_replies_are_block_aligned() {
    let cascade = TestCascade::start(1);
    let mut client = TestClient::connect(cascade.client_addr());

    client.send(&vec![1; cascade.establish_len()]);
    for _ in 0..3 {
        let payload = client.recv().unwrap();
        assert_eq!(payload.len() % 16, 0);
    }

    client.close();
    cascade.stop();
}

#[test]
fn test_wrong_length_is_skipped() {
    let cascade = TestCascade::start(1);
    let mut client = TestClient::connect(cascade.client_addr());
    assert!(wait_for(TIMEOUT, || cascade.relays[0].registry().len() == 1));

    // The next frame still lines up after the bad one
    client.send(&vec![0; cascade.establish_len() + 1]);
    let establish = vec![7u8; cascade.establish_len()];
    client.send(&establish);
    let data = client.recv_data_until(ESTABLISH_BASE, TIMEOUT);
    assert_eq!(data, establish[HEADER_UNIT..]);

    let listener = cascade.relays[0].status().listener.unwrap();
    assert_eq!(listener.protocol_faults, 1);
    assert_eq!(listener.requests_enqueued, 1);
    assert_eq!(listener.disconnects, 0);
    assert_eq!(cascade.relays[0].registry().len(), 1);

    client.close();
    cascade.stop();
}

#[test]
fn test_empty_frame_is_skipped() {
    let cascade = TestCascade::start(1);
    let mut client = TestClient::connect(cascade.client_addr());

    client.send(&[]);
    let establish = vec![3u8; cascade.establish_len()];
    client.send(&establish);
    let data = client.recv_data_until(ESTABLISH_BASE, TIMEOUT);
    assert_eq!(data, establish[HEADER_UNIT..]);
    assert_eq!(
        cascade.relays[0].status().listener.unwrap().protocol_faults,
        1
    );

    client.close();
    cascade.stop();
}

#[test]
fn test_oversized_frame_closes_channel() {
    let cascade = TestCascade::start(1);
    let mut client = TestClient::connect(cascade.client_addr());
    assert!(wait_for(TIMEOUT, || cascade.relays[0].registry().len() == 1));

    client.send_raw(&(1u32 << 21).to_be_bytes());
    assert!(client.is_closed());

    assert!(wait_for(TIMEOUT, || cascade.relays[0].registry().is_empty()));
    let listener = cascade.relays[0].status().listener.unwrap();
    assert_eq!(listener.protocol_faults, 1);
    assert_eq!(listener.disconnects, 1);

    cascade.stop();
}

#[test]
fn test_per_ip_cap_refuses_extra_clients() {
    let cascade = TestCascade::start_with(1, |_, config| config.listener.max_per_ip = 1);

    let _first = TestClient::connect(cascade.client_addr());
    assert!(wait_for(TIMEOUT, || cascade.relays[0].registry().len() == 1));

    let mut second = TestClient::connect(cascade.client_addr());
    assert!(second.is_closed());

    let listener = cascade.relays[0].status().listener.unwrap();
    assert_eq!(listener.accepted, 1);
    assert_eq!(listener.rejected, 1);
    assert_eq!(cascade.relays[0].registry().len(), 1);

    cascade.stop();
}

#[test]
fn test_second_request_waits_for_next_round() {
    // Rounds of two close only on timeout with a single client
    let cascade = TestCascade::start_with(1, |_, config| {
        config.mixing.round_size = 2;
        config.mixing.round_timeout_ms = 500;
    });
    let mut client = TestClient::connect(cascade.client_addr());

    client.send(&vec![1; cascade.establish_len()]);
    client.send(&vec![2; cascade.message_len()]);

    let data = client.recv_data_until(ESTABLISH_BASE + MESSAGE_BASE, TIMEOUT);
    assert_eq!(data[..ESTABLISH_BASE], vec![1; ESTABLISH_BASE][..]);
    assert_eq!(data[ESTABLISH_BASE..], vec![2; MESSAGE_BASE][..]);

    let listener = cascade.relays[0].status().listener.unwrap();
    assert!(listener.deferred_reads >= 1);
    assert!(wait_for(TIMEOUT, || cascade.relays[0].registry().request_round() >= 2));

    client.close();
    cascade.stop();
}

#[test]
fn test_disconnect_removes_channel() {
    let cascade = TestCascade::start(1);
    let mut client = TestClient::connect(cascade.client_addr());
    client.send(&vec![1; cascade.establish_len()]);
    client.recv_data_until(ESTABLISH_BASE, TIMEOUT);
    assert_eq!(cascade.relays[0].registry().len(), 1);

    client.close();
    assert!(wait_for(TIMEOUT, || cascade.relays[0].registry().is_empty()));
    assert!(wait_for(Duration::from_secs(1), || {
        cascade.relays[0].status().listener.unwrap().disconnects == 1
    }));

    cascade.stop();
}
