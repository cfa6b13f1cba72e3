// Copyright (c) 2024 Botho Foundation

//! Messages exchanged between the I/O core and the mixing strategy.
//!
//! # Message Types
//!
//! | Discriminant | Variant | Payload |
//! |---|---|---|
//! | 1 | [`MixMessage::ChannelEstablish`] | fixed size, shrinks per hop |
//! | 2 | [`MixMessage::ChannelMessage`] | fixed size, shrinks per hop |
//! | 3 | [`MixMessage::ChannelRelease`] | none |
//! | 4 | [`MixMessage::BatchSize`] | none (size travels in the header) |
//! | 5 | [`MixMessage::Reply`] | `[u32 valid_len][data][padding]` |
//!
//! Establish and steady-state payloads carry one processing header per relay
//! still to be traversed. Each relay strips its own header before forwarding,
//! so the payload shrinks by [`Framing::header_unit`] bytes per hop.

use std::fmt;

use crate::channel::ChannelId;

/// Length of the length prefix inside a reply payload.
pub const REPLY_HEADER_LEN: usize = 4;

/// One-byte discriminant of a message on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// First message of a channel.
    ChannelEstablish = 1,
    /// Steady-state message of an established channel.
    ChannelMessage = 2,
    /// Channel teardown.
    ChannelRelease = 3,
    /// Size of the next round.
    BatchSize = 4,
    /// Destination to client data.
    Reply = 5,
}

impl MessageType {
    /// All message types, in discriminant order.
    pub const ALL: [MessageType; 5] = [
        MessageType::ChannelEstablish,
        MessageType::ChannelMessage,
        MessageType::ChannelRelease,
        MessageType::BatchSize,
        MessageType::Reply,
    ];

    /// Wire discriminant.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a wire discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::ChannelEstablish),
            2 => Some(MessageType::ChannelMessage),
            3 => Some(MessageType::ChannelRelease),
            4 => Some(MessageType::BatchSize),
            5 => Some(MessageType::Reply),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::ChannelEstablish => "establish",
            MessageType::ChannelMessage => "message",
            MessageType::ChannelRelease => "release",
            MessageType::BatchSize => "batch-size",
            MessageType::Reply => "reply",
        };
        f.write_str(name)
    }
}

/// A message flowing through the relay's queues.
///
/// Channel ids are always *local* ids; the links translate them to and from
/// the per-edge ids used on the wire.
#[derive(Clone, PartialEq, Eq)]
pub enum MixMessage {
    /// First message of a channel on this hop.
    ChannelEstablish {
        /// Local channel id.
        channel: ChannelId,
        /// Fixed-size payload.
        payload: Vec<u8>,
    },
    /// Per-round payload of an established channel.
    ChannelMessage {
        /// Local channel id.
        channel: ChannelId,
        /// Fixed-size payload.
        payload: Vec<u8>,
    },
    /// Tear the channel down on every hop from here on.
    ChannelRelease {
        /// Local channel id.
        channel: ChannelId,
    },
    /// Out-of-band round size propagated between relays.
    BatchSize {
        /// Number of messages in the round.
        size: u32,
    },
    /// Destination to client data.
    Reply {
        /// Local channel id.
        channel: ChannelId,
        /// Length-prefixed reply payload.
        payload: Vec<u8>,
    },
}

impl MixMessage {
    /// Wire discriminant of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            MixMessage::ChannelEstablish { .. } => MessageType::ChannelEstablish,
            MixMessage::ChannelMessage { .. } => MessageType::ChannelMessage,
            MixMessage::ChannelRelease { .. } => MessageType::ChannelRelease,
            MixMessage::BatchSize { .. } => MessageType::BatchSize,
            MixMessage::Reply { .. } => MessageType::Reply,
        }
    }

    /// Channel this message belongs to, if any.
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            MixMessage::ChannelEstablish { channel, .. }
            | MixMessage::ChannelMessage { channel, .. }
            | MixMessage::ChannelRelease { channel }
            | MixMessage::Reply { channel, .. } => Some(*channel),
            MixMessage::BatchSize { .. } => None,
        }
    }

    /// Payload bytes (empty for control messages).
    pub fn payload(&self) -> &[u8] {
        match self {
            MixMessage::ChannelEstablish { payload, .. }
            | MixMessage::ChannelMessage { payload, .. }
            | MixMessage::Reply { payload, .. } => payload,
            MixMessage::ChannelRelease { .. } | MixMessage::BatchSize { .. } => &[],
        }
    }

    /// Check whether this is a request carrying payload (establish or message).
    pub fn is_channel_request(&self) -> bool {
        matches!(
            self,
            MixMessage::ChannelEstablish { .. } | MixMessage::ChannelMessage { .. }
        )
    }

    /// Remove this hop's processing header from a request payload.
    ///
    /// Control messages and replies are left untouched.
    pub fn strip_header(&mut self, header_unit: usize) {
        if let MixMessage::ChannelEstablish { payload, .. }
        | MixMessage::ChannelMessage { payload, .. } = self
        {
            let n = header_unit.min(payload.len());
            payload.drain(..n);
        }
    }
}

impl fmt::Debug for MixMessage {
    // Payload contents are never printed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("MixMessage");
        s.field("type", &self.message_type());
        match self {
            MixMessage::BatchSize { size } => {
                s.field("size", size);
            }
            other => {
                if let Some(channel) = other.channel() {
                    s.field("channel", &channel);
                }
                s.field("payload_len", &other.payload().len());
            }
        }
        s.finish()
    }
}

/// Hop-dependent payload sizes of establish and steady-state messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Framing {
    /// Bytes of processing header each relay strips.
    pub header_unit: usize,
    /// Establish payload length once every relay has stripped its header.
    pub establish_base: usize,
    /// Message payload length once every relay has stripped its header.
    pub message_base: usize,
    /// Relays after this one in the cascade.
    pub further_hops: u32,
}

impl Framing {
    /// Relays that still have to process a message arriving here, this one
    /// included.
    pub fn remaining_hops(&self) -> usize {
        self.further_hops as usize + 1
    }

    fn base(&self, kind: MessageType) -> Option<usize> {
        match kind {
            MessageType::ChannelEstablish => Some(self.establish_base),
            MessageType::ChannelMessage => Some(self.message_base),
            _ => None,
        }
    }

    /// Payload length of a message of `kind` arriving at this relay.
    ///
    /// Returns `None` for types without a fixed length.
    pub fn inbound_len(&self, kind: MessageType) -> Option<usize> {
        self.base(kind)
            .map(|base| base + self.header_unit * self.remaining_hops())
    }

    /// Payload length of a message of `kind` leaving this relay.
    pub fn outbound_len(&self, kind: MessageType) -> Option<usize> {
        self.base(kind)
            .map(|base| base + self.header_unit * (self.remaining_hops() - 1))
    }
}

/// Build a reply payload: `[u32 valid_len][chunk]`.
///
/// `chunk` is already padded; `valid` counts its leading data bytes.
pub fn encode_reply_payload(chunk: &[u8], valid: usize) -> Vec<u8> {
    let mut payload = Vec::with_capacity(REPLY_HEADER_LEN + chunk.len());
    payload.extend_from_slice(&(valid as u32).to_be_bytes());
    payload.extend_from_slice(chunk);
    payload
}

/// Extract the data bytes of a reply payload, dropping the padding.
///
/// Returns `None` if the payload is malformed.
pub fn decode_reply_payload(payload: &[u8]) -> Option<&[u8]> {
    if payload.len() < REPLY_HEADER_LEN {
        return None;
    }
    let mut len_bytes = [0u8; REPLY_HEADER_LEN];
    len_bytes.copy_from_slice(&payload[..REPLY_HEADER_LEN]);
    let valid = u32::from_be_bytes(len_bytes) as usize;
    payload[REPLY_HEADER_LEN..].get(..valid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framing(further_hops: u32) -> Framing {
        Framing {
            header_unit: 32,
            establish_base: 100,
            message_base: 60,
            further_hops,
        }
    }

    #[test]
    fn test_message_type_discriminants() {
        for kind in MessageType::ALL {
            assert_eq!(MessageType::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(MessageType::from_u8(0), None);
        assert_eq!(MessageType::from_u8(6), None);
    }

    #[test]
    fn test_inbound_and_outbound_lengths() {
        // First of three relays
        let first = framing(2);
        assert_eq!(first.inbound_len(MessageType::ChannelEstablish), Some(196));
        assert_eq!(first.outbound_len(MessageType::ChannelEstablish), Some(164));
        assert_eq!(first.inbound_len(MessageType::ChannelMessage), Some(156));

        // Next relay expects what the previous one sends
        let second = framing(1);
        assert_eq!(
            second.inbound_len(MessageType::ChannelEstablish),
            first.outbound_len(MessageType::ChannelEstablish)
        );

        // Last relay forwards the bare base payload
        let last = framing(0);
        assert_eq!(last.outbound_len(MessageType::ChannelMessage), Some(60));
    }

    #[test]
    fn test_lengths_undefined_for_control_messages() {
        let f = framing(1);
        assert_eq!(f.inbound_len(MessageType::ChannelRelease), None);
        assert_eq!(f.inbound_len(MessageType::Reply), None);
        assert_eq!(f.outbound_len(MessageType::BatchSize), None);
    }

    #[test]
    fn test_strip_header() {
        let mut msg = MixMessage::ChannelMessage {
            channel: ChannelId::new(1),
            payload: (0u8..10).collect(),
        };
        msg.strip_header(4);
        assert_eq!(msg.payload(), &[4, 5, 6, 7, 8, 9]);

        let mut reply = MixMessage::Reply {
            channel: ChannelId::new(1),
            payload: vec![1, 2, 3],
        };
        reply.strip_header(2);
        assert_eq!(reply.payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_channel_accessor() {
        let release = MixMessage::ChannelRelease {
            channel: ChannelId::new(5),
        };
        assert_eq!(release.channel(), Some(ChannelId::new(5)));
        assert_eq!(MixMessage::BatchSize { size: 3 }.channel(), None);
        assert!(release.payload().is_empty());
    }

    #[test]
    fn test_debug_hides_payload() {
        let msg = MixMessage::ChannelEstablish {
            channel: ChannelId::new(1),
            payload: b"secret".to_vec(),
        };
        let debug = format!("{:?}", msg);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("payload_len: 6"));
    }

    #[test]
    fn test_reply_payload_roundtrip() {
        let payload = encode_reply_payload(b"data\0\0\0\0", 4);
        assert_eq!(payload.len(), REPLY_HEADER_LEN + 8);
        assert_eq!(decode_reply_payload(&payload), Some(&b"data"[..]));
    }

    #[test]
    fn test_reply_payload_malformed() {
        assert_eq!(decode_reply_payload(&[0, 0]), None);
        // Claims more data than present
        assert_eq!(decode_reply_payload(&[0, 0, 0, 9, 1, 2]), None);
    }
}
