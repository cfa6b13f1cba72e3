// Copyright (c) 2024 Botho Foundation

//! Frame codec of the inter-relay multiplexed stream.
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────┬──────────────────┐
//! │ u32 BE len L │ header block (16 bytes, encrypted)   │ L - 16 bytes     │
//! │              │ type(1) | id/size(4) | payload[..11] │ payload[11..]    │
//! └──────────────┴──────────────────────────────────────┴──────────────────┘
//! ```
//!
//! `L = max(16, 5 + payload_len)`. Payloads shorter than 11 bytes are zero
//! padded inside the header block, so receivers see `L - 5` payload bytes.
//!
//! Client connections use plain `[u32 BE len][payload]` frames.

use std::io::{self, Read};

use crate::{
    channel::{ChannelId, CHANNEL_ID_LEN},
    crypto::{HeaderCipher, CIPHER_BLOCK_SIZE},
    message::MessageType,
};

use super::FrameError;

/// Length of the multiplex header.
pub const HEADER_LEN: usize = 1 + CHANNEL_ID_LEN;

/// Length of the frame length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Payload bytes carried inside the encrypted header block.
pub const HEAD_PAYLOAD_LEN: usize = CIPHER_BLOCK_SIZE - HEADER_LEN;

/// Upper bound on the frame length a receiver accepts by default.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 20;

/// Cleartext form of the 5-byte multiplex header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MultiplexHeader {
    /// Raw discriminant.
    pub kind: u8,
    /// Edge channel id, or round size for batch size messages.
    pub field: u32,
}

impl MultiplexHeader {
    /// Header of a per-channel message.
    pub fn channel(kind: MessageType, edge_id: ChannelId) -> Self {
        Self {
            kind: kind.as_u8(),
            field: edge_id.value(),
        }
    }

    /// Header of a batch size message.
    pub fn batch_size(size: u32) -> Self {
        Self {
            kind: MessageType::BatchSize.as_u8(),
            field: size,
        }
    }

    /// Decoded message type, if the discriminant is known.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.kind)
    }

    /// The field read as an edge channel id.
    pub fn edge_id(&self) -> ChannelId {
        ChannelId::new(self.field)
    }

    fn write_to(&self, block: &mut [u8]) {
        block[0] = self.kind;
        block[1..HEADER_LEN].copy_from_slice(&self.field.to_be_bytes());
    }

    fn read_from(block: &[u8]) -> Self {
        let mut field = [0u8; CHANNEL_ID_LEN];
        field.copy_from_slice(&block[1..HEADER_LEN]);
        Self {
            kind: block[0],
            field: u32::from_be_bytes(field),
        }
    }
}

/// Frame length field for a payload of `payload_len` bytes.
pub fn frame_len(payload_len: usize) -> usize {
    CIPHER_BLOCK_SIZE.max(HEADER_LEN + payload_len)
}

/// Encode one frame, advancing `cipher` by exactly one block.
pub fn encode_frame(
    cipher: &mut HeaderCipher,
    header: MultiplexHeader,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let len = frame_len(payload.len());
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + len);
    out.extend_from_slice(&(len as u32).to_be_bytes());

    let mut block = [0u8; CIPHER_BLOCK_SIZE];
    header.write_to(&mut block);
    let in_block = payload.len().min(HEAD_PAYLOAD_LEN);
    block[HEADER_LEN..HEADER_LEN + in_block].copy_from_slice(&payload[..in_block]);
    cipher.apply_block(&mut block)?;

    out.extend_from_slice(&block);
    out.extend_from_slice(&payload[in_block..]);
    Ok(out)
}

/// Decrypted header block of a frame whose tail is still on the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameHead {
    /// Multiplex header.
    pub header: MultiplexHeader,
    head: [u8; HEAD_PAYLOAD_LEN],
    len: usize,
}

impl FrameHead {
    /// Payload length of the frame, header-block padding included.
    pub fn payload_len(&self) -> usize {
        self.len - HEADER_LEN
    }

    /// Bytes following the header block on the stream.
    pub fn remaining(&self) -> usize {
        self.len - CIPHER_BLOCK_SIZE
    }

    /// Bytes on the wire, length prefix included.
    pub fn wire_len(&self) -> usize {
        LENGTH_PREFIX_LEN + self.len
    }
}

/// Read the length prefix and header block of the next frame.
///
/// Unknown discriminants are reported as [`FrameError::UnknownType`]; the
/// cipher has then advanced and the caller must drop the connection.
pub fn read_frame_head<R: Read>(
    reader: &mut R,
    cipher: &mut HeaderCipher,
    max_len: usize,
) -> Result<FrameHead, FrameError> {
    let mut len_bytes = [0u8; LENGTH_PREFIX_LEN];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes);
    if (len as usize) < CIPHER_BLOCK_SIZE {
        return Err(FrameError::TooShort(len));
    }
    if len as usize > max_len {
        return Err(FrameError::TooLong { len, max: max_len });
    }

    let mut block = [0u8; CIPHER_BLOCK_SIZE];
    reader.read_exact(&mut block)?;
    cipher.apply_block(&mut block)?;

    let header = MultiplexHeader::read_from(&block);
    if header.message_type().is_none() {
        return Err(FrameError::UnknownType(header.kind));
    }
    let mut head = [0u8; HEAD_PAYLOAD_LEN];
    head.copy_from_slice(&block[HEADER_LEN..]);
    Ok(FrameHead {
        header,
        head,
        len: len as usize,
    })
}

/// Read the rest of the frame and reassemble its payload.
pub fn read_payload<R: Read>(reader: &mut R, head: &FrameHead) -> Result<Vec<u8>, FrameError> {
    let payload_len = head.payload_len();
    let mut payload = Vec::with_capacity(payload_len);
    payload.extend_from_slice(&head.head[..payload_len.min(HEAD_PAYLOAD_LEN)]);
    let start = payload.len();
    payload.resize(payload_len, 0);
    reader.read_exact(&mut payload[start..])?;
    Ok(payload)
}

/// Discard the rest of the frame, keeping the stream aligned.
pub fn skip_payload<R: Read>(reader: &mut R, head: &FrameHead) -> Result<usize, FrameError> {
    let remaining = head.remaining() as u64;
    let skipped = io::copy(&mut reader.take(remaining), &mut io::sink())?;
    if skipped != remaining {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(remaining as usize)
}

/// Encode a client frame: `[u32 BE len][payload]`.
pub fn encode_client_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}
