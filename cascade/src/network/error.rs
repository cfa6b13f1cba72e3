// Copyright (c) 2024 Botho Foundation

//! Error types of the network layer.

use std::{io, net::SocketAddr};
use thiserror::Error;

use crate::{
    crypto::{CipherError, KeyExchangeError},
    queue::QueueError,
};

/// Errors while reading or writing one frame.
///
/// Any of these leaves the stream at an unknown position, so the connection
/// is dropped.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Frame length smaller than one header block.
    #[error("frame length {0} shorter than a header block")]
    TooShort(u32),

    /// Frame length above the configured maximum.
    #[error("frame length {len} exceeds maximum {max}")]
    TooLong {
        /// Announced length.
        len: u32,
        /// Configured maximum.
        max: usize,
    },

    /// Header block carried a discriminant no message type uses.
    #[error("unknown message discriminant {0}")]
    UnknownType(u8),

    /// Header block cipher failure.
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
}

/// Errors of the inter-relay links.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Framing error on the edge.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Edge key bootstrap failed.
    #[error("key exchange failed: {0}")]
    KeyExchange(#[from] KeyExchangeError),

    /// Could not bind the edge listener.
    #[error("failed to bind edge listener on {addr}: {source}")]
    Bind {
        /// Address that failed.
        addr: SocketAddr,
        /// Cause.
        source: io::Error,
    },

    /// The relay is shutting down.
    #[error("link shut down")]
    Shutdown,
}

impl From<QueueError> for LinkError {
    fn from(_: QueueError) -> Self {
        LinkError::Shutdown
    }
}

/// Errors of the client-facing listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Could not bind the client listener.
    #[error("failed to bind client listener on {addr}: {source}")]
    Bind {
        /// Address that failed.
        addr: SocketAddr,
        /// Cause.
        source: io::Error,
    },

    /// Readiness poll failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_display() {
        assert_eq!(
            FrameError::TooShort(3).to_string(),
            "frame length 3 shorter than a header block"
        );
        assert_eq!(
            FrameError::UnknownType(9).to_string(),
            "unknown message discriminant 9"
        );
        assert_eq!(LinkError::Shutdown.to_string(), "link shut down");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let link_err: LinkError = FrameError::from(io_err).into();
        match link_err {
            LinkError::Frame(FrameError::Io(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::ConnectionReset)
            }
            other => panic!("expected Frame(Io), got {other:?}"),
        }
    }

    #[test]
    fn test_error_source() {
        let err = ListenerError::Bind {
            addr: SocketAddr::from(([127, 0, 0, 1], 1)),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.source().is_some());
        assert!(LinkError::Shutdown.source().is_none());
    }

    #[test]
    fn test_queue_shutdown_maps_to_link_shutdown() {
        assert!(matches!(
            LinkError::from(QueueError::Shutdown),
            LinkError::Shutdown
        ));
    }
}
