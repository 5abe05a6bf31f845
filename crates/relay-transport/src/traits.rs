//! Transport abstraction traits for the relay.
//!
//! A transport hands the server fully set-up connections: a framed line
//! reader the server polls, and an [`Outbox`](crate::Outbox) it writes through.

use async_trait::async_trait;
use futures_util::Stream;
use relay_core::ConnectionId;
use relay_protocol::{Inbound, ProtocolError};
use std::net::SocketAddr;
use std::pin::Pin;
use thiserror::Error;

use crate::outbox::Outbox;

/// Framed inbound lines from one connection.
pub type LineReader = Pin<Box<dyn Stream<Item = Result<Inbound, ProtocolError>> + Send>>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection's outbox is full; the item was dropped.
    #[error("Outbox full")]
    OutboxFull,

    /// A stream ended before delivering its announced length.
    #[error("Stream ended after {sent} of {expected} bytes")]
    ShortStream {
        /// Bytes announced.
        expected: u64,
        /// Bytes actually sent.
        sent: u64,
    },

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connection produced by [`Transport::accept`].
pub struct Accepted {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Peer address.
    pub remote_addr: SocketAddr,
    /// Inbound lines.
    pub reader: LineReader,
    /// Outbound queue.
    pub outbox: Outbox,
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// A transport that can accept connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// This method waits until a new connection is available or an error occurs.
    async fn accept(&self) -> Result<Accepted, TransportError>;

    /// Get the transport name (e.g., "tcp").
    fn name(&self) -> &'static str;

    /// Get the local address the transport is bound to.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_stream_display() {
        let err = TransportError::ShortStream {
            expected: 10,
            sent: 4,
        };
        assert_eq!(err.to_string(), "Stream ended after 4 of 10 bytes");
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: TransportError = ProtocolError::LineTooLong(10, 5).into();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
