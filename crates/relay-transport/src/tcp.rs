//! TCP control-channel transport.
//!
//! Each accepted stream is split in two: the read half becomes a framed
//! [`LineReader`] the server polls alongside every other connection, and the
//! write half is handed to a writer task fed by the connection's [`Outbox`].

use async_trait::async_trait;
use relay_core::ConnectionId;
use relay_protocol::codec::DEFAULT_MAX_LINE_LENGTH;
use relay_protocol::LineCodec;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, info};

use crate::outbox::{spawn_writer, Outbox, DEFAULT_CHUNK_SIZE, DEFAULT_OUTBOX_CAPACITY};
use crate::traits::{Accepted, Transport, TransportError};

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Longest accepted command line in bytes.
    pub max_line_length: usize,
    /// Outbox capacity per connection.
    pub outbox_capacity: usize,
    /// Inline transfer chunk size.
    pub chunk_size: usize,
}

impl TcpConfig {
    /// Create a configuration with default limits.
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([0, 0, 0, 0], 12000)))
    }
}

/// TCP transport.
pub struct TcpTransport {
    listener: TcpListener,
    config: TcpConfig,
    failures: mpsc::UnboundedSender<ConnectionId>,
}

impl TcpTransport {
    /// Bind a TCP transport.
    ///
    /// Writer failures for every accepted connection are reported on
    /// `failures`.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn bind(
        config: TcpConfig,
        failures: mpsc::UnboundedSender<ConnectionId>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(
            "TCP transport listening on {}",
            listener.local_addr().unwrap_or(config.bind_addr)
        );

        Ok(Self {
            listener,
            config,
            failures,
        })
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn accept(&self) -> Result<Accepted, TransportError> {
        let (stream, remote_addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;

        let id = ConnectionId::next();
        debug!(connection = %id, remote = %remote_addr, "Accepted TCP connection");

        let (read_half, write_half) = stream.into_split();
        let reader = FramedRead::new(
            read_half,
            LineCodec::with_max_length(self.config.max_line_length),
        );

        let (outbox, rx) = Outbox::channel(id, self.config.outbox_capacity);
        spawn_writer(
            id,
            write_half,
            rx,
            self.config.chunk_size,
            self.failures.clone(),
        );

        Ok(Accepted {
            id,
            remote_addr,
            reader: Box::pin(reader),
            outbox,
        })
    }

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use relay_protocol::Inbound;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    async fn loopback() -> (TcpTransport, mpsc::UnboundedReceiver<ConnectionId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = TcpConfig::new("127.0.0.1:0".parse().unwrap());
        (TcpTransport::bind(config, tx).await.unwrap(), rx)
    }

    #[tokio::test]
    async fn test_accept_reads_and_writes_lines() {
        let (transport, _failures) = loopback().await;
        let addr = transport.local_addr().unwrap();
        assert_eq!(transport.name(), "tcp");

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"JOIN alice\r\nLIST_FILES\n").await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            lines.next_line().await.unwrap()
        });

        let mut accepted = transport.accept().await.unwrap();
        assert_eq!(
            accepted.reader.next().await.unwrap().unwrap(),
            Inbound::Line("JOIN alice".into())
        );
        assert_eq!(
            accepted.reader.next().await.unwrap().unwrap(),
            Inbound::Line("LIST_FILES".into())
        );

        accepted
            .outbox
            .send_line(Bytes::from_static(b"Welcome"))
            .unwrap();
        assert_eq!(client.await.unwrap().as_deref(), Some("Welcome"));
    }

    #[tokio::test]
    async fn test_connection_ids_are_unique() {
        let (transport, _failures) = loopback().await;
        let addr = transport.local_addr().unwrap();

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        let first = transport.accept().await.unwrap();
        let second = transport.accept().await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.outbox.id(), first.id);
    }
}
