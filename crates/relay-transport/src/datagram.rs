//! Best-effort UDP file transfer.
//!
//! The sender slices a byte source into datagrams and paces them; there is no
//! acknowledgement, retransmission, or reordering. The receiver writes
//! datagrams in arrival order until the expected length arrives or the peer
//! goes quiet for an idle window.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::traits::TransportError;

/// Default datagram payload size in bytes.
pub const DEFAULT_DATAGRAM_SIZE: usize = 1024;

/// Default pause between datagrams.
pub const DEFAULT_PACING: Duration = Duration::from_millis(1);

/// Default receiver idle window.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest UDP payload the receiver accepts.
const MAX_DATAGRAM: usize = 65_507;

/// Datagram sender configuration.
#[derive(Debug, Clone, Copy)]
pub struct DatagramConfig {
    /// Maximum payload per datagram.
    pub max_payload: usize,
    /// Pause after each datagram.
    pub pacing: Duration,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_DATAGRAM_SIZE,
            pacing: DEFAULT_PACING,
        }
    }
}

/// A one-shot sender bound to an ephemeral port and aimed at one target.
#[derive(Debug)]
pub struct DatagramSender {
    socket: UdpSocket,
    target: SocketAddr,
    config: DatagramConfig,
}

impl DatagramSender {
    /// Open a sender for `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if no local socket can be bound or connected.
    pub async fn open(target: SocketAddr, config: DatagramConfig) -> Result<Self, TransportError> {
        let local: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        Ok(Self {
            socket,
            target,
            config,
        })
    }

    /// Get the target address.
    #[must_use]
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Send up to `len` bytes from `source`, returning the bytes sent.
    ///
    /// Each datagram is filled completely except the last.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the source or sending fails, or
    /// [`TransportError::ShortStream`] if the source ends before `len`.
    pub async fn send_from<R>(&self, source: R, len: u64) -> Result<u64, TransportError>
    where
        R: AsyncRead + Unpin,
    {
        let mut source = source.take(len);
        let mut buf = vec![0u8; self.config.max_payload.clamp(1, MAX_DATAGRAM)];
        let mut sent = 0u64;
        let mut datagrams = 0u64;

        loop {
            let filled = fill(&mut source, &mut buf).await?;
            if filled == 0 {
                break;
            }
            self.socket.send(&buf[..filled]).await?;
            sent += filled as u64;
            datagrams += 1;
            trace!(target_addr = %self.target, sent, "Sent datagram");
            if !self.config.pacing.is_zero() {
                tokio::time::sleep(self.config.pacing).await;
            }
        }

        debug!(target_addr = %self.target, sent, datagrams, "Datagram send finished");
        if sent < len {
            return Err(TransportError::ShortStream {
                expected: len,
                sent,
            });
        }
        Ok(sent)
    }
}

/// Read until `buf` is full or the source ends.
async fn fill<R>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Result of a receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveSummary {
    /// Bytes written.
    pub received: u64,
    /// Bytes announced.
    pub expected: u64,
}

impl ReceiveSummary {
    /// Check if every announced byte arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received >= self.expected
    }
}

/// A bound UDP socket waiting for one transfer.
#[derive(Debug)]
pub struct DatagramReceiver {
    socket: UdpSocket,
    source: Option<IpAddr>,
}

impl DatagramReceiver {
    /// Bind a receiver.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is unavailable.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            source: None,
        })
    }

    /// Only accept datagrams sent from `ip`; others are dropped.
    #[must_use]
    pub fn accept_only(mut self, ip: IpAddr) -> Self {
        self.source = Some(ip.to_canonical());
        self
    }

    /// Get the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Write datagrams to `sink` until `expected` bytes arrive or nothing
    /// arrives for `idle`.
    ///
    /// Payload beyond `expected` is discarded, as is anything from a source
    /// other than the one set with [`DatagramReceiver::accept_only`]. An idle
    /// timeout is not an error; check [`ReceiveSummary::is_complete`].
    ///
    /// # Errors
    ///
    /// Returns an error if receiving or writing fails.
    pub async fn receive_into<W>(
        &self,
        mut sink: W,
        expected: u64,
        idle: Duration,
    ) -> Result<ReceiveSummary, TransportError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut received = 0u64;

        while received < expected {
            let (n, from) = match tokio::time::timeout(idle, self.socket.recv_from(&mut buf)).await
            {
                Ok(result) => result?,
                Err(_) => {
                    debug!(received, expected, "Datagram receiver idle, stopping");
                    break;
                }
            };
            if self
                .source
                .is_some_and(|source| source != from.ip().to_canonical())
            {
                trace!(from = %from, "Dropped datagram from unexpected source");
                continue;
            }
            let remaining = expected - received;
            let take = n.min(usize::try_from(remaining).unwrap_or(usize::MAX));
            sink.write_all(&buf[..take]).await?;
            received += take as u64;
        }
        sink.flush().await?;

        Ok(ReceiveSummary { received, expected })
    }
}
