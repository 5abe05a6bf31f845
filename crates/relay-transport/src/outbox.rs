//! Per-connection outbound queue and its writer task.
//!
//! The server never writes to a socket directly. It pushes items into a
//! bounded [`Outbox`] with `try_send`, and a writer task drains the queue in
//! order. A slow or dead peer therefore costs the server nothing but a
//! dropped item.
//!
//! Inline file transfers are queued as [`InlineStream`] items so the header,
//! the payload, and any lines queued afterwards reach the peer in order.

use bytes::Bytes;
use futures_util::SinkExt;
use relay_core::ConnectionId;
use relay_protocol::{LineCodec, Reply};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedWrite;
use tracing::{debug, trace, warn};

use crate::traits::TransportError;

/// Default inline transfer chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Default outbox capacity in items.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

/// How an inline stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Every announced byte was written.
    Completed(u64),
    /// The stream stopped early; the connection is being closed.
    Aborted {
        /// Bytes written before the failure.
        sent: u64,
        /// Failure description.
        reason: String,
    },
}

/// A header line followed by exactly `len` raw bytes.
pub struct InlineStream {
    /// Header line, written with its newline.
    pub header: Bytes,
    /// Payload source.
    pub body: Box<dyn AsyncRead + Send + Unpin>,
    /// Announced payload length.
    pub len: u64,
    /// Receives the outcome once the stream ends.
    pub done: Option<oneshot::Sender<StreamOutcome>>,
}

impl std::fmt::Debug for InlineStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineStream")
            .field("header", &self.header)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// An item queued for a connection.
#[derive(Debug)]
pub enum Outbound {
    /// One line; the writer appends the newline.
    Line(Bytes),
    /// A header plus raw payload.
    Stream(InlineStream),
}

/// Sending side of a connection's queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
}

impl Outbox {
    /// Create an outbox and the receiver its writer drains.
    #[must_use]
    pub fn channel(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id, tx }, rx)
    }

    /// Get the connection this outbox writes to.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a pre-rendered line without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::OutboxFull`] or
    /// [`TransportError::ConnectionClosed`]; the line is dropped.
    pub fn send_line(&self, line: Bytes) -> Result<(), TransportError> {
        self.push(Outbound::Line(line))
    }

    /// Queue a reply without waiting.
    ///
    /// # Errors
    ///
    /// Same as [`Outbox::send_line`].
    pub fn send_reply(&self, reply: &Reply) -> Result<(), TransportError> {
        self.send_line(reply.to_bytes())
    }

    /// Queue an inline stream without waiting.
    ///
    /// # Errors
    ///
    /// Same as [`Outbox::send_line`]; the stream is dropped, which closes its
    /// body.
    pub fn send_stream(&self, stream: InlineStream) -> Result<(), TransportError> {
        self.push(Outbound::Stream(stream))
    }

    /// Check if the writer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn push(&self, item: Outbound) -> Result<(), TransportError> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::OutboxFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }
}

/// Spawn the writer task for a connection.
///
/// The task drains `rx` until every [`Outbox`] clone is dropped, then flushes
/// and shuts the writer down. If a write fails, `id` is sent on `failures` so
/// the owner can tear the connection down.
pub fn spawn_writer<W>(
    id: ConnectionId,
    writer: W,
    rx: mpsc::Receiver<Outbound>,
    chunk_size: usize,
    failures: mpsc::UnboundedSender<ConnectionId>,
) -> tokio::task::JoinHandle<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        match run_writer(writer, rx, chunk_size).await {
            Ok(()) => debug!(connection = %id, "Writer finished"),
            Err(e) => {
                warn!(connection = %id, error = %e, "Writer failed");
                let _ = failures.send(id);
            }
        }
    })
}

async fn run_writer<W>(
    writer: W,
    mut rx: mpsc::Receiver<Outbound>,
    chunk_size: usize,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(writer, LineCodec::new());
    let mut buf = vec![0u8; chunk_size.max(1)];

    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Line(line) => {
                framed.feed(line).await?;
                if rx.is_empty() {
                    SinkExt::<Bytes>::flush(&mut framed).await?;
                }
            }
            Outbound::Stream(mut stream) => {
                let done = stream.done.take();
                let mut sent = 0;
                let result = write_stream(&mut framed, stream, &mut buf, &mut sent).await;
                let outcome = match &result {
                    Ok(()) => StreamOutcome::Completed(sent),
                    Err(e) => StreamOutcome::Aborted {
                        sent,
                        reason: e.to_string(),
                    },
                };
                if let Some(done) = done {
                    let _ = done.send(outcome);
                }
                result?;
            }
        }
    }

    SinkExt::<Bytes>::close(&mut framed).await?;
    Ok(())
}

async fn write_stream<W>(
    framed: &mut FramedWrite<W, LineCodec>,
    stream: InlineStream,
    buf: &mut [u8],
    sent: &mut u64,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let InlineStream {
        header, body, len, ..
    } = stream;

    // The header goes through the codec; the payload bypasses it.
    framed.send(header).await?;
    let io = framed.get_mut();
    let mut body = body.take(len);

    loop {
        let n = body.read(buf).await?;
        if n == 0 {
            break;
        }
        io.write_all(&buf[..n]).await?;
        *sent += n as u64;
        trace!(sent = *sent, len, "Wrote inline chunk");
    }
    io.flush().await?;

    if *sent < len {
        return Err(TransportError::ShortStream {
            expected: len,
            sent: *sent,
        });
    }
    Ok(())
}
