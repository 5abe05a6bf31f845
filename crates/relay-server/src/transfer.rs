//! File transfer coordination.
//!
//! Resolves requests against the [`SharedCatalog`] and starts one of two
//! transfers:
//!
//! - **Inline**: a `FILE_START_TCP` header and the payload are queued on the
//!   requester's outbox as a single stream item. Its writer task sends them,
//!   so the control loop never waits on the file.
//! - **Datagram**: a `FILE_START_UDP` announcement goes on the outbox and an
//!   independent task sprays paced datagrams at the requester's address.
//!
//! Both report their end state through logs and metrics only; the control
//! loop learns of an inline abort through the writer's failure report.

use relay_core::ConnectionId;
use relay_protocol::Reply;
use relay_transport::{
    DatagramConfig, DatagramSender, InlineStream, Outbox, StreamOutcome, TransportError,
};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogError, OpenedFile, SharedCatalog};
use crate::metrics;

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// Transfer errors.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The file is not in the catalog.
    #[error("File not found: {0}")]
    NotFound(String),

    /// The requester's outbox refused the announcement.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The file exists but could not be opened.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CatalogError> for TransferError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(name) | CatalogError::InvalidName(name) => {
                TransferError::NotFound(name)
            }
            CatalogError::Io(e) => TransferError::Io(e),
        }
    }
}

/// Transfer mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Payload follows a header on the control connection.
    Inline,
    /// Payload goes out as unacknowledged datagrams.
    Datagram,
}

impl TransferMode {
    /// Get the metric label for this mode.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Inline => "tcp",
            TransferMode::Datagram => "udp",
        }
    }
}

/// Lifecycle of a single transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Requested,
    Resolved,
    NotFound,
    Streaming,
    Completed,
    Aborted,
}

impl TransferState {
    /// Check if `next` is a legal successor.
    #[must_use]
    pub fn can_advance_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Requested, Resolved)
                | (Requested, NotFound)
                | (Resolved, Streaming)
                | (Resolved, Aborted)
                | (Streaming, Completed)
                | (Streaming, Aborted)
        )
    }

    /// Check if the transfer has ended.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::NotFound | TransferState::Completed | TransferState::Aborted
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            TransferState::Requested => "requested",
            TransferState::Resolved => "resolved",
            TransferState::NotFound => "not_found",
            TransferState::Streaming => "streaming",
            TransferState::Completed => "completed",
            TransferState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transfer's bookkeeping.
#[derive(Debug)]
struct Transfer {
    id: u64,
    mode: TransferMode,
    requester: ConnectionId,
    filename: String,
    state: TransferState,
}

impl Transfer {
    fn new(mode: TransferMode, requester: ConnectionId, filename: &str) -> Self {
        let transfer = Self {
            id: NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed),
            mode,
            requester,
            filename: filename.to_string(),
            state: TransferState::Requested,
        };
        debug!(
            transfer = transfer.id,
            connection = %requester,
            file = %filename,
            mode = mode.as_str(),
            "Transfer requested"
        );
        transfer
    }

    fn advance(&mut self, next: TransferState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transfer transition {} -> {}",
            self.state,
            next
        );
        debug!(
            transfer = self.id,
            connection = %self.requester,
            from = %self.state,
            to = %next,
            "Transfer state changed"
        );
        self.state = next;
    }

    fn finish(mut self, sent: u64, error: Option<String>) {
        match error {
            None => {
                self.advance(TransferState::Completed);
                info!(
                    transfer = self.id,
                    connection = %self.requester,
                    file = %self.filename,
                    bytes = sent,
                    mode = self.mode.as_str(),
                    "Transfer completed"
                );
            }
            Some(reason) => {
                self.advance(TransferState::Aborted);
                warn!(
                    transfer = self.id,
                    connection = %self.requester,
                    file = %self.filename,
                    bytes = sent,
                    mode = self.mode.as_str(),
                    reason = %reason,
                    "Transfer aborted"
                );
            }
        }
        metrics::record_transfer(self.mode.as_str(), self.state.as_str(), sent);
    }

    fn reject(mut self, err: &TransferError) {
        match err {
            TransferError::NotFound(_) => self.advance(TransferState::NotFound),
            _ => self.advance(TransferState::Resolved),
        }
        if !self.state.is_terminal() {
            self.advance(TransferState::Aborted);
        }
        metrics::record_transfer(self.mode.as_str(), self.state.as_str(), 0);
    }
}

/// Starts transfers for the dispatcher.
#[derive(Debug, Clone)]
pub struct TransferCoordinator {
    catalog: SharedCatalog,
    datagram: DatagramConfig,
}

impl TransferCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(catalog: SharedCatalog, datagram: DatagramConfig) -> Self {
        Self { catalog, datagram }
    }

    /// Get the catalog.
    #[must_use]
    pub fn catalog(&self) -> &SharedCatalog {
        &self.catalog
    }

    /// Queue an inline transfer of `filename` on `requester`.
    ///
    /// Returns the announced size.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::NotFound`] if the file is absent; the caller
    /// answers with a not-found notice.
    pub async fn start_inline(
        &self,
        requester: &Outbox,
        filename: &str,
    ) -> Result<u64, TransferError> {
        let mut transfer = Transfer::new(TransferMode::Inline, requester.id(), filename);
        let opened = match self.catalog.open(filename).await {
            Ok(opened) => opened,
            Err(e) => {
                let err = TransferError::from(e);
                transfer.reject(&err);
                return Err(err);
            }
        };
        transfer.advance(TransferState::Resolved);

        let OpenedFile { entry, file } = opened;
        let header = Reply::FileStartTcp {
            filename: entry.name.clone(),
            size: entry.size,
        }
        .to_bytes();

        let (done, outcome) = oneshot::channel();
        let stream = InlineStream {
            header,
            body: Box::new(file),
            len: entry.size,
            done: Some(done),
        };
        if let Err(e) = requester.send_stream(stream) {
            transfer.finish(0, Some(e.to_string()));
            return Err(e.into());
        }
        transfer.advance(TransferState::Streaming);

        tokio::spawn(async move {
            match outcome.await {
                Ok(StreamOutcome::Completed(sent)) => transfer.finish(sent, None),
                Ok(StreamOutcome::Aborted { sent, reason }) => transfer.finish(sent, Some(reason)),
                Err(_) => transfer.finish(0, Some("connection closed before streaming".into())),
            }
        });

        Ok(entry.size)
    }

    /// Announce and start a datagram transfer of `filename` to
    /// `peer_ip:port`.
    ///
    /// Returns the announced size.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::NotFound`] if the file is absent.
    pub async fn start_datagram(
        &self,
        requester: &Outbox,
        peer_ip: IpAddr,
        filename: &str,
        port: u16,
    ) -> Result<u64, TransferError> {
        let mut transfer = Transfer::new(TransferMode::Datagram, requester.id(), filename);
        let opened = match self.catalog.open(filename).await {
            Ok(opened) => opened,
            Err(e) => {
                let err = TransferError::from(e);
                transfer.reject(&err);
                return Err(err);
            }
        };
        transfer.advance(TransferState::Resolved);

        let OpenedFile { entry, file } = opened;
        let announcement = Reply::FileStartUdp {
            filename: entry.name.clone(),
            size: entry.size,
            port,
        };
        if let Err(e) = requester.send_reply(&announcement) {
            transfer.finish(0, Some(e.to_string()));
            return Err(e.into());
        }
        transfer.advance(TransferState::Streaming);

        let target = SocketAddr::new(peer_ip, port);
        let config = self.datagram;
        let size = entry.size;
        tokio::spawn(async move {
            let result = match DatagramSender::open(target, config).await {
                Ok(sender) => sender.send_from(file, size).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(sent) => transfer.finish(sent, None),
                Err(TransportError::ShortStream { sent, .. }) => {
                    transfer.finish(sent, Some("file shorter than announced".into()))
                }
                Err(e) => transfer.finish(0, Some(e.to_string())),
            }
        });

        Ok(entry.size)
    }
}
