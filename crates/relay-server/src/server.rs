//! The multiplexing loop.
//!
//! One task owns the [`Dispatcher`] and waits on four things at once: a new
//! connection, a line from any monitored connection, a writer failure, and
//! shutdown. Every connection's reader lives in a single [`StreamMap`], so
//! there is no per-connection reader task and no lock around the tables.

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};
use relay_core::{ConnectionId, SessionTable};
use relay_protocol::{Inbound, ProtocolError, Reply};
use relay_transport::{Accepted, Transport, TcpTransport};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::StreamMap;
use tracing::{debug, error, info, warn};

use crate::catalog::SharedCatalog;
use crate::config::Config;
use crate::dispatcher::{Dispatcher, Flow};
use crate::metrics;
use crate::transfer::TransferCoordinator;

/// Something a monitored connection produced.
enum ReadEvent {
    Line(Result<Inbound, ProtocolError>),
    Closed,
}

type EventStream = Pin<Box<dyn futures_util::Stream<Item = ReadEvent> + Send>>;

/// A bound relay server.
pub struct Server {
    transport: TcpTransport,
    dispatcher: Dispatcher,
    readers: StreamMap<ConnectionId, EventStream>,
    failures: mpsc::UnboundedReceiver<ConnectionId>,
    max_connections: usize,
}

impl Server {
    /// Bind the listener and prepare the shared directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or the shared
    /// directory cannot be created.
    pub async fn bind(config: &Config) -> Result<Self> {
        let catalog = SharedCatalog::new(&config.shared_dir);
        catalog.ensure_exists().await.with_context(|| {
            format!(
                "Failed to prepare shared directory {}",
                config.shared_dir.display()
            )
        })?;

        let (failures_tx, failures) = mpsc::unbounded_channel();
        let tcp = config.tcp_config()?;
        let bind_addr = tcp.bind_addr;
        let transport = TcpTransport::bind(tcp, failures_tx)
            .await
            .with_context(|| format!("Failed to bind {bind_addr}"))?;

        let transfers = TransferCoordinator::new(catalog, config.datagram_config());
        let sessions = SessionTable::with_max_name_length(config.limits.max_name_length);

        Ok(Self {
            transport,
            dispatcher: Dispatcher::new(sessions, transfers),
            readers: StreamMap::new(),
            failures,
            max_connections: config.limits.max_connections,
        })
    }

    /// Get the bound address.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Run until Ctrl-C.
    ///
    /// # Errors
    ///
    /// Currently never fails once bound; the signature leaves room for fatal
    /// listener errors.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `shutdown` resolves, then close every connection.
    ///
    /// # Errors
    ///
    /// See [`Server::run`].
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Relay server listening on {}",
            self.local_addr()
                .map_or_else(|| "unknown".to_string(), |addr| addr.to_string())
        );
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => self.admit(conn),
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        metrics::record_error("accept");
                    }
                },
                Some((id, event)) = self.readers.next(), if !self.readers.is_empty() => {
                    match event {
                        ReadEvent::Line(Ok(inbound)) => {
                            if self.dispatcher.dispatch(id, inbound).await == Flow::Close {
                                self.close(id, "exit");
                            }
                        }
                        ReadEvent::Line(Err(e)) => {
                            debug!(connection = %id, error = %e, "Read failed");
                            metrics::record_error("read");
                            self.close(id, "read error");
                        }
                        ReadEvent::Closed => self.close(id, "peer closed"),
                    }
                }
                Some(id) = self.failures.recv() => self.close(id, "write error"),
            }
        }

        self.readers = StreamMap::new();
        self.dispatcher.close_all();
        info!("Relay server stopped");
        Ok(())
    }

    fn admit(&mut self, conn: Accepted) {
        let Accepted {
            id,
            remote_addr,
            reader,
            outbox,
        } = conn;

        if self.dispatcher.peer_count() >= self.max_connections {
            warn!(connection = %id, remote = %remote_addr, "Server full, refusing connection");
            metrics::record_rejection();
            // Dropping the outbox afterwards flushes the notice and closes.
            let _ = outbox.send_reply(&Reply::ServerFull);
            return;
        }

        let events: EventStream = Box::pin(
            reader
                .map(ReadEvent::Line)
                .chain(stream::once(async { ReadEvent::Closed })),
        );
        self.readers.insert(id, events);
        self.dispatcher.attach(id, remote_addr, outbox);
    }

    /// Tear a connection down. Safe to call more than once.
    fn close(&mut self, id: ConnectionId, reason: &'static str) {
        self.readers.remove(&id);
        if self.dispatcher.disconnect(id) {
            debug!(connection = %id, reason, "Connection closed");
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("transport", &self.transport)
            .field("connections", &self.readers.len())
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}
