//! Download bookkeeping: where files land and which UDP transfers are
//! waiting for their announcement.

use dashmap::DashMap;
use relay_transport::datagram::DEFAULT_IDLE_TIMEOUT;
use relay_transport::{DatagramReceiver, ReceiveSummary, TransportError};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::BufWriter;
use tracing::debug;

/// Ports a datagram receiver is bound to.
pub const DATAGRAM_PORTS: RangeInclusive<u16> = 10_000..=20_000;

const BIND_ATTEMPTS: usize = 32;

/// How long a bound receiver waits for its announcement before it is released.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(30);

/// Download errors.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The server named a file we refuse to write.
    #[error("Refusing to save file with unsafe name '{0}'")]
    UnsafeName(String),

    /// Every port we tried was taken.
    #[error("No free UDP port in {start}..={end}")]
    NoFreePort { start: u16, end: u16 },

    /// Socket failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

type PendingKey = (String, u16);

/// A bound receiver waiting for its `FILE_START_UDP` announcement.
#[derive(Debug)]
struct Pending {
    receiver: DatagramReceiver,
    since: Instant,
}

/// Download directory plus the registry of pending datagram transfers.
///
/// Cloning shares the registry, so the input task can register a transfer
/// that the server-reader task later claims.
#[derive(Debug, Clone)]
pub struct Downloads {
    dir: PathBuf,
    pending: Arc<DashMap<PendingKey, Pending>>,
    bind_ip: Ipv4Addr,
    server_ip: Option<IpAddr>,
    idle: Duration,
    ttl: Duration,
}

impl Downloads {
    /// Save downloads under `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pending: Arc::new(DashMap::new()),
            bind_ip: Ipv4Addr::UNSPECIFIED,
            server_ip: None,
            idle: DEFAULT_IDLE_TIMEOUT,
            ttl: DEFAULT_PENDING_TTL,
        }
    }

    /// The conventional directory for a user: `<name>_files`.
    #[must_use]
    pub fn for_user(name: &str) -> Self {
        Self::new(format!("{name}_files"))
    }

    /// Bind datagram receivers to `ip` instead of every interface.
    #[must_use]
    pub fn with_bind_ip(mut self, ip: Ipv4Addr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// Only accept file datagrams sent from the server at `ip`.
    #[must_use]
    pub fn with_server_ip(mut self, ip: IpAddr) -> Self {
        self.server_ip = Some(ip);
        self
    }

    /// Change how long a datagram receiver waits for the next packet.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    /// Change how long a request may go unanswered before its receiver is
    /// released.
    #[must_use]
    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Get the download directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of datagram transfers waiting for an announcement.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Where `filename` will be written.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UnsafeName`] for names that would escape the
    /// download directory.
    pub fn path_for(&self, filename: &str) -> Result<PathBuf, DownloadError> {
        let unsafe_name = filename.is_empty()
            || filename == "."
            || filename.contains("..")
            || filename.contains(['/', '\\', '\0']);
        if unsafe_name {
            return Err(DownloadError::UnsafeName(filename.to_string()));
        }
        Ok(self.dir.join(filename))
    }

    /// Create (or truncate) the destination file for `filename`.
    ///
    /// # Errors
    ///
    /// Returns an error for unsafe names or if the file cannot be created.
    pub async fn create(&self, filename: &str) -> Result<(PathBuf, BufWriter<File>), DownloadError> {
        let path = self.path_for(filename)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let file = File::create(&path).await?;
        Ok((path, BufWriter::new(file)))
    }

    /// Bind a receiver on a random port and register it for `filename`.
    ///
    /// The socket is bound before the request goes out, so datagrams that
    /// outrun the announcement wait in its buffer.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::NoFreePort`] if every attempt hit a port in
    /// use, or the underlying error for anything else.
    pub async fn prepare_datagram(&self, filename: &str) -> Result<u16, DownloadError> {
        self.expire_stale();
        for _ in 0..BIND_ATTEMPTS {
            let port = fastrand::u16(DATAGRAM_PORTS);
            let key = (filename.to_string(), port);
            if self.pending.contains_key(&key) {
                continue;
            }
            match DatagramReceiver::bind(SocketAddr::from((self.bind_ip, port))).await {
                Ok(receiver) => {
                    let receiver = match self.server_ip {
                        Some(ip) => receiver.accept_only(ip),
                        None => receiver,
                    };
                    debug!(filename, port, "Datagram receiver ready");
                    self.pending.insert(
                        key,
                        Pending {
                            receiver,
                            since: Instant::now(),
                        },
                    );
                    return Ok(port);
                }
                Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!(port, "Port in use, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(DownloadError::NoFreePort {
            start: *DATAGRAM_PORTS.start(),
            end: *DATAGRAM_PORTS.end(),
        })
    }

    /// Claim the receiver registered for `(filename, port)`.
    #[must_use]
    pub fn take_pending(&self, filename: &str, port: u16) -> Option<DatagramReceiver> {
        self.pending
            .remove(&(filename.to_string(), port))
            .map(|(_, pending)| pending.receiver)
    }

    /// Drop the longest-waiting receiver.
    ///
    /// The server answers one connection's requests in order, so when a
    /// request is rejected without naming its file, the oldest unanswered
    /// one is the request that was rejected.
    pub fn abandon_oldest(&self) -> Option<(String, u16)> {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|entry| entry.value().since)
            .map(|entry| entry.key().clone())?;
        self.pending.remove(&oldest).map(|(key, _)| key)
    }

    /// Drop receivers whose request has gone unanswered for longer than the
    /// pending TTL, returning how many.
    pub fn expire_stale(&self) -> usize {
        let before = self.pending.len();
        let ttl = self.ttl;
        self.pending
            .retain(|(filename, port), pending| {
                let keep = pending.since.elapsed() < ttl;
                if !keep {
                    debug!(filename = %filename, port, "Releasing unanswered datagram receiver");
                }
                keep
            });
        before - self.pending.len()
    }

    /// Drop every pending receiver for `filename`, returning how many.
    pub fn abandon(&self, filename: &str) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(name, _), _| name != filename);
        before - self.pending.len()
    }

    /// Receive an announced datagram transfer into the download directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or the socket fails.
    /// Running out of time is reported through the summary instead.
    pub async fn receive_datagram(
        &self,
        receiver: DatagramReceiver,
        filename: &str,
        size: u64,
    ) -> Result<(PathBuf, ReceiveSummary), DownloadError> {
        let (path, file) = self.create(filename).await?;
        let summary = receiver.receive_into(file, size, self.idle).await?;
        Ok((path, summary))
    }
}
