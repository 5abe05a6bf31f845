//! Protocol dispatcher.
//!
//! Owns the session table and every connection's outbox. The server loop
//! feeds it one decoded line at a time; all replies leave through outboxes
//! without waiting, so a slow peer only ever loses its own lines.

use relay_core::{ConnectionId, Delivery, Router, RoutingError, SessionError, SessionTable};
use relay_protocol::command::keywords;
use relay_protocol::{Command, Inbound, ProtocolError, Reply};
use relay_transport::{Outbox, TransportError};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

use crate::metrics::{self, ConnectionMetricsGuard};
use crate::transfer::{TransferCoordinator, TransferError};

/// What the loop should do with the connection after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// Tear the connection down.
    Close,
}

/// A monitored connection.
#[derive(Debug)]
struct Peer {
    addr: SocketAddr,
    outbox: Outbox,
    _metrics: ConnectionMetricsGuard,
}

/// Dispatches commands against the session table.
#[derive(Debug)]
pub struct Dispatcher {
    sessions: SessionTable,
    peers: HashMap<ConnectionId, Peer>,
    transfers: TransferCoordinator,
}

impl Dispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(sessions: SessionTable, transfers: TransferCoordinator) -> Self {
        Self {
            sessions,
            peers: HashMap::new(),
            transfers,
        }
    }

    /// Get the session table.
    #[must_use]
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Get the number of monitored connections.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Start monitoring a connection and greet it.
    pub fn attach(&mut self, id: ConnectionId, addr: SocketAddr, outbox: Outbox) {
        info!(connection = %id, remote = %addr, "Client connected");
        if let Err(e) = outbox.send_reply(&Reply::Greeting) {
            warn!(connection = %id, error = %e, "Failed to queue greeting");
        }
        self.peers.insert(
            id,
            Peer {
                addr,
                outbox,
                _metrics: ConnectionMetricsGuard::new(),
            },
        );
    }

    /// Handle one inbound line from `id`.
    pub async fn dispatch(&mut self, id: ConnectionId, inbound: Inbound) -> Flow {
        let registered = self.sessions.get(id).is_some();

        let line = match inbound {
            Inbound::Line(line) => line,
            Inbound::Oversized(len) => {
                warn!(connection = %id, len, "Discarded oversized line");
                metrics::record_error("line_too_long");
                self.reply(id, &Reply::InvalidFormat { command: "command" });
                return Flow::Continue;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            return Flow::Continue;
        }

        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(ProtocolError::InvalidFormat(command)) if registered || command == keywords::JOIN => {
                debug!(connection = %id, command, "Malformed command");
                self.reply(id, &Reply::InvalidFormat { command });
                return Flow::Continue;
            }
            Err(e) if registered => {
                debug!(connection = %id, error = %e, "Unknown command");
                self.reply(id, &Reply::UnknownCommand);
                return Flow::Continue;
            }
            Err(e) => {
                debug!(connection = %id, error = %e, "Ignoring line before JOIN");
                return Flow::Continue;
            }
        };
        metrics::record_message(command.keyword());

        let flow = if registered {
            self.dispatch_registered(id, command).await
        } else {
            self.dispatch_unregistered(id, command)
        };

        let stats = self.sessions.stats();
        metrics::set_table_sizes(stats.session_count, stats.group_count);
        flow
    }

    fn dispatch_unregistered(&mut self, id: ConnectionId, command: Command) -> Flow {
        match command {
            Command::Join { name } => self.join(id, &name),
            other => {
                debug!(connection = %id, command = other.keyword(), "Ignoring command before JOIN");
            }
        }
        Flow::Continue
    }

    async fn dispatch_registered(&mut self, id: ConnectionId, command: Command) -> Flow {
        match command {
            Command::Join { .. } => {
                if let Some(session) = self.sessions.get(id) {
                    let reply = Reply::AlreadyRegistered {
                        name: session.name().to_string(),
                    };
                    self.reply(id, &reply);
                }
            }
            Command::Broadcast { text } => {
                match Router::new(&self.sessions).broadcast(id, &text) {
                    Ok(deliveries) => self.deliver(deliveries),
                    Err(e) => warn!(connection = %id, error = %e, "Broadcast failed"),
                }
            }
            Command::Unicast { to, text } => match Router::new(&self.sessions).unicast(id, &to, &text)
            {
                Ok(delivery) => self.deliver(vec![delivery]),
                Err(RoutingError::UnknownRecipient(name)) => {
                    self.reply(id, &Reply::UserNotFound { name });
                }
                Err(e) => warn!(connection = %id, error = %e, "Unicast failed"),
            },
            Command::JoinGroup { group } => match self.sessions.join_group(id, &group) {
                Ok(_) => self.reply(id, &Reply::JoinedGroup { group }),
                Err(SessionError::InvalidName(reason)) => {
                    debug!(connection = %id, group = %group, reason, "Rejected group name");
                    self.reply(
                        id,
                        &Reply::InvalidFormat {
                            command: keywords::JOIN_GROUP,
                        },
                    );
                }
                Err(e) => warn!(connection = %id, error = %e, "Join group failed"),
            },
            Command::LeaveGroup { group } => match self.sessions.leave_group(id, &group) {
                Ok(_) => self.reply(id, &Reply::LeftGroup { group }),
                Err(SessionError::NotMember(group)) => {
                    self.reply(id, &Reply::NotInGroup { group });
                }
                Err(e) => warn!(connection = %id, error = %e, "Leave group failed"),
            },
            Command::GroupMsg { group, text } => {
                match Router::new(&self.sessions).group(id, &group, &text) {
                    Ok(deliveries) => self.deliver(deliveries),
                    Err(RoutingError::NotMember(group)) => {
                        self.reply(id, &Reply::NotGroupMember { group });
                    }
                    Err(e) => warn!(connection = %id, error = %e, "Group message failed"),
                }
            }
            Command::ListFiles => {
                let names = match self.transfers.catalog().list().await {
                    Ok(entries) => entries.into_iter().map(|entry| entry.name).collect(),
                    Err(e) => {
                        warn!(connection = %id, error = %e, "Failed to list shared files");
                        metrics::record_error("catalog");
                        Vec::new()
                    }
                };
                self.reply(id, &Reply::FilesList { names });
            }
            Command::DownloadTcp { filename } => {
                let Some(peer) = self.peers.get(&id) else {
                    return Flow::Close;
                };
                let result = self.transfers.start_inline(&peer.outbox, &filename).await;
                self.transfer_result(id, filename, result);
            }
            Command::DownloadUdp { filename, port } => {
                let Some(peer) = self.peers.get(&id) else {
                    return Flow::Close;
                };
                let peer_ip = peer.addr.ip().to_canonical();
                let result = self
                    .transfers
                    .start_datagram(&peer.outbox, peer_ip, &filename, port)
                    .await;
                self.transfer_result(id, filename, result);
            }
            Command::Exit => {
                debug!(connection = %id, "Client requested exit");
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    fn join(&mut self, id: ConnectionId, name: &str) {
        let result = self
            .sessions
            .register(id, name)
            .map(|session| session.name().to_string());

        match result {
            Ok(name) => {
                let deliveries =
                    Router::new(&self.sessions).announce(Some(id), &Reply::UserJoined { name });
                self.deliver(deliveries);
            }
            Err(SessionError::NameConflict(name)) => {
                info!(connection = %id, name = %name, "Rejected duplicate name");
                self.reply(id, &Reply::NameTaken { name });
            }
            Err(SessionError::InvalidName(reason)) => {
                self.reply(id, &Reply::InvalidName { reason });
            }
            Err(e) => warn!(connection = %id, error = %e, "Registration failed"),
        }
    }

    fn transfer_result(&self, id: ConnectionId, filename: String, result: Result<u64, TransferError>) {
        match result {
            Ok(size) => debug!(connection = %id, file = %filename, size, "Transfer started"),
            Err(TransferError::NotFound(_)) => {
                self.reply(id, &Reply::FileNotFound { filename });
            }
            Err(TransferError::Io(e)) => {
                warn!(connection = %id, file = %filename, error = %e, "Failed to open shared file");
                metrics::record_error("catalog");
                self.reply(id, &Reply::FileNotFound { filename });
            }
            Err(TransferError::Transport(e)) => {
                record_send_failure(id, &e);
            }
        }
    }

    /// Stop monitoring a connection, destroy its session, and tell everyone
    /// else it left.
    ///
    /// Returns `false` if the connection was already gone. Dropping the
    /// outbox lets the writer flush what is queued and close the socket.
    pub fn disconnect(&mut self, id: ConnectionId) -> bool {
        let peer = self.peers.remove(&id);
        let session = self.sessions.remove(id);

        if let Some(session) = &session {
            let deliveries = Router::new(&self.sessions).announce(
                None,
                &Reply::UserLeft {
                    name: session.name().to_string(),
                },
            );
            self.deliver(deliveries);
        }

        let stats = self.sessions.stats();
        metrics::set_table_sizes(stats.session_count, stats.group_count);

        if let Some(peer) = &peer {
            info!(connection = %id, remote = %peer.addr, "Client disconnected");
        }
        peer.is_some() || session.is_some()
    }

    /// Drop every connection without announcements.
    pub fn close_all(&mut self) {
        let ids: Vec<ConnectionId> = self.peers.keys().copied().collect();
        for id in ids {
            self.sessions.remove(id);
        }
        self.peers.clear();
        metrics::set_table_sizes(0, 0);
    }

    fn reply(&self, id: ConnectionId, reply: &Reply) {
        if let Some(peer) = self.peers.get(&id) {
            if let Err(e) = peer.outbox.send_reply(reply) {
                record_send_failure(id, &e);
            }
        }
    }

    fn deliver(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            let Some(peer) = self.peers.get(&delivery.target) else {
                continue;
            };
            if let Err(e) = peer.outbox.send_line(delivery.line) {
                record_send_failure(delivery.target, &e);
            }
        }
    }
}

fn record_send_failure(id: ConnectionId, err: &TransportError) {
    warn!(connection = %id, error = %err, "Dropped outbound line");
    let kind = match err {
        TransportError::OutboxFull => "outbox_full",
        TransportError::ConnectionClosed => "connection_closed",
        _ => "transport",
    };
    metrics::record_error(kind);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SharedCatalog;
    use relay_transport::{DatagramConfig, Outbound};
    use tokio::sync::mpsc;

    struct Harness {
        dispatcher: Dispatcher,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("b.txt"), b"bee").unwrap();
            std::fs::write(dir.path().join("a.txt"), b"ay").unwrap();
            let transfers = TransferCoordinator::new(
                SharedCatalog::new(dir.path()),
                DatagramConfig::default(),
            );
            Self {
                dispatcher: Dispatcher::new(SessionTable::new(), transfers),
                _dir: dir,
            }
        }

        fn connect(&mut self, raw: u64) -> (ConnectionId, mpsc::Receiver<Outbound>) {
            let id = ConnectionId::from_raw(raw);
            let (outbox, mut rx) = Outbox::channel(id, 64);
            self.dispatcher
                .attach(id, "127.0.0.1:40000".parse().unwrap(), outbox);
            assert_eq!(drain(&mut rx), vec![relay_protocol::reply::GREETING]);
            (id, rx)
        }

        async fn send(&mut self, id: ConnectionId, line: &str) -> Flow {
            self.dispatcher
                .dispatch(id, Inbound::Line(line.to_string()))
                .await
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(item) = rx.try_recv() {
            match item {
                Outbound::Line(line) => lines.push(String::from_utf8(line.to_vec()).unwrap()),
                Outbound::Stream(stream) => {
                    lines.push(String::from_utf8(stream.header.to_vec()).unwrap());
                }
            }
        }
        lines
    }

    #[tokio::test]
    async fn test_join_announces_to_others_only() {
        let mut h = Harness::new();
        let (alice, mut alice_rx) = h.connect(1);
        let (bob, mut bob_rx) = h.connect(2);

        h.send(alice, "JOIN alice").await;
        assert!(drain(&mut alice_rx).is_empty());
        assert!(drain(&mut bob_rx).is_empty());

        h.send(bob, "JOIN bob").await;
        assert_eq!(drain(&mut alice_rx), vec!["Server: bob has joined"]);
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_lines_are_ignored() {
        let mut h = Harness::new();
        let (id, mut rx) = h.connect(1);

        assert_eq!(h.send(id, "BROADCAST hi").await, Flow::Continue);
        assert_eq!(h.send(id, "garbage").await, Flow::Continue);
        assert_eq!(h.send(id, "/exit").await, Flow::Continue);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(h.dispatcher.peer_count(), 1);

        h.send(id, "JOIN").await;
        assert_eq!(drain(&mut rx), vec!["Server: Invalid JOIN format."]);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let mut h = Harness::new();
        let (a, _a_rx) = h.connect(1);
        let (b, mut b_rx) = h.connect(2);

        h.send(a, "JOIN alice").await;
        h.send(b, "JOIN alice").await;
        assert_eq!(drain(&mut b_rx), vec!["Server: Name 'alice' is already taken."]);

        h.send(b, "JOIN bob").await;
        assert_eq!(h.dispatcher.sessions().len(), 2);

        h.send(b, "JOIN again").await;
        assert_eq!(drain(&mut b_rx), vec!["Server: Already registered as 'bob'."]);
    }

    #[tokio::test]
    async fn test_broadcast_and_unicast() {
        let mut h = Harness::new();
        let (a, mut a_rx) = h.connect(1);
        let (b, mut b_rx) = h.connect(2);
        let (c, mut c_rx) = h.connect(3);
        h.send(a, "JOIN alice").await;
        h.send(b, "JOIN bob").await;
        h.send(c, "JOIN carol").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        h.send(a, "BROADCAST hello all").await;
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(drain(&mut b_rx), vec!["[Broadcast] alice: hello all"]);
        assert_eq!(drain(&mut c_rx), vec!["[Broadcast] alice: hello all"]);

        h.send(b, "UNICAST carol psst").await;
        assert_eq!(drain(&mut c_rx), vec!["[PM from bob]: psst"]);
        assert!(drain(&mut a_rx).is_empty());

        h.send(b, "UNICAST nobody hello").await;
        assert_eq!(drain(&mut b_rx), vec!["Server: User 'nobody' not found."]);
        assert!(drain(&mut a_rx).is_empty());
        assert!(drain(&mut c_rx).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_commands() {
        let mut h = Harness::new();
        let (a, mut rx) = h.connect(1);
        h.send(a, "JOIN alice").await;

        h.send(a, "UNICAST bob").await;
        h.send(a, "BROADCAST").await;
        h.send(a, "FROBNICATE now").await;
        assert_eq!(
            drain(&mut rx),
            vec![
                "Server: Invalid UNICAST format.",
                "Server: Invalid BROADCAST format.",
                "Server: Unknown command or protocol error.",
            ]
        );

        h.dispatcher.dispatch(a, Inbound::Oversized(10_000)).await;
        assert_eq!(drain(&mut rx), vec!["Server: Invalid command format."]);

        assert_eq!(h.send(a, "   ").await, Flow::Continue);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_group_lifecycle() {
        let mut h = Harness::new();
        let (a, mut a_rx) = h.connect(1);
        let (b, mut b_rx) = h.connect(2);
        let (c, mut c_rx) = h.connect(3);
        h.send(a, "JOIN alice").await;
        h.send(b, "JOIN bob").await;
        h.send(c, "JOIN carol").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        h.send(a, "JOIN_GROUP devs").await;
        h.send(c, "JOIN_GROUP devs").await;
        assert_eq!(drain(&mut a_rx), vec!["Server: You joined group 'devs'."]);
        assert_eq!(drain(&mut c_rx), vec!["Server: You joined group 'devs'."]);

        h.send(a, "GROUP_MSG devs ship it").await;
        assert_eq!(drain(&mut c_rx), vec!["[Group devs] alice: ship it"]);
        assert!(drain(&mut b_rx).is_empty());
        assert!(drain(&mut a_rx).is_empty());

        h.send(b, "GROUP_MSG devs hi").await;
        assert_eq!(
            drain(&mut b_rx),
            vec!["Server: You are not a member of group 'devs'."]
        );
        h.send(b, "LEAVE_GROUP devs").await;
        assert_eq!(drain(&mut b_rx), vec!["Server: You are not in group 'devs'."]);

        h.send(a, "LEAVE_GROUP devs").await;
        assert_eq!(drain(&mut a_rx), vec!["Server: You left group 'devs'."]);
        h.dispatcher.disconnect(c);
        assert!(!h.dispatcher.sessions().group_exists("devs"));
    }

    #[tokio::test]
    async fn test_list_files() {
        let mut h = Harness::new();
        let (a, mut rx) = h.connect(1);
        h.send(a, "JOIN alice").await;
        h.send(a, "LIST_FILES").await;
        assert_eq!(
            drain(&mut rx),
            vec!["FILES_LIST 2 files available:\na.txt\nb.txt"]
        );
    }

    #[tokio::test]
    async fn test_download_requests() {
        let mut h = Harness::new();
        let (a, mut rx) = h.connect(1);
        h.send(a, "JOIN alice").await;

        h.send(a, "DOWNLOAD_TCP b.txt").await;
        assert_eq!(drain(&mut rx), vec!["FILE_START_TCP b.txt 3"]);

        h.send(a, "DOWNLOAD_TCP missing.txt").await;
        h.send(a, "DOWNLOAD_UDP ../etc/passwd 15000").await;
        assert_eq!(
            drain(&mut rx),
            vec![
                "Server: File 'missing.txt' not found.",
                "Server: File '../etc/passwd' not found.",
            ]
        );
    }

    #[tokio::test]
    async fn test_exit_and_disconnect_are_idempotent() {
        let mut h = Harness::new();
        let (a, _a_rx) = h.connect(1);
        let (b, mut b_rx) = h.connect(2);
        h.send(a, "JOIN alice").await;
        h.send(b, "JOIN bob").await;

        assert_eq!(h.send(a, "/exit").await, Flow::Close);
        assert!(h.dispatcher.disconnect(a));
        assert!(!h.dispatcher.disconnect(a));
        assert_eq!(drain(&mut b_rx), vec!["Server: alice has left"]);
        assert_eq!(h.dispatcher.peer_count(), 1);
        assert!(h.dispatcher.sessions().lookup_by_name("alice").is_none());
    }

    #[tokio::test]
    async fn test_failed_recipient_does_not_affect_others() {
        let mut h = Harness::new();
        let (a, _a_rx) = h.connect(1);
        let (b, b_rx) = h.connect(2);
        let (c, mut c_rx) = h.connect(3);
        h.send(a, "JOIN alice").await;
        h.send(b, "JOIN bob").await;
        h.send(c, "JOIN carol").await;
        drain(&mut c_rx);
        drop(b_rx);

        h.send(a, "BROADCAST still here").await;
        assert_eq!(drain(&mut c_rx), vec!["[Broadcast] alice: still here"]);
    }
}
