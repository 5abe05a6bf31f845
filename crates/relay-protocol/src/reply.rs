//! Server replies and announcements.
//!
//! Every reply renders to exactly one line of text, except [`Reply::FilesList`]
//! which renders a header line followed by one line per file name. Only the
//! announcements (`FILE_START_TCP`, `FILE_START_UDP`, `FILES_LIST`) are meant
//! to be machine-readable; the rest are human-readable notices.

use bytes::Bytes;
use std::fmt;

use crate::codec::ProtocolError;

/// Announcement prefixes.
pub mod prefixes {
    pub const FILE_START_TCP: &str = "FILE_START_TCP";
    pub const FILE_START_UDP: &str = "FILE_START_UDP";
    pub const FILES_LIST: &str = "FILES_LIST";
}

/// Greeting sent to every new connection.
pub const GREETING: &str = "Welcome to the instant messenger!";

/// A line (or block of lines) written by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Sent once on connect.
    Greeting,
    /// Sent before closing a connection refused for capacity.
    ServerFull,
    /// A session registered.
    UserJoined { name: String },
    /// A session went away.
    UserLeft { name: String },
    /// Broadcast text from another session.
    Broadcast { from: String, text: String },
    /// Private text from another session.
    Private { from: String, text: String },
    /// Group text from another member.
    Group {
        group: String,
        from: String,
        text: String,
    },
    /// Unicast recipient does not exist.
    UserNotFound { name: String },
    /// Acknowledges `JOIN_GROUP`.
    JoinedGroup { group: String },
    /// Acknowledges `LEAVE_GROUP`.
    LeftGroup { group: String },
    /// `LEAVE_GROUP` for a group the sender is not in.
    NotInGroup { group: String },
    /// `GROUP_MSG` for a group the sender is not in.
    NotGroupMember { group: String },
    /// Known command with malformed arguments.
    InvalidFormat { command: &'static str },
    /// Anything the dispatcher does not recognize.
    UnknownCommand,
    /// Requested file is not in the catalog.
    FileNotFound { filename: String },
    /// `JOIN` with a name held by another live session.
    NameTaken { name: String },
    /// `JOIN` on a connection that already has a session.
    AlreadyRegistered { name: String },
    /// `JOIN` with a name that fails validation.
    InvalidName { reason: &'static str },
    /// Catalog listing.
    FilesList { names: Vec<String> },
    /// Precedes exactly `size` bytes of file data on the same connection.
    FileStartTcp { filename: String, size: u64 },
    /// Announces `size` bytes of datagrams headed for `port`.
    FileStartUdp {
        filename: String,
        size: u64,
        port: u16,
    },
}

impl Reply {
    /// Render the reply without its trailing newline.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Greeting => f.write_str(GREETING),
            Reply::ServerFull => f.write_str("Server: Server is full."),
            Reply::UserJoined { name } => write!(f, "Server: {name} has joined"),
            Reply::UserLeft { name } => write!(f, "Server: {name} has left"),
            Reply::Broadcast { from, text } => write!(f, "[Broadcast] {from}: {text}"),
            Reply::Private { from, text } => write!(f, "[PM from {from}]: {text}"),
            Reply::Group { group, from, text } => write!(f, "[Group {group}] {from}: {text}"),
            Reply::UserNotFound { name } => write!(f, "Server: User '{name}' not found."),
            Reply::JoinedGroup { group } => write!(f, "Server: You joined group '{group}'."),
            Reply::LeftGroup { group } => write!(f, "Server: You left group '{group}'."),
            Reply::NotInGroup { group } => write!(f, "Server: You are not in group '{group}'."),
            Reply::NotGroupMember { group } => {
                write!(f, "Server: You are not a member of group '{group}'.")
            }
            Reply::InvalidFormat { command } => write!(f, "Server: Invalid {command} format."),
            Reply::UnknownCommand => f.write_str("Server: Unknown command or protocol error."),
            Reply::FileNotFound { filename } => write!(f, "Server: File '{filename}' not found."),
            Reply::NameTaken { name } => write!(f, "Server: Name '{name}' is already taken."),
            Reply::AlreadyRegistered { name } => {
                write!(f, "Server: Already registered as '{name}'.")
            }
            Reply::InvalidName { reason } => write!(f, "Server: Invalid name: {reason}."),
            Reply::FilesList { names } => {
                write!(f, "{} {} files available:", prefixes::FILES_LIST, names.len())?;
                for name in names {
                    write!(f, "\n{name}")?;
                }
                Ok(())
            }
            Reply::FileStartTcp { filename, size } => {
                write!(f, "{} {filename} {size}", prefixes::FILE_START_TCP)
            }
            Reply::FileStartUdp {
                filename,
                size,
                port,
            } => write!(f, "{} {filename} {size} {port}", prefixes::FILE_START_UDP),
        }
    }
}

/// The machine-readable subset of server lines, as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    /// `FILE_START_TCP <filename> <size>`
    FileStartTcp { filename: String, size: u64 },
    /// `FILE_START_UDP <filename> <size> <port>`
    FileStartUdp {
        filename: String,
        size: u64,
        port: u16,
    },
    /// `FILES_LIST <count> files available:`
    FilesList { count: usize },
}

impl Announcement {
    /// Parse a server line.
    ///
    /// Returns `Ok(None)` for lines that are not announcements.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedAnnouncement`] if the line carries an
    /// announcement prefix but its fields cannot be parsed.
    pub fn parse(line: &str) -> Result<Option<Self>, ProtocolError> {
        let malformed = || ProtocolError::MalformedAnnouncement(line.to_string());

        if let Some(rest) = strip_keyword(line, prefixes::FILE_START_TCP) {
            let (filename, size) = rest.rsplit_once(' ').ok_or_else(malformed)?;
            let size = size.parse().map_err(|_| malformed())?;
            if filename.is_empty() {
                return Err(malformed());
            }
            return Ok(Some(Announcement::FileStartTcp {
                filename: filename.to_string(),
                size,
            }));
        }

        if let Some(rest) = strip_keyword(line, prefixes::FILE_START_UDP) {
            let (head, port) = rest.rsplit_once(' ').ok_or_else(malformed)?;
            let (filename, size) = head.rsplit_once(' ').ok_or_else(malformed)?;
            let size = size.parse().map_err(|_| malformed())?;
            let port = port.parse().map_err(|_| malformed())?;
            if filename.is_empty() {
                return Err(malformed());
            }
            return Ok(Some(Announcement::FileStartUdp {
                filename: filename.to_string(),
                size,
                port,
            }));
        }

        if let Some(rest) = strip_keyword(line, prefixes::FILES_LIST) {
            let count = rest
                .split(' ')
                .next()
                .and_then(|count| count.parse().ok())
                .ok_or_else(malformed)?;
            return Ok(Some(Announcement::FilesList { count }));
        }

        Ok(None)
    }
}

fn strip_keyword<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    line.strip_prefix(keyword)?.strip_prefix(' ')
}
