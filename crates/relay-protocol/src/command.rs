//! Client commands for the relay protocol.
//!
//! Each command occupies one line. Fields are separated by a single space and
//! the final field of a command may itself contain spaces.

use std::fmt;
use std::str::FromStr;

use crate::codec::ProtocolError;

/// Command keywords as they appear on the wire.
pub mod keywords {
    pub const JOIN: &str = "JOIN";
    pub const BROADCAST: &str = "BROADCAST";
    pub const UNICAST: &str = "UNICAST";
    pub const JOIN_GROUP: &str = "JOIN_GROUP";
    pub const LEAVE_GROUP: &str = "LEAVE_GROUP";
    pub const GROUP_MSG: &str = "GROUP_MSG";
    pub const LIST_FILES: &str = "LIST_FILES";
    pub const DOWNLOAD_TCP: &str = "DOWNLOAD_TCP";
    pub const DOWNLOAD_UDP: &str = "DOWNLOAD_UDP";
    pub const EXIT: &str = "/exit";
}

/// A command sent by a client on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Register a display name for this connection.
    Join {
        /// Requested display name.
        name: String,
    },

    /// Send text to every other registered session.
    Broadcast {
        /// Message body.
        text: String,
    },

    /// Send text to one session, looked up by name.
    Unicast {
        /// Recipient display name.
        to: String,
        /// Message body.
        text: String,
    },

    /// Join a group, creating it if needed.
    JoinGroup {
        /// Group name.
        group: String,
    },

    /// Leave a group.
    LeaveGroup {
        /// Group name.
        group: String,
    },

    /// Send text to the other members of a group.
    GroupMsg {
        /// Group name.
        group: String,
        /// Message body.
        text: String,
    },

    /// List the shared file catalog.
    ListFiles,

    /// Download a file inline on the control connection.
    DownloadTcp {
        /// File name within the catalog.
        filename: String,
    },

    /// Download a file as datagrams sent to `port` on the client's address.
    DownloadUdp {
        /// File name within the catalog.
        filename: String,
        /// Client-side UDP port.
        port: u16,
    },

    /// Leave the server and close the connection.
    Exit,
}

impl Command {
    /// Parse one line into a command.
    ///
    /// Surrounding whitespace (including a trailing `\r`) is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidFormat`] when the keyword is known but
    /// its arguments are missing or malformed, and
    /// [`ProtocolError::UnknownCommand`] for anything else.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        let (keyword, rest) = match line.split_once(' ') {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (line, ""),
        };

        match keyword {
            keywords::JOIN => Ok(Command::Join {
                name: required(rest, keywords::JOIN)?.to_string(),
            }),
            keywords::BROADCAST => Ok(Command::Broadcast {
                text: required(rest, keywords::BROADCAST)?.to_string(),
            }),
            keywords::UNICAST => {
                let (to, text) = pair(rest, keywords::UNICAST)?;
                Ok(Command::Unicast {
                    to: to.to_string(),
                    text: text.to_string(),
                })
            }
            keywords::JOIN_GROUP => Ok(Command::JoinGroup {
                group: required(rest, keywords::JOIN_GROUP)?.to_string(),
            }),
            keywords::LEAVE_GROUP => Ok(Command::LeaveGroup {
                group: required(rest, keywords::LEAVE_GROUP)?.to_string(),
            }),
            keywords::GROUP_MSG => {
                let (group, text) = pair(rest, keywords::GROUP_MSG)?;
                Ok(Command::GroupMsg {
                    group: group.to_string(),
                    text: text.to_string(),
                })
            }
            keywords::LIST_FILES => {
                none(rest, keywords::LIST_FILES)?;
                Ok(Command::ListFiles)
            }
            keywords::DOWNLOAD_TCP => Ok(Command::DownloadTcp {
                filename: required(rest, keywords::DOWNLOAD_TCP)?.to_string(),
            }),
            keywords::DOWNLOAD_UDP => {
                // The port is the last field so filenames may contain spaces.
                let (filename, port) = rest
                    .rsplit_once(' ')
                    .ok_or(ProtocolError::InvalidFormat(keywords::DOWNLOAD_UDP))?;
                let filename = filename.trim_end();
                let port: u16 = port
                    .parse()
                    .map_err(|_| ProtocolError::InvalidFormat(keywords::DOWNLOAD_UDP))?;
                if filename.is_empty() || port == 0 {
                    return Err(ProtocolError::InvalidFormat(keywords::DOWNLOAD_UDP));
                }
                Ok(Command::DownloadUdp {
                    filename: filename.to_string(),
                    port,
                })
            }
            keywords::EXIT => {
                none(rest, keywords::EXIT)?;
                Ok(Command::Exit)
            }
            _ => Err(ProtocolError::UnknownCommand(line.to_string())),
        }
    }

    /// The wire keyword of this command.
    #[must_use]
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::Join { .. } => keywords::JOIN,
            Command::Broadcast { .. } => keywords::BROADCAST,
            Command::Unicast { .. } => keywords::UNICAST,
            Command::JoinGroup { .. } => keywords::JOIN_GROUP,
            Command::LeaveGroup { .. } => keywords::LEAVE_GROUP,
            Command::GroupMsg { .. } => keywords::GROUP_MSG,
            Command::ListFiles => keywords::LIST_FILES,
            Command::DownloadTcp { .. } => keywords::DOWNLOAD_TCP,
            Command::DownloadUdp { .. } => keywords::DOWNLOAD_UDP,
            Command::Exit => keywords::EXIT,
        }
    }
}

fn required<'a>(rest: &'a str, keyword: &'static str) -> Result<&'a str, ProtocolError> {
    if rest.is_empty() {
        Err(ProtocolError::InvalidFormat(keyword))
    } else {
        Ok(rest)
    }
}

fn pair<'a>(rest: &'a str, keyword: &'static str) -> Result<(&'a str, &'a str), ProtocolError> {
    let (head, tail) = rest
        .split_once(' ')
        .ok_or(ProtocolError::InvalidFormat(keyword))?;
    let tail = tail.trim_start();
    if head.is_empty() || tail.is_empty() {
        return Err(ProtocolError::InvalidFormat(keyword));
    }
    Ok((head, tail))
}

fn none(rest: &str, keyword: &'static str) -> Result<(), ProtocolError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::InvalidFormat(keyword))
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::parse(s)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Join { name } => write!(f, "{} {}", keywords::JOIN, name),
            Command::Broadcast { text } => write!(f, "{} {}", keywords::BROADCAST, text),
            Command::Unicast { to, text } => write!(f, "{} {} {}", keywords::UNICAST, to, text),
            Command::JoinGroup { group } => write!(f, "{} {}", keywords::JOIN_GROUP, group),
            Command::LeaveGroup { group } => write!(f, "{} {}", keywords::LEAVE_GROUP, group),
            Command::GroupMsg { group, text } => {
                write!(f, "{} {} {}", keywords::GROUP_MSG, group, text)
            }
            Command::ListFiles => f.write_str(keywords::LIST_FILES),
            Command::DownloadTcp { filename } => {
                write!(f, "{} {}", keywords::DOWNLOAD_TCP, filename)
            }
            Command::DownloadUdp { filename, port } => {
                write!(f, "{} {} {}", keywords::DOWNLOAD_UDP, filename, port)
            }
            Command::Exit => f.write_str(keywords::EXIT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("JOIN alice").unwrap(),
            Command::Join {
                name: "alice".into()
            }
        );
        assert_eq!(
            Command::parse("BROADCAST hello there\r").unwrap(),
            Command::Broadcast {
                text: "hello there".into()
            }
        );
        assert_eq!(
            Command::parse("GROUP_MSG devs ship it today").unwrap(),
            Command::GroupMsg {
                group: "devs".into(),
                text: "ship it today".into()
            }
        );
        assert_eq!(Command::parse("LIST_FILES").unwrap(), Command::ListFiles);
        assert_eq!(Command::parse("/exit").unwrap(), Command::Exit);
    }

    #[test]
    fn test_parse_download_udp_with_spaces_in_filename() {
        assert_eq!(
            Command::parse("DOWNLOAD_UDP annual report.pdf 15000").unwrap(),
            Command::DownloadUdp {
                filename: "annual report.pdf".into(),
                port: 15000
            }
        );
    }

    #[test]
    fn test_missing_arguments_are_format_errors() {
        for line in [
            "JOIN",
            "BROADCAST",
            "UNICAST",
            "UNICAST bob",
            "GROUP_MSG devs",
            "JOIN_GROUP",
            "DOWNLOAD_TCP",
            "DOWNLOAD_UDP file.txt",
            "DOWNLOAD_UDP file.txt notaport",
            "DOWNLOAD_UDP file.txt 0",
            "LIST_FILES now",
        ] {
            assert!(
                matches!(Command::parse(line), Err(ProtocolError::InvalidFormat(_))),
                "{line:?} should be a format error"
            );
        }
    }

    #[test]
    fn test_unknown_commands() {
        assert!(matches!(
            Command::parse("HELLO world"),
            Err(ProtocolError::UnknownCommand(_))
        ));
        // Keywords are case-sensitive.
        assert!(matches!(
            Command::parse("broadcast hi"),
            Err(ProtocolError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_display_matches_wire_format() {
        let command = Command::DownloadUdp {
            filename: "welcome.txt".into(),
            port: 12001,
        };
        assert_eq!(command.to_string(), "DOWNLOAD_UDP welcome.txt 12001");
        assert_eq!(Command::parse(&command.to_string()).unwrap(), command);
        assert_eq!(command.keyword(), keywords::DOWNLOAD_UDP);
    }
}
