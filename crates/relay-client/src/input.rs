//! Keyboard input handling.
//!
//! The client keeps a current mode. Slash commands switch it or issue
//! one-off requests; any other text is sent in the current mode.

use relay_protocol::Command;
use std::fmt;
use std::str::FromStr;

/// The menu printed once after connecting.
pub const MENU: &str = "\
Commands:
  /broadcast [msg]            Switch to broadcast mode (optionally send msg)
  /unicast <user> [msg]       Switch to private messages with <user>
  /join <group>               Join a group
  /leave <group>              Leave a group
  /group <group> [msg]        Switch to messages for <group>
  /list                       List files shared by the server
  /download <file> <TCP|UDP>  Download a shared file
  /exit                       Leave the chat
Anything else is sent in the current mode.";

/// Where plain text goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Mode {
    /// Everyone else on the server.
    #[default]
    Broadcast,
    /// One user.
    Unicast(String),
    /// Members of one group.
    Group(String),
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Broadcast => write!(f, "BROADCAST mode"),
            Mode::Unicast(target) => write!(f, "UNICAST mode (Target: {target})"),
            Mode::Group(target) => write!(f, "GROUP mode (Target: {target})"),
        }
    }
}

/// How a download is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Inline on the control connection.
    Tcp,
    /// Best-effort datagrams.
    Udp,
}

impl FromStr for TransferKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(TransferKind::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(TransferKind::Udp)
        } else {
            Err(())
        }
    }
}

/// What the client should do with one line of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Show text locally.
    Print(String),
    /// Send a command to the server.
    Send(Command),
    /// Request a download. UDP downloads need a local socket first.
    Download {
        /// File name within the server's catalog.
        filename: String,
        /// Delivery mode.
        kind: TransferKind,
    },
    /// Send `/exit` and stop.
    Exit,
}

/// Input state: the current mode.
#[derive(Debug, Clone, Default)]
pub struct InputState {
    mode: Mode,
}

impl InputState {
    /// Start in broadcast mode.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current mode.
    #[must_use]
    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Translate one line of input into actions, switching mode as needed.
    pub fn translate(&mut self, line: &str) -> Vec<Action> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        if !line.starts_with('/') {
            return vec![self.in_mode(line)];
        }

        let (keyword, rest) = split_word(line);
        match keyword {
            "/exit" => vec![Action::Exit],
            "/list" => vec![Action::Send(Command::ListFiles)],
            "/broadcast" => {
                self.mode = Mode::Broadcast;
                self.switched(rest)
            }
            "/unicast" => match split_word(rest) {
                ("", _) => vec![usage("/unicast <user> [msg]")],
                (target, text) => {
                    self.mode = Mode::Unicast(target.to_string());
                    self.switched(text)
                }
            },
            "/group" => match split_word(rest) {
                ("", _) => vec![usage("/group <group> [msg]")],
                (target, text) => {
                    self.mode = Mode::Group(target.to_string());
                    self.switched(text)
                }
            },
            "/join" => match split_word(rest) {
                ("", _) => vec![usage("/join <group>")],
                (group, _) => vec![Action::Send(Command::JoinGroup {
                    group: group.to_string(),
                })],
            },
            "/leave" => match split_word(rest) {
                ("", _) => vec![usage("/leave <group>")],
                (group, _) => vec![Action::Send(Command::LeaveGroup {
                    group: group.to_string(),
                })],
            },
            "/download" => {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                match parts.as_slice() {
                    [filename, kind] => match kind.parse() {
                        Ok(kind) => vec![Action::Download {
                            filename: (*filename).to_string(),
                            kind,
                        }],
                        Err(()) => vec![Action::Print("Protocol must be TCP or UDP.".into())],
                    },
                    _ => vec![usage("/download <file> <TCP|UDP>")],
                }
            }
            // Unknown slash words are ordinary text.
            _ => vec![self.in_mode(line)],
        }
    }

    fn switched(&self, text: &str) -> Vec<Action> {
        let mut actions = vec![Action::Print(format!("Switched to {}.", self.mode))];
        if !text.is_empty() {
            actions.push(self.in_mode(text));
        }
        actions
    }

    fn in_mode(&self, text: &str) -> Action {
        let text = text.to_string();
        match &self.mode {
            Mode::Broadcast => Action::Send(Command::Broadcast { text }),
            Mode::Unicast(to) => Action::Send(Command::Unicast {
                to: to.clone(),
                text,
            }),
            Mode::Group(group) => Action::Send(Command::GroupMsg {
                group: group.clone(),
                text,
            }),
        }
    }
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (s, ""),
    }
}

fn usage(form: &str) -> Action {
    Action::Print(format!("Usage: {form}"))
}
