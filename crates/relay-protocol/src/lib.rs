//! # relay-protocol
//!
//! Wire protocol definitions for the relay chat server.
//!
//! The control channel is plain UTF-8 text, one command per line. This crate
//! defines the commands clients send, the replies the server writes back, and
//! the codecs that frame both directions on a byte stream.
//!
//! ## Commands
//!
//! - `JOIN` - Register a display name
//! - `BROADCAST` / `UNICAST` / `GROUP_MSG` - Route text
//! - `JOIN_GROUP` / `LEAVE_GROUP` - Group membership
//! - `LIST_FILES` / `DOWNLOAD_TCP` / `DOWNLOAD_UDP` - Shared files
//! - `/exit` - Leave
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{Command, Reply};
//!
//! let command: Command = "UNICAST bob see you at noon".parse().unwrap();
//! assert_eq!(
//!     command,
//!     Command::Unicast { to: "bob".into(), text: "see you at noon".into() }
//! );
//!
//! let reply = Reply::Private { from: "alice".into(), text: "hi".into() };
//! assert_eq!(reply.to_string(), "[PM from alice]: hi");
//! ```

pub mod codec;
pub mod command;
pub mod reply;

pub use codec::{Inbound, LineCodec, ProtocolError, ServerEvent, ServerStreamCodec};
pub use command::Command;
pub use reply::{Announcement, Reply};
