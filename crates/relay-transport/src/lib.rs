//! # relay-transport
//!
//! Connection plumbing for the relay chat server.
//!
//! - **TCP** - The control channel: framed line reads and a queued writer
//! - **Datagram** - Paced, unacknowledged UDP file transfers
//!
//! ## Transport Abstraction
//!
//! The server only sees [`Accepted`] connections: a [`LineReader`] stream and
//! an [`Outbox`]. Writes never block the caller.
//!
//! ```rust,ignore
//! use relay_transport::{Transport, TcpTransport};
//!
//! async fn serve(transport: TcpTransport) {
//!     while let Ok(conn) = transport.accept().await {
//!         conn.outbox.send_reply(&Reply::Greeting)?;
//!     }
//! }
//! ```

pub mod datagram;
pub mod outbox;
pub mod tcp;
pub mod traits;

pub use datagram::{DatagramConfig, DatagramReceiver, DatagramSender, ReceiveSummary};
pub use outbox::{spawn_writer, InlineStream, Outbound, Outbox, StreamOutcome};
pub use tcp::{TcpConfig, TcpTransport};
pub use traits::{Accepted, LineReader, Transport, TransportError};
