//! Outbound message types for the relay.

use bytes::Bytes;
use relay_protocol::Reply;

use crate::session::ConnectionId;

/// A rendered line addressed to one connection.
///
/// The line is rendered once per routing call and shared between recipients,
/// so cloning a delivery never copies the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Target connection.
    pub target: ConnectionId,
    /// Line without its terminator.
    pub line: Bytes,
}

impl Delivery {
    /// Create a delivery from a pre-rendered line.
    #[must_use]
    pub fn new(target: ConnectionId, line: Bytes) -> Self {
        Self { target, line }
    }

    /// Create a delivery by rendering a reply.
    #[must_use]
    pub fn reply(target: ConnectionId, reply: &Reply) -> Self {
        Self::new(target, reply.to_bytes())
    }

    /// Get the line as text.
    #[must_use]
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.line)
    }
}
