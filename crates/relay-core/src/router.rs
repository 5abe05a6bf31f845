//! Message routing for the relay.
//!
//! The router is a read-only view over a [`SessionTable`]. Each operation
//! renders its line once and returns one [`Delivery`] per recipient; writing
//! them is the caller's job, which keeps a failed write to one recipient from
//! affecting any other.

use relay_protocol::Reply;
use thiserror::Error;
use tracing::trace;

use crate::message::Delivery;
use crate::session::{ConnectionId, Session, SessionTable};

/// Routing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// The sending connection has no session.
    #[error("Sender not registered: {0}")]
    UnknownSender(ConnectionId),

    /// No live session has the requested name.
    #[error("Recipient not found: {0}")]
    UnknownRecipient(String),

    /// The sender is not a member of the group (or the group does not exist).
    #[error("Not a member of group: {0}")]
    NotMember(String),
}

/// Routes messages over a session table snapshot.
///
/// Recipients are always visited in ascending connection order.
#[derive(Debug, Clone, Copy)]
pub struct Router<'a> {
    table: &'a SessionTable,
}

impl<'a> Router<'a> {
    /// Create a router over a table.
    #[must_use]
    pub fn new(table: &'a SessionTable) -> Self {
        Self { table }
    }

    /// Send a notice to every session except `except`.
    #[must_use]
    pub fn announce(&self, except: Option<ConnectionId>, reply: &Reply) -> Vec<Delivery> {
        let line = reply.to_bytes();
        let deliveries: Vec<Delivery> = self
            .table
            .sessions()
            .filter(|session| Some(session.id()) != except)
            .map(|session| Delivery::new(session.id(), line.clone()))
            .collect();
        trace!(recipients = deliveries.len(), "Announced notice");
        deliveries
    }

    /// Broadcast text from `sender` to every other session.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::UnknownSender`] if `sender` has no session.
    pub fn broadcast(
        &self,
        sender: ConnectionId,
        text: &str,
    ) -> Result<Vec<Delivery>, RoutingError> {
        let from = self.sender(sender)?;
        let reply = Reply::Broadcast {
            from: from.name().to_string(),
            text: text.to_string(),
        };
        Ok(self.announce(Some(sender), &reply))
    }

    /// Send text from `sender` to the session named `to`.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::UnknownRecipient`] if no session has that name.
    pub fn unicast(
        &self,
        sender: ConnectionId,
        to: &str,
        text: &str,
    ) -> Result<Delivery, RoutingError> {
        let from = self.sender(sender)?;
        let recipient = self
            .table
            .lookup_by_name(to)
            .ok_or_else(|| RoutingError::UnknownRecipient(to.to_string()))?;

        let reply = Reply::Private {
            from: from.name().to_string(),
            text: text.to_string(),
        };
        Ok(Delivery::reply(recipient.id(), &reply))
    }

    /// Send text from `sender` to the other members of `group`.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::NotMember`] if `sender` is not in the group.
    pub fn group(
        &self,
        sender: ConnectionId,
        group: &str,
        text: &str,
    ) -> Result<Vec<Delivery>, RoutingError> {
        let from = self.sender(sender)?;
        let members = self
            .table
            .group(group)
            .filter(|g| g.is_member(sender))
            .ok_or_else(|| RoutingError::NotMember(group.to_string()))?;

        let line = Reply::Group {
            group: group.to_string(),
            from: from.name().to_string(),
            text: text.to_string(),
        }
        .to_bytes();

        let deliveries: Vec<Delivery> = members
            .members()
            .filter(|member| *member != sender)
            .map(|member| Delivery::new(member, line.clone()))
            .collect();
        trace!(group = %group, recipients = deliveries.len(), "Routed group message");
        Ok(deliveries)
    }

    fn sender(&self, sender: ConnectionId) -> Result<&'a Session, RoutingError> {
        self.table
            .get(sender)
            .ok_or(RoutingError::UnknownSender(sender))
    }
}
