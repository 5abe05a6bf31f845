//! Group abstraction for the relay.
//!
//! Groups are named sets of sessions used for fan-out messaging. They are
//! created on first join and dropped by the session table once empty.

use std::collections::BTreeSet;
use tracing::debug;

use crate::session::ConnectionId;

/// Maximum group name length.
pub const MAX_GROUP_NAME_LENGTH: usize = 64;

/// A group identifier.
pub type GroupName = String;

/// Validate a group name.
///
/// Group names are a single protocol field, so they cannot contain spaces.
///
/// # Errors
///
/// Returns an error message if the group name is invalid.
pub fn validate_group_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("group name cannot be empty");
    }
    if name.len() > MAX_GROUP_NAME_LENGTH {
        return Err("group name too long");
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("group name contains invalid characters");
    }
    Ok(())
}

/// A named set of member connections.
#[derive(Debug, Clone)]
pub struct Group {
    name: GroupName,
    members: BTreeSet<ConnectionId>,
}

impl Group {
    /// Create a new, empty group.
    #[must_use]
    pub fn new(name: impl Into<GroupName>) -> Self {
        Self {
            name: name.into(),
            members: BTreeSet::new(),
        }
    }

    /// Get the group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if a connection is a member.
    #[must_use]
    pub fn is_member(&self, connection_id: ConnectionId) -> bool {
        self.members.contains(&connection_id)
    }

    /// Add a member.
    ///
    /// Returns `true` if the connection was not already a member.
    pub fn join(&mut self, connection_id: ConnectionId) -> bool {
        let added = self.members.insert(connection_id);
        if added {
            debug!(group = %self.name, connection = %connection_id, "Member joined group");
        }
        added
    }

    /// Remove a member.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave(&mut self, connection_id: ConnectionId) -> bool {
        let removed = self.members.remove(&connection_id);
        if removed {
            debug!(group = %self.name, connection = %connection_id, "Member left group");
        }
        removed
    }

    /// Iterate members in ascending connection order.
    pub fn members(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.members.iter().copied()
    }

    /// Check if the group has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
