//! Session table for the relay.
//!
//! The table is the single source of routing truth: it maps live connections
//! to registered display names and owns every group. Keeping both maps in one
//! structure is what lets removal evict a session from all of its groups in
//! one step, so no group ever references a destroyed session.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info};

use crate::group::{validate_group_name, Group, GroupName};

/// Maximum display name length.
pub const DEFAULT_MAX_NAME_LENGTH: usize = 32;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection, allocated in accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next process-unique connection ID.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw value. Intended for tests and tooling.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Session table errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Another live session holds the name.
    #[error("Name already taken: {0}")]
    NameConflict(String),

    /// The connection already has a session.
    #[error("Connection already registered as {0}")]
    AlreadyRegistered(String),

    /// The name or group name failed validation.
    #[error("Invalid name: {0}")]
    InvalidName(&'static str),

    /// The connection has no session.
    #[error("Connection not registered: {0}")]
    NotRegistered(ConnectionId),

    /// The session is not in the group.
    #[error("Not a member of group: {0}")]
    NotMember(String),
}

/// A registered identity bound to one connection.
#[derive(Debug, Clone)]
pub struct Session {
    id: ConnectionId,
    name: String,
    groups: BTreeSet<GroupName>,
}

impl Session {
    fn new(id: ConnectionId, name: String) -> Self {
        Self {
            id,
            name,
            groups: BTreeSet::new(),
        }
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Groups this session belongs to, in name order.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(String::as_str)
    }
}

/// Validate a display name.
///
/// # Errors
///
/// Returns an error message if the name is invalid.
pub fn validate_name(name: &str, max_length: usize) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }
    if name.len() > max_length {
        return Err("name too long");
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("name cannot contain spaces or control characters");
    }
    Ok(())
}

/// Live sessions and groups.
#[derive(Debug)]
pub struct SessionTable {
    /// Sessions indexed by connection, iterated in accept order.
    sessions: BTreeMap<ConnectionId, Session>,
    /// Display name index.
    names: HashMap<String, ConnectionId>,
    /// Groups indexed by name.
    groups: BTreeMap<GroupName, Group>,
    max_name_length: usize,
}

impl SessionTable {
    /// Create an empty table with the default name limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_name_length(DEFAULT_MAX_NAME_LENGTH)
    }

    /// Create an empty table with a custom name limit.
    #[must_use]
    pub fn with_max_name_length(max_name_length: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            names: HashMap::new(),
            groups: BTreeMap::new(),
            max_name_length,
        }
    }

    /// Bind `name` to `connection_id`.
    ///
    /// # Errors
    ///
    /// Fails if the connection already has a session, the name is invalid, or
    /// another live session holds the name.
    pub fn register(
        &mut self,
        connection_id: ConnectionId,
        name: &str,
    ) -> Result<&Session, SessionError> {
        if let Some(existing) = self.sessions.get(&connection_id) {
            return Err(SessionError::AlreadyRegistered(existing.name.clone()));
        }
        validate_name(name, self.max_name_length).map_err(SessionError::InvalidName)?;
        if self.names.contains_key(name) {
            return Err(SessionError::NameConflict(name.to_string()));
        }

        self.names.insert(name.to_string(), connection_id);
        info!(connection = %connection_id, name = %name, "Session registered");
        Ok(self
            .sessions
            .entry(connection_id)
            .or_insert_with(|| Session::new(connection_id, name.to_string())))
    }

    /// Get the session for a connection.
    #[must_use]
    pub fn get(&self, connection_id: ConnectionId) -> Option<&Session> {
        self.sessions.get(&connection_id)
    }

    /// Exact, case-sensitive lookup by display name.
    #[must_use]
    pub fn lookup_by_name(&self, name: &str) -> Option<&Session> {
        self.names.get(name).and_then(|id| self.sessions.get(id))
    }

    /// Remove a session and evict it from every group, dropping groups left
    /// empty. Idempotent.
    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<Session> {
        let session = self.sessions.remove(&connection_id)?;
        self.names.remove(&session.name);

        for group_name in &session.groups {
            if let Some(group) = self.groups.get_mut(group_name) {
                group.leave(connection_id);
                if group.is_empty() {
                    self.groups.remove(group_name);
                    debug!(group = %group_name, "Deleted empty group");
                }
            }
        }

        info!(connection = %connection_id, name = %session.name, "Session removed");
        Some(session)
    }

    /// Add a session to a group, creating the group if needed.
    ///
    /// Returns `true` if the group was created by this call. Joining a group
    /// twice is a no-op success.
    ///
    /// # Errors
    ///
    /// Fails if the connection has no session or the group name is invalid.
    pub fn join_group(
        &mut self,
        connection_id: ConnectionId,
        group_name: &str,
    ) -> Result<bool, SessionError> {
        validate_group_name(group_name).map_err(SessionError::InvalidName)?;
        let session = self
            .sessions
            .get_mut(&connection_id)
            .ok_or(SessionError::NotRegistered(connection_id))?;

        let created = !self.groups.contains_key(group_name);
        let group = self
            .groups
            .entry(group_name.to_string())
            .or_insert_with(|| {
                debug!(group = %group_name, "Creating new group");
                Group::new(group_name)
            });
        group.join(connection_id);
        session.groups.insert(group_name.to_string());

        Ok(created)
    }

    /// Remove a session from a group, deleting the group if it became empty.
    ///
    /// Returns `true` if the group was deleted.
    ///
    /// # Errors
    ///
    /// Fails if the connection has no session or is not a member.
    pub fn leave_group(
        &mut self,
        connection_id: ConnectionId,
        group_name: &str,
    ) -> Result<bool, SessionError> {
        let session = self
            .sessions
            .get_mut(&connection_id)
            .ok_or(SessionError::NotRegistered(connection_id))?;

        if !session.groups.remove(group_name) {
            return Err(SessionError::NotMember(group_name.to_string()));
        }

        let Some(group) = self.groups.get_mut(group_name) else {
            return Ok(false);
        };
        group.leave(connection_id);
        if group.is_empty() {
            self.groups.remove(group_name);
            debug!(group = %group_name, "Deleted empty group");
            return Ok(true);
        }
        Ok(false)
    }

    /// Get a group by name.
    #[must_use]
    pub fn group(&self, group_name: &str) -> Option<&Group> {
        self.groups.get(group_name)
    }

    /// Members of a group in ascending connection order; empty if absent.
    #[must_use]
    pub fn group_members(&self, group_name: &str) -> Vec<ConnectionId> {
        self.groups
            .get(group_name)
            .map(|group| group.members().collect())
            .unwrap_or_default()
    }

    /// Check if a group exists.
    #[must_use]
    pub fn group_exists(&self, group_name: &str) -> bool {
        self.groups.contains_key(group_name)
    }

    /// Check if a connection is a member of a group.
    #[must_use]
    pub fn is_member(&self, connection_id: ConnectionId, group_name: &str) -> bool {
        self.groups
            .get(group_name)
            .is_some_and(|group| group.is_member(connection_id))
    }

    /// Iterate live sessions in connection order.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if there are no live sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Get table statistics.
    #[must_use]
    pub fn stats(&self) -> TableStats {
        TableStats {
            session_count: self.sessions.len(),
            group_count: self.groups.len(),
            total_memberships: self.groups.values().map(Group::member_count).sum(),
        }
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Session table statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Number of live sessions.
    pub session_count: usize,
    /// Number of non-empty groups.
    pub group_count: usize,
    /// Sum of group sizes.
    pub total_memberships: usize,
}
