//! Session registry.
//!
//! Maps authenticated users to their live connections. A user may hold any
//! number of sessions (one per device or tab). The registry is constructed
//! once at server start and shared by handle; it is mutated only when a
//! connection binds after a successful handshake or unbinds on disconnect.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_protocol::{Frame, UserId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Queue feeding frames to one connection's writer task.
pub type Outbox = mpsc::UnboundedSender<Arc<Frame>>;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One authenticated, live connection.
#[derive(Debug, Clone)]
pub struct Session {
    /// Connection this session is bound to.
    pub connection_id: ConnectionId,
    /// Authenticated user.
    pub user_id: UserId,
    /// When the handshake completed.
    pub established_at: DateTime<Utc>,
    outbox: Outbox,
}

impl Session {
    /// Create a session that delivers pushes into `outbox`.
    #[must_use]
    pub fn new(connection_id: ConnectionId, user_id: UserId, outbox: Outbox) -> Self {
        Self {
            connection_id,
            user_id,
            established_at: Utc::now(),
            outbox,
        }
    }

    /// Queue a frame for this connection.
    ///
    /// Returns `false` if the connection's writer has already gone away.
    pub fn push(&self, frame: Arc<Frame>) -> bool {
        self.outbox.send(frame).is_ok()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Users with at least one live session.
    pub user_count: usize,
    /// Live sessions across all users.
    pub session_count: usize,
}

/// Live sessions indexed by user and by connection.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    /// Sessions per user.
    users: DashMap<UserId, HashMap<ConnectionId, Session>>,
    /// Owning user per connection.
    connections: DashMap<ConnectionId, UserId>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session after a successful handshake.
    ///
    /// Rebinding an existing connection ID replaces the previous session.
    pub fn bind(&self, session: Session) {
        let connection_id = session.connection_id.clone();
        let user_id = session.user_id.clone();

        if let Some(previous) = self
            .connections
            .insert(connection_id.clone(), user_id.clone())
        {
            if previous != user_id {
                self.remove_from_user(&previous, &connection_id);
            }
        }

        let mut entry = self.users.entry(user_id.clone()).or_default();
        entry.insert(connection_id.clone(), session);

        debug!(
            connection = %connection_id,
            user = %user_id,
            sessions = entry.len(),
            "Session bound"
        );
    }

    /// Remove a connection's session.
    ///
    /// Returns the removed session, or `None` if it was not bound. Calling
    /// this twice is harmless.
    pub fn unbind(&self, connection_id: &ConnectionId) -> Option<Session> {
        let (_, user_id) = self.connections.remove(connection_id)?;
        let removed = self.remove_from_user(&user_id, connection_id);

        debug!(connection = %connection_id, user = %user_id, "Session unbound");
        removed
    }

    fn remove_from_user(&self, user_id: &UserId, connection_id: &ConnectionId) -> Option<Session> {
        let removed = self
            .users
            .get_mut(user_id)
            .and_then(|mut sessions| sessions.remove(connection_id));

        // Drop the user entry once the last session is gone.
        self.users.remove_if(user_id, |_, sessions| sessions.is_empty());
        removed
    }

    /// Snapshot of a user's live sessions.
    #[must_use]
    pub fn sessions_for(&self, user_id: &UserId) -> Vec<Session> {
        self.users
            .get(user_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the user has at least one live session.
    #[must_use]
    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.users.contains_key(user_id)
    }

    /// Number of live sessions across all users.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.connections.len()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            user_count: self.users.len(),
            session_count: self.connections.len(),
        }
    }

    /// Push a frame to every session of `user_id` except `except`.
    ///
    /// Returns the number of sessions the frame was queued for.
    pub fn push_to_user(
        &self,
        user_id: &UserId,
        frame: &Arc<Frame>,
        except: Option<&ConnectionId>,
    ) -> usize {
        let delivered = self
            .sessions_for(user_id)
            .iter()
            .filter(|s| Some(&s.connection_id) != except)
            .filter(|s| s.push(Arc::clone(frame)))
            .count();

        trace!(user = %user_id, delivered, "Pushed frame");
        delivered
    }
}
