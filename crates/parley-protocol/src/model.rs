//! Data model carried on the wire.
//!
//! Messages reference users by opaque identifiers only. Display data such as
//! names or avatars is joined in by whoever renders the conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A stored message identifier. Assigned by the store, strictly increasing.
pub type MessageId = i64;

/// Opaque reference to a user owned by the account service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Create a new user ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the ID is empty or whitespace only.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A direct message between two users.
///
/// Everything except `read` is fixed at creation. `read` only ever moves
/// from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Store-assigned identifier, also the ordering tie-break.
    pub id: MessageId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Addressee of the message.
    pub recipient_id: UserId,
    /// Message body.
    pub text: String,
    /// Creation time, set by the store.
    pub created_at: DateTime<Utc>,
    /// Whether the recipient has read the message.
    pub read: bool,
}

impl Message {
    /// Whether `user` is the sender or the recipient.
    #[must_use]
    pub fn involves(&self, user: &UserId) -> bool {
        &self.sender_id == user || &self.recipient_id == user
    }

    /// The other participant from `user`'s point of view.
    ///
    /// Returns `None` if `user` is not part of the conversation.
    #[must_use]
    pub fn counterpart(&self, user: &UserId) -> Option<&UserId> {
        if &self.sender_id == user {
            Some(&self.recipient_id)
        } else if &self.recipient_id == user {
            Some(&self.sender_id)
        } else {
            None
        }
    }

    /// Whether the message sits between `a` and `b`, in either direction.
    #[must_use]
    pub fn is_between(&self, a: &UserId, b: &UserId) -> bool {
        (&self.sender_id == a && &self.recipient_id == b)
            || (&self.sender_id == b && &self.recipient_id == a)
    }

    /// Conversation order: creation time, then id.
    #[must_use]
    pub fn chronological(&self, other: &Message) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then(self.id.cmp(&other.id))
    }
}

/// One conversation in a user's inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxThread {
    /// The other participant.
    pub counterpart: UserId,
    /// Messages, oldest first.
    pub messages: Vec<Message>,
    /// Messages addressed to the inbox owner that are still unread.
    pub unread_count: usize,
    /// Creation time of the newest message.
    pub last_activity: DateTime<Utc>,
}
