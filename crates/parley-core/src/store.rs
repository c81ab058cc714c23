//! Message store abstraction and the in-process backend.
//!
//! The store is the only component that reads or writes message records.
//! Conflicting writes are serialized by the backend itself; callers never
//! hold application-level locks around store calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_protocol::{Message, MessageId, UserId};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::error::{ChatError, ChatResult};

/// Durable, ordered log of direct messages.
///
/// All sequences are returned oldest first: by `created_at`, ties broken by
/// `id`.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new unread message. The store assigns `id` and `created_at`.
    async fn create(&self, sender: &UserId, recipient: &UserId, text: &str)
        -> ChatResult<Message>;

    /// Look up a single message.
    async fn find_by_id(&self, id: MessageId) -> ChatResult<Option<Message>>;

    /// Messages between `a` and `b`, in both directions.
    async fn find_conversation(&self, a: &UserId, b: &UserId) -> ChatResult<Vec<Message>>;

    /// Every message `user` sent or received.
    async fn find_all_for_user(&self, user: &UserId) -> ChatResult<Vec<Message>>;

    /// Mark unread messages flowing `sender -> recipient` as read.
    ///
    /// Returns the number of messages that changed state.
    async fn mark_read(&self, sender: &UserId, recipient: &UserId) -> ChatResult<u64>;

    /// Remove a message, returning the removed record.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotFound`] if no message has this id.
    async fn delete_by_id(&self, id: MessageId) -> ChatResult<Message>;
}

#[derive(Debug, Default)]
struct MemoryLog {
    last_id: MessageId,
    last_created_at: Option<DateTime<Utc>>,
    messages: BTreeMap<MessageId, Message>,
}

/// In-process message store.
///
/// Nothing survives a restart. Used for tests and single-node development.
#[derive(Debug, Default)]
pub struct MemoryStore {
    log: RwLock<MemoryLog>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages.
    pub async fn len(&self) -> usize {
        self.log.read().await.messages.len()
    }

    /// Whether the store holds no messages.
    pub async fn is_empty(&self) -> bool {
        self.log.read().await.messages.is_empty()
    }
}

fn sorted(mut messages: Vec<Message>) -> Vec<Message> {
    messages.sort_by(Message::chronological);
    messages
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create(
        &self,
        sender: &UserId,
        recipient: &UserId,
        text: &str,
    ) -> ChatResult<Message> {
        let mut log = self.log.write().await;

        log.last_id += 1;
        // Clock steps backwards must not reorder the log.
        let now = Utc::now();
        let created_at = match log.last_created_at {
            Some(last) if last > now => last,
            _ => now,
        };
        log.last_created_at = Some(created_at);

        let message = Message {
            id: log.last_id,
            sender_id: sender.clone(),
            recipient_id: recipient.clone(),
            text: text.to_string(),
            created_at,
            read: false,
        };
        log.messages.insert(message.id, message.clone());

        trace!(id = message.id, sender = %sender, recipient = %recipient, "Stored message");
        Ok(message)
    }

    async fn find_by_id(&self, id: MessageId) -> ChatResult<Option<Message>> {
        Ok(self.log.read().await.messages.get(&id).cloned())
    }

    async fn find_conversation(&self, a: &UserId, b: &UserId) -> ChatResult<Vec<Message>> {
        let log = self.log.read().await;
        Ok(sorted(
            log.messages
                .values()
                .filter(|m| m.is_between(a, b))
                .cloned()
                .collect(),
        ))
    }

    async fn find_all_for_user(&self, user: &UserId) -> ChatResult<Vec<Message>> {
        let log = self.log.read().await;
        Ok(sorted(
            log.messages
                .values()
                .filter(|m| m.involves(user))
                .cloned()
                .collect(),
        ))
    }

    async fn mark_read(&self, sender: &UserId, recipient: &UserId) -> ChatResult<u64> {
        let mut log = self.log.write().await;
        let mut updated = 0;

        for message in log.messages.values_mut() {
            if !message.read && &message.sender_id == sender && &message.recipient_id == recipient
            {
                message.read = true;
                updated += 1;
            }
        }

        debug!(sender = %sender, recipient = %recipient, updated, "Marked messages read");
        Ok(updated)
    }

    async fn delete_by_id(&self, id: MessageId) -> ChatResult<Message> {
        self.log
            .write()
            .await
            .messages
            .remove(&id)
            .ok_or(ChatError::NotFound(id))
    }
}
