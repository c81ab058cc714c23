//! Typed command surface for direct messaging.
//!
//! Both the WebSocket gateway and the REST layer go through [`ChatService`].
//! The caller identity always comes from the authenticated session or
//! request, never from the payload.

use parley_protocol::{InboxThread, Message, MessageId, UserId};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ChatError, ChatResult};
use crate::inbox::{group_threads, trim_threads};
use crate::receipts::ReadReceipts;
use crate::router::{DeliveryReport, DeliveryRouter};
use crate::session::{ConnectionId, SessionRegistry};
use crate::store::MessageStore;

/// Default maximum message length in characters.
pub const DEFAULT_MAX_TEXT_LENGTH: usize = 4096;

/// Default number of messages kept per inbox thread.
pub const DEFAULT_INBOX_PREVIEW: usize = 50;

/// Who is issuing a command.
#[derive(Debug, Clone, Copy)]
pub struct Caller<'a> {
    /// Authenticated user.
    pub user_id: &'a UserId,
    /// Connection the command arrived on, if it came over a socket.
    pub connection: Option<&'a ConnectionId>,
}

impl<'a> Caller<'a> {
    /// A caller on a live connection.
    #[must_use]
    pub fn connection(user_id: &'a UserId, connection: &'a ConnectionId) -> Self {
        Self {
            user_id,
            connection: Some(connection),
        }
    }

    /// A caller without a connection (REST).
    #[must_use]
    pub fn request(user_id: &'a UserId) -> Self {
        Self {
            user_id,
            connection: None,
        }
    }
}

/// Result of a successful send.
#[derive(Debug, Clone)]
pub struct Sent {
    /// The stored message.
    pub message: Message,
    /// Live fan-out that followed.
    pub delivery: DeliveryReport,
}

/// Direct-messaging operations.
#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn MessageStore>,
    receipts: ReadReceipts,
    router: DeliveryRouter,
    max_text_length: usize,
    inbox_preview: usize,
}

impl ChatService {
    /// Create a service over a store and a session registry.
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            receipts: ReadReceipts::new(Arc::clone(&store)),
            router: DeliveryRouter::new(sessions),
            store,
            max_text_length: DEFAULT_MAX_TEXT_LENGTH,
            inbox_preview: DEFAULT_INBOX_PREVIEW,
        }
    }

    /// Override the maximum message length.
    #[must_use]
    pub fn with_max_text_length(mut self, max: usize) -> Self {
        self.max_text_length = max;
        self
    }

    /// Override how many of the newest messages each inbox thread carries.
    #[must_use]
    pub fn with_inbox_preview(mut self, keep: usize) -> Self {
        self.inbox_preview = keep;
        self
    }

    /// The session registry deliveries go through.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        self.router.sessions()
    }

    /// Store a message from the caller and route it to live sessions.
    ///
    /// # Errors
    ///
    /// [`ChatError::Validation`] for a blank recipient or text, or text over
    /// the length limit; [`ChatError::Persistence`] if the store fails.
    pub async fn send(&self, caller: Caller<'_>, recipient: &UserId, text: &str) -> ChatResult<Sent> {
        if recipient.is_blank() {
            return Err(ChatError::validation("recipientId is required"));
        }
        if text.trim().is_empty() {
            return Err(ChatError::validation("text is required"));
        }
        let length = text.chars().count();
        if length > self.max_text_length {
            return Err(ChatError::validation(format!(
                "text is {} characters, limit is {}",
                length, self.max_text_length
            )));
        }

        let message = self.store.create(caller.user_id, recipient, text).await?;
        let delivery = self.router.message_created(&message, caller.connection);

        info!(
            id = message.id,
            sender = %message.sender_id,
            recipient = %message.recipient_id,
            live = delivery.delivered_live(),
            "Message sent"
        );
        Ok(Sent { message, delivery })
    }

    /// Conversation between the caller and `other`, oldest first.
    ///
    /// # Errors
    ///
    /// [`ChatError::Validation`] if `other` is blank, or the store's error.
    pub async fn load_conversation(&self, caller: Caller<'_>, other: &UserId) -> ChatResult<Vec<Message>> {
        if other.is_blank() {
            return Err(ChatError::validation("recipientId is required"));
        }
        self.store.find_conversation(caller.user_id, other).await
    }

    /// Every message the caller sent or received, oldest first.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn all_messages(&self, caller: Caller<'_>) -> ChatResult<Vec<Message>> {
        self.store.find_all_for_user(caller.user_id).await
    }

    /// The caller's inbox grouped by counterpart, most recent first.
    ///
    /// Each thread carries its newest messages only; `load_conversation`
    /// returns the full history. Unread counts cover the whole thread.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn load_inbox(&self, caller: Caller<'_>) -> ChatResult<Vec<InboxThread>> {
        let messages = self.store.find_all_for_user(caller.user_id).await?;
        let mut threads = group_threads(caller.user_id, messages);
        trim_threads(&mut threads, self.inbox_preview);
        debug!(user = %caller.user_id, threads = threads.len(), "Inbox loaded");
        Ok(threads)
    }

    /// Mark everything `sender` sent to the caller as read.
    ///
    /// # Errors
    ///
    /// [`ChatError::Validation`] if `sender` is blank, or the store's error.
    pub async fn mark_read(&self, caller: Caller<'_>, sender: &UserId) -> ChatResult<u64> {
        let updated = self.receipts.mark_as_read(caller.user_id, sender).await?;
        self.router
            .messages_read(sender, caller.user_id, updated, caller.connection);
        Ok(updated)
    }

    /// Delete a message the caller took part in and notify both participants.
    ///
    /// Messages the caller is not part of are reported as not found.
    ///
    /// # Errors
    ///
    /// [`ChatError::Validation`] if no id is given, [`ChatError::NotFound`]
    /// if the message does not exist, or the store's error.
    pub async fn delete(&self, caller: Caller<'_>, message_id: Option<MessageId>) -> ChatResult<Message> {
        let id = message_id.ok_or_else(|| ChatError::validation("messageId is required"))?;

        match self.store.find_by_id(id).await? {
            Some(message) if message.involves(caller.user_id) => {}
            _ => return Err(ChatError::NotFound(id)),
        }

        let removed = self.store.delete_by_id(id).await?;
        let notified = self.router.message_deleted(&removed);

        info!(id, user = %caller.user_id, notified, "Message deleted");
        Ok(removed)
    }
}
