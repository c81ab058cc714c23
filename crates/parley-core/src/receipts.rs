//! Read receipts.
//!
//! Each message moves `unread -> read` exactly once. The direction of a
//! mark-read is always "messages from `other` to the caller", so a user can
//! never mark their own outgoing messages as read.

use parley_protocol::UserId;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ChatError, ChatResult};
use crate::store::MessageStore;

/// Marks incoming messages read on behalf of their recipient.
#[derive(Clone)]
pub struct ReadReceipts {
    store: Arc<dyn MessageStore>,
}

impl ReadReceipts {
    /// Create a tracker over a message store.
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Mark every unread message `other` sent to `reader` as read.
    ///
    /// Returns how many messages changed state; `0` is a successful no-op.
    ///
    /// # Errors
    ///
    /// [`ChatError::Validation`] if `other` is blank, or the store's error.
    pub async fn mark_as_read(&self, reader: &UserId, other: &UserId) -> ChatResult<u64> {
        if other.is_blank() {
            return Err(ChatError::validation("senderId is required"));
        }

        let updated = self.store.mark_read(other, reader).await?;
        debug!(reader = %reader, sender = %other, updated, "Read receipt applied");
        Ok(updated)
    }
}
