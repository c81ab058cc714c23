//! Frame types for the Parley protocol.
//!
//! Frames are the events exchanged over a persistent connection. Client
//! requests carry an `id` that the server echoes on the matching reply
//! (`sent`, `conversation`, `ack` or `error`); `0` means "not correlated".

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{InboxThread, Message, MessageId, UserId};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Connect,
    Connected,
    SendMessage,
    LoadConversation,
    LoadInbox,
    MarkRead,
    DeleteMessage,
    Inbox,
    Conversation,
    Sent,
    Message,
    MessageDeleted,
    MessagesRead,
    Ack,
    Error,
    Ping,
    Pong,
}

impl FrameType {
    /// Wire name of the frame type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Connect => "connect",
            FrameType::Connected => "connected",
            FrameType::SendMessage => "send-message",
            FrameType::LoadConversation => "load-conversation",
            FrameType::LoadInbox => "load-inbox",
            FrameType::MarkRead => "mark-read",
            FrameType::DeleteMessage => "delete-message",
            FrameType::Inbox => "inbox",
            FrameType::Conversation => "conversation",
            FrameType::Sent => "sent",
            FrameType::Message => "message",
            FrameType::MessageDeleted => "message-deleted",
            FrameType::MessagesRead => "messages-read",
            FrameType::Ack => "ack",
            FrameType::Error => "error",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error categories reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Missing, invalid or expired credential.
    AuthenticationError,
    /// Missing or malformed field in an event payload.
    ValidationError,
    /// Referenced message does not exist.
    NotFoundError,
    /// The message store failed.
    PersistenceError,
}

impl ErrorKind {
    /// Numeric error code.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            ErrorKind::ValidationError => 4000,
            ErrorKind::AuthenticationError => 4001,
            ErrorKind::NotFoundError => 4004,
            ErrorKind::PersistenceError => 5000,
        }
    }

    /// Kind name as it appears on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AuthenticationError => "AuthenticationError",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::NotFoundError => "NotFoundError",
            ErrorKind::PersistenceError => "PersistenceError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Late handshake, for clients that cannot put the token on the upgrade request.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol major version spoken by the client.
        version: u8,
        /// Bearer credential.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Session established.
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected {
        /// Server-assigned connection identifier.
        connection_id: String,
        /// Authenticated user.
        user_id: UserId,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Send a message to another user.
    #[serde(rename = "send-message", rename_all = "camelCase")]
    SendMessage {
        #[serde(default)]
        id: u64,
        #[serde(default)]
        recipient_id: UserId,
        #[serde(default)]
        text: String,
    },

    /// Fetch the full conversation with another user.
    #[serde(rename = "load-conversation", rename_all = "camelCase")]
    LoadConversation {
        #[serde(default)]
        id: u64,
        #[serde(default)]
        recipient_id: UserId,
    },

    /// Re-fetch the inbox.
    #[serde(rename = "load-inbox")]
    LoadInbox {
        #[serde(default)]
        id: u64,
    },

    /// Mark everything `sender_id` sent to the caller as read.
    #[serde(rename = "mark-read", rename_all = "camelCase")]
    MarkRead {
        #[serde(default)]
        id: u64,
        #[serde(default)]
        sender_id: UserId,
    },

    /// Delete a message by id.
    #[serde(rename = "delete-message", rename_all = "camelCase")]
    DeleteMessage {
        #[serde(default)]
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },

    /// Inbox snapshot, most recent conversation first.
    #[serde(rename = "inbox")]
    Inbox {
        /// Request ID, `0` for the on-connect push.
        #[serde(default)]
        id: u64,
        threads: Vec<InboxThread>,
    },

    /// Conversation history, oldest first. Sent to the requester only.
    #[serde(rename = "conversation", rename_all = "camelCase")]
    Conversation {
        id: u64,
        recipient_id: UserId,
        messages: Vec<Message>,
    },

    /// Confirmation of a `send-message` with the stored record.
    #[serde(rename = "sent")]
    Sent { id: u64, message: Message },

    /// Live delivery of a new message.
    #[serde(rename = "message")]
    Message { message: Message },

    /// A message was deleted.
    #[serde(rename = "message-deleted", rename_all = "camelCase")]
    MessageDeleted {
        message_id: MessageId,
        sender_id: UserId,
        recipient_id: UserId,
    },

    /// `reader_id` read `updated` messages from `sender_id`.
    #[serde(rename = "messages-read", rename_all = "camelCase")]
    MessagesRead {
        sender_id: UserId,
        reader_id: UserId,
        updated: u64,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        id: u64,
        /// Rows changed, for requests that update state.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated: Option<u64>,
    },

    /// Error response. Only ever sent to the connection that caused it.
    #[serde(rename = "error")]
    Error {
        id: u64,
        kind: ErrorKind,
        code: u16,
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::SendMessage { .. } => FrameType::SendMessage,
            Frame::LoadConversation { .. } => FrameType::LoadConversation,
            Frame::LoadInbox { .. } => FrameType::LoadInbox,
            Frame::MarkRead { .. } => FrameType::MarkRead,
            Frame::DeleteMessage { .. } => FrameType::DeleteMessage,
            Frame::Inbox { .. } => FrameType::Inbox,
            Frame::Conversation { .. } => FrameType::Conversation,
            Frame::Sent { .. } => FrameType::Sent,
            Frame::Message { .. } => FrameType::Message,
            Frame::MessageDeleted { .. } => FrameType::MessageDeleted,
            Frame::MessagesRead { .. } => FrameType::MessagesRead,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Request ID carried by a client request or its reply, or `0`.
    #[must_use]
    pub fn request_id(&self) -> u64 {
        match self {
            Frame::SendMessage { id, .. }
            | Frame::LoadConversation { id, .. }
            | Frame::LoadInbox { id }
            | Frame::MarkRead { id, .. }
            | Frame::DeleteMessage { id, .. }
            | Frame::Inbox { id, .. }
            | Frame::Conversation { id, .. }
            | Frame::Sent { id, .. }
            | Frame::Ack { id, .. }
            | Frame::Error { id, .. } => *id,
            _ => 0,
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: Option<String>) -> Self {
        Frame::Connect { version, token }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        user_id: UserId,
        version: u8,
        heartbeat: u32,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            user_id,
            version,
            heartbeat,
        }
    }

    /// Create a new SendMessage frame.
    #[must_use]
    pub fn send_message(id: u64, recipient_id: impl Into<UserId>, text: impl Into<String>) -> Self {
        Frame::SendMessage {
            id,
            recipient_id: recipient_id.into(),
            text: text.into(),
        }
    }

    /// Create a new LoadConversation frame.
    #[must_use]
    pub fn load_conversation(id: u64, recipient_id: impl Into<UserId>) -> Self {
        Frame::LoadConversation {
            id,
            recipient_id: recipient_id.into(),
        }
    }

    /// Create a new MarkRead frame.
    #[must_use]
    pub fn mark_read(id: u64, sender_id: impl Into<UserId>) -> Self {
        Frame::MarkRead {
            id,
            sender_id: sender_id.into(),
        }
    }

    /// Create a new DeleteMessage frame.
    #[must_use]
    pub fn delete_message(id: u64, message_id: MessageId) -> Self {
        Frame::DeleteMessage {
            id,
            message_id: Some(message_id),
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id, updated: None }
    }

    /// Create an Ack frame reporting changed rows.
    #[must_use]
    pub fn ack_updated(id: u64, updated: u64) -> Self {
        Frame::Ack {
            id,
            updated: Some(updated),
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, kind: ErrorKind, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            kind,
            code: kind.code(),
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_type() {
        let send = Frame::send_message(1, "u2", "hi");
        assert_eq!(send.frame_type(), FrameType::SendMessage);
        assert_eq!(send.frame_type().as_str(), "send-message");
        assert_eq!(send.request_id(), 1);
        assert_eq!(Frame::ack_updated(4, 1).request_id(), 4);
        assert_eq!(Frame::ping().request_id(), 0);
    }

    #[test]
    fn test_send_message_wire_shape() {
        let value = serde_json::to_value(Frame::send_message(3, "u2", "hi")).unwrap();
        assert_eq!(
            value,
            json!({"type": "send-message", "id": 3, "recipientId": "u2", "text": "hi"})
        );
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        let frame: Frame = serde_json::from_value(json!({"type": "send-message"})).unwrap();
        match frame {
            Frame::SendMessage {
                id,
                recipient_id,
                text,
            } => {
                assert_eq!(id, 0);
                assert!(recipient_id.is_blank());
                assert!(text.is_empty());
            }
            other => panic!("unexpected frame {:?}", other),
        }

        let frame: Frame = serde_json::from_value(json!({"type": "delete-message", "id": 9})).unwrap();
        assert_eq!(
            frame,
            Frame::DeleteMessage {
                id: 9,
                message_id: None
            }
        );
    }

    #[test]
    fn test_error_frame_carries_code() {
        let frame = Frame::error(4, ErrorKind::NotFoundError, "Message not found: 12");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["kind"], "NotFoundError");
        assert_eq!(value["code"], 4004);
        assert_eq!(frame.request_id(), 0);
    }

    #[test]
    fn test_request_id() {
        assert_eq!(Frame::mark_read(5, "u1").request_id(), 5);
        assert_eq!(Frame::delete_message(6, 1).request_id(), 6);
        assert_eq!(Frame::ping().request_id(), 0);
    }
}
