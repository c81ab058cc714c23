//! Delivery routing.
//!
//! Decides which live sessions see a message event without polling. Only
//! the two participants of a conversation are ever targeted; recipients
//! without a live session pick the message up from history on their next
//! inbox or conversation load.

use parley_protocol::{Frame, Message, UserId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::session::{ConnectionId, SessionRegistry};

/// Outcome of routing a newly created message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Recipient sessions the message was pushed to.
    pub recipient_sessions: usize,
    /// Other sender sessions the message was mirrored to.
    pub sender_sessions: usize,
}

impl DeliveryReport {
    /// Whether the recipient saw the message live.
    #[must_use]
    pub fn delivered_live(&self) -> bool {
        self.recipient_sessions > 0
    }

    /// Total pushes performed.
    #[must_use]
    pub fn total(&self) -> usize {
        self.recipient_sessions + self.sender_sessions
    }
}

/// Fans message events out to participant sessions.
#[derive(Debug, Clone)]
pub struct DeliveryRouter {
    sessions: Arc<SessionRegistry>,
}

impl DeliveryRouter {
    /// Create a router over a session registry.
    #[must_use]
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self { sessions }
    }

    /// The registry this router delivers through.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Route a just-created message.
    ///
    /// Every recipient session gets it, and so does every sender session
    /// other than `origin`, which already has the `sent` reply.
    pub fn message_created(&self, message: &Message, origin: Option<&ConnectionId>) -> DeliveryReport {
        let frame = Arc::new(Frame::Message {
            message: message.clone(),
        });

        let recipient_sessions =
            self.sessions
                .push_to_user(&message.recipient_id, &frame, origin);
        let sender_sessions = if message.sender_id == message.recipient_id {
            0
        } else {
            self.sessions.push_to_user(&message.sender_id, &frame, origin)
        };

        let report = DeliveryReport {
            recipient_sessions,
            sender_sessions,
        };
        debug!(
            id = message.id,
            recipient = %message.recipient_id,
            live = report.delivered_live(),
            mirrored = sender_sessions,
            "Routed new message"
        );
        report
    }

    /// Notify both participants that a message is gone.
    ///
    /// Returns the number of sessions notified.
    pub fn message_deleted(&self, message: &Message) -> usize {
        let frame = Arc::new(Frame::MessageDeleted {
            message_id: message.id,
            sender_id: message.sender_id.clone(),
            recipient_id: message.recipient_id.clone(),
        });

        let count = self.fan_out(&[&message.sender_id, &message.recipient_id], &frame, None);
        debug!(id = message.id, notified = count, "Routed deletion");
        count
    }

    /// Tell the sender that `reader` read `updated` of their messages, and
    /// sync the reader's other sessions.
    pub fn messages_read(
        &self,
        sender: &UserId,
        reader: &UserId,
        updated: u64,
        origin: Option<&ConnectionId>,
    ) -> usize {
        if updated == 0 {
            return 0;
        }

        let frame = Arc::new(Frame::MessagesRead {
            sender_id: sender.clone(),
            reader_id: reader.clone(),
            updated,
        });

        let count = self.fan_out(&[sender, reader], &frame, origin);
        trace!(sender = %sender, reader = %reader, notified = count, "Routed read receipt");
        count
    }

    fn fan_out(&self, users: &[&UserId], frame: &Arc<Frame>, except: Option<&ConnectionId>) -> usize {
        let mut seen: HashSet<&UserId> = HashSet::new();
        users
            .iter()
            .filter(|user| seen.insert(**user))
            .map(|user| self.sessions.push_to_user(user, frame, except))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use chrono::Utc;
    use tokio::sync::mpsc;

    type Rx = mpsc::UnboundedReceiver<Arc<Frame>>;

    fn bind(registry: &SessionRegistry, conn: &str, user: &str) -> Rx {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.bind(Session::new(conn.into(), user.into(), tx));
        rx
    }

    fn message(from: &str, to: &str) -> Message {
        Message {
            id: 1,
            sender_id: from.into(),
            recipient_id: to.into(),
            text: "hi".into(),
            created_at: Utc::now(),
            read: false,
        }
    }

    #[test]
    fn test_created_reaches_recipient_and_other_sender_devices() {
        let registry = Arc::new(SessionRegistry::new());
        let mut origin = bind(&registry, "a-phone", "u1");
        let mut laptop = bind(&registry, "a-laptop", "u1");
        let mut bob = bind(&registry, "b-phone", "u2");
        let mut carol = bind(&registry, "c-phone", "u3");

        let router = DeliveryRouter::new(registry);
        let report = router.message_created(&message("u1", "u2"), Some(&"a-phone".into()));

        assert_eq!(
            report,
            DeliveryReport {
                recipient_sessions: 1,
                sender_sessions: 1
            }
        );
        assert!(matches!(&*bob.try_recv().unwrap(), Frame::Message { message } if message.text == "hi"));
        assert!(laptop.try_recv().is_ok());
        assert!(origin.try_recv().is_err());
        assert!(carol.try_recv().is_err());
    }

    #[test]
    fn test_offline_recipient_is_not_an_error() {
        let registry = Arc::new(SessionRegistry::new());
        let router = DeliveryRouter::new(registry);

        let report = router.message_created(&message("u1", "u2"), None);
        assert!(!report.delivered_live());
        assert_eq!(report.total(), 0);
    }

    #[test]
    fn test_deletion_scoped_to_participants() {
        let registry = Arc::new(SessionRegistry::new());
        let mut alice = bind(&registry, "a", "u1");
        let mut bob = bind(&registry, "b", "u2");
        let mut carol = bind(&registry, "c", "u3");

        let router = DeliveryRouter::new(registry);
        assert_eq!(router.message_deleted(&message("u1", "u2")), 2);

        assert!(matches!(
            &*alice.try_recv().unwrap(),
            Frame::MessageDeleted { message_id: 1, .. }
        ));
        assert!(bob.try_recv().is_ok());
        assert!(carol.try_recv().is_err());
    }

    #[test]
    fn test_self_message_pushed_once_per_session() {
        let registry = Arc::new(SessionRegistry::new());
        let mut other = bind(&registry, "a-2", "u1");
        let _origin = bind(&registry, "a-1", "u1");

        let router = DeliveryRouter::new(registry);
        let report = router.message_created(&message("u1", "u1"), Some(&"a-1".into()));

        assert_eq!(report.total(), 1);
        assert!(other.try_recv().is_ok());
        assert!(other.try_recv().is_err());
        assert_eq!(router.message_deleted(&message("u1", "u1")), 2);
    }

    #[test]
    fn test_read_receipt_routing() {
        let registry = Arc::new(SessionRegistry::new());
        let mut alice = bind(&registry, "a", "u1");
        let mut bob_origin = bind(&registry, "b-1", "u2");

        let router = DeliveryRouter::new(registry);
        assert_eq!(router.messages_read(&"u1".into(), &"u2".into(), 0, None), 0);
        assert_eq!(
            router.messages_read(&"u1".into(), &"u2".into(), 3, Some(&"b-1".into())),
            1
        );

        assert!(matches!(
            &*alice.try_recv().unwrap(),
            Frame::MessagesRead { updated: 3, .. }
        ));
        assert!(bob_origin.try_recv().is_err());
    }
}
