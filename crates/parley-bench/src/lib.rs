//! Fixtures shared by the Parley benchmarks.

use chrono::{Duration, Utc};
use parley_core::{ConnectionId, Session, SessionRegistry};
use parley_protocol::{Frame, Message, MessageId, UserId};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// A message from `from` to `to` with a `len`-character body.
#[must_use]
pub fn message(id: MessageId, from: &str, to: &str, len: usize) -> Message {
    Message {
        id,
        sender_id: from.into(),
        recipient_id: to.into(),
        text: "x".repeat(len),
        created_at: Utc::now(),
        read: false,
    }
}

/// `count` messages spread across `peers` conversations with `owner`,
/// alternating direction, oldest first.
#[must_use]
pub fn mailbox(owner: &str, peers: usize, count: usize) -> Vec<Message> {
    let start = Utc::now() - Duration::seconds(count as i64);
    (0..count)
        .map(|i| {
            let peer = format!("peer-{}", i % peers.max(1));
            let (from, to) = if i % 2 == 0 {
                (owner.to_string(), peer)
            } else {
                (peer, owner.to_string())
            };
            Message {
                id: i as MessageId + 1,
                sender_id: UserId::new(from),
                recipient_id: UserId::new(to),
                text: "hello".to_string(),
                created_at: start + Duration::seconds(i as i64),
                read: i % 3 == 0,
            }
        })
        .collect()
}

/// Bind `count` sessions for `user`, keeping their outboxes alive.
pub fn bind_sessions(
    registry: &SessionRegistry,
    user: &str,
    count: usize,
) -> Vec<UnboundedReceiver<Arc<Frame>>> {
    (0..count)
        .map(|i| {
            let (tx, rx) = mpsc::unbounded_channel();
            registry.bind(Session::new(
                ConnectionId::new(format!("{}-{}", user, i)),
                user.into(),
                tx,
            ));
            rx
        })
        .collect()
}

/// Empty every outbox, returning how many frames were waiting.
pub fn drain(outboxes: &mut [UnboundedReceiver<Arc<Frame>>]) -> usize {
    outboxes
        .iter_mut()
        .map(|rx| std::iter::from_fn(|| rx.try_recv().ok()).count())
        .sum()
}
