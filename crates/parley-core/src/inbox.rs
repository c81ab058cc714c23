//! Inbox assembly: one thread per counterpart, most recent first.

use parley_protocol::{InboxThread, Message, UserId};
use std::collections::HashMap;

/// Group `owner`'s messages into per-counterpart threads.
///
/// Messages inside a thread are oldest first. Threads are ordered by their
/// newest message, most recent first.
#[must_use]
pub fn group_threads(owner: &UserId, messages: Vec<Message>) -> Vec<InboxThread> {
    let mut by_counterpart: HashMap<UserId, Vec<Message>> = HashMap::new();
    for message in messages {
        if let Some(counterpart) = message.counterpart(owner).cloned() {
            by_counterpart.entry(counterpart).or_default().push(message);
        }
    }

    let mut threads: Vec<InboxThread> = by_counterpart
        .into_iter()
        .filter_map(|(counterpart, mut messages)| {
            messages.sort_by(Message::chronological);
            let last_activity = messages.last()?.created_at;
            let unread_count = messages
                .iter()
                .filter(|m| !m.read && &m.recipient_id == owner)
                .count();
            Some(InboxThread {
                counterpart,
                messages,
                unread_count,
                last_activity,
            })
        })
        .collect();

    threads.sort_by(|a, b| match (a.messages.last(), b.messages.last()) {
        (Some(x), Some(y)) => y.chronological(x),
        _ => std::cmp::Ordering::Equal,
    });
    threads
}

/// Keep only the newest `keep` messages of each thread.
///
/// `unread_count` and `last_activity` are left as computed over the whole
/// thread.
pub fn trim_threads(threads: &mut [InboxThread], keep: usize) {
    for thread in threads {
        let excess = thread.messages.len().saturating_sub(keep);
        thread.messages.drain(..excess);
    }
}
