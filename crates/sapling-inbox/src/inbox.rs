//! The inbox store.
//!
//! One FIFO queue per session behind a single mutex, so the append order
//! is the order in which concurrent writers won the lock. Subscribers are
//! called after the append, outside the queue lock, which lets them read
//! the inbox (`pending`, `mark_done`) from inside the callback.
//!
//! A subscriber that returns an error or panics is logged and skipped; the
//! write still succeeds and the remaining subscribers still run.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::Utc;
use sapling_types::{InboxMessage, MessageId, NewInboxMessage, SessionId};
use tracing::{debug, trace, warn};

use crate::error::InboxError;

/// Callback invoked with every message written to a subscribed session.
pub type InboxSubscriber = Arc<dyn Fn(&InboxMessage) -> Result<(), InboxError> + Send + Sync>;

/// Per-session FIFO message store.
#[derive(Default)]
pub struct Inbox {
    queues: Mutex<HashMap<SessionId, VecDeque<InboxMessage>>>,
    subscribers: Mutex<HashMap<SessionId, Vec<(u64, InboxSubscriber)>>>,
    next_subscriber: AtomicU64,
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox")
            .field("sessions_with_pending", &self.sessions_with_pending().len())
            .finish_non_exhaustive()
    }
}

impl Inbox {
    /// Create an empty inbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to `session`'s queue and notify its subscribers.
    pub fn write(&self, session: SessionId, message: NewInboxMessage) -> MessageId {
        let stored = InboxMessage {
            id: MessageId::new(),
            session_id: session,
            source: message.source,
            kind: message.kind,
            payload: message.payload,
            timestamp: Utc::now(),
        };
        let id = stored.id;
        let depth = {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            let queue = queues.entry(session).or_default();
            queue.push_back(stored.clone());
            queue.len()
        };
        debug!(
            session_id = %session,
            message_id = %id,
            kind = ?stored.kind,
            source = %stored.source,
            depth,
            "inbox write"
        );
        self.notify(session, &stored);
        id
    }

    /// Copy of `session`'s queue, oldest first.
    pub fn pending(&self, session: SessionId) -> Vec<InboxMessage> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Oldest pending message of `session`.
    pub fn front(&self, session: SessionId) -> Option<InboxMessage> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session)
            .and_then(|queue| queue.front().cloned())
    }

    /// Remove message `id` from `session`'s queue.
    ///
    /// Unknown sessions and ids are ignored. Returns whether an entry was
    /// removed.
    pub fn mark_done(&self, session: SessionId, id: MessageId) -> bool {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(queue) = queues.get_mut(&session) else {
            return false;
        };
        let Some(position) = queue.iter().position(|m| m.id == id) else {
            return false;
        };
        queue.remove(position);
        if queue.is_empty() {
            queues.remove(&session);
        }
        debug!(session_id = %session, message_id = %id, "inbox message done");
        true
    }

    /// Number of pending messages for `session`.
    pub fn len(&self, session: SessionId) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session)
            .map_or(0, VecDeque::len)
    }

    /// Whether `session` has nothing pending.
    pub fn is_empty(&self, session: SessionId) -> bool {
        self.len(session) == 0
    }

    /// Sessions with at least one pending message, sorted.
    pub fn sessions_with_pending(&self) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(session, _)| *session)
            .collect();
        sessions.sort();
        sessions
    }

    /// Call `callback` for every message written to `session` from now on.
    pub fn subscribe<F>(self: &Arc<Self>, session: SessionId, callback: F) -> InboxSubscription
    where
        F: Fn(&InboxMessage) -> Result<(), InboxError> + Send + Sync + 'static,
    {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session)
            .or_default()
            .push((id, Arc::new(callback)));
        trace!(session_id = %session, subscriber = id, "inbox subscribed");
        InboxSubscription {
            inbox: Arc::downgrade(self),
            session,
            id,
        }
    }

    /// Number of live subscriptions for `session`.
    pub fn subscriber_count(&self, session: SessionId) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session)
            .map_or(0, Vec::len)
    }

    fn unsubscribe(&self, session: SessionId, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = subscribers.get_mut(&session) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(&session);
        }
        removed
    }

    fn notify(&self, session: SessionId, message: &InboxMessage) {
        let callbacks: Vec<(u64, InboxSubscriber)> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session)
            .cloned()
            .unwrap_or_default();
        for (id, callback) in callbacks {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(message))).unwrap_or_else(
                |payload| Err(InboxError::SubscriberPanicked(panic_message(&*payload))),
            );
            if let Err(e) = outcome {
                warn!(
                    session_id = %session,
                    message_id = %message.id,
                    subscriber = id,
                    error = %e,
                    "inbox subscriber failed"
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("non-string panic payload"))
}

/// Handle returned by [`Inbox::subscribe`].
///
/// Dropping the handle keeps the subscription; call
/// [`unsubscribe`](Self::unsubscribe) to end it.
#[derive(Debug)]
pub struct InboxSubscription {
    inbox: Weak<Inbox>,
    session: SessionId,
    id: u64,
}

impl InboxSubscription {
    /// Session this subscription listens to.
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// Remove this subscription only. Returns whether it was still active.
    pub fn unsubscribe(self) -> bool {
        self.inbox
            .upgrade()
            .is_some_and(|inbox| inbox.unsubscribe(self.session, self.id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use sapling_types::InboxMessageKind;

    use super::*;

    fn text(n: usize) -> NewInboxMessage {
        NewInboxMessage::text("test", format!("m{n}"))
    }

    fn texts(messages: &[InboxMessage]) -> Vec<String> {
        messages
            .iter()
            .map(|m| m.text().unwrap_or_default().to_owned())
            .collect()
    }

    #[test]
    fn pending_preserves_write_order() {
        let inbox = Inbox::new();
        let session = SessionId::new();
        let ids: Vec<MessageId> = (0..5).map(|n| inbox.write(session, text(n))).collect();
        let pending = inbox.pending(session);
        assert_eq!(pending.iter().map(|m| m.id).collect::<Vec<_>>(), ids);
        assert_eq!(texts(&pending), vec!["m0", "m1", "m2", "m3", "m4"]);
        assert!(pending.iter().all(|m| m.session_id == session));
    }

    #[test]
    fn pending_returns_a_copy() {
        let inbox = Inbox::new();
        let session = SessionId::new();
        inbox.write(session, text(1));
        let mut copy = inbox.pending(session);
        copy.clear();
        copy.push(InboxMessage {
            id: MessageId::new(),
            session_id: session,
            source: String::from("forged"),
            kind: InboxMessageKind::Message,
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        });
        assert_eq!(texts(&inbox.pending(session)), vec!["m1"]);
    }

    #[test]
    fn concurrent_writes_keep_per_writer_order() {
        let inbox = Inbox::new();
        let session = SessionId::new();
        std::thread::scope(|scope| {
            for writer in 0..4 {
                let inbox = &inbox;
                scope.spawn(move || {
                    for seq in 0..50 {
                        inbox.write(
                            session,
                            NewInboxMessage::text(format!("w{writer}"), seq.to_string()),
                        );
                    }
                });
            }
        });
        let pending = inbox.pending(session);
        assert_eq!(pending.len(), 200);
        for writer in 0..4 {
            let source = format!("w{writer}");
            let seqs: Vec<u32> = pending
                .iter()
                .filter(|m| m.source == source)
                .map(|m| m.text().unwrap().parse().unwrap())
                .collect();
            assert_eq!(seqs, (0..50).collect::<Vec<u32>>());
        }
    }

    #[test]
    fn mark_done_is_idempotent_and_ignores_unknowns() {
        let inbox = Inbox::new();
        let session = SessionId::new();
        let first = inbox.write(session, text(1));
        inbox.write(session, text(2));

        assert!(!inbox.mark_done(SessionId::new(), first));
        assert!(!inbox.mark_done(session, MessageId::new()));
        assert_eq!(inbox.len(session), 2);

        assert!(inbox.mark_done(session, first));
        assert!(!inbox.mark_done(session, first));
        assert_eq!(texts(&inbox.pending(session)), vec!["m2"]);
    }

    #[test]
    fn sessions_with_pending_tracks_non_empty_queues() {
        let inbox = Inbox::new();
        let (a, b) = (SessionId::new(), SessionId::new());
        let only = inbox.write(a, text(1));
        inbox.write(b, text(2));
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(inbox.sessions_with_pending(), expected);

        inbox.mark_done(a, only);
        assert_eq!(inbox.sessions_with_pending(), vec![b]);
        assert!(inbox.is_empty(a));
    }

    #[test]
    #[allow(clippy::panic)]
    fn failing_subscribers_are_isolated() {
        let inbox = Arc::new(Inbox::new());
        let session = SessionId::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _failing =
            inbox.subscribe(session, |_| Err(InboxError::Subscriber(String::from("nope"))));
        let _panicking = inbox.subscribe(session, |_| -> Result<(), InboxError> {
            panic!("subscriber exploded")
        });
        let counter = Arc::clone(&hits);
        let _counting = inbox.subscribe(session, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        inbox.write(session, text(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(inbox.len(session), 1);
    }

    #[test]
    fn unsubscribe_removes_only_its_own_callback() {
        let inbox = Arc::new(Inbox::new());
        let session = SessionId::new();
        let (a, b) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let (ca, cb) = (Arc::clone(&a), Arc::clone(&b));
        let first = inbox.subscribe(session, move |_| {
            ca.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let _second = inbox.subscribe(session, move |_| {
            cb.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        inbox.write(session, text(1));
        assert!(first.unsubscribe());
        inbox.write(session, text(2));

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 2);
        assert_eq!(inbox.subscriber_count(session), 1);
    }

    #[test]
    fn subscribers_can_read_the_inbox() {
        let inbox = Arc::new(Inbox::new());
        let session = SessionId::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let (reader, count) = (Arc::downgrade(&inbox), Arc::clone(&seen));
        let _sub = inbox.subscribe(session, move |_| {
            if let Some(inbox) = reader.upgrade() {
                count.store(inbox.pending(session).len(), Ordering::SeqCst);
            }
            Ok(())
        });
        inbox.write(session, text(1));
        inbox.write(session, text(2));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
