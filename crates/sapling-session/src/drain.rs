//! Inbox attachment and draining.
//!
//! A session attached to an [`Inbox`] drains its own queue whenever a
//! writer adds to it. Drains are serialized per session: a notification
//! arriving while a drain is active only marks the drain dirty, and the
//! active drain runs exactly one further pass for all such notifications.
//!
//! Each pass walks the pending entries in order. A `message` entry is
//! queued as conversation input (starting an execution when idle); a
//! `dispatch` entry invokes a capability directly. Successful entries are
//! marked done. The first failure halts the drain and leaves that entry and
//! everything behind it pending.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use sapling_core::AbortSignal;
use sapling_inbox::{Inbox, InboxError};
use sapling_types::{ContentBlock, InboxMessage, InboxMessageKind, MessageId, QueuedMessage};
use tracing::{debug, info, trace, warn};

use crate::error::SessionError;
use crate::session::{InboxAttachment, Session, TickInput};

/// Where a drain stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainHalt {
    /// Entry that failed; still pending.
    pub message_id: MessageId,
    /// Why it failed.
    pub error: SessionError,
}

/// Outcome of [`Session::drain_inbox`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Passes over the queue.
    pub passes: u32,
    /// Entries processed and marked done.
    pub processed: usize,
    /// Set when an entry failed.
    pub halted: Option<DrainHalt>,
}

impl Session {
    /// Subscribe to `inbox` and drain on every write to this session's
    /// queue. Entries already pending are drained right away.
    ///
    /// Replaces any earlier attachment. Drains are spawned on the tokio
    /// runtime current at attach time; without one, writes are left pending
    /// and the subscriber reports an error to the inbox.
    pub fn attach_inbox(&self, inbox: Arc<Inbox>) {
        let runtime = tokio::runtime::Handle::try_current().ok();
        let session = Arc::downgrade(&self.inner);
        let spawner = runtime.clone();
        let subscription = inbox.subscribe(self.inner.id, move |message: &InboxMessage| {
            let Some(runtime) = spawner.as_ref() else {
                return Err(InboxError::Subscriber(String::from(
                    "no tokio runtime to drain on",
                )));
            };
            let Some(inner) = session.upgrade() else {
                return Ok(());
            };
            trace!(message_id = %message.id, "inbox write; scheduling drain");
            let session = Session { inner };
            runtime.spawn(async move {
                session.drain_inbox().await;
            });
            Ok(())
        });

        let previous = self.inner.lock_inbox().replace(InboxAttachment {
            inbox: Arc::clone(&inbox),
            subscription,
        });
        if let Some(previous) = previous {
            previous.subscription.unsubscribe();
        }
        info!(session_id = %self.inner.id, pending = inbox.len(self.inner.id), "inbox attached");

        if let Some(runtime) = runtime.filter(|_| !inbox.is_empty(self.inner.id)) {
            let session = self.clone();
            runtime.spawn(async move {
                session.drain_inbox().await;
            });
        }
    }

    /// Inbox this session is attached to.
    pub fn inbox(&self) -> Option<Arc<Inbox>> {
        self.inner
            .lock_inbox()
            .as_ref()
            .map(|attachment| Arc::clone(&attachment.inbox))
    }

    /// Whether a drain is in progress.
    pub fn is_draining(&self) -> bool {
        self.inner.drain.active.load(Ordering::SeqCst)
    }

    /// Process pending inbox entries.
    ///
    /// Returns `None` without doing anything when no inbox is attached or
    /// when another drain is active (that drain picks up the work).
    pub async fn drain_inbox(&self) -> Option<DrainReport> {
        self.drain_inbox_until(&AbortSignal::new()).await
    }

    /// Like [`drain_inbox`](Self::drain_inbox), checking `abort` before
    /// every entry.
    pub async fn drain_inbox_until(&self, abort: &AbortSignal) -> Option<DrainReport> {
        let inbox = self.inbox()?;
        let flags = &self.inner.drain;
        flags.again.store(true, Ordering::SeqCst);
        if flags.active.swap(true, Ordering::SeqCst) {
            trace!(session_id = %self.inner.id, "drain active; coalesced");
            return None;
        }

        let mut report = DrainReport::default();
        loop {
            flags.again.store(false, Ordering::SeqCst);
            report.passes = report.passes.saturating_add(1);
            let halted = self.drain_pass(&inbox, abort, &mut report.processed).await;
            flags.active.store(false, Ordering::SeqCst);
            if halted.is_some() {
                report.halted = halted;
                break;
            }
            if !flags.again.load(Ordering::SeqCst) || flags.active.swap(true, Ordering::SeqCst) {
                break;
            }
        }
        debug!(
            session_id = %self.inner.id,
            passes = report.passes,
            processed = report.processed,
            halted = report.halted.is_some(),
            "drain finished"
        );
        Some(report)
    }

    async fn drain_pass(
        &self,
        inbox: &Inbox,
        abort: &AbortSignal,
        processed: &mut usize,
    ) -> Option<DrainHalt> {
        while let Some(entry) = inbox.front(self.inner.id) {
            let outcome = match abort.check() {
                Ok(()) => self.process_entry(&entry).await,
                Err(aborted) => Err(aborted.into()),
            };
            if let Err(error) = outcome {
                warn!(
                    session_id = %self.inner.id,
                    message_id = %entry.id,
                    error = %error,
                    "inbox entry failed; drain halted"
                );
                return Some(DrainHalt {
                    message_id: entry.id,
                    error,
                });
            }
            inbox.mark_done(self.inner.id, entry.id);
            *processed = processed.saturating_add(1);
            debug!(
                session_id = %self.inner.id,
                message_id = %entry.id,
                kind = ?entry.kind,
                "inbox entry done"
            );
        }
        None
    }

    async fn process_entry(&self, entry: &InboxMessage) -> Result<(), SessionError> {
        match entry.kind {
            InboxMessageKind::Message => {
                let message = queued_from_inbox(entry)?;
                self.tick(TickInput::new().with_message(message));
                Ok(())
            }
            InboxMessageKind::Dispatch => {
                let name = entry.dispatch_name().ok_or_else(|| {
                    SessionError::InvalidInboxEntry(format!(
                        "dispatch {} names no capability",
                        entry.id
                    ))
                })?;
                self.dispatch(name, entry.dispatch_input()).await.map(drop)
            }
        }
    }
}

/// Turn a `message` inbox entry into conversation input.
fn queued_from_inbox(entry: &InboxMessage) -> Result<QueuedMessage, SessionError> {
    let content = if let Some(text) = entry.text() {
        vec![ContentBlock::text(text)]
    } else if let Some(blocks) = entry.payload.get("content") {
        serde_json::from_value(blocks.clone()).map_err(|e| {
            SessionError::InvalidInboxEntry(format!("message {}: {e}", entry.id))
        })?
    } else {
        return Err(SessionError::InvalidInboxEntry(format!(
            "message {} carries neither text nor content",
            entry.id
        )));
    };
    Ok(QueuedMessage {
        id: entry.id,
        source: entry.source.clone(),
        content,
        queued_at: entry.timestamp,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use sapling_types::SessionId;
    use serde_json::json;

    use super::*;

    fn entry(payload: serde_json::Value) -> InboxMessage {
        InboxMessage {
            id: MessageId::new(),
            session_id: SessionId::new(),
            source: String::from("webhook"),
            kind: InboxMessageKind::Message,
            payload,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn text_payloads_become_text_blocks() {
        let stored = entry(json!({"text": "hello"}));
        let queued = queued_from_inbox(&stored).unwrap();
        assert_eq!(queued.id, stored.id);
        assert_eq!(queued.source, "webhook");
        assert_eq!(queued.content, vec![ContentBlock::text("hello")]);
    }

    #[test]
    fn content_payloads_pass_through() {
        let queued = queued_from_inbox(&entry(json!({
            "content": [{"type": "json", "value": {"order": 7}}]
        })))
        .unwrap();
        assert_eq!(
            queued.content,
            vec![ContentBlock::Json {
                value: json!({"order": 7})
            }]
        );
    }

    #[test]
    fn empty_payloads_are_invalid() {
        assert!(matches!(
            queued_from_inbox(&entry(json!({}))),
            Err(SessionError::InvalidInboxEntry(_))
        ));
    }
}
