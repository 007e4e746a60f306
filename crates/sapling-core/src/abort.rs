//! Cooperative cancellation.
//!
//! An [`AbortSignal`] is a shared flag plus a wake-up notification. Work
//! never gets interrupted mid-computation; instead long-running loops call
//! [`AbortSignal::check`] at their suspension points (between compile
//! iterations, around model calls, before each inbox drain step) and
//! `select!` on [`AbortSignal::cancelled`] while awaiting external I/O.
//! There is no implicit timer: timeouts are expressed by the caller
//! aborting a signal.
//!
//! Signals merge through [`AbortSignal::follow`]. A source keeps weak
//! links to its followers and fires them from its own `abort`, so a merge
//! costs one list entry and no task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::Notify;
use tracing::debug;

/// Error returned when an aborted signal is observed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("aborted: {reason}")]
pub struct Aborted {
    /// Reason given to [`AbortSignal::abort`].
    pub reason: String,
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Debug, Default)]
struct AbortInner {
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
    /// Signals that fire when this one does.
    followers: Mutex<Vec<Weak<AbortInner>>>,
    /// Signals this one follows.
    sources: Mutex<Vec<Weak<AbortInner>>>,
}

impl AbortInner {
    fn followers(&self) -> MutexGuard<'_, Vec<Weak<Self>>> {
        self.followers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sources(&self) -> MutexGuard<'_, Vec<Weak<Self>>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AbortSignal {
    /// Create a signal that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Only the first reason is kept.
    ///
    /// Returns `true` if this call fired the signal.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        {
            let mut slot = self
                .inner
                .reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason.into());
        }
        self.inner.aborted.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();

        let followers: Vec<Arc<AbortInner>> = std::mem::take(&mut *self.inner.followers())
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        if !followers.is_empty() {
            let reason = self.reason().unwrap_or_default();
            for inner in followers {
                Self { inner }.abort(reason.clone());
            }
        }
        true
    }

    /// Whether the signal has fired.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// The abort reason, if fired.
    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Return [`Aborted`] if the signal has fired.
    pub fn check(&self) -> Result<(), Aborted> {
        if self.is_aborted() {
            return Err(Aborted {
                reason: self.reason().unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Wait until the signal fires.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    /// Fire this signal whenever `other` fires.
    ///
    /// Used to merge a caller-supplied signal into an execution that is
    /// already running. If `other` has already fired, this signal fires
    /// immediately. The link is weak both ways and is dropped by
    /// [`detach`](Self::detach) or when either signal goes away.
    pub fn follow(&self, other: &Self) {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return;
        }
        if other.is_aborted() {
            self.abort(other.reason().unwrap_or_default());
            return;
        }
        {
            let mut followers = other.inner.followers();
            followers.retain(|w| w.strong_count() > 0);
            followers.push(Arc::downgrade(&self.inner));
        }
        let mut sources = self.inner.sources();
        sources.retain(|w| w.strong_count() > 0);
        sources.push(Arc::downgrade(&other.inner));
        drop(sources);
        // `other` may have fired between the check and the registration.
        if other.is_aborted() {
            self.abort(other.reason().unwrap_or_default());
        }
    }

    /// Stop following every signal passed to [`follow`](Self::follow).
    pub fn detach(&self) {
        let sources = std::mem::take(&mut *self.inner.sources());
        let mut released = 0_usize;
        let this = Arc::as_ptr(&self.inner);
        for source in sources.iter().filter_map(Weak::upgrade) {
            source
                .followers()
                .retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), this));
            released = released.saturating_add(1);
        }
        if released > 0 {
            debug!(released, "abort signal detached from its sources");
        }
    }

    /// Live signals following this one.
    pub fn follower_count(&self) -> usize {
        self.inner
            .followers()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn first_reason_wins() {
        let signal = AbortSignal::new();
        assert!(signal.check().is_ok());
        assert!(signal.abort("first"));
        assert!(!signal.abort("second"));
        assert_eq!(signal.reason().as_deref(), Some("first"));
        assert_eq!(
            signal.check(),
            Err(Aborted {
                reason: String::from("first")
            })
        );
    }

    #[tokio::test]
    async fn cancelled_resolves_after_abort() {
        let signal = AbortSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        signal.abort("stop");
        task.await.unwrap();
        assert!(signal.is_aborted());
    }

    #[tokio::test]
    async fn followed_signal_propagates() {
        let execution = AbortSignal::new();
        let caller = AbortSignal::new();
        execution.follow(&caller);
        caller.abort("timeout");
        tokio::time::timeout(std::time::Duration::from_secs(1), execution.cancelled())
            .await
            .unwrap();
        assert_eq!(execution.reason().as_deref(), Some("timeout"));
    }

    #[test]
    fn merges_do_not_outlive_their_followers() {
        let caller = AbortSignal::new();
        for _ in 0..1000 {
            let execution = AbortSignal::new();
            execution.follow(&caller);
        }
        assert_eq!(caller.follower_count(), 0);
        assert!(caller.inner.followers().len() <= 1);
    }

    #[test]
    fn detached_signals_stop_following() {
        let caller = AbortSignal::new();
        let execution = AbortSignal::new();
        execution.follow(&caller);
        assert_eq!(caller.follower_count(), 1);

        execution.detach();
        assert_eq!(caller.follower_count(), 0);
        caller.abort("late");
        assert!(!execution.is_aborted());
    }

    #[test]
    fn merges_propagate_through_chains_without_a_runtime() {
        let outer = AbortSignal::new();
        let middle = AbortSignal::new();
        let inner = AbortSignal::new();
        middle.follow(&outer);
        inner.follow(&middle);
        outer.follow(&inner);

        outer.abort("shutdown");
        assert_eq!(middle.reason().as_deref(), Some("shutdown"));
        assert_eq!(inner.reason().as_deref(), Some("shutdown"));
    }

    #[test]
    fn following_a_fired_signal_fires_immediately() {
        let execution = AbortSignal::new();
        let caller = AbortSignal::new();
        caller.abort("early");
        execution.follow(&caller);
        assert!(execution.is_aborted());
    }
}
