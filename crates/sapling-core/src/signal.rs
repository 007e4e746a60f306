//! Reactive signals.
//!
//! A [`Signal`] is an independent value with synchronous `get`/`set`.
//! Subscribers are not called inside `set`: the first change after a
//! delivery schedules one notification on the ambient tokio runtime, and
//! every further change before that notification runs is folded into it.
//! Without a runtime the notification waits for an explicit
//! [`Signal::flush`].
//!
//! A [`Computed`] derives a value from an explicit list of dependencies.
//! It recomputes lazily, on the first `get` after any dependency changed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::trace;

/// Identifies one subscription on a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Something that must be told when an upstream value changes.
pub trait Invalidate: Send + Sync {
    /// Mark cached state stale.
    fn invalidate(&self);
}

/// A value a [`Computed`] can depend on.
pub trait Dependency {
    /// Register `dependent` to be invalidated on every change.
    fn add_dependent(&self, dependent: Weak<dyn Invalidate>);
}

#[derive(Default)]
struct Dependents {
    list: Mutex<Vec<Weak<dyn Invalidate>>>,
}

impl Dependents {
    fn push(&self, dependent: Weak<dyn Invalidate>) {
        self.list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(dependent);
    }

    fn invalidate_all(&self) {
        let live: Vec<Arc<dyn Invalidate>> = {
            let mut list = self.list.lock().unwrap_or_else(PoisonError::into_inner);
            list.retain(|d| d.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        for dependent in live {
            dependent.invalidate();
        }
    }
}

/// A reactive value.
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

struct SignalInner<T> {
    value: Mutex<T>,
    subscribers: Mutex<BTreeMap<SubscriptionId, Subscriber<T>>>,
    next_id: AtomicU64,
    scheduled: AtomicBool,
    dependents: Dependents,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field(
                "value",
                &*self
                    .inner
                    .value
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            )
            .finish_non_exhaustive()
    }
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a signal holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                value: Mutex::new(value),
                subscribers: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(0),
                scheduled: AtomicBool::new(false),
                dependents: Dependents::default(),
            }),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.inner
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the value. Equal values are ignored.
    ///
    /// Returns whether the value changed.
    pub fn set(&self, value: T) -> bool {
        {
            let mut slot = self
                .inner
                .value
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *slot == value {
                return false;
            }
            *slot = value;
        }
        self.inner.dependents.invalidate_all();
        self.schedule();
        true
    }

    /// Apply `f` to a copy of the current value and store the result.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> bool {
        let next = f(&self.get());
        self.set(next)
    }

    /// Register `callback`, called with the value after coalesced changes.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(callback));
        id
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Deliver a pending notification now, on the calling thread.
    pub fn flush(&self) {
        self.inner.deliver();
    }

    /// Whether a notification is waiting to be delivered.
    pub fn has_pending_notification(&self) -> bool {
        self.inner.scheduled.load(Ordering::Acquire)
    }

    fn schedule(&self) {
        if self.inner.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            runtime.spawn(async move { inner.deliver() });
        } else {
            trace!("no tokio runtime; signal notification waits for flush");
        }
    }
}

impl<T: Clone> SignalInner<T> {
    fn deliver(&self) {
        if !self.scheduled.swap(false, Ordering::AcqRel) {
            return;
        }
        let value = self
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let subscribers: Vec<Subscriber<T>> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for subscriber in subscribers {
            subscriber(&value);
        }
    }
}

impl<T> Dependency for Signal<T> {
    fn add_dependent(&self, dependent: Weak<dyn Invalidate>) {
        self.inner.dependents.push(dependent);
    }
}

/// A lazily derived value.
pub struct Computed<T> {
    inner: Arc<ComputedInner<T>>,
}

struct ComputedInner<T> {
    compute: Box<dyn Fn() -> T + Send + Sync>,
    cached: Mutex<Option<T>>,
    dependents: Dependents,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed").finish_non_exhaustive()
    }
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Derive a value from `deps` with `compute`.
    ///
    /// `compute` reads the dependencies itself; the list only says which
    /// changes invalidate the cached result.
    pub fn new(deps: &[&dyn Dependency], compute: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let inner = Arc::new(ComputedInner {
            compute: Box::new(compute),
            cached: Mutex::new(None),
            dependents: Dependents::default(),
        });
        let weak: Weak<ComputedInner<T>> = Arc::downgrade(&inner);
        for dep in deps {
            let dependent: Weak<dyn Invalidate> = weak.clone();
            dep.add_dependent(dependent);
        }
        Self { inner }
    }

    /// Current value, recomputed if a dependency changed since the last read.
    pub fn get(&self) -> T {
        let mut cached = self
            .inner
            .cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = cached.as_ref() {
            return value.clone();
        }
        let value = (self.inner.compute)();
        *cached = Some(value.clone());
        value
    }
}

impl<T: Send + Sync> Invalidate for ComputedInner<T> {
    fn invalidate(&self) {
        let was_cached = self
            .cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if was_cached {
            self.dependents.invalidate_all();
        }
    }
}

impl<T> Dependency for Computed<T> {
    fn add_dependent(&self, dependent: Weak<dyn Invalidate>) {
        self.inner.dependents.push(dependent);
    }
}
