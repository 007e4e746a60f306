//! Per-session cache behind data cells.
//!
//! Entries are keyed by the data cell's cache key (not its node path), so
//! two nodes that ask for the same key share one fetch and one entry. An
//! entry is reused as long as the dependency list it was fetched with is
//! unchanged; [`DataCache::invalidate`] evicts entries by exact key or by
//! regular expression.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::cell::Deps;

/// A fetched value with the tick and deps it was fetched under.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedData {
    /// Serialized fetch result.
    pub value: Value,
    /// Tick during which the fetch resolved.
    pub tick: u64,
    /// Dependency list the fetch was made with.
    pub deps: Option<Deps>,
}

/// Rejection from a data fetcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct FetchError {
    /// Human-readable failure.
    pub message: String,
}

impl FetchError {
    /// Build a fetch error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Future produced by a data fetcher.
pub type FetchFuture = BoxFuture<'static, Result<Value, FetchError>>;

/// Which cache entries to evict.
#[derive(Debug, Clone)]
pub enum Invalidation {
    /// Exactly this key.
    Key(String),
    /// Every key the expression matches.
    Pattern(Regex),
}

impl Invalidation {
    /// Evict one key.
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    /// Evict keys matching `pattern`.
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self::Pattern)
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            Self::Key(k) => k == key,
            Self::Pattern(re) => re.is_match(key),
        }
    }
}

/// Shared cache of resolved data cells for one session.
#[derive(Debug, Clone, Default)]
pub struct DataCache {
    entries: Arc<Mutex<BTreeMap<String, CachedData>>>,
}

impl DataCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached entry for `key`.
    pub fn get(&self, key: &str) -> Option<CachedData> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Whether `key` holds an entry fetched with exactly `deps`.
    pub fn is_fresh(&self, key: &str, deps: Option<&[Value]>) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|entry| entry.deps.as_deref() == deps)
    }

    /// Store an entry, replacing any previous one.
    pub fn insert(&self, key: impl Into<String>, entry: CachedData) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), entry);
    }

    /// Evict matching entries. Returns how many were removed.
    pub fn invalidate(&self, which: &Invalidation) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, _| !which.matches(key));
        let evicted = before.saturating_sub(entries.len());
        debug!(?which, evicted, "data cache invalidated");
        evicted
    }

    /// All cached keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A fetch started during the render walk, awaited after it.
pub(crate) struct PendingFetch {
    pub(crate) key: String,
    pub(crate) deps: Option<Deps>,
    pub(crate) future: FetchFuture,
}
