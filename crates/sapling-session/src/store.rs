//! Session snapshot persistence.
//!
//! A [`SessionStore`] keeps the latest [`SessionSnapshot`] per session id.
//! Saving a snapshot supersedes the previous one for the same session.
//!
//! - [`MemorySessionStore`] keeps snapshots in process, evicting the least
//!   recently used session once `max_entries` is exceeded.
//! - [`FileSessionStore`] writes one JSON document per session into a
//!   directory, replacing it atomically via a temporary file.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use sapling_core::config::{StoreBackend, StoreConfig};
use sapling_types::{SessionId, SessionSnapshot};
use tracing::{debug, info};

use crate::error::StoreError;

/// Durable key-value persistence of session snapshots.
pub trait SessionStore: Send + Sync {
    /// Store `snapshot`, replacing any earlier one for its session.
    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError>;

    /// Latest snapshot of `session`, if any.
    fn load(&self, session: SessionId) -> Result<Option<SessionSnapshot>, StoreError>;

    /// Forget `session`. Returns whether a snapshot existed.
    fn delete(&self, session: SessionId) -> Result<bool, StoreError>;
}

/// Build the store selected by `config`.
pub fn from_config(config: &StoreConfig) -> Arc<dyn SessionStore> {
    match config.backend {
        StoreBackend::Memory => Arc::new(MemorySessionStore::new(config.max_entries)),
        StoreBackend::File => Arc::new(FileSessionStore::new(&config.directory)),
    }
}

#[derive(Debug, Default)]
struct Lru {
    snapshots: HashMap<SessionId, SessionSnapshot>,
    /// Least recently used first.
    order: VecDeque<SessionId>,
}

impl Lru {
    fn touch(&mut self, session: SessionId) {
        self.order.retain(|s| *s != session);
        self.order.push_back(session);
    }
}

/// In-process store with LRU eviction.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    max_entries: usize,
    entries: Mutex<Lru>,
}

impl MemorySessionStore {
    /// Create a store holding at most `max_entries` sessions (0 = unbounded).
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: Mutex::new(Lru::default()),
        }
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshots
            .len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        let mut lru = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        lru.snapshots.insert(snapshot.session_id, snapshot.clone());
        lru.touch(snapshot.session_id);
        while self.max_entries > 0 && lru.snapshots.len() > self.max_entries {
            let Some(oldest) = lru.order.pop_front() else {
                break;
            };
            lru.snapshots.remove(&oldest);
            info!(session_id = %oldest, max_entries = self.max_entries, "snapshot evicted");
        }
        debug!(session_id = %snapshot.session_id, tick = snapshot.tick, "snapshot saved");
        Ok(())
    }

    fn load(&self, session: SessionId) -> Result<Option<SessionSnapshot>, StoreError> {
        let mut lru = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let found = lru.snapshots.get(&session).cloned();
        if found.is_some() {
            lru.touch(session);
        }
        Ok(found)
    }

    fn delete(&self, session: SessionId) -> Result<bool, StoreError> {
        let mut lru = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        lru.order.retain(|s| *s != session);
        Ok(lru.snapshots.remove(&session).is_some())
    }
}

/// One `<session id>.json` file per session.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    directory: PathBuf,
}

impl FileSessionStore {
    /// Store snapshots under `directory`, created on first save.
    pub fn new(directory: &Path) -> Self {
        Self {
            directory: directory.to_path_buf(),
        }
    }

    /// Path of `session`'s snapshot file.
    pub fn path_for(&self, session: SessionId) -> PathBuf {
        self.directory.join(format!("{session}.json"))
    }
}

fn io_error(path: &Path, err: &std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

impl SessionStore for FileSessionStore {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.directory).map_err(|e| io_error(&self.directory, &e))?;
        let path = self.path_for(snapshot.session_id);
        let tmp = path.with_extension("json.tmp");
        let body =
            serde_json::to_vec_pretty(snapshot).map_err(|e| StoreError::Serde(e.to_string()))?;
        std::fs::write(&tmp, body).map_err(|e| io_error(&tmp, &e))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_error(&path, &e))?;
        debug!(
            session_id = %snapshot.session_id,
            tick = snapshot.tick,
            path = %path.display(),
            "snapshot written"
        );
        Ok(())
    }

    fn load(&self, session: SessionId) -> Result<Option<SessionSnapshot>, StoreError> {
        let path = self.path_for(session);
        let body = match std::fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, &e)),
        };
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| StoreError::Serde(e.to_string()))
    }

    fn delete(&self, session: SessionId) -> Result<bool, StoreError> {
        let path = self.path_for(session);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path, &e)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use sapling_types::{SNAPSHOT_VERSION, TimelineEntry, Usage};

    use super::*;

    fn snapshot(session: SessionId, tick: u64) -> SessionSnapshot {
        SessionSnapshot {
            version: SNAPSHOT_VERSION,
            session_id: session,
            tick,
            tree: None,
            timeline: vec![TimelineEntry::user_text(tick, "hi")],
            usage: Usage::default(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn later_saves_supersede_earlier_ones() {
        let store = MemorySessionStore::new(0);
        let session = SessionId::new();
        store.save(&snapshot(session, 1)).unwrap();
        store.save(&snapshot(session, 2)).unwrap();
        assert_eq!(store.load(session).unwrap().unwrap().tick, 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn least_recently_used_session_is_evicted() {
        let store = MemorySessionStore::new(2);
        let (a, b, c) = (SessionId::new(), SessionId::new(), SessionId::new());
        store.save(&snapshot(a, 1)).unwrap();
        store.save(&snapshot(b, 1)).unwrap();
        // Reading `a` makes `b` the eviction candidate.
        assert!(store.load(a).unwrap().is_some());
        store.save(&snapshot(c, 1)).unwrap();

        assert!(store.load(a).unwrap().is_some());
        assert!(store.load(b).unwrap().is_none());
        assert!(store.load(c).unwrap().is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn delete_reports_presence() {
        let store = MemorySessionStore::new(0);
        let session = SessionId::new();
        store.save(&snapshot(session, 1)).unwrap();
        assert!(store.delete(session).unwrap());
        assert!(!store.delete(session).unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn file_store_round_trips_and_deletes() {
        let directory = std::env::temp_dir().join(format!("sapling-store-{}", SessionId::new()));
        let store = FileSessionStore::new(&directory);
        let session = SessionId::new();

        assert!(store.load(session).unwrap().is_none());
        let saved = snapshot(session, 3);
        store.save(&saved).unwrap();
        assert!(store.path_for(session).exists());
        assert_eq!(store.load(session).unwrap(), Some(saved));

        assert!(store.delete(session).unwrap());
        assert!(store.load(session).unwrap().is_none());
        std::fs::remove_dir_all(&directory).unwrap();
    }

    #[test]
    fn corrupt_file_is_a_serde_error() {
        let directory = std::env::temp_dir().join(format!("sapling-store-{}", SessionId::new()));
        let store = FileSessionStore::new(&directory);
        let session = SessionId::new();
        std::fs::create_dir_all(&directory).unwrap();
        std::fs::write(store.path_for(session), b"{ not json").unwrap();

        assert!(matches!(store.load(session), Err(StoreError::Serde(_))));
        std::fs::remove_dir_all(&directory).unwrap();
    }
}
