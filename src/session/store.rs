//! Versioned in-memory session store with write-behind persistence.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use super::persistence::SnapshotPersistence;
use crate::error::{Result, WorkflowError};
use crate::session::{SessionId, SessionSnapshot};

/// Observer of committed snapshots.
///
/// The delivery router implements this to push state updates. The callback
/// runs inside the session's write path, after the version bump and before
/// the write lock is released, so implementations see versions in commit
/// order and must not block.
pub trait StateSink: Send + Sync {
    fn state_committed(&self, snapshot: &SessionSnapshot);
}

/// Sink that drops everything. Used where delivery is not wired up.
pub struct NullSink;

impl StateSink for NullSink {
    fn state_committed(&self, _snapshot: &SessionSnapshot) {}
}

/// Authoritative holder of session snapshots.
///
/// Reads hand out clones and never block writers for longer than a copy.
/// Writes to one session are serialized; writes to different sessions
/// proceed independently. Every committed mutation bumps `version` by
/// exactly one, so a version uniquely identifies a snapshot's content.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    sessions: DashMap<SessionId, SessionSnapshot>,
    persistence: Arc<dyn SnapshotPersistence>,
    sink: Arc<dyn StateSink>,
}

impl SessionStore {
    pub fn new(
        persistence: Arc<dyn SnapshotPersistence>,
        sink: Arc<dyn StateSink>,
    ) -> Result<Self> {
        let sessions = DashMap::new();
        for snapshot in persistence.load_latest()? {
            sessions.insert(snapshot.session_id.clone(), snapshot);
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Recovered sessions from persistence");
        }
        Ok(Self {
            inner: Arc::new(StoreInner {
                sessions,
                persistence,
                sink,
            }),
        })
    }

    /// Store with no persistence and no delivery. Test constructor.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                sessions: DashMap::new(),
                persistence: Arc::new(super::persistence::NullPersistence),
                sink: Arc::new(NullSink),
            }),
        }
    }

    pub fn create(&self, session_id: SessionId) -> Result<SessionSnapshot> {
        match self.inner.sessions.entry(session_id.clone()) {
            Entry::Occupied(_) => Err(WorkflowError::SessionExists(session_id.into_inner())),
            Entry::Vacant(slot) => {
                let snapshot = SessionSnapshot::new(session_id);
                slot.insert(snapshot.clone());
                self.inner.persistence.persist(&snapshot);
                self.inner.sink.state_committed(&snapshot);
                info!(session_id = %snapshot.session_id, "Session created");
                Ok(snapshot)
            }
        }
    }

    pub fn get(&self, id: &SessionId) -> Result<SessionSnapshot> {
        self.inner
            .sessions
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| WorkflowError::SessionNotFound(id.to_string()))
    }

    /// Current version without cloning the whole snapshot.
    pub fn version(&self, id: &SessionId) -> Result<u64> {
        self.inner
            .sessions
            .get(id)
            .map(|entry| entry.version)
            .ok_or_else(|| WorkflowError::SessionNotFound(id.to_string()))
    }

    /// Apply a mutation under the session's write lock.
    ///
    /// The closure sees a working copy with `version` already advanced to
    /// the value it will commit at. Returning an error discards the attempt
    /// and leaves the stored snapshot untouched, so partial mutations are
    /// never observable. On commit the snapshot goes to persistence and the
    /// state sink before the lock is released.
    ///
    /// `expected_version` of Some enforces optimistic concurrency against
    /// the snapshot the caller last read; None is for writers that hold no
    /// prior read, like additive result reconciliation.
    pub fn apply<F>(
        &self,
        id: &SessionId,
        expected_version: Option<u64>,
        mutate: F,
    ) -> Result<SessionSnapshot>
    where
        F: FnOnce(&mut SessionSnapshot) -> Result<()>,
    {
        let mut entry = self
            .inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| WorkflowError::SessionNotFound(id.to_string()))?;

        if let Some(expected) = expected_version
            && expected != entry.version
        {
            return Err(WorkflowError::VersionConflict {
                expected,
                actual: entry.version,
            });
        }

        let mut working = entry.clone();
        working.version += 1;
        working.updated_at = Utc::now();
        mutate(&mut working)?;

        *entry = working.clone();
        self.inner.persistence.persist(&working);
        self.inner.sink.state_committed(&working);
        debug!(session_id = %id, version = working.version, "Snapshot committed");
        Ok(working)
    }
}
