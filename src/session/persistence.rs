//! Snapshot persistence behind a dedicated writer thread.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use rusqlite::{Connection, params};
use tracing::{debug, error, warn};

use super::{SessionSnapshot, store_err, store_err_with};
use crate::error::Result;

/// Storage boundary for committed snapshots.
///
/// `persist` runs on the session write path and must not block on I/O;
/// implementations hand the snapshot off and report failures through logs.
/// `load_latest` is only called once, at startup recovery.
pub trait SnapshotPersistence: Send + Sync {
    fn persist(&self, snapshot: &SessionSnapshot);
    fn load_latest(&self) -> Result<Vec<SessionSnapshot>>;
}

/// Keeps nothing. Sessions live only as long as the process.
pub struct NullPersistence;

impl SnapshotPersistence for NullPersistence {
    fn persist(&self, _snapshot: &SessionSnapshot) {}

    fn load_latest(&self) -> Result<Vec<SessionSnapshot>> {
        Ok(Vec::new())
    }
}

enum WriteCommand {
    Persist(Box<SessionSnapshot>),
    Shutdown,
}

/// SQLite-backed persistence. All writes go through one dedicated thread so
/// the store never waits on disk. Every committed version is kept, keyed by
/// (session_id, version); recovery reads the highest version per session.
pub struct SqliteSnapshots {
    db_path: PathBuf,
    tx: Sender<WriteCommand>,
    handle: Option<JoinHandle<()>>,
}

impl SqliteSnapshots {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<WriteCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let thread_path = db_path.clone();

        let handle = thread::Builder::new()
            .name("snapshot-writer".into())
            .spawn(move || match Self::init_db(&thread_path) {
                Ok(conn) => {
                    let _ = ready_tx.send(Ok(()));
                    Self::process_commands(&conn, rx);
                }
                Err(e) => {
                    error!(error = %e, "Snapshot writer init failed");
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| store_err_with("Failed to spawn snapshot writer", e))?;

        ready_rx
            .recv()
            .map_err(|_| store_err("Snapshot writer died during init"))??;

        Ok(Self {
            db_path,
            tx,
            handle: Some(handle),
        })
    }

    fn init_db(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path)
            .map_err(|e| store_err_with("Failed to open database", e))?;
        Self::init_schema(&conn)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS snapshots (
                session_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                phase TEXT NOT NULL,
                data TEXT NOT NULL,
                committed_at TEXT NOT NULL,
                PRIMARY KEY (session_id, version)
            );
            CREATE INDEX IF NOT EXISTS idx_snapshot_session
                ON snapshots(session_id, version DESC);
            ",
        )
        .map_err(|e| store_err_with("Failed to init schema", e))?;
        Ok(())
    }

    fn process_commands(conn: &Connection, rx: Receiver<WriteCommand>) {
        for cmd in rx {
            match cmd {
                WriteCommand::Persist(snapshot) => {
                    if let Err(e) = Self::insert_snapshot(conn, &snapshot) {
                        error!(
                            session_id = %snapshot.session_id,
                            version = snapshot.version,
                            error = %e,
                            "Failed to persist snapshot"
                        );
                    }
                }
                WriteCommand::Shutdown => {
                    debug!("Snapshot writer received shutdown signal");
                    break;
                }
            }
        }
    }

    fn insert_snapshot(conn: &Connection, snapshot: &SessionSnapshot) -> Result<()> {
        let data = serde_json::to_string(snapshot)?;
        conn.execute(
            "INSERT OR REPLACE INTO snapshots (session_id, version, phase, data, committed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &snapshot.session_id,
                snapshot.version as i64,
                snapshot.phase.as_str(),
                data,
                snapshot.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| store_err_with("Failed to insert snapshot", e))?;
        Ok(())
    }
}

impl SnapshotPersistence for SqliteSnapshots {
    fn persist(&self, snapshot: &SessionSnapshot) {
        let cmd = WriteCommand::Persist(Box::new(snapshot.clone()));
        if self.tx.send(cmd).is_err() {
            warn!(
                session_id = %snapshot.session_id,
                version = snapshot.version,
                "Snapshot writer is gone, dropping write"
            );
        }
    }

    fn load_latest(&self) -> Result<Vec<SessionSnapshot>> {
        let conn = Connection::open(&self.db_path)
            .map_err(|e| store_err_with("Failed to open database", e))?;
        let mut stmt = conn
            .prepare(
                "SELECT data FROM snapshots s
                 WHERE version = (
                     SELECT MAX(version) FROM snapshots WHERE session_id = s.session_id
                 )",
            )
            .map_err(|e| store_err_with("Failed to prepare recovery query", e))?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| store_err_with("Failed to query snapshots", e))?;

        let mut snapshots = Vec::new();
        for row in rows {
            let data = row.map_err(|e| store_err_with("Failed to read snapshot row", e))?;
            snapshots.push(serde_json::from_str(&data)?);
        }
        Ok(snapshots)
    }
}

impl Drop for SqliteSnapshots {
    fn drop(&mut self) {
        let _ = self.tx.send(WriteCommand::Shutdown);
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.join()
        {
            warn!("Snapshot writer thread panicked: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use tempfile::TempDir;

    fn temp_db() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshots.db");
        (dir, path)
    }

    #[test]
    fn test_persist_and_recover_latest() {
        let (_dir, path) = temp_db();

        {
            let persistence = SqliteSnapshots::new(path.clone()).unwrap();
            let mut snapshot = SessionSnapshot::new(SessionId::new("s-1"));
            persistence.persist(&snapshot);

            snapshot.version = 2;
            snapshot.keywords.insert("glaciers".to_string());
            persistence.persist(&snapshot);
            // Drop flushes the queue before the thread exits.
        }

        let persistence = SqliteSnapshots::new(path).unwrap();
        let recovered = persistence.load_latest().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].version, 2);
        assert!(recovered[0].keywords.contains("glaciers"));
    }

    #[test]
    fn test_recovery_is_per_session() {
        let (_dir, path) = temp_db();

        {
            let persistence = SqliteSnapshots::new(path.clone()).unwrap();
            for id in ["a", "b"] {
                let mut snapshot = SessionSnapshot::new(SessionId::new(id));
                persistence.persist(&snapshot);
                snapshot.version = 3;
                persistence.persist(&snapshot);
            }
        }

        let persistence = SqliteSnapshots::new(path).unwrap();
        let mut recovered = persistence.load_latest().unwrap();
        recovered.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        assert_eq!(recovered.len(), 2);
        assert!(recovered.iter().all(|s| s.version == 3));
    }

    #[test]
    fn test_empty_database_recovers_nothing() {
        let (_dir, path) = temp_db();
        let persistence = SqliteSnapshots::new(path).unwrap();
        assert!(persistence.load_latest().unwrap().is_empty());
    }
}
