//! Shared SQLite handle. Every store (job log, email queue, triggers,
//! settings) owns a clone and creates its own tables on construction.

use crate::error::{FollowupError, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Cloneable handle to one SQLite connection.
///
/// Guards are never held across an `.await`: every store method locks,
/// runs a single statement (or a short read-then-write) and returns.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| FollowupError::Database(format!("DB open error: {e}")))?;

        // WAL lets the runner and CLI commands share the file without "database is locked"
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| FollowupError::Database(format!("DB pragma error: {e}")))?;

        tracing::debug!("🗄️ Database opened: {}", path.display());
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| FollowupError::Database(format!("DB open error: {e}")))?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Lock the connection.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FollowupError::Database(format!("DB lock poisoned: {e}")))
    }

    /// Run a schema batch (idempotent `CREATE ... IF NOT EXISTS`).
    pub fn migrate(&self, schema: &str) -> Result<()> {
        self.lock()?
            .execute_batch(schema)
            .map_err(|e| FollowupError::Database(format!("Migration: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_migrate() {
        let dir = std::env::temp_dir().join(format!(
            "followup-db-test-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let db = Db::open(&dir.join("test.db")).unwrap();
        db.migrate("CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY);")
            .unwrap();
        // second run is a no-op
        db.migrate("CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY);")
            .unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_clones_share_connection() {
        let db = Db::open_in_memory().unwrap();
        db.migrate("CREATE TABLE t (v TEXT);").unwrap();
        let other = db.clone();
        other
            .lock()
            .unwrap()
            .execute("INSERT INTO t (v) VALUES ('x')", [])
            .unwrap();
        let count: i64 = db
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
