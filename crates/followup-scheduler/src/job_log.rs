//! Job log: one row per scheduled unit of work, keyed by a unique `uid`.
//!
//! Rows are created when a job is scheduled and updated as it runs. They are
//! never deleted by the lifecycle itself, only by [`JobLogStore::cleanup_older_than`].

use chrono::{DateTime, Duration, Utc};
use followup_core::types::{fmt_ts, parse_opt_ts, parse_ts};
use followup_core::{Db, FollowupError, JobStatus, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS job_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uid TEXT NOT NULL UNIQUE,
    hook_name TEXT NOT NULL,
    args TEXT NOT NULL DEFAULT '[]',
    schedule TEXT,
    next_run TEXT,
    status TEXT NOT NULL DEFAULT 'scheduled',
    attempts INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_log_hook ON job_log(hook_name);
CREATE INDEX IF NOT EXISTS idx_job_log_created ON job_log(created_at);
";

const JOB_LOG_SELECT: &str = "SELECT id, uid, hook_name, args, schedule, next_run, status, \
     attempts, version, created_at, updated_at FROM job_log";

/// A job log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub id: i64,
    pub uid: String,
    pub hook_name: String,
    pub args: Value,
    pub schedule: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub attempts: u32,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload.
#[derive(Debug, Clone)]
pub struct NewJobLog {
    pub uid: String,
    pub hook_name: String,
    pub args: Value,
    pub schedule: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub status: JobStatus,
}

impl NewJobLog {
    pub fn new(uid: impl Into<String>, hook_name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            hook_name: hook_name.into(),
            args: Value::Array(Vec::new()),
            schedule: None,
            next_run: None,
            status: JobStatus::Scheduled,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_schedule(mut self, at: DateTime<Utc>) -> Self {
        self.schedule = Some(at);
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }
}

/// Partial update. `None` leaves the column alone; for the nullable time
/// columns `Some(None)` clears them.
#[derive(Debug, Clone, Default)]
pub struct JobLogPatch {
    pub hook_name: Option<String>,
    pub args: Option<Value>,
    pub schedule: Option<Option<DateTime<Utc>>>,
    pub next_run: Option<Option<DateTime<Utc>>>,
    pub status: Option<JobStatus>,
    pub attempts: Option<u32>,
}

impl JobLogPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// New trigger time plus the status that goes with it.
    pub fn reschedule(at: DateTime<Utc>, status: JobStatus) -> Self {
        Self {
            schedule: Some(Some(at)),
            status: Some(status),
            ..Default::default()
        }
    }

    fn assignments(&self) -> Vec<(&'static str, SqlValue)> {
        let ts = |v: &Option<DateTime<Utc>>| match v {
            Some(t) => SqlValue::Text(fmt_ts(*t)),
            None => SqlValue::Null,
        };

        let mut out = Vec::new();
        if let Some(h) = &self.hook_name {
            out.push(("hook_name", SqlValue::Text(h.clone())));
        }
        if let Some(a) = &self.args {
            out.push(("args", SqlValue::Text(a.to_string())));
        }
        if let Some(s) = &self.schedule {
            out.push(("schedule", ts(s)));
        }
        if let Some(n) = &self.next_run {
            out.push(("next_run", ts(n)));
        }
        if let Some(s) = self.status {
            out.push(("status", SqlValue::Text(s.as_str().to_string())));
        }
        if let Some(a) = self.attempts {
            out.push(("attempts", SqlValue::Integer(a as i64)));
        }
        out
    }
}

/// SQLite-backed job log.
#[derive(Clone)]
pub struct JobLogStore {
    db: Db,
}

impl JobLogStore {
    pub fn new(db: Db) -> Result<Self> {
        db.migrate(SCHEMA)?;
        Ok(Self { db })
    }

    /// Insert a row. Returns `None` when the uid already exists, so two
    /// racing inserts for one uid leave exactly one row.
    pub fn insert(&self, entry: &NewJobLog) -> Result<Option<i64>> {
        let conn = self.db.lock()?;
        let now = fmt_ts(Utc::now());
        let changed = conn
            .execute(
                "INSERT INTO job_log (uid, hook_name, args, schedule, next_run, status, attempts, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 1, ?7, ?7)
                 ON CONFLICT(uid) DO NOTHING",
                params![
                    entry.uid,
                    entry.hook_name,
                    entry.args.to_string(),
                    entry.schedule.map(fmt_ts),
                    entry.next_run.map(fmt_ts),
                    entry.status.as_str(),
                    now,
                ],
            )
            .map_err(|e| FollowupError::Database(format!("Insert job log: {e}")))?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    pub fn get(&self, id: i64) -> Result<Option<JobLogEntry>> {
        self.query_one(&format!("{JOB_LOG_SELECT} WHERE id = ?1"), SqlValue::Integer(id))
    }

    pub fn get_by_uid(&self, uid: &str) -> Result<Option<JobLogEntry>> {
        self.query_one(
            &format!("{JOB_LOG_SELECT} WHERE uid = ?1"),
            SqlValue::Text(uid.to_string()),
        )
    }

    fn query_one(&self, sql: &str, key: SqlValue) -> Result<Option<JobLogEntry>> {
        let conn = self.db.lock()?;
        conn.query_row(sql, [key], row_to_entry)
            .optional()
            .map_err(|e| FollowupError::Database(format!("Load job log: {e}")))
    }

    /// Patch by id. Returns whether a row was touched.
    pub fn update(&self, id: i64, patch: &JobLogPatch) -> Result<bool> {
        self.apply(patch, "id = ?", vec![SqlValue::Integer(id)])
            .map(|n| n > 0)
    }

    pub fn update_by_uid(&self, uid: &str, patch: &JobLogPatch) -> Result<bool> {
        self.apply(patch, "uid = ?", vec![SqlValue::Text(uid.to_string())])
            .map(|n| n > 0)
    }

    pub fn update_status_by_uid(&self, uid: &str, status: JobStatus) -> Result<bool> {
        self.update_by_uid(uid, &JobLogPatch::status(status))
    }

    /// Patch only if the row is still at `expected` version.
    pub fn update_if_version(&self, id: i64, expected: i64, patch: &JobLogPatch) -> Result<()> {
        let n = self.apply(
            patch,
            "id = ? AND version = ?",
            vec![SqlValue::Integer(id), SqlValue::Integer(expected)],
        )?;
        if n > 0 {
            return Ok(());
        }
        match self.get(id)? {
            Some(row) => Err(FollowupError::ConcurrentWrite {
                entity: "job_log",
                id,
                expected,
                actual: row.version,
            }),
            None => Err(FollowupError::NotFound(format!("job log {id}"))),
        }
    }

    /// Atomically bump `attempts`.
    pub fn increment_attempts(&self, id: i64) -> Result<bool> {
        let conn = self.db.lock()?;
        let n = conn
            .execute(
                "UPDATE job_log SET attempts = attempts + 1, version = version + 1, updated_at = ?1
                 WHERE id = ?2",
                params![fmt_ts(Utc::now()), id],
            )
            .map_err(|e| FollowupError::Database(format!("Increment attempts: {e}")))?;
        Ok(n > 0)
    }

    /// Record the end of one execution: final status plus one attempt.
    pub fn finish_by_uid(&self, uid: &str, status: JobStatus) -> Result<bool> {
        let conn = self.db.lock()?;
        let n = conn
            .execute(
                "UPDATE job_log SET status = ?1, attempts = attempts + 1, version = version + 1,
                 updated_at = ?2 WHERE uid = ?3",
                params![status.as_str(), fmt_ts(Utc::now()), uid],
            )
            .map_err(|e| FollowupError::Database(format!("Finish job: {e}")))?;
        Ok(n > 0)
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        self.delete_where("id = ?1", SqlValue::Integer(id))
            .map(|n| n > 0)
    }

    pub fn delete_by_uid(&self, uid: &str) -> Result<bool> {
        self.delete_where("uid = ?1", SqlValue::Text(uid.to_string()))
            .map(|n| n > 0)
    }

    /// Drop every row for a hook. Returns the number removed.
    pub fn delete_by_hook(&self, hook_name: &str) -> Result<usize> {
        self.delete_where("hook_name = ?1", SqlValue::Text(hook_name.to_string()))
    }

    /// Retention sweep on `created_at`.
    pub fn cleanup_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(days as i64);
        let n = self.delete_where("created_at < ?1", SqlValue::Text(fmt_ts(cutoff)))?;
        if n > 0 {
            tracing::info!("🧹 Removed {n} job log rows older than {days} days");
        }
        Ok(n)
    }

    /// Newest rows first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<JobLogEntry>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(&format!("{JOB_LOG_SELECT} ORDER BY id DESC LIMIT ?1"))
            .map_err(|e| FollowupError::Database(format!("List job log: {e}")))?;
        let rows = stmt
            .query_map([limit as i64], row_to_entry)
            .map_err(|e| FollowupError::Database(format!("List job log: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn apply(&self, patch: &JobLogPatch, filter: &str, keys: Vec<SqlValue>) -> Result<usize> {
        let mut sets = Vec::new();
        let mut values = Vec::new();
        for (col, val) in patch.assignments() {
            sets.push(format!("{col} = ?"));
            values.push(val);
        }
        sets.push("updated_at = ?".to_string());
        values.push(SqlValue::Text(fmt_ts(Utc::now())));
        sets.push("version = version + 1".to_string());
        values.extend(keys);

        let sql = format!("UPDATE job_log SET {} WHERE {filter}", sets.join(", "));
        let conn = self.db.lock()?;
        conn.execute(&sql, rusqlite::params_from_iter(values))
            .map_err(|e| FollowupError::Database(format!("Update job log: {e}")))
    }

    fn delete_where(&self, filter: &str, key: SqlValue) -> Result<usize> {
        let conn = self.db.lock()?;
        conn.execute(&format!("DELETE FROM job_log WHERE {filter}"), [key])
            .map_err(|e| FollowupError::Database(format!("Delete job log: {e}")))
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<JobLogEntry> {
    let args: String = row.get(3)?;
    let status: String = row.get(6)?;
    let created: String = row.get(9)?;
    let updated: String = row.get(10)?;
    Ok(JobLogEntry {
        id: row.get(0)?,
        uid: row.get(1)?,
        hook_name: row.get(2)?,
        args: serde_json::from_str(&args).unwrap_or(Value::Null),
        schedule: parse_opt_ts(row.get(4)?),
        next_run: parse_opt_ts(row.get(5)?),
        status: JobStatus::from_db(&status),
        attempts: row.get::<_, i64>(7)? as u32,
        version: row.get(8)?,
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}
