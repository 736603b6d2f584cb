//! Email queue table: one row per scheduled email.

use chrono::{DateTime, Duration, Utc};
use followup_core::types::{fmt_ts, parse_opt_ts, parse_ts};
use followup_core::{Context, Db, FollowupError, JobStatus, Result};
use followup_scheduler::CallbackRef;
use rusqlite::types::Value as SqlValue;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS email_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email_id TEXT NOT NULL UNIQUE,
    sequence_id TEXT,
    to_email TEXT NOT NULL,
    subject TEXT NOT NULL,
    message TEXT NOT NULL,
    args TEXT NOT NULL DEFAULT '{}',
    validation_callback TEXT,
    status TEXT NOT NULL DEFAULT 'scheduled',
    retry_count INTEGER NOT NULL DEFAULT 0,
    daily_retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    scheduled_time TEXT NOT NULL,
    last_attempt_time TEXT,
    last_error_message TEXT,
    notes TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_email_queue_status ON email_queue(status);
CREATE INDEX IF NOT EXISTS idx_email_queue_sequence ON email_queue(sequence_id);
CREATE INDEX IF NOT EXISTS idx_email_queue_scheduled ON email_queue(scheduled_time);
";

const QUEUE_SELECT: &str = "SELECT id, email_id, sequence_id, to_email, subject, message, args, \
     validation_callback, status, retry_count, daily_retry_count, max_retries, scheduled_time, \
     last_attempt_time, last_error_message, notes, version, created_at, updated_at FROM email_queue";

/// A queued email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEmail {
    pub id: i64,
    /// Stable public identifier (UUID v4).
    pub email_id: String,
    pub sequence_id: Option<String>,
    pub to_email: String,
    pub subject: String,
    pub message: String,
    pub args: Context,
    pub validation: Option<CallbackRef>,
    /// Set when the stored validation descriptor could not be decoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
    pub status: JobStatus,
    pub retry_count: u32,
    pub daily_retry_count: u32,
    pub max_retries: u32,
    pub scheduled_time: DateTime<Utc>,
    pub last_attempt_time: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub notes: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedEmail {
    /// Whether a validation predicate gates this email, decodable or not.
    pub fn has_validation(&self) -> bool {
        self.validation.is_some() || self.validation_error.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewQueuedEmail {
    pub sequence_id: Option<String>,
    pub to_email: String,
    pub subject: String,
    pub message: String,
    pub args: Context,
    pub validation: Option<CallbackRef>,
    pub max_retries: u32,
    pub scheduled_time: DateTime<Utc>,
    pub notes: Option<String>,
}

/// Partial update; `None` leaves a column alone.
#[derive(Debug, Clone, Default)]
pub struct QueuePatch {
    pub status: Option<JobStatus>,
    pub retry_count: Option<u32>,
    pub daily_retry_count: Option<u32>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub last_attempt_time: Option<DateTime<Utc>>,
    pub last_error_message: Option<Option<String>>,
}

impl QueuePatch {
    fn assignments(&self) -> Vec<(&'static str, SqlValue)> {
        let mut out = Vec::new();
        if let Some(s) = self.status {
            out.push(("status", SqlValue::Text(s.as_str().to_string())));
        }
        if let Some(n) = self.retry_count {
            out.push(("retry_count", SqlValue::Integer(n as i64)));
        }
        if let Some(n) = self.daily_retry_count {
            out.push(("daily_retry_count", SqlValue::Integer(n as i64)));
        }
        if let Some(t) = self.scheduled_time {
            out.push(("scheduled_time", SqlValue::Text(fmt_ts(t))));
        }
        if let Some(t) = self.last_attempt_time {
            out.push(("last_attempt_time", SqlValue::Text(fmt_ts(t))));
        }
        if let Some(msg) = &self.last_error_message {
            out.push((
                "last_error_message",
                msg.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null),
            ));
        }
        out
    }
}

/// Row counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub scheduled: i64,
    pub retrying: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub canceled: i64,
    pub total: i64,
}

#[derive(Clone)]
pub struct QueueStore {
    db: Db,
}

impl QueueStore {
    pub fn new(db: Db) -> Result<Self> {
        db.migrate(SCHEMA)?;
        Ok(Self { db })
    }

    pub fn insert(&self, email: &NewQueuedEmail) -> Result<i64> {
        let validation = email
            .validation
            .as_ref()
            .map(CallbackRef::to_json)
            .transpose()?;
        let args = serde_json::to_string(&email.args)?;
        let now = fmt_ts(Utc::now());

        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO email_queue (email_id, sequence_id, to_email, subject, message, args,
                validation_callback, status, max_retries, scheduled_time, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'scheduled', ?8, ?9, ?10, ?11, ?11)",
            params![
                uuid::Uuid::new_v4().to_string(),
                email.sequence_id,
                email.to_email,
                email.subject,
                email.message,
                args,
                validation,
                email.max_retries,
                fmt_ts(email.scheduled_time),
                email.notes,
                now,
            ],
        )
        .map_err(|e| FollowupError::Database(format!("Insert email: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<Option<QueuedEmail>> {
        let conn = self.db.lock()?;
        conn.query_row(&format!("{QUEUE_SELECT} WHERE id = ?1"), [id], row_to_email)
            .optional()
            .map_err(|e| FollowupError::Database(format!("Load email: {e}")))
    }

    pub fn get_by_email_id(&self, email_id: &str) -> Result<Option<QueuedEmail>> {
        let conn = self.db.lock()?;
        conn.query_row(
            &format!("{QUEUE_SELECT} WHERE email_id = ?1"),
            [email_id],
            row_to_email,
        )
        .optional()
        .map_err(|e| FollowupError::Database(format!("Load email: {e}")))
    }

    /// Unconditional patch. Returns whether the row exists.
    pub fn update(&self, id: i64, patch: &QueuePatch) -> Result<bool> {
        self.apply(patch, "id = ?", vec![SqlValue::Integer(id)])
            .map(|n| n > 0)
    }

    /// Patch only if nobody wrote the row since it was loaded at `expected`.
    pub fn update_if_version(&self, id: i64, expected: i64, patch: &QueuePatch) -> Result<()> {
        let n = self.apply(
            patch,
            "id = ? AND version = ?",
            vec![SqlValue::Integer(id), SqlValue::Integer(expected)],
        )?;
        if n > 0 {
            return Ok(());
        }
        let actual: Option<i64> = self
            .db
            .lock()?
            .query_row("SELECT version FROM email_queue WHERE id = ?1", [id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(|e| FollowupError::Database(format!("Load email version: {e}")))?;
        match actual {
            Some(actual) => Err(FollowupError::ConcurrentWrite {
                entity: "email_queue",
                id,
                expected,
                actual,
            }),
            None => Err(FollowupError::NotFound(format!("email {id}"))),
        }
    }

    /// Flip a scheduled/retrying row to canceled. Terminal rows are left alone.
    pub fn cancel_if_pending(&self, id: i64) -> Result<bool> {
        let n = self
            .db
            .lock()?
            .execute(
                "UPDATE email_queue SET status = 'canceled', version = version + 1, updated_at = ?1
                 WHERE id = ?2 AND status IN ('scheduled', 'retrying')",
                params![fmt_ts(Utc::now()), id],
            )
            .map_err(|e| FollowupError::Database(format!("Cancel email: {e}")))?;
        Ok(n > 0)
    }

    pub fn ids_by_sequence(&self, sequence_id: &str) -> Result<Vec<i64>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare("SELECT id FROM email_queue WHERE sequence_id = ?1 ORDER BY id")
            .map_err(|e| FollowupError::Database(format!("List sequence: {e}")))?;
        let rows = stmt
            .query_map([sequence_id], |r| r.get(0))
            .map_err(|e| FollowupError::Database(format!("List sequence: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Sequence members in send order.
    pub fn by_sequence(&self, sequence_id: &str) -> Result<Vec<QueuedEmail>> {
        self.list(
            &format!("{QUEUE_SELECT} WHERE sequence_id = ?1 ORDER BY scheduled_time, id"),
            vec![SqlValue::Text(sequence_id.to_string())],
        )
    }

    /// Rows still waiting to be sent, soonest first.
    pub fn pending(&self) -> Result<Vec<QueuedEmail>> {
        self.list(
            &format!(
                "{QUEUE_SELECT} WHERE status IN ('scheduled', 'retrying') ORDER BY scheduled_time, id"
            ),
            Vec::new(),
        )
    }

    /// Failed rows whose last attempt is at or after `cutoff`, newest first.
    pub fn failed_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<QueuedEmail>> {
        self.list(
            &format!(
                "{QUEUE_SELECT} WHERE status = 'failed' AND last_attempt_time >= ?1
                 ORDER BY last_attempt_time DESC"
            ),
            vec![SqlValue::Text(fmt_ts(cutoff))],
        )
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM email_queue GROUP BY status")
            .map_err(|e| FollowupError::Database(format!("Queue stats: {e}")))?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
            .map_err(|e| FollowupError::Database(format!("Queue stats: {e}")))?;

        let mut stats = QueueStats::default();
        for (status, count) in rows.filter_map(|r| r.ok()) {
            let slot = match JobStatus::from_db(&status) {
                JobStatus::Scheduled => &mut stats.scheduled,
                JobStatus::Retrying => &mut stats.retrying,
                JobStatus::Completed => &mut stats.completed,
                JobStatus::Failed => &mut stats.failed,
                JobStatus::Skipped => &mut stats.skipped,
                JobStatus::Canceled => &mut stats.canceled,
            };
            *slot += count;
            stats.total += count;
        }
        Ok(stats)
    }

    /// Delete finished rows (completed, canceled, skipped) untouched for `days`.
    pub fn cleanup_old(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(days as i64);
        self.db
            .lock()?
            .execute(
                "DELETE FROM email_queue
                 WHERE status IN ('completed', 'canceled', 'skipped') AND updated_at < ?1",
                [fmt_ts(cutoff)],
            )
            .map_err(|e| FollowupError::Database(format!("Cleanup emails: {e}")))
    }

    fn list(&self, sql: &str, values: Vec<SqlValue>) -> Result<Vec<QueuedEmail>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| FollowupError::Database(format!("List emails: {e}")))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), row_to_email)
            .map_err(|e| FollowupError::Database(format!("List emails: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn apply(&self, patch: &QueuePatch, filter: &str, keys: Vec<SqlValue>) -> Result<usize> {
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

        let sql = format!("UPDATE email_queue SET {} WHERE {filter}", sets.join(", "));
        let conn = self.db.lock()?;
        conn.execute(&sql, rusqlite::params_from_iter(values))
            .map_err(|e| FollowupError::Database(format!("Update email: {e}")))
    }
}

fn row_to_email(row: &rusqlite::Row) -> rusqlite::Result<QueuedEmail> {
    let args: String = row.get(6)?;
    let validation: Option<String> = row.get(7)?;
    let status: String = row.get(8)?;
    let scheduled: String = row.get(12)?;
    let created: String = row.get(17)?;
    let updated: String = row.get(18)?;
    let (validation, validation_error) = match validation.as_deref().map(CallbackRef::from_json) {
        None => (None, None),
        Some(Ok(desc)) => (Some(desc), None),
        Some(Err(e)) => (None, Some(e.to_string())),
    };
    Ok(QueuedEmail {
        id: row.get(0)?,
        email_id: row.get(1)?,
        sequence_id: row.get(2)?,
        to_email: row.get(3)?,
        subject: row.get(4)?,
        message: row.get(5)?,
        args: serde_json::from_str(&args).unwrap_or_default(),
        validation,
        validation_error,
        status: JobStatus::from_db(&status),
        retry_count: row.get::<_, i64>(9)? as u32,
        daily_retry_count: row.get::<_, i64>(10)? as u32,
        max_retries: row.get::<_, i64>(11)? as u32,
        scheduled_time: parse_ts(&scheduled),
        last_attempt_time: parse_opt_ts(row.get(13)?),
        last_error_message: row.get(14)?,
        notes: row.get(15)?,
        version: row.get(16)?,
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> QueueStore {
        QueueStore::new(Db::open_in_memory().unwrap()).unwrap()
    }

    fn new_email(seq: Option<&str>, at: DateTime<Utc>) -> NewQueuedEmail {
        let mut args = Context::new();
        args.insert("order_id".into(), json!(7));
        NewQueuedEmail {
            sequence_id: seq.map(str::to_string),
            to_email: "buyer@example.com".into(),
            subject: "Review your order".into(),
            message: "Hi {customer_name}".into(),
            args,
            validation: Some(CallbackRef::Function {
                name: "still_subscribed".into(),
            }),
            max_retries: 3,
            scheduled_time: at,
            notes: None,
        }
    }

    #[test]
    fn test_insert_and_load() {
        let store = store();
        let at = Utc::now() + Duration::days(3);
        let id = store.insert(&new_email(Some("seq_a"), at)).unwrap();

        let row = store.get(id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Scheduled);
        assert_eq!(row.args["order_id"], 7);
        assert_eq!(row.email_id.len(), 36);
        assert!(row.validation.is_some());
        assert_eq!(fmt_ts(row.scheduled_time), fmt_ts(at));
        assert_eq!(row.version, 1);
        assert_eq!(store.get_by_email_id(&row.email_id).unwrap().unwrap().id, id);
    }

    #[test]
    fn test_undecodable_validation_is_kept() {
        let db = Db::open_in_memory().unwrap();
        let store = QueueStore::new(db.clone()).unwrap();
        let id = store.insert(&new_email(None, Utc::now())).unwrap();
        db.lock()
            .unwrap()
            .execute(
                "UPDATE email_queue SET validation_callback = ?1 WHERE id = ?2",
                rusqlite::params![r#"{"type":"function","fn":"x"}"#, id],
            )
            .unwrap();

        let row = store.get(id).unwrap().unwrap();
        assert!(row.validation.is_none());
        assert!(row.validation_error.is_some());
        assert!(row.has_validation());
    }

    #[test]
    fn test_versioned_update() {
        let store = store();
        let id = store.insert(&new_email(None, Utc::now())).unwrap();
        let patch = QueuePatch {
            status: Some(JobStatus::Retrying),
            retry_count: Some(1),
            last_error_message: Some(Some("timeout".into())),
            ..Default::default()
        };
        store.update_if_version(id, 1, &patch).unwrap();
        let err = store.update_if_version(id, 1, &patch).unwrap_err();
        assert!(err.is_conflict());

        let row = store.get(id).unwrap().unwrap();
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.last_error_message.as_deref(), Some("timeout"));

        store
            .update(
                id,
                &QueuePatch {
                    last_error_message: Some(None),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(store.get(id).unwrap().unwrap().last_error_message, None);
    }

    #[test]
    fn test_cancel_only_touches_pending_rows() {
        let store = store();
        let id = store.insert(&new_email(None, Utc::now())).unwrap();
        assert!(store.cancel_if_pending(id).unwrap());
        assert!(!store.cancel_if_pending(id).unwrap());

        let done = store.insert(&new_email(None, Utc::now())).unwrap();
        store
            .update(done, &QueuePatch {
                status: Some(JobStatus::Completed),
                ..Default::default()
            })
            .unwrap();
        assert!(!store.cancel_if_pending(done).unwrap());
        assert_eq!(store.get(done).unwrap().unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_sequence_pending_and_stats() {
        let store = store();
        let now = Utc::now();
        let late = store.insert(&new_email(Some("seq_x"), now + Duration::days(5))).unwrap();
        let early = store.insert(&new_email(Some("seq_x"), now + Duration::days(1))).unwrap();
        store.insert(&new_email(None, now)).unwrap();
        store.cancel_if_pending(late).unwrap();

        let seq: Vec<i64> = store.by_sequence("seq_x").unwrap().iter().map(|e| e.id).collect();
        assert_eq!(seq, vec![early, late]);
        assert_eq!(store.ids_by_sequence("seq_x").unwrap(), vec![late, early]);
        assert_eq!(store.pending().unwrap().len(), 2);

        let stats = store.stats().unwrap();
        assert_eq!(stats.scheduled, 2);
        assert_eq!(stats.canceled, 1);
        assert_eq!(stats.total, 3);
    }

    #[test]
    fn test_failed_since_and_cleanup() {
        let store = store();
        let now = Utc::now();
        let recent = store.insert(&new_email(None, now)).unwrap();
        let stale = store.insert(&new_email(None, now)).unwrap();
        for (id, at) in [(recent, now - Duration::days(2)), (stale, now - Duration::days(20))] {
            store
                .update(id, &QueuePatch {
                    status: Some(JobStatus::Failed),
                    last_attempt_time: Some(at),
                    ..Default::default()
                })
                .unwrap();
        }
        let failed: Vec<i64> = store
            .failed_since(now - Duration::days(15))
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(failed, vec![recent]);

        let skipped = store.insert(&new_email(None, now)).unwrap();
        store
            .update(skipped, &QueuePatch {
                status: Some(JobStatus::Skipped),
                ..Default::default()
            })
            .unwrap();
        store
            .db
            .lock()
            .unwrap()
            .execute(
                "UPDATE email_queue SET updated_at = ?1",
                [fmt_ts(now - Duration::days(40))],
            )
            .unwrap();
        // failed rows are never cleaned up
        assert_eq!(store.cleanup_old(30).unwrap(), 1);
        assert!(store.get(skipped).unwrap().is_none());
        assert!(store.get(stale).unwrap().is_some());
    }
}
