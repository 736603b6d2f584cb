//! Append-only send log: one row per delivery attempt.

use chrono::{DateTime, Utc};
use followup_core::types::{fmt_ts, parse_ts};
use followup_core::{Db, FollowupError, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};

/// What happened to one attempt. Stored as 1 / 0 / -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    Sent,
    Failed,
    Skipped,
}

impl SendOutcome {
    pub fn as_i64(&self) -> i64 {
        match self {
            SendOutcome::Sent => 1,
            SendOutcome::Failed => 0,
            SendOutcome::Skipped => -1,
        }
    }

    pub fn from_db(v: i64) -> Self {
        match v {
            1 => SendOutcome::Sent,
            -1 => SendOutcome::Skipped,
            _ => SendOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailLogEntry {
    pub id: i64,
    /// Queue row id; `None` for immediate sends.
    pub email_id: Option<i64>,
    pub to_email: String,
    pub subject: String,
    pub sent: SendOutcome,
    pub skip_reason: Option<String>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EmailLogStore {
    db: Db,
}

impl EmailLogStore {
    pub fn new(db: Db) -> Result<Self> {
        db.migrate(
            "CREATE TABLE IF NOT EXISTS email_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email_id INTEGER,
                to_email TEXT NOT NULL,
                subject TEXT NOT NULL,
                sent INTEGER NOT NULL,
                skip_reason TEXT,
                sent_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_email_log_email ON email_log(email_id);",
        )?;
        Ok(Self { db })
    }

    pub fn record(
        &self,
        email_id: Option<i64>,
        to_email: &str,
        subject: &str,
        sent: SendOutcome,
        skip_reason: Option<&str>,
    ) -> Result<i64> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO email_log (email_id, to_email, subject, sent, skip_reason, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                email_id,
                to_email,
                subject,
                sent.as_i64(),
                skip_reason,
                fmt_ts(Utc::now())
            ],
        )
        .map_err(|e| FollowupError::Database(format!("Insert email log: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<EmailLogEntry>> {
        self.query(
            "SELECT id, email_id, to_email, subject, sent, skip_reason, sent_at
             FROM email_log ORDER BY id DESC LIMIT ?1",
            limit as i64,
        )
    }

    /// Every attempt for one queue row, oldest first.
    pub fn for_email(&self, email_id: i64) -> Result<Vec<EmailLogEntry>> {
        self.query(
            "SELECT id, email_id, to_email, subject, sent, skip_reason, sent_at
             FROM email_log WHERE email_id = ?1 ORDER BY id",
            email_id,
        )
    }

    fn query(&self, sql: &str, key: i64) -> Result<Vec<EmailLogEntry>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| FollowupError::Database(format!("List email log: {e}")))?;
        let rows = stmt
            .query_map([key], row_to_entry)
            .map_err(|e| FollowupError::Database(format!("List email log: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<EmailLogEntry> {
    let sent_at: String = row.get(6)?;
    Ok(EmailLogEntry {
        id: row.get(0)?,
        email_id: row.get(1)?,
        to_email: row.get(2)?,
        subject: row.get(3)?,
        sent: SendOutcome::from_db(row.get(4)?),
        skip_reason: row.get(5)?,
        sent_at: parse_ts(&sent_at),
    })
}
