//! Transient execution payloads for deferred jobs: the callback descriptor
//! and its arguments, stored under the job uid until the job has run.

use chrono::Utc;
use followup_core::types::fmt_ts;
use followup_core::{Db, FollowupError, Result};
use rusqlite::{OptionalExtension, params};
use serde_json::Value;

use crate::callback::CallbackRef;

#[derive(Debug, Clone, PartialEq)]
pub struct JobPayload {
    pub uid: String,
    pub hook_name: String,
    pub callback: CallbackRef,
    pub args: Value,
}

#[derive(Clone)]
pub struct PayloadStore {
    db: Db,
}

impl PayloadStore {
    pub fn new(db: Db) -> Result<Self> {
        db.migrate(
            "CREATE TABLE IF NOT EXISTS job_payloads (
                uid TEXT PRIMARY KEY,
                hook_name TEXT NOT NULL,
                callback TEXT NOT NULL,
                args TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
        )?;
        Ok(Self { db })
    }

    /// Store or replace the payload for `uid`.
    pub fn put(&self, payload: &JobPayload) -> Result<()> {
        let callback = payload.callback.to_json()?;
        self.db
            .lock()?
            .execute(
                "INSERT OR REPLACE INTO job_payloads (uid, hook_name, callback, args, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    payload.uid,
                    payload.hook_name,
                    callback,
                    payload.args.to_string(),
                    fmt_ts(Utc::now()),
                ],
            )
            .map_err(|e| FollowupError::Database(format!("Save payload: {e}")))?;
        Ok(())
    }

    pub fn get(&self, uid: &str) -> Result<Option<JobPayload>> {
        let row: Option<(String, String, String)> = self
            .db
            .lock()?
            .query_row(
                "SELECT hook_name, callback, args FROM job_payloads WHERE uid = ?1",
                [uid],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
            .map_err(|e| FollowupError::Database(format!("Load payload: {e}")))?;

        let Some((hook_name, callback, args)) = row else {
            return Ok(None);
        };
        Ok(Some(JobPayload {
            uid: uid.to_string(),
            hook_name,
            callback: CallbackRef::from_json(&callback)?,
            args: serde_json::from_str(&args)?,
        }))
    }

    pub fn delete(&self, uid: &str) -> Result<bool> {
        let n = self
            .db
            .lock()?
            .execute("DELETE FROM job_payloads WHERE uid = ?1", [uid])
            .map_err(|e| FollowupError::Database(format!("Delete payload: {e}")))?;
        Ok(n > 0)
    }

    /// Uids that have not run yet, oldest first.
    pub fn uids(&self) -> Result<Vec<String>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare("SELECT uid FROM job_payloads ORDER BY created_at, uid")
            .map_err(|e| FollowupError::Database(format!("List payloads: {e}")))?;
        let rows = stmt
            .query_map([], |r| r.get(0))
            .map_err(|e| FollowupError::Database(format!("List payloads: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}
