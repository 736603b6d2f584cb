//! Host trigger: "call action `tag` with `payload` at time T".
//!
//! A `(tag, payload)` pair is registered at most once; registering it again
//! moves the fire time. Claiming a due registration leases it: the row stays
//! put with its fire time pushed out by the lease, and only [`HostTrigger::ack`]
//! removes it. A claim that is never acked (action error, crash) fires again
//! once the lease runs out, so consumers must tolerate stale or repeated fires.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use followup_core::types::{fmt_ts, parse_ts};
use followup_core::{Db, FollowupError, Result};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

/// How long a claimed registration stays hidden before it fires again.
pub const CLAIM_LEASE_SECS: i64 = 300;

/// One pending registration. For a claimed one, `run_at` is the lease deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub id: i64,
    pub tag: String,
    pub payload: String,
    pub run_at: DateTime<Utc>,
}

pub trait HostTrigger: Send + Sync {
    /// Register (or move) a single-shot fire.
    fn register(&self, run_at: DateTime<Utc>, tag: &str, payload: &str) -> Result<()>;

    /// Remove a pending fire. Returns whether one existed.
    fn cancel(&self, tag: &str, payload: &str) -> Result<bool>;

    fn next_scheduled(&self, tag: &str, payload: &str) -> Result<Option<DateTime<Utc>>>;

    /// Lease and return up to `limit` registrations due at `now`, oldest first.
    /// Each one is pushed to `now + lease` until acked.
    fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Registration>>;

    /// Drop a claimed registration. A no-op when it was re-registered,
    /// canceled or re-claimed since the claim.
    fn ack(&self, claimed: &Registration) -> Result<()>;

    /// Everything still pending, soonest first.
    fn pending(&self) -> Result<Vec<Registration>>;
}

/// Registrations in the `trigger_queue` table. Survives restarts and can be
/// shared by several processes on one database file.
#[derive(Clone)]
pub struct SqliteTrigger {
    db: Db,
}

impl SqliteTrigger {
    pub fn new(db: Db) -> Result<Self> {
        db.migrate(
            "CREATE TABLE IF NOT EXISTS trigger_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tag TEXT NOT NULL,
                payload TEXT NOT NULL,
                run_at TEXT NOT NULL,
                leased_until TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(tag, payload)
            );
            CREATE INDEX IF NOT EXISTS idx_trigger_run_at ON trigger_queue(run_at);",
        )?;
        Ok(Self { db })
    }
}

fn row_to_registration(row: &rusqlite::Row) -> rusqlite::Result<Registration> {
    let run_at: String = row.get(3)?;
    Ok(Registration {
        id: row.get(0)?,
        tag: row.get(1)?,
        payload: row.get(2)?,
        run_at: parse_ts(&run_at),
    })
}

impl HostTrigger for SqliteTrigger {
    fn register(&self, run_at: DateTime<Utc>, tag: &str, payload: &str) -> Result<()> {
        self.db
            .lock()?
            .execute(
                "INSERT INTO trigger_queue (tag, payload, run_at, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(tag, payload) DO UPDATE SET run_at = excluded.run_at, leased_until = NULL",
                params![tag, payload, fmt_ts(run_at), fmt_ts(Utc::now())],
            )
            .map_err(|e| FollowupError::Database(format!("Register trigger: {e}")))?;
        tracing::debug!("⏱️ Trigger {tag}({payload}) at {}", fmt_ts(run_at));
        Ok(())
    }

    fn cancel(&self, tag: &str, payload: &str) -> Result<bool> {
        let n = self
            .db
            .lock()?
            .execute(
                "DELETE FROM trigger_queue WHERE tag = ?1 AND payload = ?2",
                params![tag, payload],
            )
            .map_err(|e| FollowupError::Database(format!("Cancel trigger: {e}")))?;
        Ok(n > 0)
    }

    fn next_scheduled(&self, tag: &str, payload: &str) -> Result<Option<DateTime<Utc>>> {
        let run_at: Option<String> = self
            .db
            .lock()?
            .query_row(
                "SELECT run_at FROM trigger_queue WHERE tag = ?1 AND payload = ?2",
                params![tag, payload],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| FollowupError::Database(format!("Load trigger: {e}")))?;
        Ok(run_at.map(|s| parse_ts(&s)))
    }

    fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Registration>> {
        let until = now + lease;
        let mut conn = self.db.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| FollowupError::Database(format!("Claim triggers: {e}")))?;

        let due: Vec<Registration> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, tag, payload, run_at FROM trigger_queue
                     WHERE run_at <= ?1 ORDER BY run_at, id LIMIT ?2",
                )
                .map_err(|e| FollowupError::Database(format!("Claim triggers: {e}")))?;
            let rows = stmt
                .query_map(params![fmt_ts(now), limit as i64], row_to_registration)
                .map_err(|e| FollowupError::Database(format!("Claim triggers: {e}")))?;
            rows.filter_map(|r| r.ok()).collect()
        };

        let mut claimed = Vec::with_capacity(due.len());
        for mut reg in due {
            let n = tx
                .execute(
                    "UPDATE trigger_queue SET run_at = ?1, leased_until = ?1 WHERE id = ?2",
                    params![fmt_ts(until), reg.id],
                )
                .map_err(|e| FollowupError::Database(format!("Claim triggers: {e}")))?;
            if n > 0 {
                reg.run_at = until;
                claimed.push(reg);
            }
        }
        tx.commit()
            .map_err(|e| FollowupError::Database(format!("Claim triggers: {e}")))?;
        Ok(claimed)
    }

    fn ack(&self, claimed: &Registration) -> Result<()> {
        self.db
            .lock()?
            .execute(
                "DELETE FROM trigger_queue WHERE id = ?1 AND leased_until = ?2",
                params![claimed.id, fmt_ts(claimed.run_at)],
            )
            .map_err(|e| FollowupError::Database(format!("Ack trigger: {e}")))?;
        Ok(())
    }

    fn pending(&self) -> Result<Vec<Registration>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, tag, payload, run_at FROM trigger_queue ORDER BY run_at, id")
            .map_err(|e| FollowupError::Database(format!("List triggers: {e}")))?;
        let rows = stmt
            .query_map([], row_to_registration)
            .map_err(|e| FollowupError::Database(format!("List triggers: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

/// In-process trigger table, for tests and embedding.
#[derive(Default)]
pub struct MemoryTrigger {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    regs: Vec<Registration>,
    leased: HashSet<i64>,
}

impl MemoryTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending registrations with `tag`.
    pub fn count(&self, tag: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.regs.iter().filter(|r| r.tag == tag).count()
    }
}

impl HostTrigger for MemoryTrigger {
    fn register(&self, run_at: DateTime<Utc>, tag: &str, payload: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(reg) = inner
            .regs
            .iter_mut()
            .find(|r| r.tag == tag && r.payload == payload)
        {
            reg.run_at = run_at;
            let id = reg.id;
            inner.leased.remove(&id);
            return Ok(());
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.regs.push(Registration {
            id,
            tag: tag.to_string(),
            payload: payload.to_string(),
            run_at,
        });
        Ok(())
    }

    fn cancel(&self, tag: &str, payload: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pos) = inner
            .regs
            .iter()
            .position(|r| r.tag == tag && r.payload == payload)
        else {
            return Ok(false);
        };
        let reg = inner.regs.remove(pos);
        inner.leased.remove(&reg.id);
        Ok(true)
    }

    fn next_scheduled(&self, tag: &str, payload: &str) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .regs
            .iter()
            .find(|r| r.tag == tag && r.payload == payload)
            .map(|r| r.run_at))
    }

    fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Registration>> {
        let until = now + lease;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut due: Vec<(DateTime<Utc>, i64)> = inner
            .regs
            .iter()
            .filter(|r| r.run_at <= now)
            .map(|r| (r.run_at, r.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(reg) = inner.regs.iter_mut().find(|r| r.id == id) {
                reg.run_at = until;
                claimed.push(reg.clone());
            }
            inner.leased.insert(id);
        }
        Ok(claimed)
    }

    fn ack(&self, claimed: &Registration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let current = inner
            .regs
            .iter()
            .any(|r| r.id == claimed.id && r.run_at == claimed.run_at);
        if current && inner.leased.remove(&claimed.id) {
            inner.regs.retain(|r| r.id != claimed.id);
        }
        Ok(())
    }

    fn pending(&self) -> Result<Vec<Registration>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut regs = inner.regs.clone();
        regs.sort_by_key(|r| (r.run_at, r.id));
        Ok(regs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease() -> Duration {
        Duration::seconds(CLAIM_LEASE_SECS)
    }

    fn exercise(trigger: &dyn HostTrigger) {
        let now = Utc::now();
        trigger.register(now - Duration::seconds(5), "send", "1").unwrap();
        trigger.register(now + Duration::hours(1), "send", "2").unwrap();
        // re-registering moves the existing fire
        trigger.register(now - Duration::seconds(10), "send", "2").unwrap();
        assert_eq!(trigger.pending().unwrap().len(), 2);
        assert_eq!(
            trigger.next_scheduled("send", "2").unwrap().map(fmt_ts),
            Some(fmt_ts(now - Duration::seconds(10)))
        );

        trigger.register(now + Duration::hours(2), "daily", "").unwrap();
        assert!(trigger.cancel("daily", "").unwrap());
        assert!(!trigger.cancel("daily", "").unwrap());

        let claimed = trigger.claim_due(now, 10, lease()).unwrap();
        let payloads: Vec<_> = claimed.iter().map(|r| r.payload.as_str()).collect();
        assert_eq!(payloads, vec!["2", "1"]);
        // leased, not gone
        assert!(trigger.claim_due(now, 10, lease()).unwrap().is_empty());
        assert_eq!(
            trigger.next_scheduled("send", "1").unwrap().map(fmt_ts),
            Some(fmt_ts(now + lease()))
        );

        trigger.ack(&claimed[1]).unwrap();
        assert!(trigger.next_scheduled("send", "1").unwrap().is_none());

        // never acked: fires again once the lease runs out
        let again = trigger
            .claim_due(now + lease() + Duration::seconds(1), 10, lease())
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].payload, "2");
        // the stale claim no longer owns the row
        trigger.ack(&claimed[0]).unwrap();
        assert!(trigger.next_scheduled("send", "2").unwrap().is_some());
        trigger.ack(&again[0]).unwrap();
        assert!(trigger.pending().unwrap().is_empty());
    }

    fn reregistered_during_action(trigger: &dyn HostTrigger) {
        let now = Utc::now();
        trigger.register(now - Duration::seconds(1), "retry", "9").unwrap();
        let claimed = trigger.claim_due(now, 10, lease()).unwrap();
        assert_eq!(claimed.len(), 1);

        let later = now + Duration::hours(3);
        trigger.register(later, "retry", "9").unwrap();
        trigger.ack(&claimed[0]).unwrap();
        assert_eq!(
            trigger.next_scheduled("retry", "9").unwrap().map(fmt_ts),
            Some(fmt_ts(later))
        );
    }

    #[test]
    fn test_sqlite_trigger_semantics() {
        let trigger = SqliteTrigger::new(Db::open_in_memory().unwrap()).unwrap();
        exercise(&trigger);
        reregistered_during_action(&trigger);
    }

    #[test]
    fn test_memory_trigger_semantics() {
        let trigger = MemoryTrigger::new();
        exercise(&trigger);
        reregistered_during_action(&trigger);
    }

    #[test]
    fn test_claim_respects_limit() {
        let trigger = SqliteTrigger::new(Db::open_in_memory().unwrap()).unwrap();
        let past = Utc::now() - Duration::minutes(1);
        for i in 0..5 {
            trigger.register(past, "send", &i.to_string()).unwrap();
        }
        let now = Utc::now();
        assert_eq!(trigger.claim_due(now, 3, lease()).unwrap().len(), 3);
        assert_eq!(trigger.claim_due(now, 10, lease()).unwrap().len(), 2);
        assert_eq!(trigger.pending().unwrap().len(), 5);
    }

    #[test]
    fn test_unacked_claim_survives_reopen() {
        let dir = std::env::temp_dir().join(format!(
            "followup-trigger-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let path = dir.join("trigger.db");
        let now = Utc::now();
        {
            let trigger = SqliteTrigger::new(Db::open(&path).unwrap()).unwrap();
            trigger.register(now - Duration::seconds(1), "send", "4").unwrap();
            assert_eq!(trigger.claim_due(now, 10, lease()).unwrap().len(), 1);
        }

        let trigger = SqliteTrigger::new(Db::open(&path).unwrap()).unwrap();
        assert!(trigger.claim_due(now, 10, lease()).unwrap().is_empty());
        let refired = trigger
            .claim_due(now + lease() + Duration::seconds(1), 10, lease())
            .unwrap();
        assert_eq!(refired.len(), 1);
        assert_eq!(refired[0].payload, "4");
        drop(trigger);
        std::fs::remove_dir_all(&dir).ok();
    }
}
