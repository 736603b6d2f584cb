//! Key-value settings store: runtime knobs an operator can change without
//! editing the config file (retry ceiling, backoff base, sender identity).

use crate::db::Db;
use crate::error::{FollowupError, Result};
use crate::types::fmt_ts;
use chrono::Utc;
use rusqlite::OptionalExtension;
use std::collections::HashMap;
use std::sync::RwLock;

pub const MAX_RETRIES: &str = "max_retries";
pub const RETRY_DELAY_BASE_MINUTES: &str = "retry_delay_base_minutes";
pub const DAILY_RETRY_THRESHOLD_DAYS: &str = "daily_retry_threshold_days";
pub const FROM_NAME: &str = "from_name";
pub const FROM_EMAIL: &str = "from_email";
pub const DAILY_RETRY_ENABLED: &str = "daily_retry_enabled";

/// String-valued settings with typed helpers.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Non-blank string value.
    fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }

    /// Parse as an unsigned integer; unparsable values are ignored.
    fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    fn get_bool(&self, key: &str) -> bool {
        matches!(
            self.get(key).as_deref().map(str::trim),
            Some("1") | Some("true") | Some("yes")
        )
    }
}

/// SQLite-backed settings table.
pub struct SqliteSettings {
    db: Db,
}

impl SqliteSettings {
    pub fn new(db: Db) -> Result<Self> {
        db.migrate(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self { db })
    }

    /// All settings, sorted by key.
    pub fn all(&self) -> Result<Vec<(String, String)>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare("SELECT key, value FROM settings ORDER BY key")
            .map_err(|e| FollowupError::Database(format!("List settings: {e}")))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| FollowupError::Database(format!("List settings: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

impl SettingsStore for SqliteSettings {
    fn get(&self, key: &str) -> Option<String> {
        let conn = self.db.lock().ok()?;
        conn.query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| {
            r.get(0)
        })
        .optional()
        .unwrap_or_else(|e| {
            tracing::warn!("⚠️ Failed to read setting '{key}': {e}");
            None
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .lock()?
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                rusqlite::params![key, value, fmt_ts(Utc::now())],
            )
            .map_err(|e| FollowupError::Database(format!("Save setting: {e}")))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.db
            .lock()?
            .execute("DELETE FROM settings WHERE key = ?1", [key])
            .map_err(|e| FollowupError::Database(format!("Delete setting: {e}")))?;
        Ok(())
    }
}

/// In-process settings, for tests and embedding without a database.
#[derive(Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_settings_upsert() {
        let settings = SqliteSettings::new(Db::open_in_memory().unwrap()).unwrap();
        assert_eq!(settings.get(MAX_RETRIES), None);

        settings.set(MAX_RETRIES, "3").unwrap();
        settings.set(MAX_RETRIES, "5").unwrap();
        assert_eq!(settings.get_u32(MAX_RETRIES), Some(5));
        assert_eq!(settings.all().unwrap().len(), 1);

        settings.remove(MAX_RETRIES).unwrap();
        assert_eq!(settings.get(MAX_RETRIES), None);
    }

    #[test]
    fn test_typed_helpers() {
        let settings = MemorySettings::new();
        settings.set(FROM_NAME, "   ").unwrap();
        settings.set(RETRY_DELAY_BASE_MINUTES, "five").unwrap();
        settings.set("unsubscribed:a@b.c", "1").unwrap();

        assert_eq!(settings.get_string(FROM_NAME), None);
        assert_eq!(settings.get_u32(RETRY_DELAY_BASE_MINUTES), None);
        assert!(settings.get_bool("unsubscribed:a@b.c"));
        assert!(!settings.get_bool("unsubscribed:x@y.z"));
    }
}
