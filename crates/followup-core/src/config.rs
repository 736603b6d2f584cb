//! Followup configuration system.
//!
//! Values here are startup defaults. The five runtime knobs (`max_retries`,
//! `retry_delay_base_minutes`, `daily_retry_threshold_days`, `from_name`,
//! `from_email`) can be overridden at runtime through the settings store.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FollowupError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FollowupConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl FollowupConfig {
    /// Load config from the default path (~/.followup/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FollowupError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| FollowupError::Config(format!("Failed to parse config: {e}")))
    }

    /// Save config to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| FollowupError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Followup home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".followup")
    }
}

/// Database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.followup/followup.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Trigger runner loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Seconds between polls of the trigger table.
    #[serde(default = "default_tick_secs")]
    pub tick_interval_secs: u64,
    /// Max registrations claimed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_tick_secs() -> u64 { 30 }
fn default_batch_size() -> usize { 50 }

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_secs(),
            batch_size: default_batch_size(),
        }
    }
}

/// Store identity used by the `{site_name}` / `{site_url}` tags and as the
/// sender fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_site_name")]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub admin_email: String,
}

fn default_site_name() -> String { "My Store".into() }

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            name: default_site_name(),
            url: String::new(),
            admin_email: String::new(),
        }
    }
}

/// Outgoing mail (SMTP) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Empty means "use the site name".
    #[serde(default)]
    pub from_name: String,
    /// Empty means "use the site admin email".
    #[serde(default)]
    pub from_email: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default = "default_charset")]
    pub charset: String,
}

fn default_smtp_host() -> String { "localhost".into() }
fn default_smtp_port() -> u16 { 587 }
fn default_content_type() -> String { "text/html".into() }
fn default_charset() -> String { "UTF-8".into() }

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from_name: String::new(),
            from_email: String::new(),
            content_type: default_content_type(),
            charset: default_charset(),
        }
    }
}

/// Live retry and daily sweep policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_base_minutes: u32,
    #[serde(default = "bool_true")]
    pub daily_retry_enabled: bool,
    /// Only emails that failed within this many days are swept.
    #[serde(default = "default_threshold_days")]
    pub daily_retry_threshold_days: u32,
    /// UTC hour at which the daily sweep runs.
    #[serde(default = "default_daily_hour")]
    pub daily_retry_hour: u32,
    /// Minimum time since the last failure before the sweep picks a row up.
    #[serde(default = "default_cooldown")]
    pub sweep_cooldown_minutes: u32,
}

fn bool_true() -> bool { true }
fn default_max_retries() -> u32 { 3 }
fn default_retry_delay() -> u32 { 5 }
fn default_threshold_days() -> u32 { 15 }
fn default_daily_hour() -> u32 { 2 }
fn default_cooldown() -> u32 { 60 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_base_minutes: default_retry_delay(),
            daily_retry_enabled: true,
            daily_retry_threshold_days: default_threshold_days(),
            daily_retry_hour: default_daily_hour(),
            sweep_cooldown_minutes: default_cooldown(),
        }
    }
}

/// Retention sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_days")]
    pub job_log_days: u32,
    #[serde(default = "default_retention_days")]
    pub email_queue_days: u32,
}

fn default_retention_days() -> u32 { 30 }

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            job_log_days: default_retention_days(),
            email_queue_days: default_retention_days(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FollowupConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.retry_delay_base_minutes, 5);
        assert_eq!(config.retry.daily_retry_threshold_days, 15);
        assert_eq!(config.retention.job_log_days, 30);
        assert_eq!(config.mail.content_type, "text/html");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = FollowupConfig::parse(
            r#"
            [site]
            name = "Acme Shop"

            [retry]
            max_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.site.name, "Acme Shop");
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.retry_delay_base_minutes, 5);
        assert_eq!(config.runner.tick_interval_secs, 30);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join("followup-config-test");
        let path = dir.join("config.toml");
        let mut config = FollowupConfig::default();
        config.mail.smtp_host = "smtp.example.com".into();
        config.save_to(&path).unwrap();

        let loaded = FollowupConfig::load_from(&path).unwrap();
        assert_eq!(loaded.mail.smtp_host, "smtp.example.com");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = FollowupConfig::parse("[retry\nmax_retries = ").unwrap_err();
        assert!(matches!(err, FollowupError::Config(_)));
    }
}
