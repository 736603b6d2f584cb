//! # Followup Core
//!
//! Shared building blocks for the deferred job scheduler and the email
//! delivery queue: the error taxonomy, configuration, job status values,
//! timestamp helpers, the SQLite handle and the key-value settings store.

pub mod config;
pub mod db;
pub mod error;
pub mod settings;
pub mod types;

pub use config::FollowupConfig;
pub use db::Db;
pub use error::{FollowupError, Result};
pub use settings::{MemorySettings, SettingsStore, SqliteSettings};
pub use types::{Context, JobStatus};
