//! Status values and timestamp helpers shared by the job log and the email queue.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Template/validation context: the JSON object stored alongside a job.
pub type Context = serde_json::Map<String, serde_json::Value>;

/// Lifecycle status of a job log row or an email queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    Retrying,
    Completed,
    Failed,
    Skipped,
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Scheduled,
        JobStatus::Retrying,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Skipped,
        JobStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Canceled => "canceled",
        }
    }

    /// Parse a stored status. Unknown values map to `Scheduled`.
    pub fn from_db(s: &str) -> Self {
        match s {
            "retrying" => JobStatus::Retrying,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "skipped" => JobStatus::Skipped,
            "canceled" => JobStatus::Canceled,
            _ => JobStatus::Scheduled,
        }
    }

    /// Still waiting on a trigger.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Scheduled | JobStatus::Retrying)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format a timestamp for storage. Fixed width with a `Z` suffix so that
/// lexical order in SQL equals chronological order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored timestamp, falling back to now on garbage.
pub fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_roundtrip() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::from_db(status.as_str()), status);
        }
        assert_eq!(JobStatus::from_db("bogus"), JobStatus::Scheduled);
        assert!(JobStatus::Retrying.is_pending());
        assert!(!JobStatus::Canceled.is_pending());
    }

    #[test]
    fn test_timestamp_format_sorts_lexically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 9, 23, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 1, 10, 1, 0, 0).unwrap();
        assert_eq!(fmt_ts(a), "2026-01-09T23:00:00Z");
        assert!(fmt_ts(a) < fmt_ts(b));
        assert_eq!(parse_ts(&fmt_ts(b)), b);
        assert_eq!(parse_opt_ts(Some(fmt_ts(a))), Some(a));
        assert_eq!(parse_opt_ts(None), None);
    }
}
