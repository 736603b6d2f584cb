//! Generic deferred scheduler: "run this named callback with these args at
//! time T", backed by the host trigger, the payload store and the job log.
//!
//! Overridable hooks use a fixed uid (`followup_cron_<hook>`), so scheduling
//! one again replaces the pending occurrence instead of adding a second.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use followup_core::types::fmt_ts;
use followup_core::{JobStatus, Result};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;

use crate::callback::{CallbackFn, CallbackRef, CallbackRegistry, Callable};
use crate::job_log::{JobLogPatch, JobLogStore, NewJobLog};
use crate::payload::{JobPayload, PayloadStore};
use crate::trigger::HostTrigger;

/// Trigger tag every deferred job fires under; the payload is the job uid.
pub const CRON_TAG: &str = "followup_cron_execute";

const UID_PREFIX: &str = "followup_cron_";

/// Two random 4-char alphanumeric groups, e.g. `aZ3k-9QpL`.
pub fn short_uid() -> String {
    let mut rng = rand::thread_rng();
    let mut group = || -> String {
        (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(4)
            .map(char::from)
            .collect()
    };
    let first = group();
    let second = group();
    format!("{first}-{second}")
}

/// Job uid for a hook.
pub fn job_uid(hook_name: &str, override_existing: bool) -> String {
    if override_existing {
        format!("{UID_PREFIX}{hook_name}")
    } else {
        format!("{UID_PREFIX}{hook_name}_{}", short_uid())
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub hook_name: String,
    pub callback: Callable,
    pub run_at: DateTime<Utc>,
    pub args: Value,
    /// Replace any pending occurrence of this hook.
    pub override_existing: bool,
}

impl ScheduleRequest {
    /// Runs in one hour unless told otherwise.
    pub fn new(hook_name: impl Into<String>, callback: Callable) -> Self {
        Self {
            hook_name: hook_name.into(),
            callback,
            run_at: Utc::now() + Duration::hours(1),
            args: Value::Null,
            override_existing: false,
        }
    }

    pub fn at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = run_at;
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn overriding(mut self) -> Self {
        self.override_existing = true;
        self
    }
}

/// Result of running one deferred job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Value),
    Failed(String),
    /// No payload for the uid: already run, canceled, or a stale fire.
    Missing,
}

pub struct DeferredScheduler {
    jobs: JobLogStore,
    payloads: PayloadStore,
    trigger: Arc<dyn HostTrigger>,
    registry: Arc<CallbackRegistry>,
}

impl DeferredScheduler {
    pub fn new(
        jobs: JobLogStore,
        payloads: PayloadStore,
        trigger: Arc<dyn HostTrigger>,
        registry: Arc<CallbackRegistry>,
    ) -> Self {
        Self {
            jobs,
            payloads,
            trigger,
            registry,
        }
    }

    pub fn jobs(&self) -> &JobLogStore {
        &self.jobs
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    /// Schedule a job. Returns `Ok(false)` for a blank hook name.
    pub fn schedule(&self, req: ScheduleRequest) -> Result<bool> {
        if req.hook_name.trim().is_empty() {
            tracing::warn!("⚠️ Refusing to schedule a job without a hook name");
            return Ok(false);
        }
        let callback = CallbackRef::encode(&req.callback)?;
        let uid = job_uid(&req.hook_name, req.override_existing);

        if req.override_existing && self.trigger.cancel(CRON_TAG, &uid)? {
            tracing::debug!("🔁 Replacing pending occurrence of '{}'", req.hook_name);
        }

        self.payloads.put(&JobPayload {
            uid: uid.clone(),
            hook_name: req.hook_name.clone(),
            callback,
            args: req.args.clone(),
        })?;
        self.trigger.register(req.run_at, CRON_TAG, &uid)?;

        let entry = NewJobLog::new(uid.as_str(), req.hook_name.as_str())
            .with_args(req.args)
            .with_schedule(req.run_at);
        if self.jobs.insert(&entry)?.is_none() {
            // fixed uid: the row from the previous occurrence is reused
            self.jobs.update_by_uid(
                &uid,
                &JobLogPatch {
                    args: Some(entry.args.clone()),
                    attempts: Some(0),
                    ..JobLogPatch::reschedule(req.run_at, JobStatus::Scheduled)
                },
            )?;
        }

        tracing::info!(
            "📅 Job scheduled: '{}' ({uid}) at {}",
            req.hook_name,
            fmt_ts(req.run_at)
        );
        Ok(true)
    }

    /// Run the job stored under `uid`. The payload is removed whatever the outcome.
    pub fn execute(&self, uid: &str) -> Result<JobOutcome> {
        let Some(payload) = self.payloads.get(uid)? else {
            tracing::debug!("💤 No payload for job {uid}, skipping");
            return Ok(JobOutcome::Missing);
        };

        let started = Instant::now();
        let result = match self.registry.resolve(&payload.callback) {
            Ok(f) => invoke_guarded(&f, &payload.args),
            Err(e) => Err(e.to_string()),
        };
        let elapsed = started.elapsed().as_millis();

        let (status, outcome) = match result {
            Ok(value) => {
                tracing::info!("✅ Job '{}' completed in {elapsed}ms", payload.hook_name);
                (JobStatus::Completed, JobOutcome::Completed(value))
            }
            Err(msg) => {
                tracing::error!(
                    "❌ Job '{}' ({}) failed after {elapsed}ms: {msg}",
                    payload.hook_name,
                    payload.callback
                );
                (JobStatus::Failed, JobOutcome::Failed(msg))
            }
        };

        let logged = self.jobs.finish_by_uid(uid, status);
        let cleared = self.payloads.delete(uid);
        logged?;
        cleared?;
        Ok(outcome)
    }

    /// Cancel the pending occurrence of an overridable hook.
    pub fn cancel(&self, hook_name: &str) -> Result<bool> {
        let uid = job_uid(hook_name, true);
        let had_trigger = self.trigger.cancel(CRON_TAG, &uid)?;
        let had_payload = self.payloads.delete(&uid)?;
        if had_trigger || had_payload {
            self.jobs.update_status_by_uid(&uid, JobStatus::Canceled)?;
            tracing::info!("🛑 Job '{hook_name}' canceled");
        }
        Ok(had_trigger || had_payload)
    }

    /// Uids of jobs that have been scheduled but not yet run.
    pub fn pending_uids(&self) -> Result<Vec<String>> {
        self.payloads.uids()
    }
}

/// Call a resolved callback, turning a panic into an error message.
pub fn invoke_guarded(f: &CallbackFn, args: &Value) -> std::result::Result<Value, String> {
    match catch_unwind(AssertUnwindSafe(|| f(args))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("callback panicked: {msg}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::MemoryTrigger;
    use followup_core::{Db, FollowupError};
    use serde_json::json;
    use std::sync::Mutex;

    struct Fixture {
        scheduler: DeferredScheduler,
        trigger: Arc<MemoryTrigger>,
        calls: Arc<Mutex<Vec<Value>>>,
    }

    fn fixture() -> Fixture {
        let db = Db::open_in_memory().unwrap();
        let trigger = Arc::new(MemoryTrigger::new());
        let registry = Arc::new(CallbackRegistry::new());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        registry.register_function("record", move |args| {
            sink.lock().unwrap().push(args.clone());
            Ok(json!("done"))
        });
        registry.register_function("explode", |_| Err("bad input".to_string()));
        registry.register_function("panic", |_| panic!("kaboom"));

        let scheduler = DeferredScheduler::new(
            JobLogStore::new(db.clone()).unwrap(),
            PayloadStore::new(db).unwrap(),
            trigger.clone(),
            registry,
        );
        Fixture {
            scheduler,
            trigger,
            calls,
        }
    }

    #[test]
    fn test_short_uid_shape() {
        let uid = short_uid();
        let parts: Vec<&str> = uid.split('-').collect();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.len() == 4 && p.chars().all(|c| c.is_ascii_alphanumeric())));
        assert_eq!(job_uid("cleanup", true), "followup_cron_cleanup");
        assert!(job_uid("cleanup", false).starts_with("followup_cron_cleanup_"));
    }

    #[test]
    fn test_override_keeps_one_pending_occurrence() {
        let fx = fixture();
        let t1 = Utc::now() + Duration::hours(1);
        let t2 = Utc::now() + Duration::hours(3);
        let req = ScheduleRequest::new("cleanup", Callable::function("record")).overriding();

        assert!(fx.scheduler.schedule(req.clone().at(t1)).unwrap());
        assert!(fx.scheduler.schedule(req.at(t2)).unwrap());

        assert_eq!(fx.trigger.count(CRON_TAG), 1);
        let uid = job_uid("cleanup", true);
        assert_eq!(
            fx.trigger.next_scheduled(CRON_TAG, &uid).unwrap().map(fmt_ts),
            Some(fmt_ts(t2))
        );
        let rows = fx.scheduler.jobs().list_recent(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].schedule.map(fmt_ts), Some(fmt_ts(t2)));
        assert_eq!(rows[0].status, JobStatus::Scheduled);
    }

    #[test]
    fn test_non_override_adds_occurrences() {
        let fx = fixture();
        for _ in 0..3 {
            let req = ScheduleRequest::new("ping", Callable::function("record"));
            assert!(fx.scheduler.schedule(req).unwrap());
        }
        assert_eq!(fx.trigger.count(CRON_TAG), 3);
        assert_eq!(fx.scheduler.pending_uids().unwrap().len(), 3);
    }

    #[test]
    fn test_blank_hook_and_closure() {
        let fx = fixture();
        let req = ScheduleRequest::new(" ", Callable::function("record"));
        assert!(!fx.scheduler.schedule(req).unwrap());

        let req = ScheduleRequest::new("x", Callable::closure(|_| Ok(Value::Null)));
        assert!(matches!(
            fx.scheduler.schedule(req),
            Err(FollowupError::NotEncodable(_))
        ));
        assert_eq!(fx.trigger.count(CRON_TAG), 0);
    }

    #[test]
    fn test_execute_success_clears_payload() {
        let fx = fixture();
        let req = ScheduleRequest::new("report", Callable::function("record"))
            .with_args(json!({"days": 30}))
            .overriding();
        fx.scheduler.schedule(req).unwrap();

        let uid = job_uid("report", true);
        let outcome = fx.scheduler.execute(&uid).unwrap();
        assert_eq!(outcome, JobOutcome::Completed(json!("done")));
        assert_eq!(*fx.calls.lock().unwrap(), vec![json!({"days": 30})]);

        let row = fx.scheduler.jobs().get_by_uid(&uid).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.attempts, 1);

        // a stale second fire finds nothing to run
        assert_eq!(fx.scheduler.execute(&uid).unwrap(), JobOutcome::Missing);
        assert_eq!(fx.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_execute_failures_are_contained() {
        let fx = fixture();
        for hook in ["explode", "panic"] {
            let req = ScheduleRequest::new(hook, Callable::function(hook)).overriding();
            fx.scheduler.schedule(req).unwrap();
            let uid = job_uid(hook, true);
            assert!(matches!(
                fx.scheduler.execute(&uid).unwrap(),
                JobOutcome::Failed(_)
            ));
            let row = fx.scheduler.jobs().get_by_uid(&uid).unwrap().unwrap();
            assert_eq!(row.status, JobStatus::Failed);
        }
        assert!(fx.scheduler.pending_uids().unwrap().is_empty());
    }

    #[test]
    fn test_unregistered_symbol_fails_closed() {
        let fx = fixture();
        let req = ScheduleRequest::new("gone", Callable::function("record")).overriding();
        fx.scheduler.schedule(req).unwrap();
        fx.scheduler.registry().unregister_function("record");

        let uid = job_uid("gone", true);
        match fx.scheduler.execute(&uid).unwrap() {
            JobOutcome::Failed(msg) => assert!(msg.contains("record")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(fx.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_overridable_hook() {
        let fx = fixture();
        let req = ScheduleRequest::new("digest", Callable::function("record")).overriding();
        fx.scheduler.schedule(req).unwrap();

        assert!(fx.scheduler.cancel("digest").unwrap());
        assert!(!fx.scheduler.cancel("digest").unwrap());
        assert_eq!(fx.trigger.count(CRON_TAG), 0);
        let uid = job_uid("digest", true);
        assert_eq!(
            fx.scheduler.jobs().get_by_uid(&uid).unwrap().unwrap().status,
            JobStatus::Canceled
        );
        assert_eq!(fx.scheduler.execute(&uid).unwrap(), JobOutcome::Missing);
    }
}
