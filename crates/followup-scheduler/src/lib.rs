//! # Followup Scheduler
//!
//! Persisted deferred jobs whose callbacks are stored as data.
//!
//! ## Architecture
//! ```text
//! DeferredScheduler::schedule(hook, callback, run_at, args)
//!   ├── CallbackRef::encode(callable)   → job_payloads (uid → descriptor + args)
//!   ├── HostTrigger::register(run_at, "followup_cron_execute", uid)
//!   └── JobLogStore::insert / update    → job_log (status = scheduled)
//!
//! TriggerRunner (tokio interval)
//!   ├── HostTrigger::claim_due(now, lease)  → run_at pushed to now + lease
//!   ├── tag → action
//!         └── DeferredScheduler::execute(uid)
//!               ├── CallbackRegistry::resolve(descriptor)
//!               ├── invoke (panics contained)
//!               └── job_log: completed | failed, payload deleted
//!   └── HostTrigger::ack on success, otherwise refired after the lease
//! ```

pub mod callback;
pub mod deferred;
pub mod job_log;
pub mod payload;
pub mod runner;
pub mod trigger;

pub use callback::{
    Callable, CallbackFn, CallbackRef, CallbackRegistry, ClassDef, Component, ComponentFactory,
};
pub use deferred::{
    CRON_TAG, DeferredScheduler, JobOutcome, ScheduleRequest, invoke_guarded, job_uid, short_uid,
};
pub use job_log::{JobLogEntry, JobLogPatch, JobLogStore, NewJobLog};
pub use payload::{JobPayload, PayloadStore};
pub use runner::{ActionHandler, TriggerRunner, spawn_runner};
pub use trigger::{CLAIM_LEASE_SECS, HostTrigger, MemoryTrigger, Registration, SqliteTrigger};
