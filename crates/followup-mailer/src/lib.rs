//! # Followup Mailer
//!
//! Retrying email delivery on top of the deferred scheduler's trigger and
//! callback registry.
//!
//! ## Flow
//! ```text
//! EmailQueue::send_later / create_followup_sequence
//!   ├── QueueStore::insert            → email_queue (status = scheduled)
//!   ├── HostTrigger::register(at, "followup_emailer_send_single", id)
//!   └── JobLogStore mirror            → job_log (uid = row id)
//!
//! "followup_emailer_send_single" fires → EmailQueue::execute(id)
//!   ├── validation predicate (CallbackRegistry) → skipped
//!   ├── TemplateRenderer + headers → Transport::send
//!   ├── EmailLogStore::record (every attempt)
//!   └── completed | retrying (+ backoff fire) | failed
//!
//! "followup_emailer_daily_retry" fires → EmailQueue::run_daily_retry
//!   └── recent failures → scheduled again, daily_retry_count + 1
//! ```

pub mod email_log;
pub mod notify;
pub mod queue;
pub mod queue_store;
pub mod template;
pub mod transport;

pub use email_log::{EmailLogEntry, EmailLogStore, SendOutcome};
pub use notify::{Notification, Notifier, QUEUE_CREATED, QUEUE_SCHEDULED};
pub use queue::{
    DAILY_RETRY_TAG, DEFAULT_LOG_LIMIT, DeliveryOutcome, EmailQueue, EmailRequest,
    FollowupSequence, HOOK_PREFIX, MAX_RETRY_DELAY_MINUTES, PendingEmail, RetryInfo, RetryPolicy,
    SEND_SINGLE_TAG, SendAt, SequenceStep, SweepReport, hook_name, next_daily_run,
};
pub use queue_store::{NewQueuedEmail, QueuePatch, QueueStats, QueueStore, QueuedEmail};
pub use template::{TagProducer, TemplateRenderer, is_truthy, paragraphs};
pub use transport::{MemoryTransport, OutgoingEmail, SmtpTransport, Transport};
