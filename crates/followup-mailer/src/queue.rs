//! Email delivery queue.
//!
//! Emails are stored as rows, fired by the host trigger under
//! [`SEND_SINGLE_TAG`] with the row id as payload, and walked through
//! `scheduled → completed | retrying … → failed | skipped | canceled`.
//! Failed sends are retried with exponential backoff up to the row's
//! `max_retries`; a daily sweep re-queues emails that ran out of live retries.
//!
//! Every transition out of a pending state is written with the row version
//! captured when the row was loaded. If someone else (a cancel, an overlapping
//! fire) wrote the row in the meantime, the in-flight execution yields.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use followup_core::settings::{
    DAILY_RETRY_ENABLED, DAILY_RETRY_THRESHOLD_DAYS, FROM_EMAIL, FROM_NAME, MAX_RETRIES,
    RETRY_DELAY_BASE_MINUTES,
};
use followup_core::types::fmt_ts;
use followup_core::{Context, Db, FollowupConfig, FollowupError, JobStatus, Result, SettingsStore};
use followup_scheduler::{
    Callable, CallbackRef, CallbackRegistry, HostTrigger, JobLogPatch, JobLogStore, NewJobLog,
    TriggerRunner, invoke_guarded, short_uid,
};
use serde::Serialize;
use serde_json::{Value, json};

use crate::email_log::{EmailLogEntry, EmailLogStore, SendOutcome};
use crate::notify::{Notifier, QUEUE_CREATED, QUEUE_SCHEDULED};
use crate::queue_store::{NewQueuedEmail, QueuePatch, QueueStats, QueueStore, QueuedEmail};
use crate::template::{TemplateRenderer, is_truthy};
use crate::transport::{OutgoingEmail, Transport};

/// Trigger tag for one queued email; payload is the row id.
pub const SEND_SINGLE_TAG: &str = "followup_emailer_send_single";
/// Trigger tag for the daily failed-email sweep; empty payload.
pub const DAILY_RETRY_TAG: &str = "followup_emailer_daily_retry";
/// Notification hook prefix; named emails use `followup_emailer_<name>`.
pub const HOOK_PREFIX: &str = "followup_emailer";

/// Seconds between a sweep or manual retry and the resend.
const REQUEUE_DELAY_SECS: i64 = 60;
/// Default page size for [`EmailQueue::email_logs`].
pub const DEFAULT_LOG_LIMIT: usize = 40;

const SKIP_REASON: &str = "Validation callback returned false";

/// Notification hook for an email name.
pub fn hook_name(name: Option<&str>) -> String {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(n) => format!("{HOOK_PREFIX}_{n}"),
        None => HOOK_PREFIX.to_string(),
    }
}

/// When to send: a day offset from now or an absolute time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAt {
    Days(i64),
    At(DateTime<Utc>),
}

impl SendAt {
    /// Integers from 1e9 up are unix timestamps, anything smaller is days.
    pub fn from_raw(raw: i64) -> Self {
        if raw >= 1_000_000_000 {
            DateTime::from_timestamp(raw, 0)
                .map(SendAt::At)
                .unwrap_or(SendAt::Days(0))
        } else {
            SendAt::Days(raw)
        }
    }

    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            SendAt::Days(days) => Duration::try_days(*days)
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(if *days < 0 {
                    DateTime::<Utc>::MIN_UTC
                } else {
                    DateTime::<Utc>::MAX_UTC
                }),
            SendAt::At(at) => *at,
        }
    }
}

/// Effective retry settings: settings-store overrides on top of config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_minutes: u32,
    pub daily_threshold_days: u32,
    pub sweep_cooldown_minutes: u32,
    pub daily_retry_enabled: bool,
    pub daily_hour: u32,
}

/// Upper bound on a single live-retry delay: 30 days.
pub const MAX_RETRY_DELAY_MINUTES: i64 = 30 * 24 * 60;

impl RetryPolicy {
    /// Delay before live retry `attempt` (1-based): base, 2×base, 4×base, …
    /// capped at [`MAX_RETRY_DELAY_MINUTES`].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(62);
        let minutes = i64::from(self.base_delay_minutes)
            .checked_mul(1i64 << exp)
            .map_or(MAX_RETRY_DELAY_MINUTES, |m| m.min(MAX_RETRY_DELAY_MINUTES));
        Duration::try_minutes(minutes).unwrap_or_else(|| Duration::days(30))
    }
}

/// Tomorrow at `hour`:00 UTC.
pub fn next_daily_run(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    (now.date_naive() + Duration::days(1))
        .and_hms_opt(hour.min(23), 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(now + Duration::days(1))
}

/// A single email to send later.
#[derive(Debug, Clone)]
pub struct EmailRequest {
    pub to: String,
    pub subject: String,
    pub message: String,
    pub send_at: SendAt,
    pub context: Context,
    pub name: Option<String>,
    pub validation: Option<Callable>,
    pub notes: Option<String>,
}

impl EmailRequest {
    pub fn new(to: &str, subject: &str, message: &str, send_at: SendAt) -> Self {
        Self {
            to: to.to_string(),
            subject: subject.to_string(),
            message: message.to_string(),
            send_at,
            context: Context::new(),
            name: None,
            validation: None,
            notes: None,
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn validated_by(mut self, callable: Callable) -> Self {
        self.validation = Some(callable);
        self
    }

    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_string());
        self
    }
}

/// One step of a follow-up sequence.
#[derive(Debug, Clone)]
pub struct SequenceStep {
    pub send_at: SendAt,
    pub subject: String,
    pub message: String,
    /// Row id of an earlier email this step cancels and replaces.
    pub replaces: Option<i64>,
    /// Overrides the sequence-wide validation.
    pub validation: Option<Callable>,
    pub notes: Option<String>,
}

impl SequenceStep {
    pub fn new(send_at: SendAt, subject: &str, message: &str) -> Self {
        Self {
            send_at,
            subject: subject.to_string(),
            message: message.to_string(),
            replaces: None,
            validation: None,
            notes: None,
        }
    }

    pub fn replacing(mut self, id: i64) -> Self {
        self.replaces = Some(id);
        self
    }

    pub fn validated_by(mut self, callable: Callable) -> Self {
        self.validation = Some(callable);
        self
    }

    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_string());
        self
    }
}

/// A series of emails to one recipient sharing a sequence id.
#[derive(Debug, Clone)]
pub struct FollowupSequence {
    pub to: String,
    pub steps: Vec<SequenceStep>,
    pub context: Context,
    /// Fixed sequence id. An existing sequence with this id is canceled first.
    pub uid: Option<String>,
    pub name: Option<String>,
    pub validation: Option<Callable>,
}

impl FollowupSequence {
    pub fn new(to: &str) -> Self {
        Self {
            to: to.to_string(),
            steps: Vec::new(),
            context: Context::new(),
            uid: None,
            name: None,
            validation: None,
        }
    }

    pub fn step(mut self, step: SequenceStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn with_uid(mut self, uid: &str) -> Self {
        self.uid = Some(uid.to_string());
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn validated_by(mut self, callable: Callable) -> Self {
        self.validation = Some(callable);
        self
    }
}

/// Result of one [`EmailQueue::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Sent,
    Retrying { attempt: u32, next_at: DateTime<Utc> },
    Failed(String),
    /// Validation said no.
    Skipped,
    /// No such row.
    Missing,
    /// Row was not pending (already finished or canceled).
    Ignored(JobStatus),
    /// Another writer changed the row while this execution was in flight.
    Superseded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub total: usize,
    pub retried: usize,
    pub skipped: usize,
    pub errors: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingEmail {
    pub id: i64,
    pub email_id: String,
    pub to: String,
    pub subject: String,
    pub send_time: DateTime<Utc>,
    pub days_remaining: i64,
    pub has_validation: bool,
    pub retry_count: u32,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryInfo {
    pub retry_count: u32,
    pub daily_retry_count: u32,
    pub max_retries: u32,
    pub last_attempt_time: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
}

pub struct EmailQueue {
    store: QueueStore,
    logs: EmailLogStore,
    jobs: JobLogStore,
    trigger: Arc<dyn HostTrigger>,
    registry: Arc<CallbackRegistry>,
    transport: Arc<dyn Transport>,
    settings: Arc<dyn SettingsStore>,
    renderer: TemplateRenderer,
    notifier: Arc<Notifier>,
    config: FollowupConfig,
}

impl EmailQueue {
    pub fn new(
        db: &Db,
        trigger: Arc<dyn HostTrigger>,
        registry: Arc<CallbackRegistry>,
        transport: Arc<dyn Transport>,
        settings: Arc<dyn SettingsStore>,
        config: FollowupConfig,
    ) -> Result<Self> {
        let renderer = TemplateRenderer::with_defaults(&config.site.name, &config.site.url);
        Ok(Self {
            store: QueueStore::new(db.clone())?,
            logs: EmailLogStore::new(db.clone())?,
            jobs: JobLogStore::new(db.clone())?,
            trigger,
            registry,
            transport,
            settings,
            renderer,
            notifier: Arc::new(Notifier::new()),
            config,
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Register extra template tags before the queue is shared.
    pub fn renderer_mut(&mut self) -> &mut TemplateRenderer {
        &mut self.renderer
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn jobs(&self) -> &JobLogStore {
        &self.jobs
    }

    pub fn policy(&self) -> RetryPolicy {
        let cfg = &self.config.retry;
        let daily_retry_enabled = match self.settings.get(DAILY_RETRY_ENABLED) {
            Some(_) => self.settings.get_bool(DAILY_RETRY_ENABLED),
            None => cfg.daily_retry_enabled,
        };
        RetryPolicy {
            max_retries: self
                .settings
                .get_u32(MAX_RETRIES)
                .unwrap_or(cfg.max_retries),
            base_delay_minutes: self
                .settings
                .get_u32(RETRY_DELAY_BASE_MINUTES)
                .unwrap_or(cfg.retry_delay_base_minutes),
            daily_threshold_days: self
                .settings
                .get_u32(DAILY_RETRY_THRESHOLD_DAYS)
                .unwrap_or(cfg.daily_retry_threshold_days),
            sweep_cooldown_minutes: cfg.sweep_cooldown_minutes,
            daily_retry_enabled,
            daily_hour: cfg.daily_retry_hour,
        }
    }

    /// Bind the send and daily-sweep actions on a runner.
    pub fn register_actions(self: &Arc<Self>, runner: &mut TriggerRunner) {
        let queue = self.clone();
        runner.on(SEND_SINGLE_TAG, move |payload: String| {
            let queue = queue.clone();
            async move {
                let id: i64 = payload.trim().parse().map_err(|_| {
                    FollowupError::Other(format!("Invalid email id in trigger payload: '{payload}'"))
                })?;
                queue.execute(id).await.map(|_| ())
            }
        });

        let queue = self.clone();
        runner.on(DAILY_RETRY_TAG, move |_payload: String| {
            let queue = queue.clone();
            async move { queue.run_daily_retry().map(|_| ()) }
        });
    }

    // ── Sending ────────────────────────────────────────────

    /// Render and send immediately. Never errors: the outcome is the bool
    /// and a log row.
    pub async fn send_now(&self, to: &str, subject: &str, message: &str, context: &Context) -> bool {
        let email = self.compose(to, subject, message, context);
        let sent = match self.transport.send(&email).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("❌ Immediate send to {to} failed: {e}");
                false
            }
        };
        let outcome = if sent {
            SendOutcome::Sent
        } else {
            SendOutcome::Failed
        };
        self.log_attempt(None, to, &email.subject, outcome, None);
        sent
    }

    /// Queue one email. Returns the row id.
    pub fn send_later(&self, req: EmailRequest) -> Result<i64> {
        let validation = req
            .validation
            .as_ref()
            .map(CallbackRef::encode)
            .transpose()?;
        let hook = hook_name(req.name.as_deref());
        let row = NewQueuedEmail {
            sequence_id: Some(format!("seq_{}", short_uid())),
            to_email: req.to,
            subject: req.subject,
            message: req.message,
            args: req.context,
            validation,
            max_retries: self.policy().max_retries,
            scheduled_time: req.send_at.resolve(Utc::now()),
            notes: req.notes,
        };
        self.enqueue(&row, &hook)
    }

    /// Queue a sequence. Returns the sequence id.
    pub fn create_followup_sequence(&self, seq: FollowupSequence) -> Result<String> {
        if seq.steps.is_empty() {
            return Err(FollowupError::Other("Sequence has no steps".into()));
        }

        // encode every predicate up front so a bad step leaves nothing behind
        let validations = seq
            .steps
            .iter()
            .map(|step| {
                step.validation
                    .as_ref()
                    .or(seq.validation.as_ref())
                    .map(CallbackRef::encode)
                    .transpose()
            })
            .collect::<Result<Vec<_>>>()?;

        let sequence_id = match seq.uid.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            Some(uid) => {
                let canceled = self.cancel_sequence(uid)?;
                if canceled > 0 {
                    tracing::info!("🔁 Replacing sequence {uid} ({canceled} email(s) canceled)");
                }
                uid.to_string()
            }
            None => format!("seq_{}", short_uid()),
        };

        let hook = hook_name(seq.name.as_deref());
        let max_retries = self.policy().max_retries;
        let now = Utc::now();

        for (step, validation) in seq.steps.into_iter().zip(validations) {
            if let Some(prev) = step.replaces {
                self.cancel(prev)?;
            }
            let row = NewQueuedEmail {
                sequence_id: Some(sequence_id.clone()),
                to_email: seq.to.clone(),
                subject: step.subject,
                message: step.message,
                args: seq.context.clone(),
                validation,
                max_retries,
                scheduled_time: step.send_at.resolve(now),
                notes: step.notes,
            };
            self.enqueue(&row, &hook)?;
        }

        Ok(sequence_id)
    }

    fn enqueue(&self, row: &NewQueuedEmail, hook: &str) -> Result<i64> {
        let id = self.store.insert(row)?;
        self.notifier.emit(
            QUEUE_CREATED,
            json!({ "id": id, "sequence_id": row.sequence_id, "to": row.to_email }),
        );

        let uid = id.to_string();
        self.trigger
            .register(row.scheduled_time, SEND_SINGLE_TAG, &uid)?;
        self.notifier.emit(
            QUEUE_SCHEDULED,
            json!({ "id": id, "scheduled_time": fmt_ts(row.scheduled_time) }),
        );

        let entry = NewJobLog::new(uid.as_str(), hook)
            .with_args(Value::Object(row.args.clone()))
            .with_schedule(row.scheduled_time);
        if self.jobs.insert(&entry)?.is_none() {
            self.jobs.update_by_uid(
                &uid,
                &JobLogPatch {
                    hook_name: Some(hook.to_string()),
                    ..JobLogPatch::reschedule(row.scheduled_time, JobStatus::Scheduled)
                },
            )?;
        }

        tracing::info!(
            "📧 Email {id} to {} scheduled for {}",
            row.to_email,
            fmt_ts(row.scheduled_time)
        );
        Ok(id)
    }

    // ── Execution ──────────────────────────────────────────

    /// Run one fired email.
    pub async fn execute(&self, id: i64) -> Result<DeliveryOutcome> {
        let Some(row) = self.store.get(id)? else {
            tracing::debug!("💤 Email {id} no longer exists");
            return Ok(DeliveryOutcome::Missing);
        };
        if !row.status.is_pending() {
            tracing::debug!("💤 Email {id} is {}, ignoring fire", row.status);
            return Ok(DeliveryOutcome::Ignored(row.status));
        }

        let hook = self.hook_of(id);
        let ctx = execution_context(&row);
        let now = Utc::now();

        if let Some(e) = &row.validation_error {
            let msg = format!("Validation callback undecodable: {e}");
            self.log_attempt(Some(id), &row.to_email, &row.subject, SendOutcome::Failed, None);
            return self.fail_permanently(&row, &ctx, &hook, msg, now);
        }
        if let Some(desc) = &row.validation {
            match self.registry.resolve(desc) {
                Err(e) => {
                    let msg = format!("Validation callback unavailable: {e}");
                    self.log_attempt(Some(id), &row.to_email, &row.subject, SendOutcome::Failed, None);
                    return self.fail_permanently(&row, &ctx, &hook, msg, now);
                }
                Ok(predicate) => match invoke_guarded(&predicate, &Value::Object(ctx.clone())) {
                    Ok(verdict) if !is_truthy(&verdict) => {
                        return self.skip(&row, now);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("⚠️ Validation for email {id} errored, sending anyway: {e}");
                    }
                },
            }
        }

        let email = self.compose(&row.to_email, &row.subject, &row.message, &ctx);
        let result = self.transport.send(&email).await;
        let outcome = if result.is_ok() {
            SendOutcome::Sent
        } else {
            SendOutcome::Failed
        };
        self.log_attempt(Some(id), &row.to_email, &email.subject, outcome, None);

        match result {
            Ok(()) => {
                let patch = QueuePatch {
                    status: Some(JobStatus::Completed),
                    last_attempt_time: Some(now),
                    last_error_message: Some(None),
                    ..Default::default()
                };
                if !self.commit(&row, &patch, &JobLogPatch::status(JobStatus::Completed))? {
                    return Ok(DeliveryOutcome::Superseded);
                }
                tracing::info!("✅ Email {id} sent to {}", row.to_email);
                self.notifier.emit(
                    &hook,
                    json!({ "args": Value::Object(ctx), "sent": true, "email_id": id }),
                );
                Ok(DeliveryOutcome::Sent)
            }
            Err(e) if row.retry_count < row.max_retries => {
                let policy = self.policy();
                let attempt = row.retry_count + 1;
                let next_at = now
                    .checked_add_signed(policy.delay_for(attempt))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                let patch = QueuePatch {
                    status: Some(JobStatus::Retrying),
                    retry_count: Some(attempt),
                    scheduled_time: Some(next_at),
                    last_attempt_time: Some(now),
                    last_error_message: Some(Some(e.to_string())),
                    ..Default::default()
                };
                let job = JobLogPatch::reschedule(next_at, JobStatus::Retrying);
                if !self.commit(&row, &patch, &job)? {
                    return Ok(DeliveryOutcome::Superseded);
                }
                self.trigger
                    .register(next_at, SEND_SINGLE_TAG, &id.to_string())?;
                tracing::warn!(
                    "🔄 Email {id} failed ({e}), retry {attempt}/{} at {}",
                    row.max_retries,
                    fmt_ts(next_at)
                );
                Ok(DeliveryOutcome::Retrying { attempt, next_at })
            }
            Err(e) => {
                let msg = format!("Failed after {} retry attempts: {e}", row.retry_count);
                self.fail_permanently(&row, &ctx, &hook, msg, now)
            }
        }
    }

    fn skip(&self, row: &QueuedEmail, now: DateTime<Utc>) -> Result<DeliveryOutcome> {
        let patch = QueuePatch {
            status: Some(JobStatus::Skipped),
            last_attempt_time: Some(now),
            ..Default::default()
        };
        if !self.commit(row, &patch, &JobLogPatch::status(JobStatus::Skipped))? {
            return Ok(DeliveryOutcome::Superseded);
        }
        self.log_attempt(
            Some(row.id),
            &row.to_email,
            &row.subject,
            SendOutcome::Skipped,
            Some(SKIP_REASON),
        );
        tracing::info!("⏭️ Email {} skipped: {SKIP_REASON}", row.id);
        Ok(DeliveryOutcome::Skipped)
    }

    fn fail_permanently(
        &self,
        row: &QueuedEmail,
        ctx: &Context,
        hook: &str,
        msg: String,
        now: DateTime<Utc>,
    ) -> Result<DeliveryOutcome> {
        let patch = QueuePatch {
            status: Some(JobStatus::Failed),
            last_attempt_time: Some(now),
            last_error_message: Some(Some(msg.clone())),
            ..Default::default()
        };
        if !self.commit(row, &patch, &JobLogPatch::status(JobStatus::Failed))? {
            return Ok(DeliveryOutcome::Superseded);
        }
        tracing::error!("❌ Email {} to {} failed: {msg}", row.id, row.to_email);
        self.notifier.emit(
            &format!("{hook}_failed"),
            json!({ "args": Value::Object(ctx.clone()), "email_id": row.id, "error": msg }),
        );
        Ok(DeliveryOutcome::Failed(msg))
    }

    /// Version-guarded row write plus the job-log mirror. `Ok(false)` when
    /// another writer got there first.
    fn commit(&self, row: &QueuedEmail, patch: &QueuePatch, job: &JobLogPatch) -> Result<bool> {
        match self.store.update_if_version(row.id, row.version, patch) {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                tracing::warn!("⚠️ Email {} changed during delivery, yielding: {e}", row.id);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        self.jobs.update_by_uid(&row.id.to_string(), job)?;
        Ok(true)
    }

    fn hook_of(&self, id: i64) -> String {
        match self.jobs.get_by_uid(&id.to_string()) {
            Ok(Some(entry)) => entry.hook_name,
            Ok(None) => HOOK_PREFIX.to_string(),
            Err(e) => {
                tracing::warn!("⚠️ Job log lookup for email {id} failed: {e}");
                HOOK_PREFIX.to_string()
            }
        }
    }

    fn log_attempt(
        &self,
        id: Option<i64>,
        to: &str,
        subject: &str,
        outcome: SendOutcome,
        reason: Option<&str>,
    ) {
        if let Err(e) = self.logs.record(id, to, subject, outcome, reason) {
            tracing::warn!("⚠️ Failed to write email log: {e}");
        }
    }

    // ── Composition ────────────────────────────────────────

    fn mail_defaults(&self) -> Context {
        let mail = &self.config.mail;
        let site = &self.config.site;
        let non_empty = |s: &str| (!s.trim().is_empty()).then(|| s.to_string());

        let from_name = self
            .settings
            .get_string(FROM_NAME)
            .or_else(|| non_empty(&mail.from_name))
            .unwrap_or_else(|| site.name.clone());
        let from_email = self
            .settings
            .get_string(FROM_EMAIL)
            .or_else(|| non_empty(&mail.from_email))
            .unwrap_or_else(|| site.admin_email.clone());

        let mut defaults = Context::new();
        defaults.insert("from_name".into(), Value::String(from_name));
        defaults.insert("from_email".into(), Value::String(from_email));
        defaults.insert("content_type".into(), Value::String(mail.content_type.clone()));
        defaults.insert("charset".into(), Value::String(mail.charset.clone()));
        defaults
    }

    /// Render subject and body; caller context wins over the mail defaults.
    pub fn compose(&self, to: &str, subject: &str, message: &str, context: &Context) -> OutgoingEmail {
        let mut ctx = self.mail_defaults();
        for (key, value) in context {
            ctx.insert(key.clone(), value.clone());
        }
        OutgoingEmail {
            to: to.to_string(),
            subject: self.renderer.render(subject, &ctx),
            body: self.renderer.render(message, &ctx),
            headers: build_headers(&ctx),
        }
    }

    // ── Cancellation ───────────────────────────────────────

    /// Cancel a pending email. Returns whether the row is canceled afterwards;
    /// finished rows are left as they are.
    pub fn cancel(&self, id: i64) -> Result<bool> {
        self.trigger.cancel(SEND_SINGLE_TAG, &id.to_string())?;
        if self.store.cancel_if_pending(id)? {
            self.jobs
                .update_status_by_uid(&id.to_string(), JobStatus::Canceled)?;
            tracing::info!("🛑 Email {id} canceled");
            return Ok(true);
        }
        Ok(self
            .store
            .get(id)?
            .is_some_and(|row| row.status == JobStatus::Canceled))
    }

    /// Cancel every member of a sequence. One member failing does not stop
    /// the rest. Returns how many members are canceled afterwards.
    pub fn cancel_sequence(&self, sequence_id: &str) -> Result<usize> {
        let mut canceled = 0;
        for id in self.store.ids_by_sequence(sequence_id)? {
            match self.cancel(id) {
                Ok(true) => canceled += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("⚠️ Failed to cancel email {id} in {sequence_id}: {e}"),
            }
        }
        Ok(canceled)
    }

    // ── Retries ────────────────────────────────────────────

    /// Re-queue recently failed emails that ran out of live retries.
    pub fn retry_all_failed(&self) -> Result<SweepReport> {
        let policy = self.policy();
        let now = Utc::now();
        let failed = self
            .store
            .failed_since(
                now.checked_sub_signed(Duration::days(i64::from(policy.daily_threshold_days)))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
            )?;

        let mut report = SweepReport {
            total: failed.len(),
            ..Default::default()
        };
        if failed.is_empty() {
            tracing::info!(
                "🔁 Daily retry: no failed emails within {} days",
                policy.daily_threshold_days
            );
            return Ok(report);
        }

        let cooldown = Duration::minutes(policy.sweep_cooldown_minutes as i64);
        for row in failed {
            let last = row.last_attempt_time.unwrap_or(row.updated_at);
            if now - last < cooldown {
                report.skipped += 1;
                continue;
            }
            if self
                .trigger
                .next_scheduled(SEND_SINGLE_TAG, &row.id.to_string())?
                .is_some()
            {
                report.skipped += 1;
                continue;
            }
            match self.requeue_failed(&row, now) {
                Ok(()) => report.retried += 1,
                Err(e) => {
                    tracing::warn!("⚠️ Daily retry could not requeue email {}: {e}", row.id);
                    report.errors.push(row.id);
                }
            }
        }

        tracing::info!(
            "🔁 Daily retry: {} retried, {} skipped, {} errors (threshold {} days)",
            report.retried,
            report.skipped,
            report.errors.len(),
            policy.daily_threshold_days
        );
        Ok(report)
    }

    fn requeue_failed(&self, row: &QueuedEmail, now: DateTime<Utc>) -> Result<()> {
        let at = now + Duration::seconds(REQUEUE_DELAY_SECS);
        let patch = QueuePatch {
            status: Some(JobStatus::Scheduled),
            retry_count: Some(0),
            daily_retry_count: Some(row.daily_retry_count + 1),
            scheduled_time: Some(at),
            last_error_message: Some(None),
            ..Default::default()
        };
        self.store.update_if_version(row.id, row.version, &patch)?;
        self.trigger.register(at, SEND_SINGLE_TAG, &row.id.to_string())?;
        self.jobs.update_by_uid(
            &row.id.to_string(),
            &JobLogPatch::reschedule(at, JobStatus::Scheduled),
        )?;
        tracing::info!(
            "🔁 Email {} to {} requeued (daily retry {})",
            row.id,
            row.to_email,
            row.daily_retry_count + 1
        );
        Ok(())
    }

    /// Operator-initiated resend: reset live retries and fire in a minute.
    pub fn manual_retry(&self, id: i64) -> Result<bool> {
        if self.store.get(id)?.is_none() {
            return Ok(false);
        }
        let at = Utc::now() + Duration::seconds(REQUEUE_DELAY_SECS);
        let patch = QueuePatch {
            status: Some(JobStatus::Scheduled),
            retry_count: Some(0),
            scheduled_time: Some(at),
            last_error_message: Some(None),
            ..Default::default()
        };
        self.store.update(id, &patch)?;
        self.trigger.register(at, SEND_SINGLE_TAG, &id.to_string())?;
        self.jobs.update_by_uid(
            &id.to_string(),
            &JobLogPatch::reschedule(at, JobStatus::Scheduled),
        )?;
        tracing::info!("🔁 Email {id} manually requeued for {}", fmt_ts(at));
        Ok(true)
    }

    /// Re-register scheduled or retrying emails that have no pending fire,
    /// at their scheduled time or now if that has passed. Returns how many
    /// were recovered.
    pub fn recover_orphans(&self) -> Result<usize> {
        let now = Utc::now();
        let mut recovered = 0;
        for row in self.store.pending()? {
            let payload = row.id.to_string();
            if self.trigger.next_scheduled(SEND_SINGLE_TAG, &payload)?.is_some() {
                continue;
            }
            let at = row.scheduled_time.max(now);
            self.trigger.register(at, SEND_SINGLE_TAG, &payload)?;
            tracing::warn!(
                "🩹 Email {} had no pending fire, re-registered for {}",
                row.id,
                fmt_ts(at)
            );
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Daily trigger action: keep the next run registered, then sweep.
    pub fn run_daily_retry(&self) -> Result<SweepReport> {
        if !self.policy().daily_retry_enabled {
            tracing::info!("🔁 Daily retry disabled, not sweeping");
            return Ok(SweepReport::default());
        }
        // the firing registration is only leased, so move it to tomorrow
        self.register_daily_retry(&self.policy())?;
        self.retry_all_failed()
    }

    /// Register the daily sweep for tomorrow at the configured hour unless
    /// one is already pending. Returns the pending run time.
    pub fn schedule_daily_retry(&self) -> Result<Option<DateTime<Utc>>> {
        let policy = self.policy();
        if !policy.daily_retry_enabled {
            return Ok(None);
        }
        if let Some(at) = self.trigger.next_scheduled(DAILY_RETRY_TAG, "")? {
            return Ok(Some(at));
        }
        self.register_daily_retry(&policy).map(Some)
    }

    fn register_daily_retry(&self, policy: &RetryPolicy) -> Result<DateTime<Utc>> {
        let at = next_daily_run(Utc::now(), policy.daily_hour);
        self.trigger.register(at, DAILY_RETRY_TAG, "")?;
        tracing::info!("⏰ Daily retry scheduled for {}", fmt_ts(at));
        Ok(at)
    }

    pub fn next_daily_retry(&self) -> Result<Option<DateTime<Utc>>> {
        self.trigger.next_scheduled(DAILY_RETRY_TAG, "")
    }

    // ── Settings ───────────────────────────────────────────

    pub fn set_max_retries(&self, max_retries: u32) -> Result<()> {
        self.settings.set(MAX_RETRIES, &max_retries.to_string())
    }

    pub fn set_retry_delay(&self, minutes: u32) -> Result<()> {
        self.settings
            .set(RETRY_DELAY_BASE_MINUTES, &minutes.to_string())
    }

    pub fn set_daily_retry_threshold(&self, days: u32) -> Result<()> {
        self.settings
            .set(DAILY_RETRY_THRESHOLD_DAYS, &days.to_string())
    }

    /// Persist the switch and add or remove the daily registration.
    pub fn set_daily_retry(&self, enable: bool) -> Result<()> {
        self.settings
            .set(DAILY_RETRY_ENABLED, if enable { "1" } else { "0" })?;
        if enable {
            self.schedule_daily_retry()?;
        } else {
            self.trigger.cancel(DAILY_RETRY_TAG, "")?;
        }
        Ok(())
    }

    // ── Introspection & maintenance ────────────────────────

    pub fn pending_emails(&self) -> Result<Vec<PendingEmail>> {
        let now = Utc::now();
        Ok(self
            .store
            .pending()?
            .into_iter()
            .map(|row| PendingEmail {
                has_validation: row.has_validation(),
                days_remaining: days_until(now, row.scheduled_time),
                id: row.id,
                email_id: row.email_id,
                to: row.to_email,
                subject: row.subject,
                send_time: row.scheduled_time,
                retry_count: row.retry_count,
                status: row.status,
            })
            .collect())
    }

    pub fn retry_info(&self, id: i64) -> Result<Option<RetryInfo>> {
        Ok(self.store.get(id)?.map(|row| RetryInfo {
            retry_count: row.retry_count,
            daily_retry_count: row.daily_retry_count,
            max_retries: row.max_retries,
            last_attempt_time: row.last_attempt_time,
            last_error_message: row.last_error_message,
        }))
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        self.store.stats()
    }

    /// Delete completed, canceled and skipped emails older than `days`.
    pub fn cleanup_old_emails(&self, days: u32) -> Result<usize> {
        let deleted = self.store.cleanup_old(days)?;
        if deleted > 0 {
            tracing::info!("🧹 Cleaned up {deleted} old emails");
        }
        Ok(deleted)
    }

    pub fn get_email(&self, id: i64) -> Result<Option<QueuedEmail>> {
        self.store.get(id)
    }

    pub fn sequence_emails(&self, sequence_id: &str) -> Result<Vec<QueuedEmail>> {
        self.store.by_sequence(sequence_id)
    }

    pub fn email_logs(&self, limit: usize) -> Result<Vec<EmailLogEntry>> {
        self.logs.recent(limit)
    }
}

/// Row args plus `has_notes` / `notes` from the row.
fn execution_context(row: &QueuedEmail) -> Context {
    let mut ctx = row.args.clone();
    match row.notes.as_deref().filter(|n| !n.is_empty()) {
        Some(notes) => {
            ctx.insert("has_notes".into(), Value::Bool(true));
            ctx.insert("notes".into(), Value::String(notes.to_string()));
        }
        None => {
            ctx.insert("has_notes".into(), Value::Bool(false));
        }
    }
    ctx
}

fn build_headers(ctx: &Context) -> Vec<String> {
    let field = |key: &str| {
        ctx.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let mut headers = Vec::new();
    if let Some(content_type) = field("content_type") {
        let charset = field("charset").unwrap_or("UTF-8");
        headers.push(format!("Content-Type: {content_type}; charset={charset}"));
    }
    if let Some(email) = field("from_email") {
        match field("from_name") {
            Some(name) => headers.push(format!("From: {name} <{email}>")),
            None => headers.push(format!("From: {email}")),
        }
    }
    headers
}

/// Whole days until `at`, rounded up.
fn days_until(now: DateTime<Utc>, at: DateTime<Utc>) -> i64 {
    let secs = (at - now).num_seconds();
    (secs as f64 / 86_400.0).ceil() as i64
}
