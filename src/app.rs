//! Process wiring: one database holding the trigger table, the deferred
//! scheduler and the email queue, all sharing one callback registry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use followup_core::{
    Context, Db, FollowupConfig, FollowupError, Result, SettingsStore, SqliteSettings,
};
use followup_mailer::{
    EmailQueue, FollowupSequence, Notifier, SendAt, SequenceStep, Transport, hook_name,
    next_daily_run,
};
use followup_scheduler::{
    CRON_TAG, Callable, CallbackRegistry, ClassDef, DeferredScheduler, JobLogStore, PayloadStore,
    ScheduleRequest, SqliteTrigger, TriggerRunner, job_uid, spawn_runner,
};
use serde::Deserialize;
use serde_json::{Value, json};

/// Validation predicate: false once the recipient has unsubscribed.
pub const SUBSCRIBED_CHECK: &str = "recipient_subscribed";
/// Context key carrying the recipient address for predicates and listeners.
pub const RECIPIENT_KEY: &str = "recipient";
pub const REVIEW_REQUEST: &str = "review_request";
pub const FOLLOWUP: &str = "followup";
pub const MAINTENANCE_HOOK: &str = "followup_maintenance";
const MAINTENANCE_HOUR: u32 = 3;

pub fn unsubscribe_key(email: &str) -> String {
    format!("unsubscribed:{}", email.trim().to_lowercase())
}

/// Copy the recipient into the context unless the caller set one.
pub fn with_recipient(mut context: Context, to: &str) -> Context {
    context
        .entry(RECIPIENT_KEY)
        .or_insert_with(|| Value::String(to.to_string()));
    context
}

pub struct App {
    pub config: FollowupConfig,
    pub settings: Arc<SqliteSettings>,
    pub trigger: Arc<SqliteTrigger>,
    pub registry: Arc<CallbackRegistry>,
    pub scheduler: Arc<DeferredScheduler>,
    pub queue: Arc<EmailQueue>,
}

impl App {
    pub fn build(config: FollowupConfig, db: Db, transport: Arc<dyn Transport>) -> Result<Self> {
        let settings = Arc::new(SqliteSettings::new(db.clone())?);
        let trigger = Arc::new(SqliteTrigger::new(db.clone())?);
        let registry = Arc::new(CallbackRegistry::new());
        let scheduler = Arc::new(DeferredScheduler::new(
            JobLogStore::new(db.clone())?,
            PayloadStore::new(db.clone())?,
            trigger.clone(),
            registry.clone(),
        ));
        let queue = EmailQueue::new(
            &db,
            trigger.clone(),
            registry.clone(),
            transport,
            settings.clone(),
            config.clone(),
        )?;

        register_callbacks(&registry, &settings, &queue, &scheduler, &config);
        subscribe_listeners(queue.notifier(), settings.clone());

        Ok(Self {
            config,
            settings,
            trigger,
            registry,
            scheduler,
            queue: Arc::new(queue),
        })
    }

    /// Runner with every action this process knows about.
    pub fn runner(self: &Arc<Self>) -> TriggerRunner {
        let mut runner =
            TriggerRunner::new(self.trigger.clone()).with_batch_size(self.config.runner.batch_size);

        let app = self.clone();
        runner.on(CRON_TAG, move |uid: String| {
            let app = app.clone();
            async move {
                app.scheduler.execute(&uid)?;
                if uid == job_uid(MAINTENANCE_HOOK, true) {
                    app.ensure_maintenance()?;
                }
                Ok::<(), FollowupError>(())
            }
        });
        self.queue.register_actions(&mut runner);
        runner
    }

    /// Keep one maintenance job pending. Returns the newly scheduled time,
    /// or `None` if one was already waiting.
    pub fn ensure_maintenance(&self) -> Result<Option<DateTime<Utc>>> {
        let uid = job_uid(MAINTENANCE_HOOK, true);
        if self.scheduler.pending_uids()?.contains(&uid) {
            return Ok(None);
        }
        let at = next_daily_run(Utc::now(), MAINTENANCE_HOUR);
        let retention = &self.config.retention;
        self.scheduler.schedule(
            ScheduleRequest::new(MAINTENANCE_HOOK, Callable::method("Maintenance", "cleanup"))
                .at(at)
                .with_args(json!({
                    "email_days": retention.email_queue_days,
                    "job_days": retention.job_log_days,
                }))
                .overriding(),
        )?;
        Ok(Some(at))
    }

    /// Startup housekeeping: the recurring registrations plus any queued
    /// email whose fire went missing. Returns the number of emails recovered.
    pub fn prepare(&self) -> Result<usize> {
        if let Some(at) = self.queue.schedule_daily_retry()? {
            tracing::info!("🔁 Next daily retry: {at}");
        }
        self.ensure_maintenance()?;
        let recovered = self.queue.recover_orphans()?;
        if recovered > 0 {
            tracing::warn!("🩹 Re-registered {recovered} email(s) with no pending fire");
        }
        Ok(recovered)
    }

    /// Poll triggers until Ctrl-C.
    pub async fn run(self: Arc<Self>, interval_secs: u64) -> Result<()> {
        self.prepare()?;

        let runner = Arc::new(self.runner());
        tokio::select! {
            _ = spawn_runner(runner, interval_secs) => {}
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("👋 Shutting down");
            }
        }
        Ok(())
    }
}

fn register_callbacks(
    registry: &CallbackRegistry,
    settings: &Arc<SqliteSettings>,
    queue: &EmailQueue,
    scheduler: &DeferredScheduler,
    config: &FollowupConfig,
) {
    let lookup = settings.clone();
    registry.register_function(SUBSCRIBED_CHECK, move |args| {
        let recipient = args
            .get(RECIPIENT_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| "no recipient in context".to_string())?;
        Ok(Value::Bool(!lookup.get_bool(&unsubscribe_key(recipient))))
    });

    let emails = queue.store().clone();
    let jobs = scheduler.jobs().clone();
    let email_days = config.retention.email_queue_days;
    let job_days = config.retention.job_log_days;
    registry.register_class(
        "Maintenance",
        ClassDef::new().static_method("cleanup", move |args| {
            let days = |key: &str, fallback: u32| {
                args.get(key)
                    .and_then(Value::as_u64)
                    .map_or(fallback, |d| d as u32)
            };
            let removed_emails = emails
                .cleanup_old(days("email_days", email_days))
                .map_err(|e| e.to_string())?;
            let removed_jobs = jobs
                .cleanup_older_than(days("job_days", job_days))
                .map_err(|e| e.to_string())?;
            tracing::info!(
                "🧹 Maintenance: {removed_emails} email(s), {removed_jobs} job log row(s) removed"
            );
            Ok(json!({ "emails": removed_emails, "jobs": removed_jobs }))
        }),
    );
}

fn subscribe_listeners(notifier: &Notifier, settings: Arc<SqliteSettings>) {
    notifier.subscribe(&hook_name(Some(REVIEW_REQUEST)), |n| {
        tracing::info!("⭐ Review request delivered: {}", n.payload["args"]);
    });
    notifier.subscribe(&hook_name(Some(FOLLOWUP)), |n| {
        tracing::info!(
            "📨 Follow-up delivered (sent = {}): {}",
            n.payload["sent"],
            n.payload["args"]
        );
    });

    // a review request that bounced for good stops the rest of the series
    notifier.subscribe(
        &format!("{}_failed", hook_name(Some(REVIEW_REQUEST))),
        move |n| {
            let Some(recipient) = n.payload["args"].get(RECIPIENT_KEY).and_then(Value::as_str)
            else {
                return;
            };
            match settings.set(&unsubscribe_key(recipient), "1") {
                Ok(()) => tracing::info!("🔕 {recipient} unsubscribed after failed review request"),
                Err(e) => tracing::warn!("⚠️ Could not unsubscribe {recipient}: {e}"),
            }
        },
    );
}

/// JSON description of a sequence, as accepted by `followup sequence <file>`.
#[derive(Debug, Deserialize)]
pub struct SequenceFile {
    pub to: String,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub context: Context,
    /// Gate every step on the recipient still being subscribed.
    #[serde(default)]
    pub check_subscribed: bool,
    pub steps: Vec<StepFile>,
}

#[derive(Debug, Deserialize)]
pub struct StepFile {
    /// Days from now, or a unix timestamp.
    pub at: i64,
    pub subject: String,
    pub message: String,
    #[serde(default)]
    pub replaces: Option<i64>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SequenceFile {
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn into_sequence(self) -> FollowupSequence {
        let mut seq = FollowupSequence::new(&self.to)
            .with_context(with_recipient(self.context, &self.to));
        if let Some(uid) = &self.uid {
            seq = seq.with_uid(uid);
        }
        if let Some(name) = &self.name {
            seq = seq.named(name);
        }
        if self.check_subscribed {
            seq = seq.validated_by(Callable::function(SUBSCRIBED_CHECK));
        }
        for step in self.steps {
            let mut next = SequenceStep::new(SendAt::from_raw(step.at), &step.subject, &step.message);
            if let Some(id) = step.replaces {
                next = next.replacing(id);
            }
            if let Some(notes) = &step.notes {
                next = next.with_notes(notes);
            }
            seq = seq.step(next);
        }
        seq
    }
}
