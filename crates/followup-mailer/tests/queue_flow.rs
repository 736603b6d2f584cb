//! End-to-end: queue emails, fire them through the runner against a
//! SQLite-backed trigger table, and watch retries land.

use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use followup_core::{Context, Db, FollowupConfig, JobStatus, SqliteSettings};
use followup_mailer::{
    DAILY_RETRY_TAG, EmailQueue, EmailRequest, FollowupSequence, MemoryTransport, SEND_SINGLE_TAG,
    SendAt, SendOutcome, SequenceStep,
};
use followup_scheduler::{Callable, CallbackRegistry, HostTrigger, SqliteTrigger, TriggerRunner};
use serde_json::{Value, json};

struct World {
    queue: Arc<EmailQueue>,
    trigger: Arc<SqliteTrigger>,
    transport: Arc<MemoryTransport>,
    registry: Arc<CallbackRegistry>,
    runner: TriggerRunner,
}

fn world() -> World {
    let db = Db::open_in_memory().unwrap();
    let trigger = Arc::new(SqliteTrigger::new(db.clone()).unwrap());
    let transport = Arc::new(MemoryTransport::new());
    let registry = Arc::new(CallbackRegistry::new());
    let settings = Arc::new(SqliteSettings::new(db.clone()).unwrap());

    let mut config = FollowupConfig::default();
    config.site.name = "Acme".into();
    config.site.admin_email = "shop@acme.test".into();

    let mut queue = EmailQueue::new(
        &db,
        trigger.clone(),
        registry.clone(),
        transport.clone(),
        settings,
        config,
    )
    .unwrap();
    queue
        .renderer_mut()
        .register_tag("order_id", |ctx| match ctx.get("order_id") {
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        });
    let queue = Arc::new(queue);

    let mut runner = TriggerRunner::new(trigger.clone());
    queue.register_actions(&mut runner);

    World {
        queue,
        trigger,
        transport,
        registry,
        runner,
    }
}

fn order_context(order_id: i64) -> Context {
    match json!({"order_id": order_id, "customer_name": "Dana"}) {
        Value::Object(map) => map,
        _ => Context::new(),
    }
}

#[tokio::test]
async fn queued_email_is_sent_when_due() {
    let w = world();
    let id = w
        .queue
        .send_later(
            EmailRequest::new(
                "dana@example.com",
                "How was order #{order_id}?",
                "Hi {customer_name}, thanks for shopping at {site_name}.",
                SendAt::Days(0),
            )
            .named("review_request")
            .with_context(order_context(77)),
        )
        .unwrap();

    assert_eq!(w.runner.run_due(Utc::now() + Duration::seconds(1)).await.unwrap(), 1);

    let sent = w.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "How was order #77?");
    assert_eq!(sent[0].body, "Hi Dana, thanks for shopping at Acme.");
    assert_eq!(sent[0].header("From"), Some("Acme <shop@acme.test>"));

    let row = w.queue.get_email(id).unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Completed);
    let job = w.queue.jobs().get_by_uid(&id.to_string()).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(w.queue.notifier().emitted("followup_emailer_review_request").len(), 1);
}

#[tokio::test]
async fn failed_send_is_refired_after_backoff() {
    let w = world();
    let id = w
        .queue
        .send_later(EmailRequest::new("dana@example.com", "Hi", "Body", SendAt::Days(0)))
        .unwrap();
    w.transport.fail_next(1, "451 try again later");

    w.runner.run_due(Utc::now() + Duration::seconds(1)).await.unwrap();
    let row = w.queue.get_email(id).unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Retrying);
    assert_eq!(row.retry_count, 1);

    let next = w
        .trigger
        .next_scheduled(SEND_SINGLE_TAG, &id.to_string())
        .unwrap()
        .unwrap();
    assert!(next > Utc::now() + Duration::minutes(4));

    // not due yet
    assert_eq!(w.runner.run_due(Utc::now()).await.unwrap(), 0);
    assert_eq!(w.runner.run_due(next + Duration::seconds(1)).await.unwrap(), 1);
    assert_eq!(w.queue.get_email(id).unwrap().unwrap().status, JobStatus::Completed);

    let attempts = w.queue.email_logs(10).unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].sent, SendOutcome::Sent);
    assert_eq!(attempts[1].sent, SendOutcome::Failed);
}

#[tokio::test]
async fn sequence_respects_unsubscribe_and_cancel() {
    let w = world();
    let unsubscribed = Arc::new(Mutex::new(false));
    let flag = unsubscribed.clone();
    w.registry.register_function("still_subscribed", move |_| {
        Ok(json!(!*flag.lock().unwrap()))
    });

    let seq_id = w
        .queue
        .create_followup_sequence(
            FollowupSequence::new("dana@example.com")
                .with_uid("order_77")
                .validated_by(Callable::function("still_subscribed"))
                .step(SequenceStep::new(SendAt::Days(0), "First", "one"))
                .step(SequenceStep::new(SendAt::Days(2), "Second", "two"))
                .step(SequenceStep::new(SendAt::Days(5), "Third", "three")),
        )
        .unwrap();

    w.runner.run_due(Utc::now() + Duration::seconds(1)).await.unwrap();
    assert_eq!(w.transport.sent_count(), 1);

    *unsubscribed.lock().unwrap() = true;
    w.runner
        .run_due(Utc::now() + Duration::days(2) + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(w.transport.sent_count(), 1);

    assert_eq!(w.queue.cancel_sequence(&seq_id).unwrap(), 1);
    assert_eq!(
        w.runner.run_due(Utc::now() + Duration::days(6)).await.unwrap(),
        0
    );

    let statuses: Vec<JobStatus> = w
        .queue
        .sequence_emails(&seq_id)
        .unwrap()
        .into_iter()
        .map(|row| row.status)
        .collect();
    assert_eq!(
        statuses,
        vec![JobStatus::Completed, JobStatus::Skipped, JobStatus::Canceled]
    );
}

#[tokio::test]
async fn daily_retry_requeues_and_reregisters() {
    let w = world();
    w.queue.set_max_retries(0).unwrap();
    w.queue.set_daily_retry(true).unwrap();
    let first_daily = w.queue.next_daily_retry().unwrap().unwrap();

    let id = w
        .queue
        .send_later(EmailRequest::new("dana@example.com", "Hi", "Body", SendAt::Days(0)))
        .unwrap();
    w.transport.fail_next(1, "550 mailbox unavailable");
    w.runner.run_due(Utc::now() + Duration::seconds(1)).await.unwrap();
    let row = w.queue.get_email(id).unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Failed);
    assert_eq!(row.max_retries, 0);

    // the sweep ignores failures inside the cool-down window
    let report = w.queue.retry_all_failed().unwrap();
    assert_eq!((report.total, report.retried, report.skipped), (1, 0, 1));

    // the daily fire moves its own registration forward
    w.trigger.register(Utc::now(), DAILY_RETRY_TAG, "").unwrap();
    w.runner.run_due(Utc::now() + Duration::seconds(1)).await.unwrap();
    let next_daily = w.queue.next_daily_retry().unwrap().unwrap();
    assert!(next_daily >= first_daily);

    assert!(w.queue.manual_retry(id).unwrap());
    w.runner
        .run_due(Utc::now() + Duration::minutes(2))
        .await
        .unwrap();
    assert_eq!(w.queue.get_email(id).unwrap().unwrap().status, JobStatus::Completed);
}
