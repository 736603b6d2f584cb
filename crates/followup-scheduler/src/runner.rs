//! Trigger runner: polls the host trigger and dispatches due registrations
//! to the action registered for their tag.
//! Uses tokio::interval, so it sleeps between polls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use followup_core::Result;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::trigger::{CLAIM_LEASE_SECS, HostTrigger};

/// Async action invoked with the registration payload.
pub type ActionHandler = Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct TriggerRunner {
    trigger: Arc<dyn HostTrigger>,
    actions: HashMap<String, ActionHandler>,
    batch_size: usize,
    lease: Duration,
}

impl TriggerRunner {
    pub fn new(trigger: Arc<dyn HostTrigger>) -> Self {
        Self {
            trigger,
            actions: HashMap::new(),
            batch_size: 50,
            lease: Duration::seconds(CLAIM_LEASE_SECS),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// How long a failed or interrupted fire waits before it is retried.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease.max(Duration::seconds(1));
        self
    }

    /// Bind an action to a tag. A later binding for the same tag replaces the earlier one.
    pub fn on<F, Fut>(&mut self, tag: &str, action: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: ActionHandler = Arc::new(move |payload: String| action(payload).boxed());
        self.actions.insert(tag.to_string(), handler);
    }

    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Claim everything due at `now` and run it, one registration at a time.
    /// A registration is acked only when its action succeeds; a failed one
    /// fires again after the lease. Returns the number dispatched.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut dispatched = 0;
        loop {
            let batch = self.trigger.claim_due(now, self.batch_size, self.lease)?;
            if batch.is_empty() {
                break;
            }
            let full = batch.len() == self.batch_size;

            for reg in batch {
                let Some(action) = self.actions.get(&reg.tag).cloned() else {
                    tracing::warn!("⚠️ No action bound for trigger '{}' ({})", reg.tag, reg.payload);
                    self.trigger.ack(&reg)?;
                    continue;
                };
                tracing::debug!("🔔 Trigger fired: {}({})", reg.tag, reg.payload);
                match action(reg.payload.clone()).await {
                    Ok(()) => self.trigger.ack(&reg)?,
                    Err(e) => tracing::error!(
                        "❌ Action '{}' failed for '{}', refiring after lease: {e}",
                        reg.tag,
                        reg.payload
                    ),
                }
                dispatched += 1;
            }

            if !full {
                break;
            }
        }
        Ok(dispatched)
    }
}

/// Spawn the polling loop. Runs until the task is dropped.
pub async fn spawn_runner(runner: Arc<TriggerRunner>, check_interval_secs: u64) {
    tracing::info!(
        "⏰ Trigger runner started (check every {}s, actions: {})",
        check_interval_secs,
        runner.tags().join(", ")
    );

    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(check_interval_secs.max(1)));

    loop {
        interval.tick().await;
        match runner.run_due(Utc::now()).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("📣 Dispatched {n} due trigger(s)"),
            Err(e) => tracing::error!("❌ Trigger poll failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::MemoryTrigger;
    use chrono::Duration;
    use followup_core::FollowupError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_run_due_dispatches_by_tag() {
        let trigger = Arc::new(MemoryTrigger::new());
        let past = Utc::now() - Duration::seconds(1);
        trigger.register(past, "send", "7").unwrap();
        trigger.register(past, "unknown", "x").unwrap();
        trigger.register(Utc::now() + Duration::hours(1), "send", "8").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut runner = TriggerRunner::new(trigger.clone());
        let sink = seen.clone();
        runner.on("send", move |payload| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(payload);
                Ok::<(), FollowupError>(())
            }
        });

        assert_eq!(runner.run_due(Utc::now()).await.unwrap(), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["7".to_string()]);
        // the unknown tag was claimed and dropped, the future one stays
        assert_eq!(trigger.count("unknown"), 0);
        assert_eq!(trigger.count("send"), 1);
    }

    #[tokio::test]
    async fn test_failing_action_does_not_stop_batch() {
        let trigger = Arc::new(MemoryTrigger::new());
        let past = Utc::now() - Duration::seconds(1);
        for i in 0..5 {
            trigger.register(past, "job", &i.to_string()).unwrap();
        }

        let mut runner = TriggerRunner::new(trigger.clone()).with_batch_size(2);
        runner.on("job", |payload| async move {
            if payload == "1" {
                Err(FollowupError::Other("boom".into()))
            } else {
                Ok(())
            }
        });

        assert_eq!(runner.run_due(Utc::now()).await.unwrap(), 5);
        let left: Vec<String> = trigger
            .pending()
            .unwrap()
            .into_iter()
            .map(|r| r.payload)
            .collect();
        assert_eq!(left, vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_action_refires_after_lease() {
        let trigger = Arc::new(MemoryTrigger::new());
        let now = Utc::now();
        trigger.register(now - Duration::seconds(1), "job", "42").unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let mut runner = TriggerRunner::new(trigger.clone()).with_lease(Duration::minutes(2));
        runner.on("job", move |_payload: String| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(FollowupError::Database("disk I/O error".into()))
                } else {
                    Ok(())
                }
            }
        });

        assert_eq!(runner.run_due(now).await.unwrap(), 1);
        assert_eq!(trigger.count("job"), 1);
        // still inside the lease
        assert_eq!(runner.run_due(now + Duration::minutes(1)).await.unwrap(), 0);

        assert_eq!(runner.run_due(now + Duration::minutes(3)).await.unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(trigger.count("job"), 0);
    }

    #[tokio::test]
    async fn test_action_that_reschedules_itself_is_kept() {
        let trigger = Arc::new(MemoryTrigger::new());
        let now = Utc::now();
        trigger.register(now - Duration::seconds(1), "tick", "").unwrap();

        let next = now + Duration::hours(1);
        let mut runner = TriggerRunner::new(trigger.clone());
        let handle = trigger.clone();
        runner.on("tick", move |payload: String| {
            let handle = handle.clone();
            async move { handle.register(next, "tick", &payload) }
        });

        assert_eq!(runner.run_due(now).await.unwrap(), 1);
        assert_eq!(trigger.next_scheduled("tick", "").unwrap(), Some(next));
    }
}
