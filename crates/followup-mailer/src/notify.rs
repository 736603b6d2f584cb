//! Outward notifications: listeners subscribe to a hook name and are called
//! synchronously when the queue emits it.
//! Lightweight: no queues, no background tasks. Keeps the last 100 emissions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Emitted once per inserted queue row.
pub const QUEUE_CREATED: &str = "email_queue_created";
/// Emitted once the row's trigger is registered.
pub const QUEUE_SCHEDULED: &str = "email_queue_scheduled";

const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub hook: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

pub type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Default)]
pub struct Notifier {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
    history: Mutex<VecDeque<Notification>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, hook: &str, listener: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(hook.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn listener_count(&self, hook: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(hook)
            .map_or(0, Vec::len)
    }

    /// Call every listener for `hook`, then record the emission.
    pub fn emit(&self, hook: &str, payload: Value) {
        let notification = Notification {
            hook: hook.to_string(),
            payload,
            timestamp: Utc::now(),
        };

        // listeners run without the lock held, so they may subscribe or emit
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(hook)
            .cloned()
            .unwrap_or_default();
        for listener in &listeners {
            listener(&notification);
        }
        tracing::debug!("📣 {hook} ({} listener(s))", listeners.len());

        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(notification);
        if history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }

    /// Recent emissions, oldest first.
    pub fn history(&self) -> Vec<Notification> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Recent emissions for one hook.
    pub fn emitted(&self, hook: &str) -> Vec<Notification> {
        self.history()
            .into_iter()
            .filter(|n| n.hook == hook)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscribe_and_emit() {
        let notifier = Notifier::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        notifier.subscribe("followup_emailer_review_request", move |n| {
            assert_eq!(n.payload["sent"], true);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        notifier.emit("followup_emailer_review_request", json!({"sent": true}));
        notifier.emit("other", json!(null));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.listener_count("followup_emailer_review_request"), 1);
        assert_eq!(notifier.history().len(), 2);
        assert_eq!(notifier.emitted("other").len(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let notifier = Notifier::new();
        for i in 0..150 {
            notifier.emit(QUEUE_CREATED, json!({ "id": i }));
        }
        let history = notifier.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].payload["id"], 50);
    }
}
