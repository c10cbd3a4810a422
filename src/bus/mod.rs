use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub mod events;

/// A handler failure is logged and never stops delivery to later subscribers.
pub type Handler = Arc<dyn Fn(&EventEnvelope) -> Result<(), String> + Send + Sync>;

pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub id: String,
    pub event_type: String,
    pub source: String,
    pub target: Option<String>,
    pub payload: Value,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

struct SubscriberEntry {
    token: SubscriptionToken,
    name: String,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    next_token: u64,
    subscribers: BTreeMap<String, Vec<SubscriberEntry>>,
}

/// Single-process publish/subscribe fabric. Delivery is synchronous within the
/// publishing stack and ordered by subscription time; the wildcard `*`
/// receives every envelope. The `target` field is advisory only, envelopes
/// are always broadcast.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    log_root: Option<PathBuf>,
}

impl EventBus {
    pub fn new(log_root: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner::default())),
            log_root,
        }
    }

    pub fn subscribe(
        &self,
        event_type: &str,
        subscriber: &str,
        handler: Handler,
    ) -> SubscriptionToken {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.next_token += 1;
        let token = SubscriptionToken(inner.next_token);
        inner
            .subscribers
            .entry(event_type.to_string())
            .or_default()
            .push(SubscriberEntry {
                token,
                name: subscriber.to_string(),
                handler,
            });
        token
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        for entries in inner.subscribers.values_mut() {
            entries.retain(|entry| entry.token != token);
        }
    }

    pub fn publish(
        &self,
        event_type: &str,
        source: &str,
        target: Option<&str>,
        payload: Value,
    ) -> EventEnvelope {
        let envelope = EventEnvelope {
            id: crate::shared::ids::new_uuid(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            target: target.map(str::to_string),
            payload,
            timestamp: crate::shared::ids::now_iso(),
        };

        // Handlers are cloned out so a subscriber can publish or unsubscribe
        // from inside its own callback without deadlocking the registry.
        let handlers: Vec<(SubscriptionToken, String, Handler)> = {
            let inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut selected: Vec<&SubscriberEntry> = Vec::new();
            if let Some(entries) = inner.subscribers.get(event_type) {
                selected.extend(entries.iter());
            }
            if event_type != WILDCARD {
                if let Some(entries) = inner.subscribers.get(WILDCARD) {
                    selected.extend(entries.iter());
                }
            }
            selected.sort_by_key(|entry| entry.token.0);
            selected
                .into_iter()
                .map(|entry| (entry.token, entry.name.clone(), entry.handler.clone()))
                .collect()
        };

        for (_, name, handler) in handlers {
            if let Err(err) = handler(&envelope) {
                self.log_handler_failure(&name, event_type, &err);
            }
        }

        envelope
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner
            .subscribers
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn log_handler_failure(&self, subscriber: &str, event_type: &str, err: &str) {
        if let Some(root) = &self.log_root {
            crate::shared::logging::append_core_log(
                root,
                "warn",
                "bus.handler.failed",
                &format!("{subscriber} on {event_type}: {err}"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivery_reaches_type_and_wildcard_subscribers_in_order() {
        let bus = EventBus::new(None);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_a = seen.clone();
        bus.subscribe(
            "task:created",
            "a",
            Arc::new(move |env| {
                seen_a.lock().unwrap().push(format!("a:{}", env.event_type));
                Ok(())
            }),
        );
        let seen_b = seen.clone();
        bus.subscribe(
            WILDCARD,
            "b",
            Arc::new(move |env| {
                seen_b.lock().unwrap().push(format!("b:{}", env.event_type));
                Ok(())
            }),
        );

        bus.publish("task:created", "test", None, json!({"taskId": "t1"}));
        bus.publish("draft:created", "test", None, json!({}));

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "a:task:created".to_string(),
                "b:task:created".to_string(),
                "b:draft:created".to_string()
            ]
        );
    }

    #[test]
    fn failing_handler_does_not_abort_remaining_delivery() {
        let bus = EventBus::new(None);
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            "task:created",
            "failing",
            Arc::new(|_| Err("boom".to_string())),
        );
        let counter = delivered.clone();
        bus.subscribe(
            "task:created",
            "counting",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        bus.publish("task:created", "test", None, json!({}));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_token_stops_delivery() {
        let bus = EventBus::new(None);
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        let token = bus.subscribe(
            "task:created",
            "once",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        bus.publish("task:created", "test", None, json!({}));
        bus.unsubscribe(token);
        bus.publish("task:created", "test", None, json!({}));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_may_publish_from_inside_a_callback() {
        let bus = EventBus::new(None);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner_bus = bus.clone();
        bus.subscribe(
            "task:created",
            "chain",
            Arc::new(move |_| {
                inner_bus.publish("task:completed", "chain", None, json!({}));
                Ok(())
            }),
        );
        let seen_done = seen.clone();
        bus.subscribe(
            "task:completed",
            "sink",
            Arc::new(move |env| {
                seen_done.lock().unwrap().push(env.event_type.clone());
                Ok(())
            }),
        );

        bus.publish("task:created", "test", None, json!({}));
        assert_eq!(seen.lock().unwrap().clone(), vec!["task:completed"]);
    }

    #[test]
    fn envelope_carries_advisory_target_without_filtering() {
        let bus = EventBus::new(None);
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        bus.subscribe(
            "conductor:review-request",
            "other-conductor",
            Arc::new(move |env| {
                assert_eq!(env.target.as_deref(), Some("quality"));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        bus.publish(
            "conductor:review-request",
            "chief",
            Some("quality"),
            json!({}),
        );
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
