use super::{payload_str, Conductor, ConductorError};
use crate::bus::{events, EventBus, EventEnvelope, SubscriptionToken};
use crate::domain::MessageStatus;
use crate::store::Store;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub const CONDUCTOR_NAME: &str = "context";

const THREAD_FETCH_LIMIT: usize = 20;
const BODY_TRIM_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeHit {
    pub title: String,
    pub snippet: String,
    pub reference: Option<String>,
}

/// Read-only lookup the Context conductor may consult. Failures are logged
/// and skipped; a source can never fail the conductor.
pub trait KnowledgeSource: Send + Sync {
    fn name(&self) -> &str;
    fn query(&self, query: &str) -> Result<Vec<KnowledgeHit>, String>;
}

/// Assembles a context bundle (thread history plus knowledge hits) for every
/// freshly created task that references a threaded source message.
pub struct ContextConductor {
    store: Arc<Store>,
    bus: EventBus,
    sources: Vec<Arc<dyn KnowledgeSource>>,
    log_root: Option<PathBuf>,
    tokens: Mutex<Vec<SubscriptionToken>>,
}

impl ContextConductor {
    pub fn new(store: Arc<Store>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            sources: Vec::new(),
            log_root: None,
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn KnowledgeSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_log_root(mut self, log_root: PathBuf) -> Self {
        self.log_root = Some(log_root);
        self
    }

    fn on_task_created(
        store: &Store,
        bus: &EventBus,
        sources: &[Arc<dyn KnowledgeSource>],
        log_root: Option<&PathBuf>,
        envelope: &EventEnvelope,
    ) -> Result<(), ConductorError> {
        // Routed republications describe the same task a second time.
        if envelope
            .payload
            .get("routed")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Ok(());
        }
        let task_id = payload_str(&envelope.payload, "taskId")?;
        let Some(task) = store.find_task(task_id)? else {
            return Ok(());
        };
        let Some(message_id) = task.source_message_id.clone() else {
            return Ok(());
        };
        let Some(message) = store.find_message(&message_id)? else {
            return Ok(());
        };
        let Some(thread_id) = message.thread_id.clone() else {
            return Ok(());
        };

        // Global fetch, thread filter in memory; the thread-scoped query
        // exists on the store if this ever needs widening.
        let handled = store.find_messages_by_status(MessageStatus::Handled, THREAD_FETCH_LIMIT)?;
        let thread: Vec<Value> = handled
            .iter()
            .filter(|m| m.thread_id.as_deref() == Some(thread_id.as_str()))
            .map(|m| {
                json!({
                    "messageId": m.id,
                    "from": m.from,
                    "subject": m.subject,
                    "body": trim_chars(&m.body, BODY_TRIM_CHARS),
                    "createdAt": m.created_at,
                })
            })
            .collect();

        let query = message
            .metadata
            .get("caseRef")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| message.id.clone());
        let mut knowledge = Vec::new();
        for source in sources {
            match source.query(&query) {
                Ok(hits) => {
                    for hit in hits {
                        knowledge.push(json!({
                            "source": source.name(),
                            "title": hit.title,
                            "snippet": hit.snippet,
                            "reference": hit.reference,
                        }));
                    }
                }
                Err(err) => {
                    if let Some(root) = log_root {
                        crate::shared::logging::append_core_log(
                            root,
                            "warn",
                            "context.knowledge.failed",
                            &format!("{}: {err}", source.name()),
                        );
                    }
                }
            }
        }

        bus.publish(
            events::CONDUCTOR_CONTEXT_READY,
            CONDUCTOR_NAME,
            None,
            json!({
                "taskId": task.id,
                "messageId": message.id,
                "threadId": thread_id,
                "thread": thread,
                "knowledge": knowledge,
            }),
        );
        Ok(())
    }
}

impl Conductor for ContextConductor {
    fn name(&self) -> &'static str {
        CONDUCTOR_NAME
    }

    fn start(&self) -> Result<(), ConductorError> {
        let mut tokens = match self.tokens.lock() {
            Ok(tokens) => tokens,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !tokens.is_empty() {
            return Ok(());
        }

        let store = self.store.clone();
        let bus = self.bus.clone();
        let sources = self.sources.clone();
        let log_root = self.log_root.clone();
        tokens.push(self.bus.subscribe(
            events::TASK_CREATED,
            CONDUCTOR_NAME,
            Arc::new(move |envelope| {
                Self::on_task_created(&store, &bus, &sources, log_root.as_ref(), envelope)
                    .map_err(|err| err.to_string())
            }),
        ));
        Ok(())
    }

    fn stop(&self) {
        let mut tokens = match self.tokens.lock() {
            Ok(tokens) => tokens,
            Err(poisoned) => poisoned.into_inner(),
        };
        for token in tokens.drain(..) {
            self.bus.unsubscribe(token);
        }
    }
}

fn trim_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}
