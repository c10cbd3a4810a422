use super::triage::{default_rules, triage, TriageRule};
use super::{payload_str, Conductor, ConductorError};
use crate::bus::{events, EventBus, EventEnvelope, SubscriptionToken};
use crate::domain::MessageStatus;
use crate::store::{NewTask, Store};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

pub const CONDUCTOR_NAME: &str = "inbox";

/// Turns `message:received` into a triaged task. Pure rule application plus
/// store writes, nothing else.
pub struct InboxConductor {
    store: Arc<Store>,
    bus: EventBus,
    rules: Arc<Mutex<Vec<TriageRule>>>,
    tokens: Mutex<Vec<SubscriptionToken>>,
}

impl InboxConductor {
    pub fn new(store: Arc<Store>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            rules: Arc::new(Mutex::new(default_rules())),
            tokens: Mutex::new(Vec::new()),
        }
    }

    /// Swap the triage ladder without restarting the conductor.
    pub fn replace_rules(&self, rules: Vec<TriageRule>) {
        if let Ok(mut current) = self.rules.lock() {
            *current = rules;
        }
    }

    fn on_message_received(
        store: &Store,
        bus: &EventBus,
        rules: &Mutex<Vec<TriageRule>>,
        envelope: &EventEnvelope,
    ) -> Result<(), ConductorError> {
        let message_id = payload_str(&envelope.payload, "messageId")?;
        let Some(message) = store.find_message(message_id)? else {
            return Err(ConductorError::Store(crate::store::StoreError::NotFound {
                entity: "message",
                id: message_id.to_string(),
            }));
        };
        if message.status != MessageStatus::New {
            return Ok(());
        }

        let decision = {
            let rules = rules.lock().map_err(|_| {
                ConductorError::Store(crate::store::StoreError::LockPoisoned)
            })?;
            triage(&message, &rules)
        };

        store.update_message_status(&message.id, MessageStatus::Processing)?;

        let mut new_task = NewTask::new(decision.agent_type.clone(), decision.priority);
        new_task.payload.insert(
            "messageId".to_string(),
            Value::from(message.id.clone()),
        );
        new_task.payload.insert(
            "category".to_string(),
            Value::from(decision.category.clone()),
        );
        new_task.payload.insert(
            "triageReason".to_string(),
            Value::from(decision.reason.clone()),
        );
        new_task.source_channel = Some(message.channel.clone());
        new_task.source_message_id = Some(message.id.clone());
        new_task.conductor_id = Some(CONDUCTOR_NAME.to_string());
        let task = store.insert_task(&new_task)?;
        store.attach_message_task(&message.id, &task.id)?;

        bus.publish(
            events::TASK_CREATED,
            CONDUCTOR_NAME,
            None,
            json!({
                "taskId": task.id,
                "taskType": task.task_type,
                "priority": task.priority,
                "payload": task.payload,
            }),
        );
        bus.publish(
            events::MESSAGE_PROCESSED,
            CONDUCTOR_NAME,
            None,
            json!({ "messageId": message.id, "taskId": task.id }),
        );
        Ok(())
    }
}

impl Conductor for InboxConductor {
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
        let rules = self.rules.clone();
        let token = self.bus.subscribe(
            events::MESSAGE_RECEIVED,
            CONDUCTOR_NAME,
            Arc::new(move |envelope| {
                Self::on_message_received(&store, &bus, &rules, envelope)
                    .map_err(|err| err.to_string())
            }),
        );
        tokens.push(token);
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
