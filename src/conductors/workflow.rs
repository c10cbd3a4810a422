use super::{payload_str, Conductor, ConductorError};
use crate::approval::ApprovalEngine;
use crate::bus::{events, EventBus, EventEnvelope, SubscriptionToken};
use crate::config::OperationMode;
use crate::domain::{AgentOutput, Task, TaskStatus};
use crate::store::{NewTask, Store};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

pub const CONDUCTOR_NAME: &str = "workflow";

/// Task types that get a multi-step plan instead of direct routing.
pub const COMPLEX_TASK_TYPES: &[&str] = &[
    "multi-step-response",
    "batch-processing",
    "research-and-report",
];

/// Task types whose completed output becomes a reviewable draft.
pub const DRAFT_TASK_TYPES: &[&str] = &[
    "urgent-email",
    "billing-email",
    "complaint-email",
    "scheduling-email",
    "general-email",
    "multi-step-response",
    "respond",
    "report",
];

const DEPENDENCY_SCAN_LIMIT: usize = 200;

/// Plans complex tasks into sub-task graphs, routes simple ones to the queue
/// consumer, and turns completed draft-producing work into drafts (or a
/// sandbox dry-run).
pub struct WorkflowConductor {
    store: Arc<Store>,
    bus: EventBus,
    approval: Arc<ApprovalEngine>,
    mode: OperationMode,
    tokens: Mutex<Vec<SubscriptionToken>>,
}

impl WorkflowConductor {
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        approval: Arc<ApprovalEngine>,
        mode: OperationMode,
    ) -> Self {
        Self {
            store,
            bus,
            approval,
            mode,
            tokens: Mutex::new(Vec::new()),
        }
    }

    fn on_task_created(
        store: &Store,
        bus: &EventBus,
        envelope: &EventEnvelope,
    ) -> Result<(), ConductorError> {
        // Routed envelopes are for the queue consumer, not for planning.
        if is_routed(&envelope.payload) {
            return Ok(());
        }
        let task_id = payload_str(&envelope.payload, "taskId")?;
        let Some(task) = store.find_task(task_id)? else {
            return Ok(());
        };
        if task.payload.get("workflowStep").is_some() {
            // Sub-tasks are routed explicitly when their dependencies clear.
            return Ok(());
        }

        if COMPLEX_TASK_TYPES.contains(&task.task_type.as_str()) {
            Self::plan(store, bus, &task)
        } else {
            publish_routed(bus, &task);
            Ok(())
        }
    }

    fn plan(store: &Store, bus: &EventBus, task: &Task) -> Result<(), ConductorError> {
        let steps = match task.task_type.as_str() {
            "research-and-report" => {
                let research = insert_step(store, task, "research", 1, &[])?;
                let report = insert_step(store, task, "report", 2, &[research.id.as_str()])?;
                vec![research, report]
            }
            "batch-processing" => {
                let items = task
                    .payload
                    .get("items")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let mut steps = Vec::new();
                for (index, item) in items.iter().enumerate() {
                    let mut step =
                        step_template(task, "batch-item", (index + 1) as u64, &[]);
                    step.payload.insert("item".to_string(), item.clone());
                    steps.push(store.insert_task(&step)?);
                }
                steps
            }
            // multi-step-response: analysis first, the response depends on it.
            _ => {
                let analyze = insert_step(store, task, "analyze", 1, &[])?;
                let respond = insert_step(store, task, "respond", 2, &[analyze.id.as_str()])?;
                vec![analyze, respond]
            }
        };

        // The parent is owned by the plan from here on; settle_parent moves it
        // to completed once the last step finishes.
        store.update_task_status(&task.id, TaskStatus::Running)?;

        bus.publish(
            events::CONDUCTOR_WORKFLOW_PLANNED,
            CONDUCTOR_NAME,
            None,
            json!({
                "taskId": task.id,
                "taskType": task.task_type,
                "steps": steps.iter().map(|step| json!({
                    "taskId": step.id,
                    "taskType": step.task_type,
                    "workflowStep": step.payload.get("workflowStep"),
                })).collect::<Vec<_>>(),
            }),
        );

        // Steps without dependencies start immediately.
        for step in &steps {
            if dependencies_of(step).is_empty() {
                publish_routed(bus, step);
            }
        }
        Ok(())
    }

    fn on_task_completed(
        store: &Store,
        bus: &EventBus,
        approval: &ApprovalEngine,
        mode: OperationMode,
        envelope: &EventEnvelope,
    ) -> Result<(), ConductorError> {
        let task_id = payload_str(&envelope.payload, "taskId")?;
        let Some(task) = store.find_task(task_id)? else {
            return Ok(());
        };

        Self::release_dependents(store, bus, &task.id)?;
        Self::settle_parent(store, &task)?;

        let output = envelope
            .payload
            .get("output")
            .cloned()
            .and_then(|value| serde_json::from_value::<AgentOutput>(value).ok())
            .or_else(|| task.result.clone());
        let Some(output) = output else {
            return Ok(());
        };

        if !DRAFT_TASK_TYPES.contains(&task.task_type.as_str()) || output.outputs.is_empty() {
            return Ok(());
        }

        if mode == OperationMode::Sandbox {
            bus.publish(
                events::CONDUCTOR_SANDBOX_DRYRUN,
                CONDUCTOR_NAME,
                None,
                json!({
                    "taskId": task.id,
                    "wouldCreateDraft": true,
                    "summary": output.summary,
                    "channel": task.source_channel,
                }),
            );
            return Ok(());
        }

        let channel = task.source_channel.clone().unwrap_or_else(|| "email".to_string());
        let draft = approval.create_draft(&task, &output, &channel)?;
        bus.publish(
            events::CONDUCTOR_REVIEW_REQUEST,
            CONDUCTOR_NAME,
            Some("quality"),
            json!({
                "taskId": task.id,
                "draftId": draft.id,
                "output": output,
            }),
        );
        Ok(())
    }

    /// Route pending sub-tasks whose dependencies have all completed.
    fn release_dependents(
        store: &Store,
        bus: &EventBus,
        completed_id: &str,
    ) -> Result<(), ConductorError> {
        for candidate in store.find_tasks_by_status(TaskStatus::Pending, DEPENDENCY_SCAN_LIMIT)? {
            let depends = dependencies_of(&candidate);
            if depends.is_empty() || !depends.iter().any(|id| id == completed_id) {
                continue;
            }
            let mut all_done = true;
            for dependency in &depends {
                let done = store
                    .find_task(dependency)?
                    .map(|task| task.status == TaskStatus::Completed)
                    .unwrap_or(false);
                if !done {
                    all_done = false;
                    break;
                }
            }
            if all_done {
                publish_routed(bus, &candidate);
            }
        }
        Ok(())
    }

    /// When the last step of a plan completes, the parent task completes.
    fn settle_parent(store: &Store, step: &Task) -> Result<(), ConductorError> {
        let Some(parent_id) = step.payload.get("parentTaskId").and_then(Value::as_str) else {
            return Ok(());
        };
        for status in [TaskStatus::Pending, TaskStatus::Queued, TaskStatus::Running] {
            let open = store
                .find_tasks_by_status(status, DEPENDENCY_SCAN_LIMIT)?
                .into_iter()
                .any(|task| {
                    task.payload.get("parentTaskId").and_then(Value::as_str) == Some(parent_id)
                });
            if open {
                return Ok(());
            }
        }
        if let Some(parent) = store.find_task(parent_id)? {
            if !parent.status.is_terminal() {
                store.update_task_status(&parent.id, TaskStatus::Completed)?;
            }
        }
        Ok(())
    }
}

impl Conductor for WorkflowConductor {
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
        tokens.push(self.bus.subscribe(
            events::TASK_CREATED,
            CONDUCTOR_NAME,
            Arc::new(move |envelope| {
                Self::on_task_created(&store, &bus, envelope).map_err(|err| err.to_string())
            }),
        ));

        let store = self.store.clone();
        let bus = self.bus.clone();
        let approval = self.approval.clone();
        let mode = self.mode;
        tokens.push(self.bus.subscribe(
            events::TASK_COMPLETED,
            CONDUCTOR_NAME,
            Arc::new(move |envelope| {
                Self::on_task_completed(&store, &bus, &approval, mode, envelope)
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

fn is_routed(payload: &Value) -> bool {
    payload.get("routed").and_then(Value::as_bool).unwrap_or(false)
        || payload
            .get("payload")
            .and_then(|inner| inner.get("routed"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
}

fn dependencies_of(task: &Task) -> Vec<String> {
    task.payload
        .get("dependsOn")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn step_template(parent: &Task, step_type: &str, order: u64, depends_on: &[&str]) -> NewTask {
    let mut step = NewTask::new(step_type, parent.priority);
    step.payload
        .insert("parentTaskId".to_string(), Value::from(parent.id.clone()));
    step.payload
        .insert("workflowStep".to_string(), Value::from(order));
    if !depends_on.is_empty() {
        step.payload.insert(
            "dependsOn".to_string(),
            Value::from(
                depends_on
                    .iter()
                    .map(|id| Value::from(*id))
                    .collect::<Vec<_>>(),
            ),
        );
    }
    step.source_channel = parent.source_channel.clone();
    step.source_message_id = parent.source_message_id.clone();
    step.conductor_id = Some(CONDUCTOR_NAME.to_string());
    step
}

fn insert_step(
    store: &Store,
    parent: &Task,
    step_type: &str,
    order: u64,
    depends_on: &[&str],
) -> Result<Task, ConductorError> {
    Ok(store.insert_task(&step_template(parent, step_type, order, depends_on))?)
}

fn publish_routed(bus: &EventBus, task: &Task) {
    let mut payload = task.payload.clone();
    payload.insert("routed".to_string(), Value::from(true));
    bus.publish(
        events::TASK_CREATED,
        CONDUCTOR_NAME,
        None,
        json!({
            "taskId": task.id,
            "taskType": task.task_type,
            "priority": task.priority,
            "routed": true,
            "payload": payload,
        }),
    );
}
