use crate::approval::ApprovalEngine;
use crate::bus::{events, EventBus, SubscriptionToken};
use crate::conductors::{
    ChiefConductor, Conductor, ConductorError, ContextConductor, InboxConductor,
    LearningConductor, QualityConductor, WorkflowConductor,
};
use crate::config::{OperationMode, Settings};
use crate::domain::{AgentOutputStatus, MessageStatus, SessionStatus, TaskStatus};
use crate::invoker::{InvokerConfig, SandboxProfile, WorkerInvoker, WorkerRequest};
use crate::queue::{QueueConfig, QueueError, QueueEvent, TaskQueue};
use crate::shared::logging::append_core_log;
use crate::store::{Store, StoreError};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RESTART_REFILL_LIMIT: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Conductor(#[from] ConductorError),
    #[error("failed to prepare state root {path}: {source}")]
    StateRoot {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Wires store, bus, queue, invoker, conductors and the approval engine into
/// one process. Startup performs recovery (orphan workers, persisted pending
/// tasks); shutdown stops timers and dispatch while in-flight work completes.
pub struct Core {
    settings: Settings,
    store: Arc<Store>,
    bus: EventBus,
    queue: TaskQueue,
    invoker: Arc<WorkerInvoker>,
    approval: Arc<ApprovalEngine>,
    conductors: Vec<Arc<dyn Conductor>>,
    glue_tokens: Mutex<Vec<SubscriptionToken>>,
}

impl Core {
    pub fn new(settings: Settings) -> Result<Self, RuntimeError> {
        Self::with_sandbox(settings, None)
    }

    /// `sandbox_override` swaps the container profile for a plain process,
    /// which is how tests and development hosts run workers.
    pub fn with_sandbox(
        settings: Settings,
        sandbox_override: Option<SandboxProfile>,
    ) -> Result<Self, RuntimeError> {
        fs::create_dir_all(&settings.state_root).map_err(|source| RuntimeError::StateRoot {
            path: settings.state_root.display().to_string(),
            source,
        })?;

        // A store that cannot open is fatal; the process must not start.
        let store = Arc::new(Store::open(&settings.resolved_db_path())?);
        let bus = EventBus::new(Some(settings.state_root.clone()));
        let queue = TaskQueue::new(
            store.clone(),
            QueueConfig {
                concurrency: settings.queue.concurrency,
                retry_delay: Duration::from_millis(settings.queue.retry_delay_ms),
            },
        );

        let sandbox = sandbox_override.unwrap_or_else(|| SandboxProfile::Container {
            runtime: settings.worker.runtime.clone(),
            image: settings.worker.image.clone(),
            memory_limit: settings.worker.memory_limit.clone(),
            cpu_limit: settings.worker.cpu_limit.clone(),
            allow_network: settings.worker.allow_network,
        });
        let mut invoker_config = InvokerConfig::new(settings.ipc_root(), sandbox);
        invoker_config.timeout = Duration::from_millis(settings.worker.timeout_ms);
        invoker_config.kill_grace = Duration::from_millis(settings.worker.kill_grace_ms);
        invoker_config.log_root = Some(settings.state_root.clone());
        let invoker = Arc::new(WorkerInvoker::new(invoker_config));

        let approval = Arc::new(ApprovalEngine::new(store.clone(), bus.clone()));

        let conductors: Vec<Arc<dyn Conductor>> = vec![
            Arc::new(InboxConductor::new(store.clone(), bus.clone())),
            Arc::new(WorkflowConductor::new(
                store.clone(),
                bus.clone(),
                approval.clone(),
                settings.mode,
            )),
            Arc::new(
                ContextConductor::new(store.clone(), bus.clone())
                    .with_log_root(settings.state_root.clone()),
            ),
            Arc::new(QualityConductor::new(store.clone(), bus.clone())),
            Arc::new(LearningConductor::new(
                store.clone(),
                bus.clone(),
                settings.conductors.correction_buffer_limit,
                Duration::from_millis(settings.conductors.learning_interval_ms),
            )),
            Arc::new(ChiefConductor::new(
                bus.clone(),
                Duration::from_millis(settings.conductors.briefing_interval_ms),
            )),
        ];

        Ok(Self {
            settings,
            store,
            bus,
            queue,
            invoker,
            approval,
            conductors,
            glue_tokens: Mutex::new(Vec::new()),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn approval(&self) -> &Arc<ApprovalEngine> {
        &self.approval
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn start(&self) -> Result<(), RuntimeError> {
        let removed = self.invoker.cleanup_orphans();
        for name in &removed {
            append_core_log(
                &self.settings.state_root,
                "info",
                "runtime.orphan.removed",
                name,
            );
        }

        for conductor in &self.conductors {
            conductor.start()?;
        }
        self.install_queue_handler();
        self.install_queue_bridge();
        self.install_glue();

        // Persisted pending work survives restarts; the queue re-fills from
        // the store in priority order. Unplanned complex tasks go back to the
        // Workflow conductor instead of straight onto the queue.
        for task in self.store.find_pending_tasks(RESTART_REFILL_LIMIT)? {
            if !dependencies_satisfied(&self.store, &task)? {
                continue;
            }
            if crate::conductors::workflow::COMPLEX_TASK_TYPES.contains(&task.task_type.as_str())
            {
                self.bus.publish(
                    events::TASK_CREATED,
                    "core",
                    None,
                    json!({ "taskId": task.id, "taskType": task.task_type }),
                );
                continue;
            }
            self.queue.enqueue(task)?;
        }

        append_core_log(&self.settings.state_root, "info", "runtime.started", "core up");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
        for conductor in &self.conductors {
            conductor.stop();
        }
        let mut tokens = match self.glue_tokens.lock() {
            Ok(tokens) => tokens,
            Err(poisoned) => poisoned.into_inner(),
        };
        for token in tokens.drain(..) {
            self.bus.unsubscribe(token);
        }
        append_core_log(
            &self.settings.state_root,
            "info",
            "runtime.stopped",
            "core down",
        );
    }

    /// The queue handler drives the worker invoker and records a session per
    /// run. A failed Agent-Output surfaces as a handler failure so the queue
    /// applies its retry policy.
    fn install_queue_handler(&self) {
        let store = self.store.clone();
        let invoker = self.invoker.clone();
        self.queue.set_handler(Arc::new(move |task| {
            let session = store
                .insert_session(&task.task_type, &task.id, None)
                .map_err(|err| err.to_string())?;
            let _ = store.update_session_status(&session.id, SessionStatus::Running);

            let request = WorkerRequest {
                task_id: task.id.clone(),
                task_type: task.task_type.clone(),
                payload: task.payload.clone(),
                secrets: BTreeMap::new(),
                conductor_context: None,
            };
            let run = match invoker.invoke(request) {
                Ok(run) => run,
                Err(err) => {
                    let _ = store.update_session_status(&session.id, SessionStatus::Error);
                    return Err(err.to_string());
                }
            };

            let _ = store.update_task_agent(&task.id, &run.container_id);
            let terminal = if run.exit_code == 0 && !run.timed_out {
                SessionStatus::Stopped
            } else {
                SessionStatus::Error
            };
            let _ = store.update_session_status(&session.id, terminal);

            if run.output.status == AgentOutputStatus::Failed {
                Err(run.output.summary.clone())
            } else {
                Ok(run.output)
            }
        }));
    }

    /// Queue lifecycle events become bus envelopes, and source messages are
    /// stamped handled/failed as their tasks settle.
    fn install_queue_bridge(&self) {
        let store = self.store.clone();
        let bus = self.bus.clone();
        let log_root = self.settings.state_root.clone();
        self.queue.add_observer(Arc::new(move |event| match event {
            QueueEvent::Completed {
                task_id,
                duration_ms,
                output,
            } => {
                settle_source_message(&store, task_id, MessageStatus::Handled);
                bus.publish(
                    events::TASK_COMPLETED,
                    "queue",
                    None,
                    json!({
                        "taskId": task_id,
                        "durationMs": duration_ms,
                        "output": output,
                    }),
                );
                if output.status == AgentOutputStatus::Escalated {
                    bus.publish(
                        events::TASK_ESCALATED,
                        "queue",
                        None,
                        json!({ "taskId": task_id, "reason": output.summary }),
                    );
                }
            }
            QueueEvent::Failed { task_id, error } => {
                settle_source_message(&store, task_id, MessageStatus::Failed);
                bus.publish(
                    events::TASK_FAILED,
                    "queue",
                    None,
                    json!({ "taskId": task_id, "error": error }),
                );
            }
            QueueEvent::Retry {
                task_id,
                retry_count,
                delay_ms,
            } => {
                append_core_log(
                    &log_root,
                    "info",
                    "queue.retry",
                    &format!("task {task_id} retry {retry_count} in {delay_ms} ms"),
                );
            }
            QueueEvent::Started { .. } => {}
        }));
    }

    fn install_glue(&self) {
        let mut tokens = match self.glue_tokens.lock() {
            Ok(tokens) => tokens,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Routed task:created envelopes are the queue consumer's cue.
        let store = self.store.clone();
        let queue = self.queue.clone();
        tokens.push(self.bus.subscribe(
            events::TASK_CREATED,
            "core",
            Arc::new(move |envelope| {
                let routed = envelope
                    .payload
                    .get("routed")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if !routed {
                    return Ok(());
                }
                let Some(task_id) = envelope.payload.get("taskId").and_then(Value::as_str)
                else {
                    return Err("routed task:created without taskId".to_string());
                };
                let Some(task) = store.find_task(task_id).map_err(|err| err.to_string())?
                else {
                    return Ok(());
                };
                if task.status != TaskStatus::Pending {
                    return Ok(());
                }
                queue.enqueue(task).map_err(|err| err.to_string())
            }),
        ));

        // In autonomous mode scored drafts may auto-approve by rule.
        if self.settings.mode == OperationMode::Autonomous {
            let store = self.store.clone();
            let approval = self.approval.clone();
            tokens.push(self.bus.subscribe(
                events::DRAFT_QUALITY_REVIEWED,
                "core",
                Arc::new(move |envelope| {
                    let Some(draft_id) =
                        envelope.payload.get("draftId").and_then(Value::as_str)
                    else {
                        return Ok(());
                    };
                    let Some(draft) =
                        store.find_draft(draft_id).map_err(|err| err.to_string())?
                    else {
                        return Ok(());
                    };
                    if draft.status != crate::domain::DraftStatus::PendingReview {
                        return Ok(());
                    }
                    let matched = approval
                        .match_auto_approve_rule(&draft)
                        .map_err(|err| err.to_string())?;
                    if let Some(rule) = matched {
                        approval
                            .auto_approve(&draft.id, &rule)
                            .map_err(|err| err.to_string())?;
                    }
                    Ok(())
                }),
            ));
        }
    }
}

fn settle_source_message(store: &Store, task_id: &str, status: MessageStatus) {
    let Ok(Some(task)) = store.find_task(task_id) else {
        return;
    };
    let Some(message_id) = task.source_message_id else {
        return;
    };
    // Transition failures (already handled, never processed) are non-fatal.
    let _ = store.update_message_status(&message_id, status);
}

fn dependencies_satisfied(store: &Store, task: &crate::domain::Task) -> Result<bool, StoreError> {
    let Some(depends) = task.payload.get("dependsOn").and_then(Value::as_array) else {
        return Ok(true);
    };
    for dependency in depends.iter().filter_map(Value::as_str) {
        let done = store
            .find_task(dependency)?
            .map(|dep| dep.status == TaskStatus::Completed)
            .unwrap_or(false);
        if !done {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Stop-file location, the external signal that ends `run_until_stopped`.
pub fn stop_signal_path(state_root: &std::path::Path) -> PathBuf {
    state_root.join("stop")
}

/// Block until the stop file appears, then shut the core down.
pub fn run_until_stopped(core: &Core) -> Result<(), RuntimeError> {
    core.start()?;
    let stop_path = stop_signal_path(&core.settings.state_root);
    if stop_path.exists() {
        let _ = fs::remove_file(&stop_path);
    }
    while !stop_path.exists() {
        std::thread::sleep(Duration::from_millis(200));
    }
    let _ = fs::remove_file(&stop_path);
    core.shutdown();
    Ok(())
}
