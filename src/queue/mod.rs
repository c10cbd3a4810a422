use crate::domain::{AgentOutput, Task, TaskStatus};
use crate::store::{Store, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_CONCURRENCY: usize = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("queue state lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub retry_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Started {
        task_id: String,
    },
    Completed {
        task_id: String,
        duration_ms: u64,
        output: AgentOutput,
    },
    Retry {
        task_id: String,
        retry_count: u32,
        delay_ms: u64,
    },
    Failed {
        task_id: String,
        error: String,
    },
}

pub type QueueHandler = Arc<dyn Fn(&Task) -> Result<AgentOutput, String> + Send + Sync>;
pub type QueueObserver = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

struct QueueState {
    waiting: Vec<Task>,
    running: usize,
    paused: bool,
    handler: Option<QueueHandler>,
    observers: Vec<QueueObserver>,
}

struct QueueShared {
    store: Arc<Store>,
    config: QueueConfig,
    stop: AtomicBool,
    state: Mutex<QueueState>,
}

/// Priority task queue over the store. Waiting tasks sort by priority rank
/// then created-at; dispatch runs while slots are free and the queue is not
/// paused. Every status transition lands in the store before the matching
/// lifecycle event is emitted.
#[derive(Clone)]
pub struct TaskQueue {
    shared: Arc<QueueShared>,
}

impl TaskQueue {
    pub fn new(store: Arc<Store>, config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                store,
                config,
                stop: AtomicBool::new(false),
                state: Mutex::new(QueueState {
                    waiting: Vec::new(),
                    running: 0,
                    paused: false,
                    handler: None,
                    observers: Vec::new(),
                }),
            }),
        }
    }

    /// Installing a handler is idempotent; the newest handler wins.
    pub fn set_handler(&self, handler: QueueHandler) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.handler = Some(handler);
        }
        drain(&self.shared);
    }

    pub fn add_observer(&self, observer: QueueObserver) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.observers.push(observer);
        }
    }

    pub fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        enqueue_inner(&self.shared, task)?;
        drain(&self.shared);
        Ok(())
    }

    /// Pausing halts dispatch; running tasks continue to completion.
    pub fn pause(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.paused = true;
        }
    }

    pub fn resume(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.paused = false;
        }
        drain(&self.shared);
    }

    pub fn size(&self) -> usize {
        self.shared
            .state
            .lock()
            .map(|state| state.waiting.len())
            .unwrap_or(0)
    }

    pub fn active_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .map(|state| state.running)
            .unwrap_or(0)
    }

    /// Stops dispatch and cancels pending retry timers. In-flight handlers
    /// run to completion; persisted queued tasks are re-read on restart.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Ok(mut state) = self.shared.state.lock() {
            state.paused = true;
        }
    }
}

fn enqueue_inner(shared: &Arc<QueueShared>, mut task: Task) -> Result<(), QueueError> {
    shared.store.update_task_status(&task.id, TaskStatus::Queued)?;
    task.status = TaskStatus::Queued;

    let mut state = shared.state.lock().map_err(|_| QueueError::LockPoisoned)?;
    state.waiting.push(task);
    // Stable sort: insertion order is the tie-break within equal keys.
    state
        .waiting
        .sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
    Ok(())
}

fn drain(shared: &Arc<QueueShared>) {
    loop {
        let (task, handler) = {
            let Ok(mut state) = shared.state.lock() else {
                return;
            };
            if state.paused
                || shared.stop.load(Ordering::Relaxed)
                || state.running >= shared.config.concurrency
                || state.waiting.is_empty()
            {
                return;
            }
            let Some(handler) = state.handler.clone() else {
                return;
            };
            let task = state.waiting.remove(0);
            state.running += 1;
            (task, handler)
        };

        if let Err(err) = shared.store.update_task_status(&task.id, TaskStatus::Running) {
            crate::shared::logging::append_core_log(
                shared.store.root(),
                "error",
                "queue.dispatch.store",
                &format!("task {}: {err}", task.id),
            );
            release_slot(shared);
            emit(
                shared,
                &QueueEvent::Failed {
                    task_id: task.id.clone(),
                    error: err.to_string(),
                },
            );
            continue;
        }

        emit(
            shared,
            &QueueEvent::Started {
                task_id: task.id.clone(),
            },
        );

        let exec_shared = shared.clone();
        thread::spawn(move || execute_task(&exec_shared, task, handler));
    }
}

fn execute_task(shared: &Arc<QueueShared>, task: Task, handler: QueueHandler) {
    let start = Instant::now();
    let result = handler(&task);
    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(output) => {
            if let Err(err) = shared.store.update_task_result(&task.id, &output) {
                crate::shared::logging::append_core_log(
                    shared.store.root(),
                    "error",
                    "queue.result.store",
                    &format!("task {}: {err}", task.id),
                );
            }
            let _ = shared
                .store
                .update_task_status(&task.id, TaskStatus::Completed);
            release_slot(shared);
            emit(
                shared,
                &QueueEvent::Completed {
                    task_id: task.id.clone(),
                    duration_ms,
                    output,
                },
            );
        }
        Err(error) => {
            if task.retry_count < task.max_retries {
                let retry_count = shared
                    .store
                    .increment_task_retry(&task.id)
                    .unwrap_or(task.retry_count + 1);
                let _ = shared
                    .store
                    .update_task_status(&task.id, TaskStatus::Pending);
                let delay = shared.config.retry_delay * retry_count;
                release_slot(shared);
                emit(
                    shared,
                    &QueueEvent::Retry {
                        task_id: task.id.clone(),
                        retry_count,
                        delay_ms: delay.as_millis() as u64,
                    },
                );
                schedule_retry(shared.clone(), task.id.clone(), delay);
            } else {
                let _ = shared.store.update_task_status(&task.id, TaskStatus::Failed);
                release_slot(shared);
                emit(
                    shared,
                    &QueueEvent::Failed {
                        task_id: task.id.clone(),
                        error,
                    },
                );
            }
        }
    }

    drain(shared);
}

fn schedule_retry(shared: Arc<QueueShared>, task_id: String, delay: Duration) {
    thread::spawn(move || {
        if !sleep_with_stop(&shared.stop, delay) {
            return;
        }
        let reloaded = match shared.store.find_task(&task_id) {
            Ok(Some(task)) => task,
            Ok(None) | Err(_) => return,
        };
        if enqueue_inner(&shared, reloaded).is_ok() {
            drain(&shared);
        }
    });
}

fn release_slot(shared: &Arc<QueueShared>) {
    if let Ok(mut state) = shared.state.lock() {
        state.running = state.running.saturating_sub(1);
    }
}

fn emit(shared: &Arc<QueueShared>, event: &QueueEvent) {
    let observers = shared
        .state
        .lock()
        .map(|state| state.observers.clone())
        .unwrap_or_default();
    for observer in observers {
        observer(event);
    }
}

pub(crate) fn sleep_with_stop(stop: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::from_millis(0) {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(Duration::from_millis(50));
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !stop.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentOutputStatus, TaskPriority};
    use crate::store::test_support::open_temp_store;
    use crate::store::NewTask;
    use serde_json::Map;
    use std::sync::mpsc;
    use std::time::Duration;

    fn instant_output() -> AgentOutput {
        AgentOutput {
            status: AgentOutputStatus::Completed,
            priority: TaskPriority::Normal,
            summary: "handled the task".to_string(),
            needs_review: false,
            outputs: Vec::new(),
            metadata: Map::new(),
            error: None,
        }
    }

    fn collect_events(queue: &TaskQueue) -> mpsc::Receiver<QueueEvent> {
        let (tx, rx) = mpsc::channel();
        queue.add_observer(Arc::new(move |event| {
            let _ = tx.send(event.clone());
        }));
        rx
    }

    fn wait_for_terminal(rx: &mpsc::Receiver<QueueEvent>, want: usize) -> Vec<QueueEvent> {
        let mut all = Vec::new();
        let mut terminal = 0;
        while terminal < want {
            let event = rx
                .recv_timeout(Duration::from_secs(5))
                .expect("queue event within deadline");
            if matches!(
                event,
                QueueEvent::Completed { .. } | QueueEvent::Failed { .. }
            ) {
                terminal += 1;
            }
            all.push(event);
        }
        all
    }

    #[test]
    fn priority_dispatch_runs_urgent_before_low() {
        let (_tmp, store) = open_temp_store();
        let queue = TaskQueue::new(
            store.clone(),
            QueueConfig {
                concurrency: 1,
                retry_delay: Duration::from_millis(10),
            },
        );
        let rx = collect_events(&queue);
        queue.set_handler(Arc::new(|_| Ok(instant_output())));

        queue.pause();
        let low = store
            .insert_task(&NewTask::new("general-email", TaskPriority::Low))
            .expect("low");
        let urgent = store
            .insert_task(&NewTask::new("urgent-email", TaskPriority::Urgent))
            .expect("urgent");
        queue.enqueue(low.clone()).expect("enqueue low");
        queue.enqueue(urgent.clone()).expect("enqueue urgent");
        queue.resume();

        let events = wait_for_terminal(&rx, 2);
        let completed: Vec<String> = events
            .iter()
            .filter_map(|event| match event {
                QueueEvent::Completed { task_id, .. } => Some(task_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec![urgent.id.clone(), low.id.clone()]);
    }

    #[test]
    fn retry_backoff_is_linear_and_ends_in_completion() {
        let (_tmp, store) = open_temp_store();
        let queue = TaskQueue::new(
            store.clone(),
            QueueConfig {
                concurrency: 1,
                retry_delay: Duration::from_millis(50),
            },
        );
        let rx = collect_events(&queue);

        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = attempts.clone();
        queue.set_handler(Arc::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("transient failure".to_string())
            } else {
                Ok(instant_output())
            }
        }));

        let task = store
            .insert_task(&NewTask::new("general-email", TaskPriority::Normal))
            .expect("insert");
        queue.enqueue(task.clone()).expect("enqueue");

        let events = wait_for_terminal(&rx, 1);
        let retries: Vec<u64> = events
            .iter()
            .filter_map(|event| match event {
                QueueEvent::Retry { delay_ms, .. } => Some(*delay_ms),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![50, 100]);
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, QueueEvent::Completed { .. }))
                .count(),
            1
        );

        let stored = store.find_task(&task.id).expect("find").expect("present");
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.retry_count, 2);
    }

    #[test]
    fn exhausted_retries_mark_the_task_failed() {
        let (_tmp, store) = open_temp_store();
        let queue = TaskQueue::new(
            store.clone(),
            QueueConfig {
                concurrency: 1,
                retry_delay: Duration::from_millis(5),
            },
        );
        let rx = collect_events(&queue);
        queue.set_handler(Arc::new(|_| Err("permanent failure".to_string())));

        let mut new = NewTask::new("general-email", TaskPriority::Normal);
        new.max_retries = 1;
        let task = store.insert_task(&new).expect("insert");
        queue.enqueue(task.clone()).expect("enqueue");

        let events = wait_for_terminal(&rx, 1);
        assert!(events
            .iter()
            .any(|event| matches!(event, QueueEvent::Retry { retry_count: 1, .. })));
        assert!(events
            .iter()
            .any(|event| matches!(event, QueueEvent::Failed { .. })));

        let stored = store.find_task(&task.id).expect("find").expect("present");
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn active_count_never_exceeds_concurrency() {
        let (_tmp, store) = open_temp_store();
        let queue = TaskQueue::new(
            store.clone(),
            QueueConfig {
                concurrency: 2,
                retry_delay: Duration::from_millis(10),
            },
        );
        let rx = collect_events(&queue);

        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak_in = peak.clone();
        let active_in = active.clone();
        queue.set_handler(Arc::new(move |_| {
            let now = active_in.fetch_add(1, Ordering::SeqCst) + 1;
            peak_in.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            active_in.fetch_sub(1, Ordering::SeqCst);
            Ok(instant_output())
        }));

        queue.pause();
        for _ in 0..5 {
            let task = store
                .insert_task(&NewTask::new("general-email", TaskPriority::Normal))
                .expect("insert");
            queue.enqueue(task).expect("enqueue");
        }
        queue.resume();

        wait_for_terminal(&rx, 5);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.active_count(), 0);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn pause_halts_dispatch_until_resume() {
        let (_tmp, store) = open_temp_store();
        let queue = TaskQueue::new(store.clone(), QueueConfig::default());
        let rx = collect_events(&queue);
        queue.set_handler(Arc::new(|_| Ok(instant_output())));

        queue.pause();
        let task = store
            .insert_task(&NewTask::new("general-email", TaskPriority::Normal))
            .expect("insert");
        queue.enqueue(task).expect("enqueue");

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(queue.size(), 1);

        queue.resume();
        wait_for_terminal(&rx, 1);
        assert_eq!(queue.size(), 0);
    }
}
