use super::{Conductor, ConductorError};
use crate::bus::{events, EventBus, EventEnvelope, SubscriptionToken};
use crate::queue::sleep_with_stop;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub const CONDUCTOR_NAME: &str = "chief";

#[derive(Debug, Default, Clone)]
struct BriefingCounters {
    completed: u64,
    failed: u64,
    escalated: u64,
    escalations: Vec<Value>,
}

/// Aggregator role: counts task outcomes, re-requests review for outputs the
/// worker flagged, and publishes a periodic briefing. Never mutates tasks.
pub struct ChiefConductor {
    bus: EventBus,
    interval: Duration,
    counters: Arc<Mutex<BriefingCounters>>,
    stop: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
    tokens: Mutex<Vec<SubscriptionToken>>,
}

impl ChiefConductor {
    pub fn new(bus: EventBus, interval: Duration) -> Self {
        Self {
            bus,
            interval,
            counters: Arc::new(Mutex::new(BriefingCounters::default())),
            stop: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
            tokens: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot-and-reset the window, publish the briefing.
    fn publish_briefing(bus: &EventBus, counters: &Mutex<BriefingCounters>) {
        let snapshot = {
            let mut counters = match counters.lock() {
                Ok(counters) => counters,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *counters)
        };
        bus.publish(
            events::CONDUCTOR_BRIEFING,
            CONDUCTOR_NAME,
            None,
            json!({
                "completedTasks": snapshot.completed,
                "failedTasks": snapshot.failed,
                "escalatedTasks": snapshot.escalated,
                "escalations": snapshot.escalations,
                "generatedAt": crate::shared::ids::now_iso(),
            }),
        );
    }

    fn on_task_completed(
        bus: &EventBus,
        counters: &Mutex<BriefingCounters>,
        envelope: &EventEnvelope,
    ) -> Result<(), ConductorError> {
        if let Ok(mut counters) = counters.lock() {
            counters.completed += 1;
        }

        let needs_review = envelope
            .payload
            .get("output")
            .and_then(|output| output.get("needsReview"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if needs_review {
            bus.publish(
                events::CONDUCTOR_REVIEW_REQUEST,
                CONDUCTOR_NAME,
                Some("quality"),
                json!({
                    "taskId": envelope.payload.get("taskId"),
                    "output": envelope.payload.get("output"),
                }),
            );
        }
        Ok(())
    }

    fn on_task_failed(
        counters: &Mutex<BriefingCounters>,
        _envelope: &EventEnvelope,
    ) -> Result<(), ConductorError> {
        if let Ok(mut counters) = counters.lock() {
            counters.failed += 1;
        }
        Ok(())
    }

    fn on_task_escalated(
        counters: &Mutex<BriefingCounters>,
        envelope: &EventEnvelope,
    ) -> Result<(), ConductorError> {
        if let Ok(mut counters) = counters.lock() {
            counters.escalated += 1;
            counters.escalations.push(envelope.payload.clone());
        }
        Ok(())
    }
}

impl Conductor for ChiefConductor {
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
        self.stop.store(false, Ordering::Relaxed);

        let bus = self.bus.clone();
        let counters = self.counters.clone();
        tokens.push(self.bus.subscribe(
            events::TASK_COMPLETED,
            CONDUCTOR_NAME,
            Arc::new(move |envelope| {
                Self::on_task_completed(&bus, &counters, envelope).map_err(|err| err.to_string())
            }),
        ));

        let counters = self.counters.clone();
        tokens.push(self.bus.subscribe(
            events::TASK_FAILED,
            CONDUCTOR_NAME,
            Arc::new(move |envelope| {
                Self::on_task_failed(&counters, envelope).map_err(|err| err.to_string())
            }),
        ));

        let counters = self.counters.clone();
        tokens.push(self.bus.subscribe(
            events::TASK_ESCALATED,
            CONDUCTOR_NAME,
            Arc::new(move |envelope| {
                Self::on_task_escalated(&counters, envelope).map_err(|err| err.to_string())
            }),
        ));

        let bus = self.bus.clone();
        let counters = self.counters.clone();
        let stop = self.stop.clone();
        let interval = self.interval;
        let handle = std::thread::spawn(move || {
            while sleep_with_stop(&stop, interval) {
                Self::publish_briefing(&bus, &counters);
            }
        });
        if let Ok(mut timer) = self.timer.lock() {
            *timer = Some(handle);
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let mut tokens = match self.tokens.lock() {
            Ok(tokens) => tokens,
            Err(poisoned) => poisoned.into_inner(),
        };
        for token in tokens.drain(..) {
            self.bus.unsubscribe(token);
        }
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                let _ = handle.join();
            }
        }
    }
}
