use super::{Conductor, ConductorError};
use crate::bus::{events, EventBus, EventEnvelope, SubscriptionToken};
use crate::learning::{analyse, update_prompt_metrics};
use crate::queue::sleep_with_stop;
use crate::store::Store;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub const CONDUCTOR_NAME: &str = "learning";

/// Buffers recorded corrections and runs the analyser once the buffer fills
/// or the periodic timer fires, whichever comes first. Also keeps per-prompt
/// rating tallies current as reviews and feedback arrive.
pub struct LearningConductor {
    store: Arc<Store>,
    bus: EventBus,
    buffer_limit: usize,
    interval: Duration,
    buffer: Arc<Mutex<Vec<Value>>>,
    stop: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
    tokens: Mutex<Vec<SubscriptionToken>>,
}

impl LearningConductor {
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        buffer_limit: usize,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            buffer_limit,
            interval,
            buffer: Arc::new(Mutex::new(Vec::new())),
            stop: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
            tokens: Mutex::new(Vec::new()),
        }
    }

    /// Drain the buffer and analyse. Whoever drains first publishes; the
    /// racing trigger sees an empty buffer and does nothing.
    fn run_analysis(
        store: &Store,
        bus: &EventBus,
        buffer: &Mutex<Vec<Value>>,
    ) -> Result<(), ConductorError> {
        {
            let mut buffer = match buffer.lock() {
                Ok(buffer) => buffer,
                Err(poisoned) => poisoned.into_inner(),
            };
            if buffer.is_empty() {
                return Ok(());
            }
            buffer.clear();
        }

        let insights = analyse(store)?;
        for insight in &insights {
            update_prompt_metrics(store, &insight.agent_type)?;
        }
        let has_suggestions = insights
            .iter()
            .any(|insight| !insight.suggestions.is_empty());
        if !has_suggestions {
            return Ok(());
        }

        bus.publish(
            events::CONDUCTOR_LEARNING_INSIGHT,
            CONDUCTOR_NAME,
            Some("chief"),
            json!({
                "insights": insights,
                "generatedAt": crate::shared::ids::now_iso(),
            }),
        );
        Ok(())
    }

    fn on_correction_recorded(
        store: &Store,
        bus: &EventBus,
        buffer: &Mutex<Vec<Value>>,
        buffer_limit: usize,
        envelope: &EventEnvelope,
    ) -> Result<(), ConductorError> {
        let should_analyse = {
            let mut buffer = match buffer.lock() {
                Ok(buffer) => buffer,
                Err(poisoned) => poisoned.into_inner(),
            };
            buffer.push(envelope.payload.clone());
            buffer.len() >= buffer_limit
        };
        if should_analyse {
            Self::run_analysis(store, bus, buffer)?;
        }
        Ok(())
    }

    fn on_review_result(store: &Store, envelope: &EventEnvelope) -> Result<(), ConductorError> {
        let approved = envelope
            .payload
            .get("approved")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self::tally_for_task(store, &envelope.payload, approved)
    }

    fn on_feedback(store: &Store, envelope: &EventEnvelope) -> Result<(), ConductorError> {
        let rating = envelope
            .payload
            .get("rating")
            .and_then(Value::as_str)
            .unwrap_or("negative");
        let task_id = envelope.payload.get("taskId").and_then(Value::as_str);
        let draft_id = envelope.payload.get("draftId").and_then(Value::as_str);
        let comment = envelope.payload.get("comment").and_then(Value::as_str);
        store.insert_feedback(task_id, draft_id, rating, comment)?;
        Self::tally_for_task(store, &envelope.payload, rating == "positive")
    }

    /// Increment usage and the positive/negative tally on the prompt version
    /// currently active under `<agent-type>-system-prompt`, if any.
    fn tally_for_task(
        store: &Store,
        payload: &Value,
        positive: bool,
    ) -> Result<(), ConductorError> {
        let Some(task_id) = payload.get("taskId").and_then(Value::as_str) else {
            return Ok(());
        };
        let Some(task) = store.find_task(task_id)? else {
            return Ok(());
        };
        let prompt_name = format!("{}-system-prompt", task.task_type);
        let Some(active) = store.active_prompt_version(&prompt_name)? else {
            return Ok(());
        };

        let mut metrics = active.metrics.clone().unwrap_or_default();
        metrics.usage_count += 1;
        if positive {
            metrics.positive_rating += 1;
        } else {
            metrics.negative_rating += 1;
        }
        store.update_prompt_metrics(&active.id, &metrics)?;
        Ok(())
    }
}

impl Conductor for LearningConductor {
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

        let store = self.store.clone();
        let bus = self.bus.clone();
        let buffer = self.buffer.clone();
        let limit = self.buffer_limit;
        tokens.push(self.bus.subscribe(
            events::CORRECTION_RECORDED,
            CONDUCTOR_NAME,
            Arc::new(move |envelope| {
                Self::on_correction_recorded(&store, &bus, &buffer, limit, envelope)
                    .map_err(|err| err.to_string())
            }),
        ));

        let store = self.store.clone();
        tokens.push(self.bus.subscribe(
            events::CONDUCTOR_REVIEW_RESULT,
            CONDUCTOR_NAME,
            Arc::new(move |envelope| {
                Self::on_review_result(&store, envelope).map_err(|err| err.to_string())
            }),
        ));

        let store = self.store.clone();
        tokens.push(self.bus.subscribe(
            events::CONDUCTOR_FEEDBACK,
            CONDUCTOR_NAME,
            Arc::new(move |envelope| {
                Self::on_feedback(&store, envelope).map_err(|err| err.to_string())
            }),
        ));

        let store = self.store.clone();
        let bus = self.bus.clone();
        let buffer = self.buffer.clone();
        let stop = self.stop.clone();
        let interval = self.interval;
        let handle = std::thread::spawn(move || {
            while sleep_with_stop(&stop, interval) {
                let _ = Self::run_analysis(&store, &bus, &buffer);
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
