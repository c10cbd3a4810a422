use super::{payload_str, Conductor, ConductorError};
use crate::bus::{events, EventBus, EventEnvelope, SubscriptionToken};
use crate::domain::{AgentOutput, AgentOutputStatus, Draft, TaskStatus};
use crate::store::Store;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

pub const CONDUCTOR_NAME: &str = "quality";

const APPROVED_SCORE: i64 = 80;
const MIN_SUMMARY_CHARS: usize = 10;

/// Reviews Agent-Outputs (sending unacceptable work back to rework) and
/// scores drafts before they reach a human.
pub struct QualityConductor {
    store: Arc<Store>,
    bus: EventBus,
    tokens: Mutex<Vec<SubscriptionToken>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputReview {
    pub approved: bool,
    pub corrections: Vec<String>,
    pub quality_score: i64,
}

impl QualityConductor {
    pub fn new(store: Arc<Store>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            tokens: Mutex::new(Vec::new()),
        }
    }

    fn on_review_request(
        store: &Store,
        bus: &EventBus,
        envelope: &EventEnvelope,
    ) -> Result<(), ConductorError> {
        let task_id = payload_str(&envelope.payload, "taskId")?;
        let output = envelope
            .payload
            .get("output")
            .cloned()
            .and_then(|value| serde_json::from_value::<AgentOutput>(value).ok());
        let Some(output) = output else {
            return Ok(());
        };

        let review = review_output(&output);
        if !review.approved {
            // Rework loop: the task goes back to running until the worker
            // produces acceptable output.
            store.update_task_status(task_id, TaskStatus::Running)?;
        }

        bus.publish(
            events::CONDUCTOR_REVIEW_RESULT,
            CONDUCTOR_NAME,
            None,
            json!({
                "taskId": task_id,
                "approved": review.approved,
                "corrections": review.corrections,
                "qualityScore": review.quality_score,
            }),
        );
        Ok(())
    }

    fn on_draft_created(
        store: &Store,
        bus: &EventBus,
        envelope: &EventEnvelope,
    ) -> Result<(), ConductorError> {
        let draft_id = payload_str(&envelope.payload, "draftId")?;
        let Some(draft) = store.find_draft(draft_id)? else {
            return Ok(());
        };

        let (score, notes) = score_draft(&draft);
        let notes_text = if notes.is_empty() {
            None
        } else {
            Some(notes.join("; "))
        };
        store.update_draft_quality(&draft.id, score, notes_text.as_deref())?;

        bus.publish(
            events::DRAFT_QUALITY_REVIEWED,
            CONDUCTOR_NAME,
            None,
            json!({
                "draftId": draft.id,
                "qualityScore": score,
                "qualityNotes": notes_text,
            }),
        );
        Ok(())
    }
}

impl Conductor for QualityConductor {
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
            events::CONDUCTOR_REVIEW_REQUEST,
            CONDUCTOR_NAME,
            Arc::new(move |envelope| {
                Self::on_review_request(&store, &bus, envelope).map_err(|err| err.to_string())
            }),
        ));

        let store = self.store.clone();
        let bus = self.bus.clone();
        tokens.push(self.bus.subscribe(
            events::DRAFT_CREATED,
            CONDUCTOR_NAME,
            Arc::new(move |envelope| {
                Self::on_draft_created(&store, &bus, envelope).map_err(|err| err.to_string())
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

/// The output checks: short summary, missing outputs on completion, and
/// sensitive content. Approved iff no correction applies.
pub fn review_output(output: &AgentOutput) -> OutputReview {
    let mut corrections = Vec::new();

    if output.summary.trim().chars().count() < MIN_SUMMARY_CHARS {
        corrections.push("Summary too short or missing".to_string());
    }
    if output.outputs.is_empty() && output.status == AgentOutputStatus::Completed {
        corrections.push("No outputs provided despite completed status".to_string());
    }
    for item in &output.outputs {
        if let Some(kind) = sensitive_kind(&item.content) {
            corrections.push(format!("Output contains sensitive content ({kind})"));
            break;
        }
    }

    let approved = corrections.is_empty();
    let quality_score = if approved {
        APPROVED_SCORE
    } else {
        (APPROVED_SCORE - 20 * corrections.len() as i64).max(20)
    };
    OutputReview {
        approved,
        corrections,
        quality_score,
    }
}

/// Draft scoring: start at 100 and subtract per rule, clamped to [0, 100].
pub fn score_draft(draft: &Draft) -> (i64, Vec<String>) {
    let mut score: i64 = 100;
    let mut notes = Vec::new();

    let body_chars = draft.body.chars().count();
    if body_chars < 20 {
        score -= 30;
        notes.push("body too short".to_string());
    }
    if body_chars > 5000 {
        score -= 10;
        notes.push("body very long".to_string());
    }
    if draft.subject.chars().count() < 3 {
        score -= 15;
        notes.push("subject too short".to_string());
    }
    if draft.to.is_empty() {
        score -= 25;
        notes.push("no recipients".to_string());
    }
    if let Some(kind) = sensitive_kind(&draft.body) {
        score -= 30;
        notes.push(format!("sensitive content ({kind})"));
    }
    if draft.body.contains("!!!") || draft.body.contains("???") {
        score -= 10;
        notes.push("excessive punctuation".to_string());
    }

    (score.clamp(0, 100), notes)
}

/// Initial sensitive-pattern set: card-like 16-digit numbers, embedded email
/// addresses, plaintext password assignments. Hand-rolled scans; the rule set
/// stays in one place so it can grow via configuration.
pub fn sensitive_kind(text: &str) -> Option<&'static str> {
    if contains_card_number(text) {
        return Some("card number");
    }
    if contains_email_address(text) {
        return Some("email address");
    }
    if contains_password_assignment(text) {
        return Some("password");
    }
    None
}

fn contains_card_number(text: &str) -> bool {
    let chars: Vec<char> = text.chars().collect();
    let mut index = 0;
    while index < chars.len() {
        if !chars[index].is_ascii_digit() {
            index += 1;
            continue;
        }
        // Walk a digit run, allowing single spaces or dashes between groups.
        let mut digits = 0;
        let mut cursor = index;
        while cursor < chars.len() {
            let c = chars[cursor];
            if c.is_ascii_digit() {
                digits += 1;
                cursor += 1;
            } else if (c == ' ' || c == '-')
                && cursor + 1 < chars.len()
                && chars[cursor + 1].is_ascii_digit()
                && digits > 0
            {
                cursor += 1;
            } else {
                break;
            }
        }
        if digits == 16 {
            return true;
        }
        index = cursor.max(index + 1);
    }
    false
}

fn contains_email_address(text: &str) -> bool {
    let bytes: Vec<char> = text.chars().collect();
    for (index, c) in bytes.iter().enumerate() {
        if *c != '@' || index == 0 || index + 1 >= bytes.len() {
            continue;
        }
        let before_ok = bytes[index - 1].is_ascii_alphanumeric()
            || matches!(bytes[index - 1], '.' | '_' | '-' | '+');
        if !before_ok {
            continue;
        }
        // Domain needs at least one dot followed by letters.
        let rest: String = bytes[index + 1..]
            .iter()
            .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
            .collect();
        if let Some(dot) = rest.rfind('.') {
            let tld = &rest[dot + 1..];
            if dot > 0 && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()) {
                return true;
            }
        }
    }
    false
}

fn contains_password_assignment(text: &str) -> bool {
    let lowered = text.to_lowercase();
    let mut from = 0;
    while let Some(rel) = lowered[from..].find("password") {
        let after = from + rel + "password".len();
        let tail = lowered[after..].trim_start();
        if (tail.starts_with(':') || tail.starts_with('=')) && {
            let value = tail[1..].trim_start();
            !value.is_empty() && !value.starts_with('\n')
        } {
            return true;
        }
        from = after;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OutputItem, TaskPriority};
    use crate::store::test_support::open_temp_store;
    use crate::store::{NewDraft, NewTask};
    use serde_json::Map;
    use std::sync::Mutex as StdMutex;

    fn output(summary: &str, outputs: Vec<OutputItem>) -> AgentOutput {
        AgentOutput {
            status: AgentOutputStatus::Completed,
            priority: TaskPriority::Normal,
            summary: summary.to_string(),
            needs_review: false,
            outputs,
            metadata: Map::new(),
            error: None,
        }
    }

    fn item(content: &str) -> OutputItem {
        OutputItem {
            item_type: "email".to_string(),
            content: content.to_string(),
            metadata: None,
        }
    }

    #[test]
    fn empty_outputs_on_completed_status_fail_review() {
        let review = review_output(&output("a long enough summary", vec![]));
        assert!(!review.approved);
        assert_eq!(
            review.corrections,
            vec!["No outputs provided despite completed status".to_string()]
        );
        assert_eq!(review.quality_score, 60);
    }

    #[test]
    fn short_summary_and_sensitive_content_stack_deductions() {
        let review = review_output(&output(
            "too short",
            vec![item("card 4111 1111 1111 1111 inside")],
        ));
        assert!(!review.approved);
        assert_eq!(review.corrections.len(), 2);
        assert_eq!(review.quality_score, 40);
    }

    #[test]
    fn clean_output_is_approved_at_eighty() {
        let review = review_output(&output(
            "a perfectly reasonable summary",
            vec![item("Dear customer, thanks for reaching out.")],
        ));
        assert!(review.approved);
        assert_eq!(review.quality_score, 80);
    }

    #[test]
    fn review_failure_moves_the_task_back_to_running() {
        let (_tmp, store) = open_temp_store();
        let bus = EventBus::new(None);
        let conductor = QualityConductor::new(store.clone(), bus.clone());
        conductor.start().expect("start");

        let results: Arc<StdMutex<Vec<Value>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = results.clone();
        bus.subscribe(
            events::CONDUCTOR_REVIEW_RESULT,
            "test-sink",
            Arc::new(move |envelope| {
                sink.lock().unwrap().push(envelope.payload.clone());
                Ok(())
            }),
        );

        let task = store
            .insert_task(&NewTask::new("billing-email", TaskPriority::Normal))
            .expect("task");
        store
            .update_task_status(&task.id, TaskStatus::Completed)
            .expect("completed");

        bus.publish(
            events::CONDUCTOR_REVIEW_REQUEST,
            "workflow",
            Some("quality"),
            json!({
                "taskId": task.id,
                "output": output("a long enough summary", vec![]),
            }),
        );

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["approved"], false);
        assert_eq!(
            results[0]["corrections"][0],
            "No outputs provided despite completed status"
        );

        let reloaded = store.find_task(&task.id).expect("find").expect("present");
        assert_eq!(reloaded.status, TaskStatus::Running);
    }

    fn draft(body: &str, subject: &str, to: Vec<String>) -> Draft {
        Draft {
            id: "d-1".to_string(),
            task_id: "t-1".to_string(),
            source_message_id: None,
            channel: "email".to_string(),
            to,
            cc: Vec::new(),
            subject: subject.to_string(),
            body: body.to_string(),
            original_body: body.to_string(),
            status: crate::domain::DraftStatus::PendingReview,
            priority: TaskPriority::Normal,
            conductor_notes: None,
            quality_score: None,
            quality_notes: None,
            auto_approve_match: None,
            reviewed_by: None,
            reviewed_at: None,
            sent_at: None,
            external_draft_id: None,
            metadata: Map::new(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn short_body_boundary_is_exactly_twenty_chars() {
        let nineteen = draft(&"x".repeat(19), "Re: hi", vec!["a@b.example".to_string()]);
        let (score, _) = score_draft(&nineteen);
        assert!(score <= 70);

        let twenty = draft(&"x".repeat(20), "Re: hi", vec!["a@b.example".to_string()]);
        let (score, notes) = score_draft(&twenty);
        assert_eq!(score, 100);
        assert!(notes.is_empty());
    }

    #[test]
    fn deductions_accumulate_and_clamp_at_zero() {
        let bad = draft(
            "short!!! with password = hunter2",
            "x",
            Vec::new(),
        );
        let (score, notes) = score_draft(&bad);
        // 100 - 30 (short) - 15 (subject) - 25 (recipients) - 30 (password) - 10 (!!!)
        assert_eq!(score, 0);
        assert_eq!(notes.len(), 5);
    }

    #[test]
    fn long_body_costs_ten() {
        let long = draft(&"y".repeat(5100), "Re: hi", vec!["a@b.example".to_string()]);
        let (score, notes) = score_draft(&long);
        assert_eq!(score, 90);
        assert_eq!(notes, vec!["body very long".to_string()]);
    }

    #[test]
    fn draft_scoring_persists_score_and_publishes() {
        let (_tmp, store) = open_temp_store();
        let bus = EventBus::new(None);
        let conductor = QualityConductor::new(store.clone(), bus.clone());
        conductor.start().expect("start");

        let reviewed: Arc<StdMutex<Vec<Value>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = reviewed.clone();
        bus.subscribe(
            events::DRAFT_QUALITY_REVIEWED,
            "test-sink",
            Arc::new(move |envelope| {
                sink.lock().unwrap().push(envelope.payload.clone());
                Ok(())
            }),
        );

        let stored = store
            .insert_draft(&NewDraft {
                task_id: "task-1".to_string(),
                source_message_id: None,
                channel: "email".to_string(),
                to: vec!["customer@example.com".to_string()],
                cc: Vec::new(),
                subject: "Re: your question".to_string(),
                body: "A thorough and polite reply body.".to_string(),
                priority: TaskPriority::Normal,
                conductor_notes: None,
                metadata: Map::new(),
            })
            .expect("draft");

        bus.publish(
            events::DRAFT_CREATED,
            "approval-engine",
            None,
            json!({ "draftId": stored.id }),
        );

        let reviewed = reviewed.lock().unwrap();
        assert_eq!(reviewed.len(), 1);
        assert_eq!(reviewed[0]["qualityScore"], 100);

        let loaded = store.find_draft(&stored.id).expect("find").expect("present");
        assert_eq!(loaded.quality_score, Some(100));
    }

    #[test]
    fn sensitive_patterns_detect_cards_emails_and_passwords() {
        assert_eq!(
            sensitive_kind("pay with 4111111111111111 now"),
            Some("card number")
        );
        assert_eq!(
            sensitive_kind("grouped 4111 1111 1111 1111 form"),
            Some("card number")
        );
        assert_eq!(sensitive_kind("17 digits 41111111111111111 is not a card"), None);
        assert_eq!(
            sensitive_kind("contact me at someone@example.com please"),
            Some("email address")
        );
        assert_eq!(
            sensitive_kind("the Password: hunter2 leaked"),
            Some("password")
        );
        assert_eq!(sensitive_kind("please reset your password soon"), None);
        assert_eq!(sensitive_kind("a perfectly clean sentence"), None);
    }
}
