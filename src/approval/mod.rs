use crate::bus::{events, EventBus};
use crate::domain::{AgentOutput, ChangeType, Draft, DraftStatus, Task};
use crate::store::{NewCorrection, NewDraft, Store, StoreError};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

const SUBJECT_FALLBACK_CHARS: usize = 80;
const AUTO_APPROVE_MIN_SUMMARY_CHARS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("draft {id} not found")]
    DraftNotFound { id: String },
    #[error("draft {id} is {status}, expected pending_review")]
    NotPendingReview { id: String, status: String },
    #[error("draft {id} is {status}, cannot mark sent")]
    NotSendable { id: String, status: String },
    #[error("rejection requires a non-empty reason")]
    EmptyRejectionReason,
}

/// Draft lifecycle and human-edit classification. Every transition persists
/// first and publishes after, so bus subscribers always observe stored state.
pub struct ApprovalEngine {
    store: Arc<Store>,
    bus: EventBus,
}

impl ApprovalEngine {
    pub fn new(store: Arc<Store>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Body comes from the first email-like output item, falling back to the
    /// agent summary. Recipients default to the source message sender; the
    /// subject is the source subject with a `Re: ` prefix, or the truncated
    /// summary when there is no source message.
    pub fn create_draft(
        &self,
        task: &Task,
        output: &AgentOutput,
        channel: &str,
    ) -> Result<Draft, ApprovalError> {
        let body = output
            .outputs
            .iter()
            .find(|item| matches!(item.item_type.as_str(), "email" | "reply" | "draft"))
            .map(|item| item.content.clone())
            .unwrap_or_else(|| output.summary.clone());

        let source_message = match &task.source_message_id {
            Some(id) => self.store.find_message(id)?,
            None => None,
        };

        let to = source_message
            .as_ref()
            .map(|message| vec![message.from.clone()])
            .unwrap_or_default();
        let subject = match source_message.as_ref().and_then(|m| m.subject.clone()) {
            Some(subject) if subject.to_lowercase().starts_with("re:") => subject,
            Some(subject) => format!("Re: {subject}"),
            None => truncate_chars(&output.summary, SUBJECT_FALLBACK_CHARS),
        };

        let mut metadata = Map::new();
        metadata.insert("agentType".to_string(), Value::from(task.task_type.clone()));

        let draft = self.store.insert_draft(&NewDraft {
            task_id: task.id.clone(),
            source_message_id: task.source_message_id.clone(),
            channel: channel.to_string(),
            to,
            cc: Vec::new(),
            subject,
            body,
            priority: output.priority,
            conductor_notes: None,
            metadata,
        })?;

        self.bus.publish(
            events::DRAFT_CREATED,
            "approval-engine",
            None,
            json!({
                "draftId": draft.id,
                "taskId": draft.task_id,
                "channel": draft.channel,
                "priority": draft.priority,
            }),
        );
        Ok(draft)
    }

    pub fn approve(&self, draft_id: &str, reviewed_by: &str) -> Result<Draft, ApprovalError> {
        let draft = self.require_pending(draft_id)?;
        self.store
            .update_draft_status(&draft.id, DraftStatus::Approved, Some(reviewed_by))?;
        let reloaded = self.reload(draft_id)?;
        self.bus.publish(
            events::DRAFT_APPROVED,
            "approval-engine",
            None,
            json!({ "draftId": reloaded.id, "reviewedBy": reviewed_by }),
        );
        Ok(reloaded)
    }

    pub fn reject(
        &self,
        draft_id: &str,
        reviewed_by: &str,
        reason: &str,
    ) -> Result<Draft, ApprovalError> {
        if reason.trim().is_empty() {
            return Err(ApprovalError::EmptyRejectionReason);
        }
        let draft = self.require_pending(draft_id)?;
        self.store
            .update_draft_status(&draft.id, DraftStatus::Rejected, Some(reviewed_by))?;
        let correction = self.store.insert_correction(&NewCorrection {
            draft_id: draft.id.clone(),
            task_id: draft.task_id.clone(),
            original_body: draft.original_body.clone(),
            edited_body: String::new(),
            edited_subject: None,
            change_type: ChangeType::Rejection,
            feedback: Some(reason.to_string()),
        })?;

        let reloaded = self.reload(draft_id)?;
        self.bus.publish(
            events::DRAFT_REJECTED,
            "approval-engine",
            None,
            json!({ "draftId": reloaded.id, "reason": reason }),
        );
        self.publish_correction(&correction.id, &reloaded, ChangeType::Rejection);
        Ok(reloaded)
    }

    pub fn edit_and_approve(
        &self,
        draft_id: &str,
        new_body: &str,
        new_subject: Option<&str>,
        feedback: Option<&str>,
        reviewed_by: &str,
    ) -> Result<Draft, ApprovalError> {
        let draft = self.require_pending(draft_id)?;
        let change_type = classify_edit(&draft.original_body, new_body);

        self.store.update_draft_body(&draft.id, new_body, new_subject)?;
        self.store
            .update_draft_status(&draft.id, DraftStatus::EditedAndSent, Some(reviewed_by))?;
        let correction = self.store.insert_correction(&NewCorrection {
            draft_id: draft.id.clone(),
            task_id: draft.task_id.clone(),
            original_body: draft.original_body.clone(),
            edited_body: new_body.to_string(),
            edited_subject: new_subject.map(str::to_string),
            change_type,
            feedback: feedback.map(str::to_string),
        })?;

        let reloaded = self.reload(draft_id)?;
        self.bus.publish(
            events::DRAFT_EDITED,
            "approval-engine",
            None,
            json!({
                "draftId": reloaded.id,
                "changeType": change_type,
            }),
        );
        self.publish_correction(&correction.id, &reloaded, change_type);
        Ok(reloaded)
    }

    pub fn auto_approve(&self, draft_id: &str, rule_name: &str) -> Result<Draft, ApprovalError> {
        let draft = self.require_pending(draft_id)?;
        self.store.set_draft_auto_approve_match(&draft.id, rule_name)?;
        self.store
            .update_draft_status(&draft.id, DraftStatus::AutoApproved, None)?;
        let reloaded = self.reload(draft_id)?;
        self.bus.publish(
            events::DRAFT_AUTO_APPROVED,
            "approval-engine",
            None,
            json!({ "draftId": reloaded.id, "rule": rule_name }),
        );
        Ok(reloaded)
    }

    /// approved|auto_approved -> sent. edited_and_sent is already terminal.
    pub fn mark_sent(&self, draft_id: &str) -> Result<Draft, ApprovalError> {
        let draft = self
            .store
            .find_draft(draft_id)?
            .ok_or_else(|| ApprovalError::DraftNotFound {
                id: draft_id.to_string(),
            })?;
        if !matches!(
            draft.status,
            DraftStatus::Approved | DraftStatus::AutoApproved
        ) {
            return Err(ApprovalError::NotSendable {
                id: draft.id,
                status: draft.status.as_str().to_string(),
            });
        }
        self.store
            .update_draft_status(&draft.id, DraftStatus::Sent, None)?;
        let reloaded = self.reload(draft_id)?;
        self.bus.publish(
            events::DRAFT_SENT,
            "approval-engine",
            None,
            json!({ "draftId": reloaded.id }),
        );
        Ok(reloaded)
    }

    /// First enabled approval rule the draft satisfies, if any. Criteria keys:
    /// minQualityScore, maxPriority, agentTypes, minSummaryChars.
    pub fn match_auto_approve_rule(&self, draft: &Draft) -> Result<Option<String>, ApprovalError> {
        let body_len = draft.body.chars().count();
        for rule in self.store.enabled_approval_rules()? {
            if rule_matches(&rule.criteria, draft, body_len) {
                return Ok(Some(rule.name));
            }
        }
        Ok(None)
    }

    fn publish_correction(&self, correction_id: &str, draft: &Draft, change_type: ChangeType) {
        self.bus.publish(
            events::CORRECTION_RECORDED,
            "approval-engine",
            None,
            json!({
                "correctionId": correction_id,
                "draftId": draft.id,
                "taskId": draft.task_id,
                "changeType": change_type,
            }),
        );
    }

    fn require_pending(&self, draft_id: &str) -> Result<Draft, ApprovalError> {
        let draft = self
            .store
            .find_draft(draft_id)?
            .ok_or_else(|| ApprovalError::DraftNotFound {
                id: draft_id.to_string(),
            })?;
        if draft.status != DraftStatus::PendingReview {
            return Err(ApprovalError::NotPendingReview {
                id: draft.id,
                status: draft.status.as_str().to_string(),
            });
        }
        Ok(draft)
    }

    fn reload(&self, draft_id: &str) -> Result<Draft, ApprovalError> {
        self.store
            .find_draft(draft_id)?
            .ok_or_else(|| ApprovalError::DraftNotFound {
                id: draft_id.to_string(),
            })
    }
}

fn rule_matches(criteria: &Map<String, Value>, draft: &Draft, body_len: usize) -> bool {
    if let Some(min_score) = criteria.get("minQualityScore").and_then(Value::as_i64) {
        match draft.quality_score {
            Some(score) if score >= min_score => {}
            _ => return false,
        }
    }
    if let Some(max_priority) = criteria.get("maxPriority").and_then(Value::as_str) {
        let Some(cap) = crate::domain::TaskPriority::parse(max_priority) else {
            return false;
        };
        // Auto-approval never applies above the configured urgency.
        if draft.priority.rank() < cap.rank() {
            return false;
        }
    }
    if let Some(agent_types) = criteria.get("agentTypes").and_then(Value::as_array) {
        let agent_type = draft
            .metadata
            .get("agentType")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !agent_types
            .iter()
            .filter_map(Value::as_str)
            .any(|t| t == agent_type)
        {
            return false;
        }
    }
    let min_summary = criteria
        .get("minSummaryChars")
        .and_then(Value::as_u64)
        .unwrap_or(AUTO_APPROVE_MIN_SUMMARY_CHARS as u64) as usize;
    body_len >= min_summary
}

/// Word-set difference ratio over whitespace tokens (lower-cased):
/// `changed = |edited \ original| + |original \ edited|`,
/// `ratio = changed / (2 * max(|original|, |edited|))`.
pub fn change_ratio(original: &str, edited: &str) -> f64 {
    let original_words: HashSet<String> = tokenize(original);
    let edited_words: HashSet<String> = tokenize(edited);
    let total = original_words.len().max(edited_words.len());
    if total == 0 {
        return 0.0;
    }
    let changed = edited_words.difference(&original_words).count()
        + original_words.difference(&edited_words).count();
    changed as f64 / (2.0 * total as f64)
}

pub fn classify_edit(original: &str, edited: &str) -> ChangeType {
    if edited.trim().is_empty() {
        return ChangeType::Rejection;
    }
    let ratio = change_ratio(original, edited);
    if ratio > 0.5 {
        ChangeType::MajorRewrite
    } else if ratio > 0.2 {
        ChangeType::ToneChange
    } else {
        ChangeType::MinorEdit
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect()
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AgentOutputStatus, MessageDirection, OutputItem, TaskPriority,
    };
    use crate::store::test_support::open_temp_store;
    use crate::store::{NewMessage, NewTask};

    fn engine() -> (tempfile::TempDir, Arc<Store>, ApprovalEngine) {
        let (tmp, store) = open_temp_store();
        let bus = EventBus::new(None);
        let engine = ApprovalEngine::new(store.clone(), bus);
        (tmp, store, engine)
    }

    fn email_output(body: &str) -> AgentOutput {
        AgentOutput {
            status: AgentOutputStatus::Completed,
            priority: TaskPriority::Normal,
            summary: "drafted a customer reply".to_string(),
            needs_review: true,
            outputs: vec![OutputItem {
                item_type: "email".to_string(),
                content: body.to_string(),
                metadata: None,
            }],
            metadata: Map::new(),
            error: None,
        }
    }

    fn task_with_message(store: &Store) -> Task {
        let message = store
            .insert_message(&NewMessage {
                channel: "email".to_string(),
                direction: MessageDirection::Inbound,
                external_id: None,
                from: "customer@example.com".to_string(),
                to: vec!["support@example.com".to_string()],
                subject: Some("Invoice question".to_string()),
                body: "Where is my invoice?".to_string(),
                metadata: Map::new(),
                thread_id: None,
            })
            .expect("message");
        let mut new = NewTask::new("billing-email", TaskPriority::Normal);
        new.source_message_id = Some(message.id.clone());
        new.source_channel = Some("email".to_string());
        store.insert_task(&new).expect("task")
    }

    #[test]
    fn create_draft_derives_recipients_subject_and_metadata() {
        let (_tmp, store, engine) = engine();
        let task = task_with_message(&store);
        let draft = engine
            .create_draft(&task, &email_output("Dear customer, see attached."), "email")
            .expect("draft");

        assert_eq!(draft.to, vec!["customer@example.com".to_string()]);
        assert_eq!(draft.subject, "Re: Invoice question");
        assert_eq!(draft.body, "Dear customer, see attached.");
        assert_eq!(draft.status, DraftStatus::PendingReview);
        assert_eq!(
            draft.metadata.get("agentType").and_then(Value::as_str),
            Some("billing-email")
        );
    }

    #[test]
    fn create_draft_does_not_double_the_reply_prefix() {
        let (_tmp, store, engine) = engine();
        let message = store
            .insert_message(&NewMessage {
                channel: "email".to_string(),
                direction: MessageDirection::Inbound,
                external_id: None,
                from: "customer@example.com".to_string(),
                to: vec![],
                subject: Some("Re: Invoice question".to_string()),
                body: "follow up".to_string(),
                metadata: Map::new(),
                thread_id: None,
            })
            .expect("message");
        let mut new = NewTask::new("billing-email", TaskPriority::Normal);
        new.source_message_id = Some(message.id);
        let task = store.insert_task(&new).expect("task");

        let draft = engine
            .create_draft(&task, &email_output("body"), "email")
            .expect("draft");
        assert_eq!(draft.subject, "Re: Invoice question");
    }

    #[test]
    fn approve_requires_pending_review() {
        let (_tmp, store, engine) = engine();
        let task = task_with_message(&store);
        let draft = engine
            .create_draft(&task, &email_output("body text here"), "email")
            .expect("draft");

        let approved = engine.approve(&draft.id, "ops@example.com").expect("approve");
        assert_eq!(approved.status, DraftStatus::Approved);
        assert!(approved.reviewed_at.is_some());

        let err = engine
            .approve(&draft.id, "ops@example.com")
            .expect_err("double approve");
        assert!(matches!(err, ApprovalError::NotPendingReview { .. }));
    }

    #[test]
    fn reject_records_a_rejection_correction() {
        let (_tmp, store, engine) = engine();
        let task = task_with_message(&store);
        let draft = engine
            .create_draft(&task, &email_output("body text here"), "email")
            .expect("draft");

        assert!(matches!(
            engine.reject(&draft.id, "ops@example.com", "  "),
            Err(ApprovalError::EmptyRejectionReason)
        ));

        let rejected = engine
            .reject(&draft.id, "ops@example.com", "wrong customer entirely")
            .expect("reject");
        assert_eq!(rejected.status, DraftStatus::Rejected);

        let corrections = store.corrections_for_draft(&draft.id).expect("corrections");
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].change_type, ChangeType::Rejection);
        assert!(corrections[0].edited_body.is_empty());
        assert_eq!(
            corrections[0].feedback.as_deref(),
            Some("wrong customer entirely")
        );
    }

    #[test]
    fn edit_and_approve_classifies_and_records() {
        let (_tmp, store, engine) = engine();
        let task = task_with_message(&store);
        let draft = engine
            .create_draft(
                &task,
                &email_output("hello world this is a draft"),
                "email",
            )
            .expect("draft");

        let edited = engine
            .edit_and_approve(
                &draft.id,
                "completely different response text",
                Some("New subject"),
                Some("tone was off"),
                "ops@example.com",
            )
            .expect("edit");
        assert_eq!(edited.status, DraftStatus::EditedAndSent);
        assert_eq!(edited.body, "completely different response text");
        assert_eq!(edited.subject, "New subject");
        assert_eq!(edited.original_body, "hello world this is a draft");
        assert!(edited.sent_at.is_some());
        assert!(edited.reviewed_at.is_some());

        let corrections = store.corrections_for_draft(&draft.id).expect("corrections");
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].change_type, ChangeType::MajorRewrite);
    }

    #[test]
    fn mark_sent_only_from_approved_like_states() {
        let (_tmp, store, engine) = engine();
        let task = task_with_message(&store);
        let draft = engine
            .create_draft(&task, &email_output("body text here"), "email")
            .expect("draft");

        assert!(matches!(
            engine.mark_sent(&draft.id),
            Err(ApprovalError::NotSendable { .. })
        ));

        engine.approve(&draft.id, "ops@example.com").expect("approve");
        let sent = engine.mark_sent(&draft.id).expect("send");
        assert_eq!(sent.status, DraftStatus::Sent);
        assert!(sent.sent_at.is_some());

        // edited_and_sent is terminal; a second transition is refused.
        let other = engine
            .create_draft(&task, &email_output("another body"), "email")
            .expect("draft2");
        engine
            .edit_and_approve(&other.id, "tweaked body", None, None, "ops@example.com")
            .expect("edit");
        assert!(matches!(
            engine.mark_sent(&other.id),
            Err(ApprovalError::NotSendable { .. })
        ));
    }

    #[test]
    fn auto_approve_records_the_rule_name() {
        let (_tmp, store, engine) = engine();
        let task = task_with_message(&store);
        let draft = engine
            .create_draft(&task, &email_output("body text here"), "email")
            .expect("draft");

        let approved = engine
            .auto_approve(&draft.id, "high-quality")
            .expect("auto approve");
        assert_eq!(approved.status, DraftStatus::AutoApproved);
        assert_eq!(approved.auto_approve_match.as_deref(), Some("high-quality"));
        assert!(approved.sent_at.is_some());
    }

    #[test]
    fn change_ratio_boundaries_map_to_change_types() {
        // Identical bodies are a minor edit with ratio zero.
        assert_eq!(
            classify_edit("hello world this is a draft", "hello world this is a draft"),
            ChangeType::MinorEdit
        );
        // A full rewrite crosses the 0.5 boundary.
        assert_eq!(
            classify_edit(
                "hello world this is a draft",
                "completely different response text"
            ),
            ChangeType::MajorRewrite
        );
        // Empty edit is a rejection.
        assert_eq!(classify_edit("anything", "   "), ChangeType::Rejection);
    }

    #[test]
    fn change_ratio_thresholds_are_exclusive() {
        // 10 original words, swap one: changed = 2, ratio = 2/20 = 0.1.
        let original = "a b c d e f g h i j";
        let minor = "a b c d e f g h i x";
        assert!(change_ratio(original, minor) <= 0.2);
        assert_eq!(classify_edit(original, minor), ChangeType::MinorEdit);

        // Swap three of ten: changed = 6, ratio = 0.3.
        let tone = "a b c d e f g x y z";
        let ratio = change_ratio(original, tone);
        assert!(ratio > 0.2 && ratio <= 0.5);
        assert_eq!(classify_edit(original, tone), ChangeType::ToneChange);

        // Swap six of ten: changed = 12, ratio = 0.6.
        let rewrite = "a b c d u v w x y z";
        assert!(change_ratio(original, rewrite) > 0.5);
        assert_eq!(classify_edit(original, rewrite), ChangeType::MajorRewrite);
    }

    #[test]
    fn rule_matching_checks_quality_and_agent_type() {
        let (_tmp, store, engine) = engine();
        let mut criteria = Map::new();
        criteria.insert("minQualityScore".to_string(), Value::from(80));
        criteria.insert(
            "agentTypes".to_string(),
            Value::from(vec!["billing-email".to_string()]),
        );
        store
            .insert_approval_rule("billing-clean", true, &criteria)
            .expect("rule");

        let task = task_with_message(&store);
        let draft = engine
            .create_draft(&task, &email_output("a perfectly fine body"), "email")
            .expect("draft");

        // No quality score yet: the rule does not match.
        let loaded = store.find_draft(&draft.id).expect("find").expect("present");
        assert_eq!(engine.match_auto_approve_rule(&loaded).expect("match"), None);

        store
            .update_draft_quality(&draft.id, 92, None)
            .expect("quality");
        let loaded = store.find_draft(&draft.id).expect("find").expect("present");
        assert_eq!(
            engine.match_auto_approve_rule(&loaded).expect("match"),
            Some("billing-clean".to_string())
        );
    }
}
