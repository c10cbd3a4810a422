use coreclaw::approval::{change_ratio, classify_edit, ApprovalEngine};
use coreclaw::bus::{events, EventBus};
use coreclaw::domain::{
    AgentOutput, AgentOutputStatus, ChangeType, DraftStatus, OutputItem, TaskPriority,
};
use coreclaw::store::{NewTask, Store};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

fn harness() -> (tempfile::TempDir, Arc<Store>, EventBus, ApprovalEngine) {
    let tmp = tempdir().expect("tempdir");
    let store = Arc::new(Store::open(&tmp.path().join("core.db")).expect("open store"));
    let bus = EventBus::new(None);
    let engine = ApprovalEngine::new(store.clone(), bus.clone());
    (tmp, store, bus, engine)
}

fn output_with_body(body: &str) -> AgentOutput {
    AgentOutput {
        status: AgentOutputStatus::Completed,
        priority: TaskPriority::Normal,
        summary: "drafted a reply".to_string(),
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

// The reference classification examples.
#[test]
fn edit_classification_follows_the_word_set_ratio() {
    let original = "hello world this is a draft";
    assert_eq!(classify_edit(original, original), ChangeType::MinorEdit);
    assert_eq!(change_ratio(original, original), 0.0);

    assert_eq!(
        classify_edit(original, "completely different response text"),
        ChangeType::MajorRewrite
    );
    assert!(change_ratio(original, "completely different response text") > 0.5);

    assert_eq!(classify_edit(original, ""), ChangeType::Rejection);
}

// Boundary ratios: 0.19 minor, 0.21 tone, 0.51 major.
#[test]
fn classification_boundaries_are_exclusive() {
    // 100 distinct words; replacing k of them yields ratio 2k/200 = k/100.
    let words: Vec<String> = (0..100).map(|i| format!("w{i}")).collect();
    let original = words.join(" ");

    let edited_19 = edited_with_replacements(&words, 19);
    assert!((change_ratio(&original, &edited_19) - 0.19).abs() < 1e-9);
    assert_eq!(classify_edit(&original, &edited_19), ChangeType::MinorEdit);

    let edited_21 = edited_with_replacements(&words, 21);
    assert!((change_ratio(&original, &edited_21) - 0.21).abs() < 1e-9);
    assert_eq!(classify_edit(&original, &edited_21), ChangeType::ToneChange);

    let edited_51 = edited_with_replacements(&words, 51);
    assert!((change_ratio(&original, &edited_51) - 0.51).abs() < 1e-9);
    assert_eq!(
        classify_edit(&original, &edited_51),
        ChangeType::MajorRewrite
    );
}

fn edited_with_replacements(words: &[String], count: usize) -> String {
    let mut edited: Vec<String> = words.to_vec();
    for (index, word) in edited.iter_mut().enumerate().take(count) {
        *word = format!("replacement{index}");
    }
    edited.join(" ")
}

#[test]
fn full_draft_lifecycle_emits_the_expected_events() {
    let (_tmp, store, bus, engine) = harness();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe(
        "*",
        "recorder",
        Arc::new(move |envelope| {
            sink.lock().unwrap().push(envelope.event_type.clone());
            Ok(())
        }),
    );

    let task = store
        .insert_task(&NewTask::new("general-email", TaskPriority::Normal))
        .expect("task");
    let draft = engine
        .create_draft(&task, &output_with_body("Dear customer, thank you."), "email")
        .expect("create");
    engine.approve(&draft.id, "ops@example.com").expect("approve");
    engine.mark_sent(&draft.id).expect("send");

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            events::DRAFT_CREATED.to_string(),
            events::DRAFT_APPROVED.to_string(),
            events::DRAFT_SENT.to_string()
        ]
    );
}

#[test]
fn edit_and_approve_publishes_correction_recorded() {
    let (_tmp, store, bus, engine) = harness();
    let corrections: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = corrections.clone();
    bus.subscribe(
        events::CORRECTION_RECORDED,
        "recorder",
        Arc::new(move |envelope| {
            sink.lock().unwrap().push(envelope.payload.clone());
            Ok(())
        }),
    );

    let task = store
        .insert_task(&NewTask::new("general-email", TaskPriority::Normal))
        .expect("task");
    let draft = engine
        .create_draft(&task, &output_with_body("the original body text"), "email")
        .expect("create");
    engine
        .edit_and_approve(
            &draft.id,
            "the original body text with a tweak",
            None,
            Some("small touch-up"),
            "ops@example.com",
        )
        .expect("edit");

    let corrections = corrections.lock().unwrap();
    assert_eq!(corrections.len(), 1);
    assert_eq!(corrections[0]["changeType"], "minor_edit");
    assert_eq!(corrections[0]["draftId"], draft.id.as_str());

    let stored = store.corrections_for_draft(&draft.id).expect("list");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].change_type, ChangeType::MinorEdit);
}

#[test]
fn rejected_draft_cannot_be_approved_later() {
    let (_tmp, store, _bus, engine) = harness();
    let task = store
        .insert_task(&NewTask::new("general-email", TaskPriority::Normal))
        .expect("task");
    let draft = engine
        .create_draft(&task, &output_with_body("body under review"), "email")
        .expect("create");

    engine
        .reject(&draft.id, "ops@example.com", "not our customer")
        .expect("reject");
    assert!(engine.approve(&draft.id, "ops@example.com").is_err());

    let loaded = store.find_draft(&draft.id).expect("find").expect("present");
    assert_eq!(loaded.status, DraftStatus::Rejected);
    assert!(loaded.reviewed_at.is_some());
    assert!(loaded.sent_at.is_none());
}
