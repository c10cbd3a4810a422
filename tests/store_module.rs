use coreclaw::domain::{MessageDirection, MessageStatus, TaskPriority, TaskStatus};
use coreclaw::store::{NewMessage, NewPromptVersion, NewTask, Store};
use serde_json::Map;
use std::sync::Arc;
use tempfile::tempdir;

fn open_store(dir: &std::path::Path) -> Arc<Store> {
    Arc::new(Store::open(&dir.join("core.db")).expect("open store"))
}

#[test]
fn insert_then_read_message_round_trips_all_fields() {
    let tmp = tempdir().expect("tempdir");
    let store = open_store(tmp.path());

    let mut metadata = Map::new();
    metadata.insert(
        "internetMessageId".to_string(),
        serde_json::Value::from("<abc@mail.example>"),
    );
    let inserted = store
        .insert_message(&NewMessage {
            channel: "email".to_string(),
            direction: MessageDirection::Inbound,
            external_id: Some("graph-123".to_string()),
            from: "customer@example.com".to_string(),
            to: vec![
                "support@example.com".to_string(),
                "billing@example.com".to_string(),
            ],
            subject: Some("Invoice 4711".to_string()),
            body: "Where is my invoice?".to_string(),
            metadata: metadata.clone(),
            thread_id: Some("thread-9".to_string()),
        })
        .expect("insert");

    let loaded = store
        .find_message(&inserted.id)
        .expect("find")
        .expect("present");
    assert_eq!(loaded.channel, "email");
    assert_eq!(loaded.direction, MessageDirection::Inbound);
    assert_eq!(loaded.external_id.as_deref(), Some("graph-123"));
    assert_eq!(loaded.from, "customer@example.com");
    assert_eq!(loaded.to.len(), 2);
    assert_eq!(loaded.subject.as_deref(), Some("Invoice 4711"));
    assert_eq!(loaded.body, "Where is my invoice?");
    assert_eq!(loaded.metadata, metadata);
    assert_eq!(loaded.status, MessageStatus::New);
    assert_eq!(loaded.thread_id.as_deref(), Some("thread-9"));
    assert!(!loaded.created_at.is_empty());
}

#[test]
fn reopening_the_store_preserves_rows_and_migrations() {
    let tmp = tempdir().expect("tempdir");
    let task_id = {
        let store = open_store(tmp.path());
        store
            .insert_task(&NewTask::new("general-email", TaskPriority::Normal))
            .expect("task")
            .id
    };

    let store = open_store(tmp.path());
    let task = store.find_task(&task_id).expect("find").expect("present");
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(!store.applied_migrations().expect("versions").is_empty());
}

#[test]
fn completed_at_invariant_holds_for_every_terminal_status() {
    let tmp = tempdir().expect("tempdir");
    let store = open_store(tmp.path());

    for terminal in [
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ] {
        let task = store
            .insert_task(&NewTask::new("general-email", TaskPriority::Normal))
            .expect("task");
        assert!(task.completed_at.is_none());
        store
            .update_task_status(&task.id, terminal)
            .expect("terminal");
        let loaded = store.find_task(&task.id).expect("find").expect("present");
        assert!(loaded.completed_at.is_some());
    }

    let open = store
        .insert_task(&NewTask::new("general-email", TaskPriority::Normal))
        .expect("task");
    for active in [TaskStatus::Queued, TaskStatus::Running] {
        store.update_task_status(&open.id, active).expect("active");
        let loaded = store.find_task(&open.id).expect("find").expect("present");
        assert!(loaded.completed_at.is_none());
    }
}

#[test]
fn at_most_one_prompt_version_is_active_per_name() {
    let tmp = tempdir().expect("tempdir");
    let store = open_store(tmp.path());

    let mut ids = Vec::new();
    for content in ["v1", "v2", "v3"] {
        ids.push(
            store
                .insert_prompt_version(&NewPromptVersion {
                    name: "general-email-system-prompt".to_string(),
                    content: content.to_string(),
                })
                .expect("insert")
                .id,
        );
    }
    for id in &ids {
        store.activate_prompt_version(id).expect("activate");
    }

    let mut active_count = 0;
    for id in &ids {
        if store
            .find_prompt_version(id)
            .expect("find")
            .expect("present")
            .active
        {
            active_count += 1;
        }
    }
    assert_eq!(active_count, 1);
    assert_eq!(
        store
            .active_prompt_version("general-email-system-prompt")
            .expect("query")
            .expect("active")
            .id,
        ids[2]
    );
}
