use super::{sql_err, Store, StoreError};
use crate::domain::{AgentOutput, Task, TaskPriority, TaskStatus};
use crate::shared::ids::{new_uuid, now_iso};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: String,
    pub priority: TaskPriority,
    pub payload: Map<String, Value>,
    pub source_channel: Option<String>,
    pub source_message_id: Option<String>,
    pub conductor_id: Option<String>,
    pub max_retries: u32,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, priority: TaskPriority) -> Self {
        Self {
            task_type: task_type.into(),
            priority,
            payload: Map::new(),
            source_channel: None,
            source_message_id: None,
            conductor_id: None,
            max_retries: 3,
        }
    }
}

impl Store {
    pub fn insert_task(&self, new: &NewTask) -> Result<Task, StoreError> {
        let id = new_uuid();
        let now = now_iso();
        let payload = serde_json::to_string(&new.payload).unwrap_or_else(|_| "{}".to_string());

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (
                id, task_type, status, priority, payload, source_channel,
                source_message_id, conductor_id, retry_count, max_retries,
                created_at, updated_at
            ) VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?9)",
            params![
                id,
                new.task_type,
                new.priority.as_str(),
                payload,
                new.source_channel,
                new.source_message_id,
                new.conductor_id,
                new.max_retries,
                now,
            ],
        )
        .map_err(sql_err)?;
        drop(conn);

        self.find_task(&id)?.ok_or(StoreError::NotFound {
            entity: "task",
            id,
        })
    }

    pub fn find_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id],
                map_task_row,
            )
            .optional()
            .map_err(sql_err)?;
        drop(conn);
        Ok(self.finish_task_row(row))
    }

    /// Pending and queued work, priority rank then FIFO. This is the order the
    /// queue re-fills from after a restart.
    pub fn find_pending_tasks(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE status IN ('pending', 'queued')
                 ORDER BY {PRIORITY_RANK_SQL}, created_at ASC, rowid ASC LIMIT ?1"
            ),
            params![limit as i64],
        )
    }

    pub fn find_tasks_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE status = ?1 ORDER BY created_at ASC, rowid ASC LIMIT ?2"
            ),
            params![status.as_str(), limit as i64],
        )
    }

    /// Moves the task and stamps completed_at exactly once when it enters a
    /// terminal status.
    pub fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE tasks SET
                    status = ?2,
                    updated_at = ?3,
                    completed_at = CASE
                        WHEN ?2 IN ('completed', 'failed', 'cancelled')
                            THEN COALESCE(completed_at, ?3)
                        ELSE completed_at
                    END
                 WHERE id = ?1",
                params![id, status.as_str(), now_iso()],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "task",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn update_task_result(&self, id: &str, result: &AgentOutput) -> Result<(), StoreError> {
        let raw = serde_json::to_string(result).unwrap_or_else(|_| "null".to_string());
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE tasks SET result = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, raw, now_iso()],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "task",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn update_task_agent(&self, id: &str, agent_id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE tasks SET agent_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, agent_id, now_iso()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Returns the retry count after the increment.
    pub fn increment_task_retry(&self, id: &str) -> Result<u32, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE tasks SET retry_count = retry_count + 1, updated_at = ?2 WHERE id = ?1",
            params![id, now_iso()],
        )
        .map_err(sql_err)?;
        let count: u32 = conn
            .query_row("SELECT retry_count FROM tasks WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(sql_err)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "task",
                id: id.to_string(),
            })?;
        Ok(count)
    }

    fn query_tasks(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Task>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(sql_err)?;
        let rows = stmt.query_map(args, map_task_row).map_err(sql_err)?;
        let mut raw = Vec::new();
        for row in rows {
            raw.push(row.map_err(sql_err)?);
        }
        drop(stmt);
        drop(conn);
        Ok(raw
            .into_iter()
            .filter_map(|row| self.finish_task_row(Some(row)))
            .collect())
    }

    fn finish_task_row(&self, row: Option<RawTaskRow>) -> Option<Task> {
        let row = row?;
        let Some(status) = TaskStatus::parse(&row.status) else {
            self.log_skipped_row("tasks", &row.id, "invalid status");
            return None;
        };
        let Some(priority) = TaskPriority::parse(&row.priority) else {
            self.log_skipped_row("tasks", &row.id, "invalid priority");
            return None;
        };
        let payload = match serde_json::from_str(&row.payload) {
            Ok(payload) => payload,
            Err(_) => {
                self.log_skipped_row("tasks", &row.id, "invalid payload json");
                return None;
            }
        };
        let result = match row.result {
            None => None,
            Some(raw) => match serde_json::from_str::<AgentOutput>(&raw) {
                Ok(output) => Some(output),
                Err(_) => {
                    self.log_skipped_row("tasks", &row.id, "invalid result json");
                    None
                }
            },
        };
        Some(Task {
            id: row.id,
            task_type: row.task_type,
            status,
            priority,
            payload,
            source_channel: row.source_channel,
            source_message_id: row.source_message_id,
            agent_id: row.agent_id,
            conductor_id: row.conductor_id,
            result,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

pub(crate) const PRIORITY_RANK_SQL: &str = "CASE priority
    WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 WHEN 'normal' THEN 2 ELSE 3 END";

const TASK_COLUMNS: &str = "id, task_type, status, priority, payload, source_channel, \
     source_message_id, agent_id, conductor_id, result, retry_count, max_retries, \
     created_at, updated_at, completed_at";

struct RawTaskRow {
    id: String,
    task_type: String,
    status: String,
    priority: String,
    payload: String,
    source_channel: Option<String>,
    source_message_id: Option<String>,
    agent_id: Option<String>,
    conductor_id: Option<String>,
    result: Option<String>,
    retry_count: u32,
    max_retries: u32,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

fn map_task_row(row: &Row<'_>) -> rusqlite::Result<RawTaskRow> {
    Ok(RawTaskRow {
        id: row.get(0)?,
        task_type: row.get(1)?,
        status: row.get(2)?,
        priority: row.get(3)?,
        payload: row.get(4)?,
        source_channel: row.get(5)?,
        source_message_id: row.get(6)?,
        agent_id: row.get(7)?,
        conductor_id: row.get(8)?,
        result: row.get(9)?,
        retry_count: row.get(10)?,
        max_retries: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}
