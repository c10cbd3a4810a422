use super::{sql_err, Store, StoreError};
use crate::domain::{Message, MessageDirection, MessageStatus};
use crate::shared::ids::{new_uuid, now_iso};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::{Map, Value};

/// Insert shape; the store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub channel: String,
    pub direction: MessageDirection,
    pub external_id: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub subject: Option<String>,
    pub body: String,
    pub metadata: Map<String, Value>,
    pub thread_id: Option<String>,
}

impl Store {
    pub fn insert_message(&self, new: &NewMessage) -> Result<Message, StoreError> {
        let id = new_uuid();
        let now = now_iso();
        let recipients =
            serde_json::to_string(&new.to).unwrap_or_else(|_| "[]".to_string());
        let metadata = serde_json::to_string(&new.metadata).unwrap_or_else(|_| "{}".to_string());

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO messages (
                id, channel, direction, external_id, sender, recipients, subject,
                body, metadata, status, thread_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'new', ?10, ?11, ?11)",
            params![
                id,
                new.channel,
                new.direction.as_str(),
                new.external_id,
                new.from,
                recipients,
                new.subject,
                new.body,
                metadata,
                new.thread_id,
                now,
            ],
        )
        .map_err(sql_err)?;
        drop(conn);

        self.find_message(&id)?.ok_or(StoreError::NotFound {
            entity: "message",
            id,
        })
    }

    pub fn find_message(&self, id: &str) -> Result<Option<Message>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                [id],
                map_message_row,
            )
            .optional()
            .map_err(sql_err)?;
        drop(conn);
        Ok(self.finish_message_row(row))
    }

    pub fn find_messages_by_status(
        &self,
        status: MessageStatus,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![status.as_str(), limit as i64], map_message_row)
            .map_err(sql_err)?;
        let mut raw = Vec::new();
        for row in rows {
            raw.push(row.map_err(sql_err)?);
        }
        drop(stmt);
        drop(conn);
        Ok(raw
            .into_iter()
            .filter_map(|row| self.finish_message_row(Some(row)))
            .collect())
    }

    /// Thread-scoped variant kept alongside the global fetch; the Context
    /// conductor currently filters in memory (see DESIGN.md).
    pub fn find_thread_messages(
        &self,
        thread_id: &str,
        status: MessageStatus,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE thread_id = ?1 AND status = ?2
                 ORDER BY created_at DESC LIMIT ?3"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(
                params![thread_id, status.as_str(), limit as i64],
                map_message_row,
            )
            .map_err(sql_err)?;
        let mut raw = Vec::new();
        for row in rows {
            raw.push(row.map_err(sql_err)?);
        }
        drop(stmt);
        drop(conn);
        Ok(raw
            .into_iter()
            .filter_map(|row| self.finish_message_row(Some(row)))
            .collect())
    }

    pub fn update_message_status(
        &self,
        id: &str,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        let current = self.find_message(id)?.ok_or_else(|| StoreError::NotFound {
            entity: "message",
            id: id.to_string(),
        })?;
        if !current.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                entity: "message",
                from: current.status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }

        let conn = self.lock()?;
        conn.execute(
            "UPDATE messages SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now_iso()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn attach_message_task(&self, id: &str, task_id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE messages SET task_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, task_id, now_iso()],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "message",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn finish_message_row(&self, row: Option<RawMessageRow>) -> Option<Message> {
        let row = row?;
        let Some(direction) = MessageDirection::parse(&row.direction) else {
            self.log_skipped_row("messages", &row.id, "invalid direction");
            return None;
        };
        let Some(status) = MessageStatus::parse(&row.status) else {
            self.log_skipped_row("messages", &row.id, "invalid status");
            return None;
        };
        let to = match serde_json::from_str(&row.recipients) {
            Ok(to) => to,
            Err(_) => {
                self.log_skipped_row("messages", &row.id, "invalid recipients json");
                return None;
            }
        };
        let metadata = match serde_json::from_str(&row.metadata) {
            Ok(metadata) => metadata,
            Err(_) => {
                self.log_skipped_row("messages", &row.id, "invalid metadata json");
                return None;
            }
        };
        Some(Message {
            id: row.id,
            channel: row.channel,
            direction,
            external_id: row.external_id,
            from: row.sender,
            to,
            subject: row.subject,
            body: row.body,
            metadata,
            status,
            task_id: row.task_id,
            thread_id: row.thread_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const MESSAGE_COLUMNS: &str = "id, channel, direction, external_id, sender, recipients, \
     subject, body, metadata, status, task_id, thread_id, created_at, updated_at";

struct RawMessageRow {
    id: String,
    channel: String,
    direction: String,
    external_id: Option<String>,
    sender: String,
    recipients: String,
    subject: Option<String>,
    body: String,
    metadata: String,
    status: String,
    task_id: Option<String>,
    thread_id: Option<String>,
    created_at: String,
    updated_at: String,
}

fn map_message_row(row: &Row<'_>) -> rusqlite::Result<RawMessageRow> {
    Ok(RawMessageRow {
        id: row.get(0)?,
        channel: row.get(1)?,
        direction: row.get(2)?,
        external_id: row.get(3)?,
        sender: row.get(4)?,
        recipients: row.get(5)?,
        subject: row.get(6)?,
        body: row.get(7)?,
        metadata: row.get(8)?,
        status: row.get(9)?,
        task_id: row.get(10)?,
        thread_id: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}
