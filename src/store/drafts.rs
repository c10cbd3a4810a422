use super::tasks::PRIORITY_RANK_SQL;
use super::{sql_err, Store, StoreError};
use crate::domain::{Draft, DraftStatus, TaskPriority};
use crate::shared::ids::{new_uuid, now_iso};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub struct NewDraft {
    pub task_id: String,
    pub source_message_id: Option<String>,
    pub channel: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub priority: TaskPriority,
    pub conductor_notes: Option<String>,
    pub metadata: Map<String, Value>,
}

impl Store {
    pub fn insert_draft(&self, new: &NewDraft) -> Result<Draft, StoreError> {
        let id = new_uuid();
        let now = now_iso();
        let recipients = serde_json::to_string(&new.to).unwrap_or_else(|_| "[]".to_string());
        let cc = serde_json::to_string(&new.cc).unwrap_or_else(|_| "[]".to_string());
        let metadata = serde_json::to_string(&new.metadata).unwrap_or_else(|_| "{}".to_string());

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO drafts (
                id, task_id, source_message_id, channel, recipients, cc, subject,
                body, original_body, status, priority, conductor_notes, metadata,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 'pending_review', ?9, ?10, ?11, ?12, ?12)",
            params![
                id,
                new.task_id,
                new.source_message_id,
                new.channel,
                recipients,
                cc,
                new.subject,
                new.body,
                new.priority.as_str(),
                new.conductor_notes,
                metadata,
                now,
            ],
        )
        .map_err(sql_err)?;
        drop(conn);

        self.find_draft(&id)?.ok_or(StoreError::NotFound {
            entity: "draft",
            id,
        })
    }

    pub fn find_draft(&self, id: &str) -> Result<Option<Draft>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE id = ?1"),
                [id],
                map_draft_row,
            )
            .optional()
            .map_err(sql_err)?;
        drop(conn);
        Ok(self.finish_draft_row(row))
    }

    pub fn find_drafts_pending_review(&self, limit: usize) -> Result<Vec<Draft>, StoreError> {
        self.query_drafts(
            &format!(
                "SELECT {DRAFT_COLUMNS} FROM drafts
                 WHERE status = 'pending_review'
                 ORDER BY {PRIORITY_RANK_SQL}, created_at ASC, rowid ASC LIMIT ?1"
            ),
            params![limit as i64],
        )
    }

    pub fn recent_drafts(&self, limit: usize) -> Result<Vec<Draft>, StoreError> {
        self.query_drafts(
            &format!(
                "SELECT {DRAFT_COLUMNS} FROM drafts
                 ORDER BY created_at DESC LIMIT ?1"
            ),
            params![limit as i64],
        )
    }

    /// Status move with the coalesce timestamp discipline: reviewed_at for
    /// approved/rejected/edited_and_sent, sent_at for sent-like states, each
    /// stamped only on the first transition into the group.
    pub fn update_draft_status(
        &self,
        id: &str,
        status: DraftStatus,
        reviewed_by: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = now_iso();
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE drafts SET
                    status = ?2,
                    updated_at = ?3,
                    reviewed_by = COALESCE(?4, reviewed_by),
                    reviewed_at = CASE
                        WHEN ?2 IN ('approved', 'rejected', 'edited_and_sent')
                            THEN COALESCE(reviewed_at, ?3)
                        ELSE reviewed_at
                    END,
                    sent_at = CASE
                        WHEN ?2 IN ('sent', 'edited_and_sent', 'auto_approved')
                            THEN COALESCE(sent_at, ?3)
                        ELSE sent_at
                    END
                 WHERE id = ?1",
                params![id, status.as_str(), now, reviewed_by],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "draft",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Rewrites body/subject after a human edit; original_body is never touched.
    pub fn update_draft_body(
        &self,
        id: &str,
        body: &str,
        subject: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE drafts SET
                    body = ?2,
                    subject = COALESCE(?3, subject),
                    updated_at = ?4
                 WHERE id = ?1",
                params![id, body, subject, now_iso()],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "draft",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn update_draft_quality(
        &self,
        id: &str,
        score: i64,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE drafts SET quality_score = ?2, quality_notes = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, score, notes, now_iso()],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "draft",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_draft_auto_approve_match(
        &self,
        id: &str,
        rule_name: &str,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE drafts SET auto_approve_match = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, rule_name, now_iso()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn query_drafts(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Draft>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(sql_err)?;
        let rows = stmt.query_map(args, map_draft_row).map_err(sql_err)?;
        let mut raw = Vec::new();
        for row in rows {
            raw.push(row.map_err(sql_err)?);
        }
        drop(stmt);
        drop(conn);
        Ok(raw
            .into_iter()
            .filter_map(|row| self.finish_draft_row(Some(row)))
            .collect())
    }

    fn finish_draft_row(&self, row: Option<RawDraftRow>) -> Option<Draft> {
        let row = row?;
        let Some(status) = DraftStatus::parse(&row.status) else {
            self.log_skipped_row("drafts", &row.id, "invalid status");
            return None;
        };
        let Some(priority) = TaskPriority::parse(&row.priority) else {
            self.log_skipped_row("drafts", &row.id, "invalid priority");
            return None;
        };
        let to = match serde_json::from_str(&row.recipients) {
            Ok(to) => to,
            Err(_) => {
                self.log_skipped_row("drafts", &row.id, "invalid recipients json");
                return None;
            }
        };
        let cc = match serde_json::from_str(&row.cc) {
            Ok(cc) => cc,
            Err(_) => {
                self.log_skipped_row("drafts", &row.id, "invalid cc json");
                return None;
            }
        };
        let metadata = match serde_json::from_str(&row.metadata) {
            Ok(metadata) => metadata,
            Err(_) => {
                self.log_skipped_row("drafts", &row.id, "invalid metadata json");
                return None;
            }
        };
        Some(Draft {
            id: row.id,
            task_id: row.task_id,
            source_message_id: row.source_message_id,
            channel: row.channel,
            to,
            cc,
            subject: row.subject,
            body: row.body,
            original_body: row.original_body,
            status,
            priority,
            conductor_notes: row.conductor_notes,
            quality_score: row.quality_score,
            quality_notes: row.quality_notes,
            auto_approve_match: row.auto_approve_match,
            reviewed_by: row.reviewed_by,
            reviewed_at: row.reviewed_at,
            sent_at: row.sent_at,
            external_draft_id: row.external_draft_id,
            metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const DRAFT_COLUMNS: &str = "id, task_id, source_message_id, channel, recipients, cc, \
     subject, body, original_body, status, priority, conductor_notes, quality_score, \
     quality_notes, auto_approve_match, reviewed_by, reviewed_at, sent_at, \
     external_draft_id, metadata, created_at, updated_at";

struct RawDraftRow {
    id: String,
    task_id: String,
    source_message_id: Option<String>,
    channel: String,
    recipients: String,
    cc: String,
    subject: String,
    body: String,
    original_body: String,
    status: String,
    priority: String,
    conductor_notes: Option<String>,
    quality_score: Option<i64>,
    quality_notes: Option<String>,
    auto_approve_match: Option<String>,
    reviewed_by: Option<String>,
    reviewed_at: Option<String>,
    sent_at: Option<String>,
    external_draft_id: Option<String>,
    metadata: String,
    created_at: String,
    updated_at: String,
}

fn map_draft_row(row: &Row<'_>) -> rusqlite::Result<RawDraftRow> {
    Ok(RawDraftRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        source_message_id: row.get(2)?,
        channel: row.get(3)?,
        recipients: row.get(4)?,
        cc: row.get(5)?,
        subject: row.get(6)?,
        body: row.get(7)?,
        original_body: row.get(8)?,
        status: row.get(9)?,
        priority: row.get(10)?,
        conductor_notes: row.get(11)?,
        quality_score: row.get(12)?,
        quality_notes: row.get(13)?,
        auto_approve_match: row.get(14)?,
        reviewed_by: row.get(15)?,
        reviewed_at: row.get(16)?,
        sent_at: row.get(17)?,
        external_draft_id: row.get(18)?,
        metadata: row.get(19)?,
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::NewDraft;
    use crate::domain::TaskPriority;
    use serde_json::Map;

    pub(crate) fn sample_draft(task_id: &str) -> NewDraft {
        NewDraft {
            task_id: task_id.to_string(),
            source_message_id: None,
            channel: "email".to_string(),
            to: vec!["customer@example.com".to_string()],
            cc: Vec::new(),
            subject: "Re: Invoice question".to_string(),
            body: "Hello, your invoice is attached to this reply.".to_string(),
            priority: TaskPriority::Normal,
            conductor_notes: None,
            metadata: Map::new(),
        }
    }
}
