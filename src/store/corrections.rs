use super::{sql_err, Store, StoreError};
use crate::domain::{ChangeType, Correction};
use crate::shared::ids::{new_uuid, now_iso};
use rusqlite::{params, Row};

#[derive(Debug, Clone)]
pub struct NewCorrection {
    pub draft_id: String,
    pub task_id: String,
    pub original_body: String,
    pub edited_body: String,
    pub edited_subject: Option<String>,
    pub change_type: ChangeType,
    pub feedback: Option<String>,
}

impl Store {
    pub fn insert_correction(&self, new: &NewCorrection) -> Result<Correction, StoreError> {
        let id = new_uuid();
        let now = now_iso();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO corrections (
                id, draft_id, task_id, original_body, edited_body, edited_subject,
                change_type, feedback, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                new.draft_id,
                new.task_id,
                new.original_body,
                new.edited_body,
                new.edited_subject,
                new.change_type.as_str(),
                new.feedback,
                now,
            ],
        )
        .map_err(sql_err)?;

        Ok(Correction {
            id,
            draft_id: new.draft_id.clone(),
            task_id: new.task_id.clone(),
            original_body: new.original_body.clone(),
            edited_body: new.edited_body.clone(),
            edited_subject: new.edited_subject.clone(),
            change_type: new.change_type,
            feedback: new.feedback.clone(),
            created_at: now,
        })
    }

    pub fn recent_corrections(&self, limit: usize) -> Result<Vec<Correction>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, draft_id, task_id, original_body, edited_body, edited_subject,
                        change_type, feedback, created_at
                 FROM corrections ORDER BY created_at DESC LIMIT ?1",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![limit as i64], map_correction_row)
            .map_err(sql_err)?;
        let mut raw = Vec::new();
        for row in rows {
            raw.push(row.map_err(sql_err)?);
        }
        drop(stmt);
        drop(conn);
        Ok(raw
            .into_iter()
            .filter_map(|row| self.finish_correction_row(row))
            .collect())
    }

    pub fn corrections_for_draft(&self, draft_id: &str) -> Result<Vec<Correction>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, draft_id, task_id, original_body, edited_body, edited_subject,
                        change_type, feedback, created_at
                 FROM corrections WHERE draft_id = ?1 ORDER BY created_at ASC",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![draft_id], map_correction_row)
            .map_err(sql_err)?;
        let mut raw = Vec::new();
        for row in rows {
            raw.push(row.map_err(sql_err)?);
        }
        drop(stmt);
        drop(conn);
        Ok(raw
            .into_iter()
            .filter_map(|row| self.finish_correction_row(row))
            .collect())
    }

    fn finish_correction_row(&self, row: RawCorrectionRow) -> Option<Correction> {
        let Some(change_type) = ChangeType::parse(&row.change_type) else {
            self.log_skipped_row("corrections", &row.id, "invalid change_type");
            return None;
        };
        Some(Correction {
            id: row.id,
            draft_id: row.draft_id,
            task_id: row.task_id,
            original_body: row.original_body,
            edited_body: row.edited_body,
            edited_subject: row.edited_subject,
            change_type,
            feedback: row.feedback,
            created_at: row.created_at,
        })
    }
}

struct RawCorrectionRow {
    id: String,
    draft_id: String,
    task_id: String,
    original_body: String,
    edited_body: String,
    edited_subject: Option<String>,
    change_type: String,
    feedback: Option<String>,
    created_at: String,
}

fn map_correction_row(row: &Row<'_>) -> rusqlite::Result<RawCorrectionRow> {
    Ok(RawCorrectionRow {
        id: row.get(0)?,
        draft_id: row.get(1)?,
        task_id: row.get(2)?,
        original_body: row.get(3)?,
        edited_body: row.get(4)?,
        edited_subject: row.get(5)?,
        change_type: row.get(6)?,
        feedback: row.get(7)?,
        created_at: row.get(8)?,
    })
}
