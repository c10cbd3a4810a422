use super::{sql_err, Store, StoreError};
use crate::domain::FeedbackRecord;
use crate::shared::ids::{new_uuid, now_iso};
use rusqlite::{params, Row};

impl Store {
    pub fn insert_feedback(
        &self,
        task_id: Option<&str>,
        draft_id: Option<&str>,
        rating: &str,
        comment: Option<&str>,
    ) -> Result<FeedbackRecord, StoreError> {
        let id = new_uuid();
        let now = now_iso();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO feedback (id, task_id, draft_id, rating, comment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, task_id, draft_id, rating, comment, now],
        )
        .map_err(sql_err)?;

        Ok(FeedbackRecord {
            id,
            task_id: task_id.map(str::to_string),
            draft_id: draft_id.map(str::to_string),
            rating: rating.to_string(),
            comment: comment.map(str::to_string),
            created_at: now,
        })
    }

    pub fn recent_feedback(&self, limit: usize) -> Result<Vec<FeedbackRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, task_id, draft_id, rating, comment, created_at
                 FROM feedback ORDER BY created_at DESC LIMIT ?1",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![limit as i64], map_feedback_row)
            .map_err(sql_err)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(sql_err)?);
        }
        Ok(records)
    }
}

fn map_feedback_row(row: &Row<'_>) -> rusqlite::Result<FeedbackRecord> {
    Ok(FeedbackRecord {
        id: row.get(0)?,
        task_id: row.get(1)?,
        draft_id: row.get(2)?,
        rating: row.get(3)?,
        comment: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::store::test_support::open_temp_store;

    #[test]
    fn feedback_round_trips() {
        let (_tmp, store) = open_temp_store();
        store
            .insert_feedback(Some("task-1"), None, "positive", Some("good answer"))
            .expect("insert");
        let recent = store.recent_feedback(5).expect("list");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].rating, "positive");
        assert_eq!(recent[0].task_id.as_deref(), Some("task-1"));
    }
}
