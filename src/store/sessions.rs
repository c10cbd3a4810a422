use super::{sql_err, Store, StoreError};
use crate::domain::{Session, SessionStatus};
use crate::shared::ids::{new_uuid, now_iso};
use rusqlite::{params, OptionalExtension, Row};

impl Store {
    pub fn insert_session(
        &self,
        agent_id: &str,
        task_id: &str,
        container_id: Option<&str>,
    ) -> Result<Session, StoreError> {
        let id = new_uuid();
        let now = now_iso();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sessions (id, agent_id, task_id, container_id, status, started_at)
             VALUES (?1, ?2, ?3, ?4, 'starting', ?5)",
            params![id, agent_id, task_id, container_id, now],
        )
        .map_err(sql_err)?;

        Ok(Session {
            id,
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            container_id: container_id.map(str::to_string),
            status: SessionStatus::Starting,
            started_at: now,
            stopped_at: None,
        })
    }

    pub fn find_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, agent_id, task_id, container_id, status, started_at, stopped_at
                 FROM sessions WHERE id = ?1",
                [id],
                map_session_row,
            )
            .optional()
            .map_err(sql_err)?;
        drop(conn);
        Ok(row.and_then(|row| self.finish_session_row(row)))
    }

    /// stopped_at is stamped when the session reaches a terminal status.
    pub fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE sessions SET
                    status = ?2,
                    stopped_at = CASE
                        WHEN ?2 IN ('stopped', 'error') THEN COALESCE(stopped_at, ?3)
                        ELSE stopped_at
                    END
                 WHERE id = ?1",
                params![id, status.as_str(), now_iso()],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "session",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn finish_session_row(&self, row: RawSessionRow) -> Option<Session> {
        let Some(status) = SessionStatus::parse(&row.status) else {
            self.log_skipped_row("sessions", &row.id, "invalid status");
            return None;
        };
        Some(Session {
            id: row.id,
            agent_id: row.agent_id,
            task_id: row.task_id,
            container_id: row.container_id,
            status,
            started_at: row.started_at,
            stopped_at: row.stopped_at,
        })
    }
}

struct RawSessionRow {
    id: String,
    agent_id: String,
    task_id: String,
    container_id: Option<String>,
    status: String,
    started_at: String,
    stopped_at: Option<String>,
}

fn map_session_row(row: &Row<'_>) -> rusqlite::Result<RawSessionRow> {
    Ok(RawSessionRow {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        task_id: row.get(2)?,
        container_id: row.get(3)?,
        status: row.get(4)?,
        started_at: row.get(5)?,
        stopped_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::open_temp_store;

    #[test]
    fn session_lifecycle_stamps_stopped_at_once() {
        let (_tmp, store) = open_temp_store();
        let session = store
            .insert_session("email-agent", "task-1", Some("coreclaw-worker-abc"))
            .expect("insert");
        assert_eq!(session.status, SessionStatus::Starting);

        store
            .update_session_status(&session.id, SessionStatus::Running)
            .expect("running");
        let running = store
            .find_session(&session.id)
            .expect("find")
            .expect("present");
        assert!(running.stopped_at.is_none());

        store
            .update_session_status(&session.id, SessionStatus::Stopped)
            .expect("stopped");
        let stopped = store
            .find_session(&session.id)
            .expect("find")
            .expect("present");
        assert!(stopped.stopped_at.is_some());
    }
}
