use super::{sql_err, Store, StoreError};
use crate::domain::{PromptMetrics, PromptVersion};
use crate::shared::ids::{new_uuid, now_iso};
use rusqlite::{params, OptionalExtension, Row};

#[derive(Debug, Clone)]
pub struct NewPromptVersion {
    pub name: String,
    pub content: String,
}

impl Store {
    /// Inserts the next version for the name; versions start at 1.
    pub fn insert_prompt_version(
        &self,
        new: &NewPromptVersion,
    ) -> Result<PromptVersion, StoreError> {
        let id = new_uuid();
        let now = now_iso();
        let conn = self.lock()?;
        let next_version: u32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM prompt_versions WHERE name = ?1",
                [new.name.as_str()],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        conn.execute(
            "INSERT INTO prompt_versions (id, name, content, version, active, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![id, new.name, new.content, next_version, now],
        )
        .map_err(sql_err)?;

        Ok(PromptVersion {
            id,
            name: new.name.clone(),
            content: new.content.clone(),
            version: next_version,
            active: false,
            activated_at: None,
            created_at: now,
            metrics: None,
        })
    }

    pub fn find_prompt_version(&self, id: &str) -> Result<Option<PromptVersion>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {PROMPT_COLUMNS} FROM prompt_versions WHERE id = ?1"),
                [id],
                map_prompt_row,
            )
            .optional()
            .map_err(sql_err)?;
        drop(conn);
        Ok(row.and_then(|row| self.finish_prompt_row(row)))
    }

    pub fn active_prompt_version(&self, name: &str) -> Result<Option<PromptVersion>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {PROMPT_COLUMNS} FROM prompt_versions
                     WHERE name = ?1 AND active = 1"
                ),
                [name],
                map_prompt_row,
            )
            .optional()
            .map_err(sql_err)?;
        drop(conn);
        Ok(row.and_then(|row| self.finish_prompt_row(row)))
    }

    /// Deactivates every sibling of the name and activates the chosen id, all
    /// inside one transaction so at most one version is ever active.
    pub fn activate_prompt_version(&self, id: &str) -> Result<PromptVersion, StoreError> {
        let now = now_iso();
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(sql_err)?;
            let name: Option<String> = tx
                .query_row(
                    "SELECT name FROM prompt_versions WHERE id = ?1",
                    [id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            let name = name.ok_or_else(|| StoreError::NotFound {
                entity: "prompt_version",
                id: id.to_string(),
            })?;
            tx.execute(
                "UPDATE prompt_versions SET active = 0 WHERE name = ?1",
                [name.as_str()],
            )
            .map_err(sql_err)?;
            tx.execute(
                "UPDATE prompt_versions SET active = 1, activated_at = ?2 WHERE id = ?1",
                params![id, now],
            )
            .map_err(sql_err)?;
            tx.commit().map_err(sql_err)?;
        }

        self.find_prompt_version(id)?.ok_or(StoreError::NotFound {
            entity: "prompt_version",
            id: id.to_string(),
        })
    }

    pub fn update_prompt_metrics(
        &self,
        id: &str,
        metrics: &PromptMetrics,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(metrics).unwrap_or_else(|_| "null".to_string());
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE prompt_versions SET metrics = ?2 WHERE id = ?1",
                params![id, raw],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "prompt_version",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn finish_prompt_row(&self, row: RawPromptRow) -> Option<PromptVersion> {
        let metrics = match row.metrics {
            None => None,
            Some(raw) => match serde_json::from_str::<PromptMetrics>(&raw) {
                Ok(metrics) => Some(metrics),
                Err(_) => {
                    self.log_skipped_row("prompt_versions", &row.id, "invalid metrics json");
                    None
                }
            },
        };
        Some(PromptVersion {
            id: row.id,
            name: row.name,
            content: row.content,
            version: row.version,
            active: row.active != 0,
            activated_at: row.activated_at,
            created_at: row.created_at,
            metrics,
        })
    }
}

const PROMPT_COLUMNS: &str =
    "id, name, content, version, active, activated_at, created_at, metrics";

struct RawPromptRow {
    id: String,
    name: String,
    content: String,
    version: u32,
    active: i64,
    activated_at: Option<String>,
    created_at: String,
    metrics: Option<String>,
}

fn map_prompt_row(row: &Row<'_>) -> rusqlite::Result<RawPromptRow> {
    Ok(RawPromptRow {
        id: row.get(0)?,
        name: row.get(1)?,
        content: row.get(2)?,
        version: row.get(3)?,
        active: row.get(4)?,
        activated_at: row.get(5)?,
        created_at: row.get(6)?,
        metrics: row.get(7)?,
    })
}
