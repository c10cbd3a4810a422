use super::{sql_err, Store, StoreError};
use crate::domain::ApprovalRule;
use crate::shared::ids::{new_uuid, now_iso};
use rusqlite::{params, Row};
use serde_json::{Map, Value};

impl Store {
    pub fn insert_approval_rule(
        &self,
        name: &str,
        enabled: bool,
        criteria: &Map<String, Value>,
    ) -> Result<ApprovalRule, StoreError> {
        let id = new_uuid();
        let now = now_iso();
        let raw = serde_json::to_string(criteria).unwrap_or_else(|_| "{}".to_string());
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO approval_rules (id, name, enabled, criteria, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, name, enabled as i64, raw, now],
        )
        .map_err(sql_err)?;

        Ok(ApprovalRule {
            id,
            name: name.to_string(),
            enabled,
            criteria: criteria.clone(),
            created_at: now,
        })
    }

    pub fn enabled_approval_rules(&self) -> Result<Vec<ApprovalRule>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, enabled, criteria, created_at
                 FROM approval_rules WHERE enabled = 1 ORDER BY created_at ASC",
            )
            .map_err(sql_err)?;
        let rows = stmt.query_map([], map_rule_row).map_err(sql_err)?;
        let mut raw = Vec::new();
        for row in rows {
            raw.push(row.map_err(sql_err)?);
        }
        drop(stmt);
        drop(conn);
        Ok(raw
            .into_iter()
            .filter_map(|row| self.finish_rule_row(row))
            .collect())
    }

    fn finish_rule_row(&self, row: RawRuleRow) -> Option<ApprovalRule> {
        let criteria = match serde_json::from_str(&row.criteria) {
            Ok(criteria) => criteria,
            Err(_) => {
                self.log_skipped_row("approval_rules", &row.id, "invalid criteria json");
                return None;
            }
        };
        Some(ApprovalRule {
            id: row.id,
            name: row.name,
            enabled: row.enabled != 0,
            criteria,
            created_at: row.created_at,
        })
    }
}

struct RawRuleRow {
    id: String,
    name: String,
    enabled: i64,
    criteria: String,
    created_at: String,
}

fn map_rule_row(row: &Row<'_>) -> rusqlite::Result<RawRuleRow> {
    Ok(RawRuleRow {
        id: row.get(0)?,
        name: row.get(1)?,
        enabled: row.get(2)?,
        criteria: row.get(3)?,
        created_at: row.get(4)?,
    })
}
