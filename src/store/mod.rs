use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

mod approval_rules;
mod corrections;
mod drafts;
mod feedback;
mod messages;
mod migrations;
mod prompts;
mod sessions;
mod tasks;

pub use corrections::NewCorrection;
pub use drafts::NewDraft;
pub use messages::NewMessage;
pub use prompts::NewPromptVersion;
pub use tasks::NewTask;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create store parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("migration {version} failed: {source}")]
    Migration {
        version: i64,
        #[source]
        source: rusqlite::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
}

pub(crate) fn sql_err(source: rusqlite::Error) -> StoreError {
    StoreError::Sql { source }
}

/// Durable task-lifecycle store. One connection guarded by a mutex; every
/// repository method runs its statements through it. Opening failure is fatal
/// to the caller by contract.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
    root: PathBuf,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let parent = db_path.parent().map(Path::to_path_buf);
        if let Some(parent) = &parent {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let conn = Connection::open(db_path).map_err(|source| StoreError::Open {
            path: db_path.display().to_string(),
            source,
        })?;
        // journal_mode reports the resulting mode as a row; read and discard.
        conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))
            .map_err(|source| StoreError::Open {
                path: db_path.display().to_string(),
                source,
            })?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|source| StoreError::Open {
                path: db_path.display().to_string(),
                source,
            })?;

        let store = Self {
            conn: Mutex::new(conn),
            root: parent.unwrap_or_else(|| PathBuf::from(".")),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .map_err(sql_err)?;

        for (version, ddl) in migrations::MIGRATIONS {
            let applied: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
                    [version],
                    |row| row.get(0),
                )
                .map_err(sql_err)?;
            if applied {
                continue;
            }

            let tx = conn.transaction().map_err(sql_err)?;
            tx.execute_batch(ddl)
                .map_err(|source| StoreError::Migration {
                    version: *version,
                    source,
                })?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, crate::shared::ids::now_iso()],
            )
            .map_err(|source| StoreError::Migration {
                version: *version,
                source,
            })?;
            tx.commit().map_err(|source| StoreError::Migration {
                version: *version,
                source,
            })?;
        }
        Ok(())
    }

    pub fn applied_migrations(&self) -> Result<Vec<i64>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT version FROM schema_migrations ORDER BY version")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(sql_err)?;
        let mut versions = Vec::new();
        for row in rows {
            versions.push(row.map_err(sql_err)?);
        }
        Ok(versions)
    }

    pub(crate) fn log_skipped_row(&self, table: &str, id: &str, reason: &str) {
        crate::shared::logging::append_core_log(
            &self.root,
            "warn",
            "store.row.skipped",
            &format!("{table} row {id}: {reason}"),
        );
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_runs_all_migrations_once() {
        let tmp = tempdir().expect("tempdir");
        let db = tmp.path().join("core.db");

        let store = Store::open(&db).expect("first open");
        let applied = store.applied_migrations().expect("versions");
        assert_eq!(applied, migrations::MIGRATIONS.iter().map(|(v, _)| *v).collect::<Vec<_>>());
        drop(store);

        // Re-open is a no-op for already-applied versions.
        let store = Store::open(&db).expect("second open");
        let applied_again = store.applied_migrations().expect("versions");
        assert_eq!(applied, applied_again);
    }

    #[test]
    fn open_fails_when_path_is_a_directory() {
        let tmp = tempdir().expect("tempdir");
        let err = Store::open(tmp.path()).expect_err("directory is not a database");
        assert!(matches!(err, StoreError::Open { .. }));
    }
}
