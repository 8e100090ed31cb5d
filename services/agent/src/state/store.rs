//! SQLite-based app store.
//!
//! Keeps every app the agent knows about, including stopped and failed
//! ones, so restart, delete and log queries survive an agent restart.

use std::path::Path;

use hostdeck_id::AppId;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

use crate::app::{App, AppStatus};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to encode app record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// SQLite app store.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self { conn };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS apps (
                app_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                variant TEXT NOT NULL,
                record TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_apps_status ON apps(status);
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Insert or update an app record.
    pub fn upsert_app(&self, app: &App) -> Result<(), StateStoreError> {
        let record = serde_json::to_string(app)?;
        self.conn.execute(
            r#"
            INSERT INTO apps (app_id, status, variant, record, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(app_id) DO UPDATE SET
                status = excluded.status,
                record = excluded.record,
                updated_at = excluded.updated_at
            "#,
            params![
                app.id.to_string(),
                app.status.as_str(),
                app.variant.as_str(),
                record,
                app.created_at.timestamp_millis(),
                app.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Get an app record.
    pub fn get_app(&self, app_id: AppId) -> Result<Option<App>, StateStoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM apps WHERE app_id = ?1")?;

        stmt.query_row(params![app_id.to_string()], decode_row)
            .optional()
            .map_err(Into::into)
    }

    /// List all apps, oldest first.
    pub fn list_apps(&self) -> Result<Vec<App>, StateStoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM apps ORDER BY created_at, app_id")?;

        let apps = stmt
            .query_map([], decode_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(apps)
    }

    /// List apps in one status.
    pub fn list_apps_by_status(&self, status: AppStatus) -> Result<Vec<App>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT record FROM apps WHERE status = ?1 ORDER BY created_at, app_id",
        )?;

        let apps = stmt
            .query_map(params![status.as_str()], decode_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(apps)
    }

    /// Delete an app record. Deleting a missing record is not an error.
    pub fn delete_app(&self, app_id: AppId) -> Result<(), StateStoreError> {
        self.conn.execute(
            "DELETE FROM apps WHERE app_id = ?1",
            params![app_id.to_string()],
        )?;
        Ok(())
    }

    /// Count apps in one status.
    pub fn count_apps_by_status(&self, status: AppStatus) -> Result<i64, StateStoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM apps WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn decode_row(row: &Row<'_>) -> rusqlite::Result<App> {
    let record: String = row.get(0)?;
    serde_json::from_str(&record)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AccessPolicy, Variant};
    use crate::runtime::RuntimeHandle;
    use chrono::Utc;
    use std::path::PathBuf;

    fn app(status: AppStatus) -> App {
        App {
            id: AppId::new(),
            variant: Variant::Image,
            status,
            source: PathBuf::from("/srv/bundles/demo"),
            port: Some(9001),
            last_port: Some(9001),
            gpus: vec![],
            vram_required_mb: 0,
            access: AccessPolicy {
                allow_ips: vec!["10.0.0.0/8".to_string()],
                auth_header: None,
            },
            container_port: Some(7860),
            entrypoint: None,
            artifact: None,
            handle: Some(RuntimeHandle::Container {
                name: "hostdeck-demo".to_string(),
            }),
            error: None,
            generation: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_state_store_apps() {
        let store = StateStore::open_in_memory().unwrap();
        let mut record = app(AppStatus::Running);

        store.upsert_app(&record).unwrap();
        let fetched = store.get_app(record.id).unwrap().unwrap();
        assert_eq!(fetched, record);

        record.transition(AppStatus::Stopped);
        record.port = None;
        store.upsert_app(&record).unwrap();
        let fetched = store.get_app(record.id).unwrap().unwrap();
        assert_eq!(fetched.status, AppStatus::Stopped);
        assert_eq!(fetched.port, None);

        assert_eq!(store.list_apps().unwrap().len(), 1);
        assert_eq!(store.count_apps_by_status(AppStatus::Stopped).unwrap(), 1);
        assert!(store
            .list_apps_by_status(AppStatus::Running)
            .unwrap()
            .is_empty());

        store.delete_app(record.id).unwrap();
        assert!(store.get_app(record.id).unwrap().is_none());
        store.delete_app(record.id).unwrap();
    }

    #[test]
    fn test_state_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.db");
        let record = app(AppStatus::Error);

        {
            let store = StateStore::open(&path).unwrap();
            store.upsert_app(&record).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let apps = store.list_apps().unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].id, record.id);
        assert_eq!(apps[0].access, record.access);
    }
}
