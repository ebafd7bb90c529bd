use std::path::Path;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use crate::diff::apply_changes;
use crate::error::{Result, SyncError};
use crate::model::{Incident, StoredIncident};

/// Downstream document store the sync writes into.
///
/// Inserts must be idempotent on the upstream id: re-inserting a record that
/// already exists is a silent no-op.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert records, returning the row ids of those that were new.
    async fn insert_many(&self, records: &[Incident]) -> Result<Vec<i64>>;

    /// Apply path-addressed changes to one stored record.
    async fn patch(&self, id: i64, changes: &[(String, Value)]) -> Result<()>;

    /// The record with the greatest `created_at`.
    async fn latest(&self) -> Result<Option<StoredIncident>>;

    /// Delete up to `limit` records; returns how many were removed.
    async fn delete_batch(&self, limit: usize) -> Result<usize>;

    /// `(name, id)` pairs of every known incident type.
    async fn incident_types(&self) -> Result<Vec<(String, i64)>>;

    /// Register type names that are not known yet (case-insensitive).
    /// Returns how many were added.
    async fn register_incident_types(&self, names: &[String]) -> Result<usize>;

    async fn count(&self) -> Result<u64>;
}

/// Initialise the incident schema. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS incident_types (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL UNIQUE COLLATE NOCASE
        );

        CREATE TABLE IF NOT EXISTS incidents (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            upstream_id         TEXT NOT NULL UNIQUE,
            created_at          TEXT NOT NULL,   -- RFC 3339, UTC, fixed width
            cross_reference_id  TEXT,
            type_id             INTEGER REFERENCES incident_types(id),
            doc                 TEXT NOT NULL,   -- JSON-encoded Incident
            updated_at          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_incidents_created
            ON incidents(created_at DESC);",
    )
}

/// SQLite-backed [`RecordStore`].
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::new(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Register an incident type, returning its id. Existing names
    /// (case-insensitive) keep their id.
    pub fn upsert_incident_type(&self, name: &str) -> Result<i64> {
        let db = self.db.lock();
        db.execute(
            "INSERT OR IGNORE INTO incident_types (name) VALUES (?1)",
            [name],
        )?;
        let id = db.query_row(
            "SELECT id FROM incident_types WHERE name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(id)
    }
}

fn timestamp(dt: &chrono::DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert_many(&self, records: &[Incident]) -> Result<Vec<i64>> {
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        let now = timestamp(&Utc::now());
        let mut ids = Vec::with_capacity(records.len());
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO incidents
                 (upstream_id, created_at, cross_reference_id, type_id, doc, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for record in records {
                let doc = serde_json::to_string(record)?;
                let inserted = stmt.execute(rusqlite::params![
                    record.upstream_id,
                    timestamp(&record.created_at),
                    record.cross_reference_id,
                    record.type_id,
                    doc,
                    now,
                ])?;
                if inserted == 1 {
                    ids.push(tx.last_insert_rowid());
                }
            }
        }
        tx.commit()?;
        debug!(
            offered = records.len(),
            inserted = ids.len(),
            "incidents inserted"
        );
        Ok(ids)
    }

    async fn patch(&self, id: i64, changes: &[(String, Value)]) -> Result<()> {
        let db = self.db.lock();
        let doc: Option<String> = db
            .query_row("SELECT doc FROM incidents WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(doc) = doc else {
            return Err(SyncError::RecordNotFound { id });
        };

        let mut value: Value = serde_json::from_str(&doc)?;
        apply_changes(&mut value, changes);
        let record: Incident = serde_json::from_value(value)?;

        db.execute(
            "UPDATE incidents
             SET doc = ?1, cross_reference_id = ?2, type_id = ?3, updated_at = ?4
             WHERE id = ?5",
            rusqlite::params![
                serde_json::to_string(&record)?,
                record.cross_reference_id,
                record.type_id,
                timestamp(&Utc::now()),
                id,
            ],
        )?;
        Ok(())
    }

    async fn latest(&self) -> Result<Option<StoredIncident>> {
        let db = self.db.lock();
        let row: Option<(i64, String)> = db
            .query_row(
                "SELECT id, doc FROM incidents ORDER BY created_at DESC, id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((id, doc)) => Ok(Some(StoredIncident {
                id,
                record: serde_json::from_str(&doc)?,
            })),
            None => Ok(None),
        }
    }

    async fn delete_batch(&self, limit: usize) -> Result<usize> {
        let db = self.db.lock();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let n = db.execute(
            "DELETE FROM incidents WHERE id IN
             (SELECT id FROM incidents ORDER BY id LIMIT ?1)",
            [limit],
        )?;
        Ok(n)
    }

    async fn incident_types(&self) -> Result<Vec<(String, i64)>> {
        let db = self.db.lock();
        let mut stmt = db.prepare("SELECT name, id FROM incident_types ORDER BY id")?;
        let types = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(types)
    }

    async fn register_incident_types(&self, names: &[String]) -> Result<usize> {
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        let mut added = 0;
        {
            let mut stmt = tx.prepare("INSERT OR IGNORE INTO incident_types (name) VALUES (?1)")?;
            for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
                added += stmt.execute([name])?;
            }
        }
        tx.commit()?;
        Ok(added)
    }

    async fn count(&self) -> Result<u64> {
        let db = self.db.lock();
        let n: i64 = db.query_row("SELECT COUNT(*) FROM incidents", [], |row| row.get(0))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }
}
