//! Collection blob repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Store exactly one serialized payload per collection name.
//! - Keep SQL details inside the persistence boundary.
//!
//! # Invariants
//! - `save` is a whole-payload overwrite of the row keyed by `name`.
//! - The SQLite repository only accepts fully migrated connections.

use crate::db::migrations::{current_user_version, latest_version};
use crate::db::{open_db, open_db_in_memory};
use crate::store::{StoreError, StoreResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// Durable key/value storage for collection blobs.
///
/// Shared by every collection in the process.
pub trait BlobRepository: Send + Sync {
    /// Loads the payload stored under `name`.
    fn load(&self, name: &str) -> StoreResult<Option<String>>;
    /// Replaces the payload stored under `name`.
    fn save(&self, name: &str, payload: &str) -> StoreResult<()>;
}

/// SQLite-backed blob repository over table `collection_blobs`.
pub struct SqliteBlobRepository {
    conn: Mutex<Connection>,
}

impl SqliteBlobRepository {
    /// Constructs a repository from a migrated connection.
    ///
    /// # Errors
    /// - `UninitializedConnection` when migrations were not applied.
    /// - `MissingRequiredTable` when `collection_blobs` is absent.
    pub fn try_new(conn: Connection) -> StoreResult<Self> {
        ensure_connection_ready(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens (or creates) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::try_new(open_db(path)?)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::try_new(open_db_in_memory()?)
    }

    /// Lists stored collection names, sorted.
    pub fn collection_names(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare("SELECT name FROM collection_blobs ORDER BY name ASC;")?;
        let mut rows = stmt.query([])?;
        let mut names = Vec::new();
        while let Some(row) = rows.next()? {
            names.push(row.get(0)?);
        }
        Ok(names)
    }
}

impl BlobRepository for SqliteBlobRepository {
    fn load(&self, name: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let payload = conn
            .query_row(
                "SELECT payload FROM collection_blobs WHERE name = ?1;",
                [name],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(payload)
    }

    fn save(&self, name: &str, payload: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO collection_blobs (name, payload, updated_at)
             VALUES (?1, ?2, (strftime('%s', 'now') * 1000))
             ON CONFLICT(name) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at;",
            params![name, payload],
        )?;
        Ok(())
    }
}

fn ensure_connection_ready(conn: &Connection) -> StoreResult<()> {
    let expected_version = latest_version();
    let actual_version = current_user_version(conn)?;
    if actual_version != expected_version {
        return Err(StoreError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    let exists: bool = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'collection_blobs'
        );",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(StoreError::MissingRequiredTable("collection_blobs"));
    }

    Ok(())
}
