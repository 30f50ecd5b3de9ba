//! # SQLite Slot
//!
//! Durable [`KeyValueSlot`] backed by a single SQLite table. The active trip
//! snapshot is the only entry this crate writes, so the table stays tiny.

use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};

use crate::error::{Result, TripError};
use crate::snapshot::KeyValueSlot;

impl From<rusqlite::Error> for TripError {
    fn from(e: rusqlite::Error) -> Self {
        TripError::persistence(e.to_string())
    }
}

/// Key-value slot stored in SQLite.
pub struct SqliteSlot {
    db: Connection,
    db_path: String,
}

impl SqliteSlot {
    /// Open (or create) the slot database at `db_path`.
    pub fn new(db_path: &str) -> SqlResult<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;

        Ok(Self {
            db,
            db_path: db_path.to_string(),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> SqlResult<Self> {
        Self::new(":memory:")
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> SqlResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            "#,
        )
    }
}

impl std::fmt::Debug for SqliteSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSlot")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl KeyValueSlot for SqliteSlot {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .db
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.db.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
             VALUES (?, ?, strftime('%s', 'now'))",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.db
            .execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
        Ok(())
    }
}
