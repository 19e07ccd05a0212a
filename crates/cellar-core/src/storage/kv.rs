//! Key/value table
//!
//! Every write records who made it, taken from the descriptor's
//! `commitname` / `commitemail`.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};

use crate::error::{StoreError, StoreResult};
use crate::storage::schema::{init_schema, needs_init, FileKind};

/// Identity attached to writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Committer {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// A stored value with its provenance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub value: String,
    pub committer: Committer,
    /// Milliseconds since the Unix epoch
    pub updated_at: i64,
}

/// SQLite file with a `kv` table
pub struct KvTable {
    conn: Connection,
}

impl KvTable {
    /// Open or create the file and make sure its schema is current
    pub fn open(path: &Path, kind: FileKind) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        Self::from_connection(Connection::open(path)?, path, kind)
    }

    /// Wrap an opened connection to `path`
    ///
    /// SQLite falls back to read-only when the file is write-protected; such
    /// a connection is refused with [`StoreError::ReadOnly`].
    pub fn from_connection(conn: Connection, path: &Path, kind: FileKind) -> StoreResult<Self> {
        if conn.is_readonly(DatabaseName::Main)? {
            return Err(StoreError::ReadOnly {
                path: path.to_path_buf(),
            });
        }
        if needs_init(&conn) {
            init_schema(&conn, kind)?;
        }

        Ok(Self { conn })
    }

    /// Open an in-memory table (for testing)
    pub fn open_in_memory(kind: FileKind) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn, kind)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn set(&self, key: &str, value: &str, committer: &Committer) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value, committer_name, committer_email, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                committer_name = excluded.committer_name,
                committer_email = excluded.committer_email,
                updated_at = excluded.updated_at",
            params![
                key,
                value,
                committer.name,
                committer.email,
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entry(key)?.map(|entry| entry.value))
    }

    pub fn entry(&self, key: &str) -> StoreResult<Option<KvEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT value, committer_name, committer_email, updated_at FROM kv WHERE key = ?1",
                [key],
                |row| {
                    Ok(KvEntry {
                        value: row.get(0)?,
                        committer: Committer {
                            name: row.get(1)?,
                            email: row.get(2)?,
                        },
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// Close the connection, reporting any error SQLite raises while doing so
    pub fn close(self) -> StoreResult<()> {
        self.conn.close().map_err(|(_, e)| StoreError::Database(e))
    }
}
