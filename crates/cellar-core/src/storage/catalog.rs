//! Container catalog
//!
//! Lists the databases of a container. Creating a database is idempotent:
//! the catalog row and the database file are created only if missing.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::info;

use crate::config::validate_database_name;
use crate::error::StoreResult;
use crate::lock::META_DIR;
use crate::storage::kv::{Committer, KvTable};
use crate::storage::schema::FileKind;

/// Catalog file name inside the metadata directory
pub const CATALOG_FILE: &str = "catalog.db";

/// Database file name inside a database directory
pub const DATABASE_FILE: &str = "data.db";

/// A database listed in the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub name: String,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
    pub created_by: Committer,
}

/// Catalog of a container directory
pub struct Catalog {
    table: KvTable,
    root: PathBuf,
}

impl Catalog {
    /// Open or create the catalog of the container rooted at `root`
    pub fn open(root: &Path) -> StoreResult<Self> {
        let table = KvTable::open(&catalog_path(root), FileKind::Catalog)?;
        Ok(Self {
            table,
            root: root.to_path_buf(),
        })
    }

    /// Container-level key/value table
    pub fn kv(&self) -> &KvTable {
        &self.table
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a database's data file
    pub fn database_path(&self, name: &str) -> PathBuf {
        database_path(&self.root, name)
    }

    pub fn exists(&self, name: &str) -> StoreResult<bool> {
        let found = self
            .table
            .connection()
            .query_row("SELECT 1 FROM databases WHERE name = ?1", [name], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Create a database if it does not exist yet
    ///
    /// Returns `true` when a new database was created.
    pub fn create_database(&self, name: &str, committer: &Committer) -> StoreResult<bool> {
        validate_database_name(name)?;

        // Materialize the file first so a catalog row never points at nothing
        KvTable::open(&self.database_path(name), FileKind::Database)?.close()?;

        let inserted = self.table.connection().execute(
            "INSERT OR IGNORE INTO databases (name, created_at, created_by_name, created_by_email)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                name,
                Utc::now().timestamp_millis(),
                committer.name,
                committer.email
            ],
        )?;

        if inserted > 0 {
            info!("Created database '{}' in {:?}", name, self.root);
        }
        Ok(inserted > 0)
    }

    /// All databases, ordered by name
    pub fn list(&self) -> StoreResult<Vec<DatabaseInfo>> {
        let mut stmt = self.table.connection().prepare(
            "SELECT name, created_at, created_by_name, created_by_email
             FROM databases ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DatabaseInfo {
                name: row.get(0)?,
                created_at: row.get(1)?,
                created_by: Committer {
                    name: row.get(2)?,
                    email: row.get(3)?,
                },
            })
        })?;

        let mut databases = Vec::new();
        for row in rows {
            databases.push(row?);
        }
        Ok(databases)
    }

    pub fn close(self) -> StoreResult<()> {
        self.table.close()
    }
}

/// Path of the catalog file for a container
pub fn catalog_path(root: &Path) -> PathBuf {
    root.join(META_DIR).join(CATALOG_FILE)
}

/// Path of a database's data file
pub fn database_path(root: &Path, name: &str) -> PathBuf {
    root.join(name).join(DATABASE_FILE)
}
