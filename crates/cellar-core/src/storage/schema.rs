//! SQLite schema for catalog and database files
//!
//! Both file kinds carry a `kv` table; the catalog additionally lists the
//! databases that exist in the container.

use rusqlite::{Connection, OptionalExtension, Result};

/// Version written into `schema_info`
pub const SCHEMA_VERSION: i32 = 1;

/// Which file a connection points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// `.cellar/catalog.db`
    Catalog,
    /// `<database>/data.db`
    Database,
}

const KV_TABLES: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_info (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        committer_name TEXT,
        committer_email TEXT,
        updated_at INTEGER NOT NULL
    );
"#;

const CATALOG_TABLES: &str = r#"
    CREATE TABLE IF NOT EXISTS databases (
        name TEXT PRIMARY KEY,
        created_at INTEGER NOT NULL,
        created_by_name TEXT,
        created_by_email TEXT
    );
"#;

/// Create the tables of `kind` and stamp the schema version
pub fn init_schema(conn: &Connection, kind: FileKind) -> Result<()> {
    conn.execute_batch(KV_TABLES)?;
    if kind == FileKind::Catalog {
        conn.execute_batch(CATALOG_TABLES)?;
    }

    conn.execute(
        "INSERT INTO schema_info (key, value) VALUES ('version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Version stamped in the file, `None` for a fresh or foreign file
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let has_info = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_info'",
            [],
            |row| row.get::<_, i64>(0),
        )?
        > 0;
    if !has_info {
        return Ok(None);
    }

    let stamped: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_info WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(stamped.and_then(|v| v.parse().ok()))
}

/// Whether `init_schema` has to run before the file is used
pub fn needs_init(conn: &Connection) -> bool {
    !matches!(get_schema_version(conn), Ok(Some(v)) if v >= SCHEMA_VERSION)
}
