//! Storage layer
//!
//! SQLite files behind an opened engine handle.
//!
//! ## Layout
//!
//! - `<dir>/.cellar/LOCK` - directory lock (see `lock`)
//! - `<dir>/.cellar/catalog.db` - databases in the container, container-level kv
//! - `<dir>/<database>/data.db` - one file per database

pub mod catalog;
pub mod kv;
pub mod schema;

pub use catalog::{Catalog, DatabaseInfo};
pub use kv::{Committer, KvEntry, KvTable};
pub use schema::{init_schema, needs_init, FileKind, SCHEMA_VERSION};
