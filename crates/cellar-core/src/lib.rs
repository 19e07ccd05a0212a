//! Cellar Core Library
//!
//! An embedded key/value store living in a local directory that several
//! processes may try to open. Exactly one process owns a directory at a time;
//! the others either fail fast or wait within a bounded retry window, as
//! requested by the connection descriptor.
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::new("/data/store")
//!     .with_committer("Alice", "alice@example.com")
//!     .with_database("beads");
//!
//! let mut store = Store::open(config)?;
//! store.set_config("theme", "dark")?;
//! store.close()?;
//! ```
//!
//! # Modules
//!
//! - `store`: Two-phase open, writability probe and close (main entry point)
//! - `descriptor`: Container and database descriptors
//! - `params`: Parameter sets and their layering
//! - `retry`: Retry policy and the backoff loop
//! - `context`: Caller deadline and cancellation
//! - `engine`: Descriptor-driven open of a store directory
//! - `lock`: Cross-process directory lock
//! - `storage`: SQLite catalog and key/value files
//! - `config`: Store configuration
//! - `error`: Error types

pub mod config;
pub mod context;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod lock;
pub mod params;
pub mod retry;
pub mod storage;
pub mod store;

pub use config::Config;
pub use context::{CancelFlag, OpenContext};
pub use descriptor::{container_descriptor, main_descriptor, ConnectionDescriptor};
pub use engine::EngineHandle;
pub use error::{ConfigError, ErrorClass, OpenPhase, StoreError, StoreResult};
pub use params::{default_open_params, default_retry_params, default_tuning_params, ParameterSet};
pub use retry::RetryPolicy;
pub use store::{HandleState, OpenOptions, Store};
