//! Error handling
//!
//! Typed errors for configuration, descriptor parsing, lock contention and
//! storage. Contention and cancellation failures are kept distinct from
//! configuration failures so callers can decide whether retrying makes sense.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors caused by an unusable configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No store directory configured
    #[error("Store path is empty. Set `path` in the config file or CELLAR_PATH.")]
    MissingPath,

    /// Store directory is not valid UTF-8 and cannot be written into a descriptor
    #[error("Store path {0:?} is not valid UTF-8")]
    NonUtf8Path(PathBuf),

    /// Path contains `?` and there are no parameters to disambiguate it
    #[error("Store path '{0}' contains '?' and cannot be used without descriptor parameters")]
    AmbiguousPath(String),

    /// Database name is not usable as a directory name
    #[error("Invalid database name '{0}': only ASCII letters, digits, '-' and '_' are allowed")]
    InvalidDatabaseName(String),
}

/// The two phases of opening a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPhase {
    /// Open the multi-database root without selecting a database
    Container,
    /// Open the selected working database
    Database,
}

impl fmt::Display for OpenPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenPhase::Container => f.write_str("container"),
            OpenPhase::Database => f.write_str("database"),
        }
    }
}

/// Broad classification used to decide how to react to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Fix the configuration; retrying will not help
    Configuration,
    /// Another process holds the store; retrying later may succeed
    Contention,
    /// The caller's deadline or cancellation stopped the operation
    Cancelled,
    /// Everything else (I/O, SQLite, closed handle, ...)
    Storage,
}

/// Errors that can occur while opening or using a store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Descriptor could not be parsed or carries an unknown parameter
    #[error("Invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    /// Lock still held after the retry window was exhausted
    #[error(
        "Store at '{}' is locked by another process{}; gave up after {attempts} attempts in {elapsed:?}",
        .path.display(),
        holder_suffix(.holder)
    )]
    ContentionTimeout {
        path: PathBuf,
        attempts: u32,
        elapsed: Duration,
        holder: Option<u32>,
    },

    /// Lock held and retries are disabled
    #[error(
        "Store at '{}' is locked by another process{} (retries disabled)",
        .path.display(),
        holder_suffix(.holder)
    )]
    ContentionImmediate { path: PathBuf, holder: Option<u32> },

    /// The caller cancelled the open
    #[error("Open cancelled by caller")]
    Cancelled,

    /// The caller's deadline passed before the open completed
    #[error("Open deadline exceeded after {elapsed:?}")]
    DeadlineExceeded { elapsed: Duration },

    /// The first open phase failed; nothing was acquired
    #[error("Failed to open store ({phase} phase): {source}")]
    Open {
        phase: OpenPhase,
        #[source]
        source: Box<StoreError>,
    },

    /// A later phase failed after an earlier one succeeded; the earlier one was released
    #[error("Failed to open store ({phase} phase) after the container was opened; container released: {source}")]
    PartialOpen {
        phase: OpenPhase,
        #[source]
        source: Box<StoreError>,
    },

    /// Open succeeded but the store refused the first write
    #[error("Store opened but is not writable: {source}")]
    WriteAfterOpen {
        #[source]
        source: Box<StoreError>,
    },

    /// SQLite opened the file read-only
    #[error("Store file '{}' can only be opened read-only", .path.display())]
    ReadOnly { path: PathBuf },

    /// Selected database does not exist in the container
    #[error("Database '{0}' does not exist")]
    DatabaseNotFound(String),

    /// Operation requires a selected database
    #[error("No database selected")]
    NoDatabaseSelected,

    /// The background task running a blocking open failed
    #[error("Background open task failed: {0}")]
    Background(String),

    /// Handle was already closed
    #[error("Store handle is closed")]
    Closed,

    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error with path context
    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn holder_suffix(holder: &Option<u32>) -> String {
    match holder {
        Some(pid) => format!(" (pid {pid})"),
        None => String::new(),
    }
}

impl StoreError {
    /// Attach a path to an I/O error
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// The innermost error, looking through phase and probe wrappers
    pub fn root_cause(&self) -> &StoreError {
        match self {
            StoreError::Open { source, .. }
            | StoreError::PartialOpen { source, .. }
            | StoreError::WriteAfterOpen { source } => source.root_cause(),
            other => other,
        }
    }

    /// The open phase that failed, if this is a phase failure
    pub fn failed_phase(&self) -> Option<OpenPhase> {
        match self {
            StoreError::Open { phase, .. } | StoreError::PartialOpen { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Classify the error
    pub fn class(&self) -> ErrorClass {
        match self.root_cause() {
            StoreError::Config(_) | StoreError::InvalidDescriptor(_) => ErrorClass::Configuration,
            StoreError::ContentionTimeout { .. } | StoreError::ContentionImmediate { .. } => {
                ErrorClass::Contention
            }
            StoreError::Cancelled | StoreError::DeadlineExceeded { .. } => ErrorClass::Cancelled,
            _ => ErrorClass::Storage,
        }
    }

    /// Whether another process holding the store caused this error
    pub fn is_contention(&self) -> bool {
        self.class() == ErrorClass::Contention
    }

    /// Whether this error is caused by configuration
    pub fn is_configuration(&self) -> bool {
        self.class() == ErrorClass::Configuration
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self.root_cause() {
            StoreError::ContentionTimeout { .. } | StoreError::ContentionImmediate { .. } => {
                Some("Another process is using this store. Wait for it to finish and try again.")
            }
            StoreError::Config(ConfigError::MissingPath) => {
                Some("Set `path` in the config file or the CELLAR_PATH environment variable.")
            }
            StoreError::ReadOnly { .. } => {
                Some("Check that the store files are writable by this user.")
            }
            StoreError::Io { source, .. } if source.kind() == io::ErrorKind::PermissionDenied => {
                Some("Check file and directory permissions of the store directory.")
            }
            _ => None,
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
