//! Embedded engine
//!
//! The narrow interface the store is built on:
//!
//! - [`open`]: parse a descriptor, lock the directory under the descriptor's
//!   retry policy, open the catalog and, when selected, the database
//! - [`EngineHandle::write_kv`] / [`EngineHandle::read_kv`]
//! - [`EngineHandle::close`]
//!
//! Only the keys below are accepted; an unknown key is an error rather than
//! silently ignored so a caller cannot believe a setting took effect.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::validate_database_name;
use crate::context::OpenContext;
use crate::descriptor::ConnectionDescriptor;
use crate::error::{StoreError, StoreResult};
use crate::lock::{self, DirLock};
use crate::params::{ParameterSet, KEY_COMMIT_EMAIL, KEY_COMMIT_NAME, KEY_DATABASE};
use crate::retry::{retry_open, RetryPolicy, RETRY_KEYS};
use crate::storage::{Catalog, Committer, DatabaseInfo, FileKind, KvTable};

/// Every descriptor key the engine understands
pub fn recognized_keys() -> impl Iterator<Item = &'static str> {
    [KEY_COMMIT_NAME, KEY_COMMIT_EMAIL, KEY_DATABASE]
        .into_iter()
        .chain(RETRY_KEYS)
}

/// Settings decoded from a descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSettings {
    pub directory: PathBuf,
    pub database: Option<String>,
    pub committer: Committer,
    pub retry: RetryPolicy,
}

impl OpenSettings {
    pub fn from_descriptor(descriptor: &ConnectionDescriptor) -> StoreResult<Self> {
        let params = descriptor.params();
        reject_unknown_keys(&params)?;

        let database = params
            .get(KEY_DATABASE)
            .filter(|name| !name.is_empty())
            .map(|name| validate_database_name(name).map(|_| name.to_string()))
            .transpose()?;

        let owned = |key: &str| params.get(key).filter(|v| !v.is_empty()).map(String::from);

        Ok(Self {
            directory: PathBuf::from(descriptor.directory()),
            database,
            committer: Committer {
                name: owned(KEY_COMMIT_NAME),
                email: owned(KEY_COMMIT_EMAIL),
            },
            retry: RetryPolicy::from_params(&params)?,
        })
    }
}

fn reject_unknown_keys(params: &ParameterSet) -> StoreResult<()> {
    let unknown: Vec<&str> = params
        .iter()
        .map(|(key, _)| key)
        .filter(|key| !recognized_keys().any(|known| known == *key))
        .collect();

    if unknown.is_empty() {
        Ok(())
    } else {
        Err(StoreError::InvalidDescriptor(format!(
            "unrecognized parameter(s): {}",
            unknown.join(", ")
        )))
    }
}

/// An opened store directory
///
/// Holds the directory lock until closed or dropped.
pub struct EngineHandle {
    settings: OpenSettings,
    catalog: Option<Catalog>,
    data: Option<KvTable>,
    lock: Option<DirLock>,
}

/// Open a store directory
pub fn open(descriptor: &ConnectionDescriptor, ctx: &OpenContext) -> StoreResult<EngineHandle> {
    let settings = OpenSettings::from_descriptor(descriptor)?;
    let dir = settings.directory.clone();

    std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

    debug!(
        "Locking {:?} (retry={}, max_elapsed={:?})",
        dir, settings.retry.enabled, settings.retry.max_elapsed
    );
    let lock = retry_open(&settings.retry, ctx, &dir, || lock::try_lock_dir(&dir))?;

    // From here on the lock is released by dropping `lock` on any error
    let catalog = Catalog::open(&dir)?;
    let data = match &settings.database {
        Some(name) => {
            if !catalog.exists(name)? {
                return Err(StoreError::DatabaseNotFound(name.clone()));
            }
            Some(KvTable::open(&catalog.database_path(name), FileKind::Database)?)
        }
        None => None,
    };

    info!(
        "Opened {:?}{}",
        dir,
        settings
            .database
            .as_deref()
            .map(|name| format!(" (database '{}')", name))
            .unwrap_or_default()
    );

    Ok(EngineHandle {
        settings,
        catalog: Some(catalog),
        data,
        lock: Some(lock),
    })
}

impl EngineHandle {
    pub fn directory(&self) -> &Path {
        &self.settings.directory
    }

    /// Selected database, `None` for a container-level handle
    pub fn database(&self) -> Option<&str> {
        self.settings.database.as_deref()
    }

    pub fn committer(&self) -> &Committer {
        &self.settings.committer
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.settings.retry
    }

    pub fn is_open(&self) -> bool {
        self.lock.is_some()
    }

    fn catalog(&self) -> StoreResult<&Catalog> {
        self.catalog.as_ref().ok_or(StoreError::Closed)
    }

    /// Table that key/value calls go to: the database, or the catalog
    fn kv(&self) -> StoreResult<&KvTable> {
        match (&self.data, self.settings.database.is_some()) {
            (Some(table), _) => Ok(table),
            (None, true) => Err(StoreError::Closed),
            (None, false) => Ok(self.catalog()?.kv()),
        }
    }

    /// Write a key, recording the descriptor's committer
    pub fn write_kv(&self, key: &str, value: &str) -> StoreResult<()> {
        self.kv()?.set(key, value, &self.settings.committer)
    }

    pub fn read_kv(&self, key: &str) -> StoreResult<Option<String>> {
        self.kv()?.get(key)
    }

    /// Create a database in this container if it does not exist
    pub fn create_database(&self, name: &str) -> StoreResult<bool> {
        self.catalog()?
            .create_database(name, &self.settings.committer)
    }

    pub fn list_databases(&self) -> StoreResult<Vec<DatabaseInfo>> {
        self.catalog()?.list()
    }

    /// Close connections and release this handle's share of the lock
    ///
    /// Closing twice is a no-op. The lock is released even if closing a
    /// connection fails; the first such failure is returned.
    pub fn close(&mut self) -> StoreResult<()> {
        let mut result = Ok(());

        if let Some(data) = self.data.take() {
            result = data.close();
        }
        if let Some(catalog) = self.catalog.take() {
            let closed = catalog.close();
            if result.is_ok() {
                result = closed;
            }
        }
        if self.lock.take().is_some() {
            debug!("Closed handle on {:?}", self.settings.directory);
        }

        result
    }
}
