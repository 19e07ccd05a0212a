//! Store handle
//!
//! `Store` is the entry point. Opening runs two phases:
//!
//! 1. **container**: open the multi-database root (no database selected) and
//!    create the configured database if it is missing
//! 2. **database**: open the working connection with the database selected
//!
//! If the second phase fails the first is released before the error is
//! returned. After both succeed the store proves it is writable with a probe
//! write; a store that cannot write is never handed out.
//!
//! ## Usage
//!
//! ```ignore
//! let config = Config::new("/data/store").with_database("beads");
//! let mut store = Store::open(config)?;
//!
//! store.set_config("theme", "dark")?;
//! store.close()?;
//! ```

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::OpenContext;
use crate::descriptor::{container_descriptor, main_descriptor};
use crate::engine::{self, EngineHandle};
use crate::error::{OpenPhase, StoreError, StoreResult};
use crate::params::{default_tuning_params, ParameterSet};
use crate::retry::RetryPolicy;
use crate::storage::DatabaseInfo;

/// Key written by the writability probe
pub const PROBE_KEY: &str = "cellar.open_probe";

/// Lifecycle of a store handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Closed,
    Opening,
    Open,
}

/// Options for [`Store::open_with`]
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Retry layer of the descriptor parameters
    pub retry: RetryPolicy,
    /// Caller layer, applied last
    pub overrides: ParameterSet,
    /// Deadline / cancellation for the whole open
    pub context: OpenContext,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            overrides: ParameterSet::new(),
            context: OpenContext::background(),
        }
    }
}

impl OpenOptions {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_context(mut self, context: OpenContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.set(key, value);
        self
    }

    /// Tuning, retry, config-file and caller layers merged in order
    ///
    /// Identity parameters are added underneath by the descriptor builders.
    pub fn open_params(&self, config: &Config) -> ParameterSet {
        let mut params = default_tuning_params();
        params.merge(&self.retry.to_params());
        params.merge(&config.param_overrides());
        params.merge(&self.overrides);
        params
    }
}

/// An open store
pub struct Store {
    state: HandleState,
    config: Config,
    container: Option<EngineHandle>,
    main: Option<EngineHandle>,
}

impl Store {
    /// Open with default options
    pub fn open(config: Config) -> StoreResult<Self> {
        Self::open_with(config, OpenOptions::default())
    }

    /// Load configuration from the default locations and open
    pub fn open_default() -> anyhow::Result<Self> {
        let config = Config::load()?;
        Ok(Self::open(config)?)
    }

    /// Open the container, then the database, then probe writability
    pub fn open_with(config: Config, options: OpenOptions) -> StoreResult<Self> {
        config.validate()?;

        let extra = options.open_params(&config);
        let container_desc = container_descriptor(&config, &extra)?;
        let main_desc = main_descriptor(&config, &extra)?;
        let ctx = &options.context;
        let started = Instant::now();

        info!("Opening store at {:?}", config.path);

        let mut store = Store {
            state: HandleState::Opening,
            config,
            container: None,
            main: None,
        };

        match engine::open(&container_desc, ctx) {
            Ok(container) => store.container = Some(container),
            Err(e) => return Err(store.abort(OpenPhase::Container, e)),
        }
        if let Some(database) = store.config.database() {
            let created = match &store.container {
                Some(container) => container.create_database(database),
                None => Err(StoreError::Closed),
            };
            if let Err(e) = created {
                return Err(store.abort(OpenPhase::Container, e));
            }
        }
        debug!("Container phase done after {:?}", started.elapsed());

        match engine::open(&main_desc, ctx) {
            Ok(main) => store.main = Some(main),
            Err(e) => return Err(store.abort(OpenPhase::Database, e)),
        }
        store.state = HandleState::Open;

        // Open means writable: a handle that cannot take a write is never returned
        if let Err(e) = store.set_config(PROBE_KEY, &std::process::id().to_string()) {
            if let Err(close_err) = store.close() {
                warn!("Failed to close unwritable store: {}", close_err);
            }
            return Err(StoreError::WriteAfterOpen {
                source: Box::new(e),
            });
        }

        info!(
            "Store open at {:?} in {:?}",
            store.config.path,
            started.elapsed()
        );
        Ok(store)
    }

    /// [`Store::open_with`] on tokio's blocking pool
    pub async fn open_async(config: Config, options: OpenOptions) -> StoreResult<Self> {
        tokio::task::spawn_blocking(move || Self::open_with(config, options))
            .await
            .map_err(|e| StoreError::Background(e.to_string()))?
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == HandleState::Open
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Selected database, if any
    pub fn database(&self) -> Option<&str> {
        self.config.database()
    }

    fn main(&self) -> StoreResult<&EngineHandle> {
        match (&self.state, &self.main) {
            (HandleState::Open, Some(main)) => Ok(main),
            _ => Err(StoreError::Closed),
        }
    }

    /// Write a configuration value
    pub fn set_config(&self, key: &str, value: &str) -> StoreResult<()> {
        self.main()?.write_kv(key, value)
    }

    /// Read a configuration value
    pub fn get_config(&self, key: &str) -> StoreResult<Option<String>> {
        self.main()?.read_kv(key)
    }

    /// Databases in the container
    pub fn list_databases(&self) -> StoreResult<Vec<DatabaseInfo>> {
        self.main()?;
        match &self.container {
            Some(container) => container.list_databases(),
            None => Err(StoreError::Closed),
        }
    }

    /// Release the store so another process can open it
    ///
    /// Closing a closed store is a no-op.
    pub fn close(&mut self) -> StoreResult<()> {
        if self.state == HandleState::Closed {
            debug!("Store at {:?} already closed", self.config.path);
            return Ok(());
        }

        let started = Instant::now();
        let mut result = Ok(());
        if let Some(mut main) = self.main.take() {
            result = main.close();
        }
        if let Some(mut container) = self.container.take() {
            let closed = container.close();
            if result.is_ok() {
                result = closed;
            }
        }
        self.state = HandleState::Closed;

        info!(
            "Closed store at {:?} in {:?}",
            self.config.path,
            started.elapsed()
        );
        result
    }
}

impl Store {
    /// Release whatever an interrupted open acquired and build its error
    ///
    /// Close failures here are logged so they cannot mask `cause`.
    fn abort(&mut self, phase: OpenPhase, cause: StoreError) -> StoreError {
        let had_container = self.container.is_some();
        for mut handle in [self.main.take(), self.container.take()].into_iter().flatten() {
            if let Err(e) = handle.close() {
                warn!("Failed to release handle after {} phase failure: {}", phase, e);
            }
        }
        self.state = HandleState::Closed;

        let source = Box::new(cause);
        if phase == OpenPhase::Container || !had_container {
            StoreError::Open { phase, source }
        } else {
            StoreError::PartialOpen { phase, source }
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if self.state != HandleState::Closed {
            if let Err(e) = self.close() {
                warn!("Failed to close store on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelFlag;
    use crate::error::ErrorClass;
    use crate::lock::{lock_path, LockFile};
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> Config {
        Config::new(temp_dir.path())
            .with_committer("store-test", "store-test@test.invalid")
            .with_database("testdb")
    }

    fn lock_is_free(temp_dir: &TempDir) -> bool {
        let path = lock_path(temp_dir.path());
        // A failed open may never have created the metadata directory
        if let Some(meta) = path.parent() {
            std::fs::create_dir_all(meta).unwrap();
        }
        LockFile::try_acquire(&path).unwrap().is_some()
    }

    #[test]
    fn test_open_creates_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(test_config(&temp_dir)).unwrap();

        assert_eq!(store.state(), HandleState::Open);
        assert_eq!(store.database(), Some("testdb"));
        assert!(temp_dir.path().join(".cellar").join("catalog.db").exists());
        assert!(temp_dir.path().join("testdb").join("data.db").exists());

        // The probe write landed
        assert_eq!(
            store.get_config(PROBE_KEY).unwrap(),
            Some(std::process::id().to_string())
        );
    }

    #[test]
    fn test_set_and_get_config() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(test_config(&temp_dir)).unwrap();

        store.set_config("lock_retry_opened", "1").unwrap();
        assert_eq!(
            store.get_config("lock_retry_opened").unwrap(),
            Some("1".to_string())
        );
        assert_eq!(store.get_config("missing").unwrap(), None);
    }

    #[test]
    fn test_data_persists_across_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        {
            let mut store = Store::open(config.clone()).unwrap();
            store.set_config("persisted", "yes").unwrap();
            store.close().unwrap();
        }

        let store = Store::open(config).unwrap();
        assert_eq!(store.get_config("persisted").unwrap(), Some("yes".to_string()));
        assert_eq!(store.list_databases().unwrap().len(), 1);
    }

    #[test]
    fn test_open_without_database() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(Config::new(temp_dir.path())).unwrap();

        assert_eq!(store.database(), None);
        store.set_config("container_key", "v").unwrap();
        assert!(store.list_databases().unwrap().is_empty());
    }

    #[test]
    fn test_close_releases_lock() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = Store::open(test_config(&temp_dir)).unwrap();
        assert!(!lock_is_free(&temp_dir));

        let started = Instant::now();
        store.close().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(store.state(), HandleState::Closed);
        assert!(lock_is_free(&temp_dir));
    }

    #[test]
    fn test_double_close_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = Store::open(test_config(&temp_dir)).unwrap();

        store.close().unwrap();
        store.close().unwrap();
        assert_eq!(store.state(), HandleState::Closed);
    }

    #[test]
    fn test_closed_store_refuses_operations() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = Store::open(test_config(&temp_dir)).unwrap();
        store.close().unwrap();

        assert!(matches!(store.set_config("k", "v"), Err(StoreError::Closed)));
        assert!(matches!(store.get_config("k"), Err(StoreError::Closed)));
        assert!(matches!(store.list_databases(), Err(StoreError::Closed)));
    }

    #[test]
    fn test_drop_releases_lock() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(test_config(&temp_dir)).unwrap();
        drop(store);
        assert!(lock_is_free(&temp_dir));
    }

    #[test]
    fn test_missing_path_is_configuration_error() {
        let result = Store::open(Config::default());
        let err = result.err().unwrap();
        assert!(err.is_configuration());
        assert_eq!(err.failed_phase(), None);
    }

    #[test]
    fn test_unknown_override_fails_container_phase() {
        let temp_dir = TempDir::new().unwrap();
        let options = OpenOptions::default().with_override("nocache", "true");
        let err = Store::open_with(test_config(&temp_dir), options).err().unwrap();

        assert_eq!(err.failed_phase(), Some(OpenPhase::Container));
        assert!(err.is_configuration());
        // Rejected before anything on disk was touched
        assert!(!lock_path(temp_dir.path()).exists());
        assert!(lock_is_free(&temp_dir));
    }

    #[test]
    fn test_unopenable_database_file_fails_container_phase() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        // Make the database file unopenable: a directory where the file goes
        std::fs::create_dir_all(temp_dir.path().join("testdb").join("data.db")).unwrap();

        let err = Store::open(config).err().unwrap();
        assert_eq!(err.failed_phase(), Some(OpenPhase::Container));
        assert!(lock_is_free(&temp_dir));
    }

    #[test]
    fn test_partial_open_names_database_phase() {
        let temp_dir = TempDir::new().unwrap();
        // Selecting a database through the caller layer only affects the main
        // descriptor, and the container phase never creates it
        let options = OpenOptions::default().with_override("database", "elsewhere");
        let err = Store::open_with(Config::new(temp_dir.path()), options)
            .err()
            .unwrap();

        match &err {
            StoreError::PartialOpen { phase, source } => {
                assert_eq!(*phase, OpenPhase::Database);
                assert!(matches!(**source, StoreError::DatabaseNotFound(_)));
            }
            other => panic!("expected partial open, got {:?}", other),
        }
        assert_eq!(err.class(), ErrorClass::Storage);
        assert!(lock_is_free(&temp_dir));
    }

    #[test]
    fn test_unwritable_database_is_not_handed_out() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        {
            let mut store = Store::open(config.clone()).unwrap();
            store.close().unwrap();
        }

        // Opens fine, refuses every write
        let data = rusqlite::Connection::open(temp_dir.path().join("testdb").join("data.db")).unwrap();
        data.execute_batch(
            "CREATE TRIGGER kv_refuse_insert BEFORE INSERT ON kv
             BEGIN SELECT RAISE(ABORT, 'writes refused'); END;",
        )
        .unwrap();
        data.close().unwrap();

        let err = Store::open(config).err().unwrap();
        assert!(matches!(err, StoreError::WriteAfterOpen { .. }), "unexpected error: {err}");
        assert!(matches!(err.root_cause(), StoreError::Database(_)));
        assert_eq!(err.class(), ErrorClass::Storage);
        assert_eq!(err.failed_phase(), None);
        // The store was closed before the error came back
        assert!(lock_is_free(&temp_dir));
    }

    #[test]
    fn test_contention_fail_fast() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join(".cellar")).unwrap();
        let _held = LockFile::try_acquire(&lock_path(temp_dir.path()))
            .unwrap()
            .unwrap();

        let options = OpenOptions::default().with_retry(RetryPolicy::disabled());
        let started = Instant::now();
        let err = Store::open_with(test_config(&temp_dir), options)
            .err()
            .unwrap();

        assert!(err.is_contention());
        assert_eq!(err.failed_phase(), Some(OpenPhase::Container));
        assert!(matches!(
            err.root_cause(),
            StoreError::ContentionImmediate { .. }
        ));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_deadline_is_not_contention() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join(".cellar")).unwrap();
        let _held = LockFile::try_acquire(&lock_path(temp_dir.path()))
            .unwrap()
            .unwrap();

        let options = OpenOptions::default()
            .with_context(OpenContext::with_timeout(Duration::from_millis(100)));
        let err = Store::open_with(test_config(&temp_dir), options)
            .err()
            .unwrap();

        assert_eq!(err.class(), ErrorClass::Cancelled);
        assert!(matches!(
            err.root_cause(),
            StoreError::DeadlineExceeded { .. }
        ));
    }

    #[test]
    fn test_pre_cancelled_open() {
        let temp_dir = TempDir::new().unwrap();
        let flag = CancelFlag::new();
        flag.cancel();

        let options =
            OpenOptions::default().with_context(OpenContext::background().with_cancel(flag));
        let err = Store::open_with(test_config(&temp_dir), options)
            .err()
            .unwrap();
        assert!(matches!(err.root_cause(), StoreError::Cancelled));
    }

    #[test]
    fn test_open_params_layering() {
        let mut config = Config::new("/data/store");
        config
            .params
            .insert("open_retry_max_elapsed".to_string(), "5s".to_string());

        let options = OpenOptions::default()
            .with_retry(RetryPolicy::disabled())
            .with_override("open_retry_initial", "20ms");
        let params = options.open_params(&config);

        // Retry layer
        assert_eq!(params.get("open_retry"), Some("false"));
        // Config-file layer beats the retry layer
        assert_eq!(params.get("open_retry_max_elapsed"), Some("5s"));
        // Caller layer beats everything
        assert_eq!(params.get("open_retry_initial"), Some("20ms"));
    }

    #[tokio::test]
    async fn test_open_async() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = Store::open_async(test_config(&temp_dir), OpenOptions::default())
            .await
            .unwrap();

        assert!(store.is_open());
        store.set_config("async", "1").unwrap();
        store.close().unwrap();
    }
}
