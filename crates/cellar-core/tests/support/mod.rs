//! Cross-process lock helper
//!
//! The test binary re-executes itself with `CELLAR_LOCK_HELPER=1` to get a
//! second process that opens a store and holds it. The two processes talk
//! through two marker files: the helper creates the ready marker once it
//! holds the store, and exits after the test creates the release marker.

#![allow(dead_code)]

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use cellar_core::{Config, Store};

pub const ENV_HELPER: &str = "CELLAR_LOCK_HELPER";
pub const ENV_DIR: &str = "CELLAR_LOCK_DIR";
pub const ENV_READY: &str = "CELLAR_LOCK_READY";
pub const ENV_RELEASE: &str = "CELLAR_LOCK_RELEASE";

/// Name of the test function that runs helper mode
pub const HELPER_TEST: &str = "lock_helper_process";

/// Database both processes open
pub const TEST_DATABASE: &str = "testdb";

const POLL: Duration = Duration::from_millis(20);

/// How long the helper holds the store before giving up on the release marker
const HELPER_HOLD_LIMIT: Duration = Duration::from_secs(30);

/// Settings passed to helper mode through the environment
pub struct HelperArgs {
    pub dir: PathBuf,
    pub ready: PathBuf,
    pub release: PathBuf,
}

/// `Some` when this process was started as the lock helper
pub fn helper_args() -> Option<HelperArgs> {
    if std::env::var(ENV_HELPER).ok().as_deref() != Some("1") {
        return None;
    }

    let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
    match (var(ENV_DIR), var(ENV_READY), var(ENV_RELEASE)) {
        (Some(dir), Some(ready), Some(release)) => Some(HelperArgs {
            dir: PathBuf::from(dir),
            ready: PathBuf::from(ready),
            release: PathBuf::from(release),
        }),
        _ => {
            eprintln!("missing CELLAR_LOCK_* env vars");
            std::process::exit(2);
        }
    }
}

/// Hold the store until released; exits the process with 2 on any failure
pub fn run_helper(args: HelperArgs) {
    let config = Config::new(&args.dir)
        .with_committer("lock-helper", "lock-helper@test.invalid")
        .with_database(TEST_DATABASE);

    let mut store = match Store::open(config) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("helper failed to open store: {e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = store.set_config("lock_helper_alive", "1") {
        eprintln!("helper store is not writable: {e}");
        std::process::exit(2);
    }

    if let Err(e) = fs::write(&args.ready, "ready\n") {
        eprintln!("helper failed to write ready file: {e}");
        std::process::exit(2);
    }

    let deadline = Instant::now() + HELPER_HOLD_LIMIT;
    while Instant::now() < deadline {
        if args.release.exists() {
            if let Err(e) = store.close() {
                eprintln!("helper failed to close store: {e}");
                std::process::exit(2);
            }
            return;
        }
        thread::sleep(POLL);
    }

    eprintln!("helper timed out waiting for release file");
    std::process::exit(2);
}

/// A running helper process; killed on drop if still alive
pub struct LockHelper {
    child: Child,
    ready: PathBuf,
    release: PathBuf,
    log: PathBuf,
    status: Option<ExitStatus>,
}

impl LockHelper {
    /// Start a helper holding the store at `store_dir`
    ///
    /// Markers and the helper's output go to `scratch`.
    pub fn spawn(store_dir: &Path, scratch: &Path) -> Self {
        let ready = scratch.join("helper.ready");
        let release = scratch.join("helper.release");
        let log = scratch.join("helper.log");

        let exe = std::env::current_exe().expect("current_exe");
        let stdout = File::create(&log).expect("create helper log");
        let stderr = stdout.try_clone().expect("clone helper log");

        let child = Command::new(exe)
            .args([HELPER_TEST, "--exact", "--nocapture", "--test-threads=1"])
            .env(ENV_HELPER, "1")
            .env(ENV_DIR, store_dir)
            .env(ENV_READY, &ready)
            .env(ENV_RELEASE, &release)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .expect("failed to start helper");

        Self {
            child,
            ready,
            release,
            log,
            status: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Everything the helper printed so far
    pub fn output(&self) -> String {
        fs::read_to_string(&self.log).unwrap_or_default()
    }

    /// Wait until the helper holds the store
    pub fn wait_ready(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.ready.exists() {
                return;
            }
            if let Some(status) = self.poll_exit() {
                panic!(
                    "helper exited before becoming ready ({status}); output:\n{}",
                    self.output()
                );
            }
            thread::sleep(POLL);
        }
        panic!("helper did not become ready; output:\n{}", self.output());
    }

    /// Ask the helper to close the store and exit
    pub fn release(&self) {
        fs::write(&self.release, "release\n").expect("failed to write release file");
    }

    /// Wait for the helper to exit on its own
    pub fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.poll_exit() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(POLL);
        }
    }

    /// Terminate the helper without letting it release anything
    pub fn kill(&mut self) {
        if self.poll_exit().is_none() {
            let _ = self.child.kill();
            // Never block forever on a helper that refuses to die
            self.wait_exit(Duration::from_secs(2));
        }
    }

    fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            self.status = self.child.try_wait().ok().flatten();
        }
        self.status
    }
}

impl Drop for LockHelper {
    fn drop(&mut self) {
        self.kill();
    }
}
