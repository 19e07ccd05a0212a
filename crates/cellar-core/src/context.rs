//! Caller-controlled deadline and cancellation for opens
//!
//! Opening may sleep between lock attempts. An `OpenContext` lets the caller
//! bound that wait independently of the retry policy; when it fires the open
//! fails with [`StoreError::Cancelled`] or [`StoreError::DeadlineExceeded`]
//! rather than a contention error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{StoreError, StoreResult};

/// Longest uninterrupted sleep; cancellation is noticed within this interval
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shared flag for cancelling an in-flight open from another thread
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Deadline and cancellation for one open call
#[derive(Debug, Clone, Default)]
pub struct OpenContext {
    deadline: Option<Instant>,
    cancel: Option<CancelFlag>,
}

impl OpenContext {
    /// No deadline, not cancellable
    pub fn background() -> Self {
        Self::default()
    }

    /// Deadline `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: None,
        }
    }

    /// Attach a cancellation flag
    pub fn with_cancel(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if there is one
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Fail if cancelled or past the deadline
    ///
    /// `started` is only used to report how long the operation ran.
    pub fn check(&self, started: Instant) -> StoreResult<()> {
        if self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
            return Err(StoreError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(StoreError::DeadlineExceeded {
                    elapsed: started.elapsed(),
                });
            }
        }
        Ok(())
    }

    /// Sleep for `delay`, waking early to report cancellation or the deadline
    pub fn sleep(&self, delay: Duration, started: Instant) -> StoreResult<()> {
        let wake_at = Instant::now() + delay;
        loop {
            self.check(started)?;

            let now = Instant::now();
            if now >= wake_at {
                return Ok(());
            }

            let mut slice = (wake_at - now).min(POLL_INTERVAL);
            if let Some(remaining) = self.remaining() {
                // Wake exactly at the deadline so the next check reports it
                slice = slice.min(remaining.max(Duration::from_millis(1)));
            }
            thread::sleep(slice);
        }
    }
}
