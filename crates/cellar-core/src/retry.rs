//! Open retry policy and backoff loop
//!
//! The policy travels inside the connection descriptor as five `open_retry*`
//! keys. The engine decodes them and drives [`retry_open`] around its lock
//! attempt:
//!
//! - retry disabled: one attempt, a held lock fails immediately
//! - retry enabled: exponential backoff from `initial_interval` capped at
//!   `max_interval`, until the lock is free or `max_elapsed` has passed
//!
//! `max_tries` is only a backstop; with the defaults the elapsed bound is hit
//! long before 200 attempts.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::context::OpenContext;
use crate::error::{StoreError, StoreResult};
use crate::params::ParameterSet;

pub const KEY_OPEN_RETRY: &str = "open_retry";
pub const KEY_OPEN_RETRY_MAX_ELAPSED: &str = "open_retry_max_elapsed";
pub const KEY_OPEN_RETRY_MAX_TRIES: &str = "open_retry_max_tries";
pub const KEY_OPEN_RETRY_INITIAL: &str = "open_retry_initial";
pub const KEY_OPEN_RETRY_MAX_INTERVAL: &str = "open_retry_max_interval";

/// All keys owned by the retry policy
pub const RETRY_KEYS: [&str; 5] = [
    KEY_OPEN_RETRY,
    KEY_OPEN_RETRY_MAX_ELAPSED,
    KEY_OPEN_RETRY_MAX_TRIES,
    KEY_OPEN_RETRY_INITIAL,
    KEY_OPEN_RETRY_MAX_INTERVAL,
];

/// Growth factor between consecutive backoff delays
pub const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Bounded retry behaviour for opening a locked store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub enabled: bool,
    /// Total time budget for all attempts
    pub max_elapsed: Duration,
    /// Attempt ceiling; 0 means unlimited
    pub max_tries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_elapsed: Duration::from_secs(2),
            max_tries: 200,
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Fail fast: a held lock is reported on the first attempt
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Same policy with a different elapsed bound
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    /// Encode as descriptor parameters
    pub fn to_params(&self) -> ParameterSet {
        ParameterSet::new()
            .with(KEY_OPEN_RETRY, self.enabled.to_string())
            .with(KEY_OPEN_RETRY_MAX_ELAPSED, format_duration(self.max_elapsed))
            .with(KEY_OPEN_RETRY_MAX_TRIES, self.max_tries.to_string())
            .with(KEY_OPEN_RETRY_INITIAL, format_duration(self.initial_interval))
            .with(KEY_OPEN_RETRY_MAX_INTERVAL, format_duration(self.max_interval))
    }

    /// Decode from descriptor parameters
    ///
    /// Without `open_retry` the policy is disabled. Missing bounds fall back
    /// to the defaults.
    pub fn from_params(params: &ParameterSet) -> StoreResult<Self> {
        let defaults = Self::default();

        let enabled = match params.get(KEY_OPEN_RETRY) {
            None => false,
            Some(raw) => parse_bool(raw).ok_or_else(|| invalid(KEY_OPEN_RETRY, raw))?,
        };

        let duration = |key: &str, fallback: Duration| -> StoreResult<Duration> {
            match params.get(key) {
                None => Ok(fallback),
                Some(raw) => parse_duration(raw).ok_or_else(|| invalid(key, raw)),
            }
        };

        let max_tries = match params.get(KEY_OPEN_RETRY_MAX_TRIES) {
            None => defaults.max_tries,
            Some(raw) => raw
                .parse()
                .map_err(|_| invalid(KEY_OPEN_RETRY_MAX_TRIES, raw))?,
        };

        let policy = Self {
            enabled,
            max_elapsed: duration(KEY_OPEN_RETRY_MAX_ELAPSED, defaults.max_elapsed)?,
            max_tries,
            initial_interval: duration(KEY_OPEN_RETRY_INITIAL, defaults.initial_interval)?,
            max_interval: duration(KEY_OPEN_RETRY_MAX_INTERVAL, defaults.max_interval)?,
        };

        if policy.initial_interval.is_zero() || policy.max_interval < policy.initial_interval {
            return Err(StoreError::InvalidDescriptor(format!(
                "{KEY_OPEN_RETRY_INITIAL} must be non-zero and not exceed {KEY_OPEN_RETRY_MAX_INTERVAL}"
            )));
        }

        Ok(policy)
    }
}

fn invalid(key: &str, raw: &str) -> StoreError {
    StoreError::InvalidDescriptor(format!("invalid value '{raw}' for '{key}'"))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Format a duration as `2s`, `10ms`, `250us` or `7ns`
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        "0s".to_string()
    } else if nanos % 1_000_000_000 == 0 {
        format!("{}s", nanos / 1_000_000_000)
    } else if nanos % 1_000_000 == 0 {
        format!("{}ms", nanos / 1_000_000)
    } else if nanos % 1_000 == 0 {
        format!("{}us", nanos / 1_000)
    } else {
        format!("{nanos}ns")
    }
}

/// Parse durations such as `2s`, `10ms`, `1.5s` or `1m30s`
pub fn parse_duration(raw: &str) -> Option<Duration> {
    if raw == "0" {
        return Some(Duration::ZERO);
    }

    let mut rest = raw;
    let mut total = 0f64;
    if rest.is_empty() {
        return None;
    }

    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let value: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total += value * nanos_per_unit;
    }

    if !total.is_finite() || total > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(total.round() as u64))
}

/// Exponential backoff capped at the policy's max interval
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            current: policy.initial_interval,
            max: policy.max_interval,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(BACKOFF_MULTIPLIER).min(self.max);
        delay
    }
}

/// Outcome of one lock attempt
#[derive(Debug)]
pub enum Attempt<T> {
    /// Acquired
    Ready(T),
    /// Another process holds the lock
    Busy { holder: Option<u32> },
}

/// Run `attempt` under `policy`, honouring the caller's context
///
/// Errors returned by `attempt` itself abort the loop unchanged.
pub fn retry_open<T>(
    policy: &RetryPolicy,
    ctx: &OpenContext,
    path: &Path,
    mut attempt: impl FnMut() -> StoreResult<Attempt<T>>,
) -> StoreResult<T> {
    let started = Instant::now();
    let mut backoff = Backoff::new(policy);
    let mut attempts: u32 = 0;

    loop {
        ctx.check(started)?;
        attempts += 1;

        let holder = match attempt()? {
            Attempt::Ready(value) => {
                if attempts > 1 {
                    debug!(
                        "Acquired {:?} after {} attempts in {:?}",
                        path,
                        attempts,
                        started.elapsed()
                    );
                }
                return Ok(value);
            }
            Attempt::Busy { holder } => holder,
        };

        if !policy.enabled {
            return Err(StoreError::ContentionImmediate {
                path: path.to_path_buf(),
                holder,
            });
        }

        let elapsed = started.elapsed();
        let tries_exhausted = policy.max_tries != 0 && attempts >= policy.max_tries;
        if elapsed >= policy.max_elapsed || tries_exhausted {
            return Err(StoreError::ContentionTimeout {
                path: path.to_path_buf(),
                attempts,
                elapsed,
                holder,
            });
        }

        // Never sleep past the elapsed bound; the final attempt lands on it.
        let delay = backoff.next_delay().min(policy.max_elapsed - elapsed);
        debug!(
            "Store {:?} is locked (holder={:?}), attempt {} failed; retrying in {:?}",
            path, holder, attempts, delay
        );
        ctx.sleep(delay, started)?;
    }
}
