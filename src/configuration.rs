//! Runtime configuration for the engine.
//!
//! Configuration can be created programmatically using
//! [`Configuration::new()`] or from environment variables using
//! [`Configuration::from_env()`]. Sandbox resource caps live in
//! [`SandboxProfile`](crate::sandbox::SandboxProfile), which has its own
//! `from_env`.
//!
//! # Environment Variables
//!
//! All values are optional; unset or unparsable values fall back to the
//! defaults below.
//!
//! - `WORKER_MIN` — lower bound of the worker pool (default: `2`)
//! - `WORKER_MAX` — upper bound of the worker pool (default: number of CPUs)
//! - `MAX_ATTEMPTS` — delivery attempts per match before it is failed (default: `3`)
//! - `RESERVATION_TIMEOUT` — redelivery window for un-acked queue items
//!   (default: twice the executor wall-clock limit)
//! - `LOCK_WAIT_SECS` — how long orchestrator calls block on a contended lock (default: `10`)
//! - `QUEUE_DIR` — directory for the queue journal; unset means the queue
//!   lives in memory only
//! - `ENGINE_LOG_DIR` — enable file logging to this directory

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Attempts per match before the pipeline records it as failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Engine-level knobs; see the module docs for the environment variables.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) worker_min: usize,
    pub(crate) worker_max: usize,
    pub(crate) max_attempts: u32,
    pub(crate) reservation_timeout: Duration,
    pub(crate) lock_wait: Duration,
    pub(crate) queue_dir: Option<PathBuf>,
    pub(crate) log_dir: Option<PathBuf>,
}

impl Configuration {
    /// Defaults: workers `[2, num_cpus]`, three attempts, 120 s reservation
    /// window, 10 s lock wait, in-memory queue, no file logging.
    pub fn new() -> Self {
        Self {
            worker_min: 2,
            worker_max: num_cpus::get().max(2),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            reservation_timeout: Duration::from_secs(120),
            lock_wait: Duration::from_secs(10),
            queue_dir: None,
            log_dir: None,
        }
    }

    /// Read configuration from environment variables, falling back to the
    /// defaults of [`Configuration::new()`] per field.
    pub fn from_env() -> Self {
        fn parse_usize(var: &str) -> Option<usize> {
            std::env::var(var).ok()?.parse().ok()
        }

        fn parse_u32(var: &str) -> Option<u32> {
            std::env::var(var).ok()?.parse().ok()
        }

        fn parse_duration_secs(var: &str) -> Option<Duration> {
            std::env::var(var)
                .ok()?
                .parse::<u64>()
                .ok()
                .map(Duration::from_secs)
        }

        let defaults = Self::new();
        let queue_dir = std::env::var("QUEUE_DIR").ok().map(PathBuf::from);
        let log_dir = std::env::var("ENGINE_LOG_DIR")
            .ok()
            .map(PathBuf::from)
            .filter(|p| p.is_dir());

        Self {
            worker_min: parse_usize("WORKER_MIN").unwrap_or(defaults.worker_min),
            worker_max: parse_usize("WORKER_MAX").unwrap_or(defaults.worker_max),
            max_attempts: parse_u32("MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            reservation_timeout: parse_duration_secs("RESERVATION_TIMEOUT")
                .unwrap_or(defaults.reservation_timeout),
            lock_wait: parse_duration_secs("LOCK_WAIT_SECS").unwrap_or(defaults.lock_wait),
            queue_dir,
            log_dir,
        }
    }

    /// Sets the `[min, max]` worker budget.
    ///
    /// # Panics
    ///
    /// Panics if `min > max` or `max == 0`.
    #[must_use]
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        assert!(
            max > 0 && min <= max,
            "worker budget must satisfy 0 < min <= max"
        );
        self.worker_min = min;
        self.worker_max = max;
        self
    }

    /// Sets the number of delivery attempts before a match is failed.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the redelivery window for dequeued-but-unacked items. Callers
    /// should keep this at least twice the executor wall-clock limit.
    #[must_use]
    pub fn with_reservation_timeout(mut self, timeout: Duration) -> Self {
        self.reservation_timeout = timeout;
        self
    }

    /// Sets how long orchestrator calls block waiting for a contended lock.
    #[must_use]
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Persist the queue journal under `dir`, surviving process restarts.
    #[must_use]
    pub fn with_queue_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.queue_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Enable logging to the given directory path.
    ///
    /// # Panics
    ///
    /// Panics if the path exists and is not a directory.
    #[must_use]
    pub fn with_log<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            std::fs::create_dir_all(path)
                .unwrap_or_else(|e| panic!("could not create directory {}: {e}", path.display()));
        }
        if !path.is_dir() {
            panic!("logging path must be a directory: {}", path.display());
        }
        self.log_dir = Some(path.to_path_buf());
        self
    }

    pub(crate) fn is_logging_enabled(&self) -> bool {
        self.log_dir.is_some()
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Configuration::new();
        assert!(c.worker_min <= c.worker_max);
        assert_eq!(c.max_attempts, 3);
        assert!(c.queue_dir.is_none());
    }

    #[test]
    #[should_panic]
    fn rejects_inverted_worker_budget() {
        let _ = Configuration::new().with_workers(8, 2);
    }
}
