// ========================================================================================
//
//                        Bounded Retries and Cooperative Cancellation
//
// ========================================================================================
//
// Every remote call in the engine (catalog listing, subset download, batched name
// assistance) goes through `with_retries`. The caller owns the per-attempt timeout
// (it is configured on the HTTP client or the child process); this module owns the
// attempt count and the backoff between attempts.

use log::{debug, warn};
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// How many times a fallible remote operation is attempted, and how long to wait
/// between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: Duration::from_secs(10),
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250))
    }
}

/// Runs `operation` until it succeeds or `policy.max_attempts` is exhausted, sleeping
/// with exponential backoff between attempts. The last error is returned unchanged.
pub fn with_retries<T, E, F>(operation_name: &str, policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 1;
    loop {
        match operation() {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{operation_name} succeeded on attempt {attempt}");
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_attempts => {
                let backoff = policy.backoff_for(attempt);
                warn!(
                    "{operation_name} failed (attempt {attempt}/{}): {err}. Retrying in {:?}.",
                    policy.max_attempts, backoff
                );
                if !backoff.is_zero() {
                    thread::sleep(backoff);
                }
                attempt += 1;
            }
            Err(err) => {
                warn!(
                    "{operation_name} failed after {attempt} attempt(s), giving up: {err}"
                );
                return Err(err);
            }
        }
    }
}

/// A cheaply cloneable flag checked between pipeline phases and between scaling
/// batches. Cancellation is cooperative: work already handed to the statistics
/// engine runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
