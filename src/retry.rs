//! Bounded retries for transient storage failures.

use crate::error::{LedgerError, Result};
use std::io;
use std::thread;
use std::time::Duration;

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// How many times, and how patiently, to retry a failed write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1).
    pub max_attempts: u32,
    /// Sleep before the second attempt; doubles after each failure.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, failed_attempts: u32) -> Duration {
        let factor = 1u32 << failed_attempts.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// IO failures worth another attempt.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Run `op` until it succeeds, fails permanently, or exhausts the policy.
///
/// Permanent failures come back as [`LedgerError::Io`]; exhausted transient
/// failures as [`LedgerError::StorageUnavailable`].
pub fn with_retries<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) => {
                if attempt >= max_attempts {
                    tracing::warn!(operation = what, attempts = attempt, error = %e, "giving up");
                    return Err(LedgerError::StorageUnavailable {
                        attempts: attempt,
                        message: format!("{what}: {e}"),
                    });
                }
                let delay = policy.delay_for(attempt);
                tracing::debug!(operation = what, attempt, ?delay, error = %e, "retrying");
                thread::sleep(delay);
            }
            Err(e) => return Err(LedgerError::Io(e)),
        }
    }
}
