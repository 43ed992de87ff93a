//! Bounded exponential backoff for retriable provider errors

use std::time::Duration;

use log::debug;

use crate::error::ProviderError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards
    pub base_delay: Duration,
    /// Add up to 100ms of random jitter per wait
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            jitter: true,
        }
    }

    /// Retries without sleeping
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Run `op`, retrying only transient failures
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        let mut delay = self.base_delay;
        let mut attempt = 1;

        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt < self.max_attempts => {
                    debug!(
                        "{} failed (attempt {}/{}): {}; retrying",
                        what, attempt, self.max_attempts, e
                    );
                    let jitter = if self.jitter {
                        Duration::from_millis(rand_jitter())
                    } else {
                        Duration::ZERO
                    };
                    if !(delay + jitter).is_zero() {
                        std::thread::sleep(delay + jitter);
                    }
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Random jitter value (0-100ms)
fn rand_jitter() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish() % 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransientKind;
    use std::cell::Cell;

    #[test]
    fn test_transient_errors_retry_until_success() {
        let calls = Cell::new(0);
        let result = RetryPolicy::immediate(3).run("fetch m1", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(ProviderError::transient(TransientKind::RateLimited, "429"))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_attempts_are_bounded() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(3).run("fetch m1", || {
            calls.set(calls.get() + 1);
            Err(ProviderError::transient(TransientKind::Unavailable, "503"))
        });
        assert!(matches!(result, Err(ProviderError::Transient { .. })));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(3).run("fetch m1", || {
            calls.set(calls.get() + 1);
            Err(ProviderError::PermissionDenied("m1".into()))
        });
        assert_eq!(result, Err(ProviderError::PermissionDenied("m1".into())));
        assert_eq!(calls.get(), 1);
    }
}
