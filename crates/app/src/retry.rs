use std::time::Duration;

use tracing::warn;

use crate::error::CliError;

/// Bounded exponential backoff for presigned uploads and log attaches.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            ..Self::default()
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget runs out. `op` receives the 1-based attempt number.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut(u32) -> Result<T, CliError>,
    ) -> Result<T, CliError> {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(what, attempt, ?delay, error = %err, "transient failure, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn delays_double_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(5), Duration::from_secs(4));
    }

    #[test]
    fn transient_failures_are_retried_until_success() {
        let calls = Cell::new(0);
        let result = fast().run("upload", |_| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(CliError::Transport("reset".into()))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = fast().run("upload", |_| {
            calls.set(calls.get() + 1);
            Err(CliError::protocol(403, "http", "expired signature"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn budget_is_bounded() {
        let calls = Cell::new(0);
        let result: Result<(), _> = fast().run("logs", |_| {
            calls.set(calls.get() + 1);
            Err(CliError::protocol(502, "http", "bad gateway"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }
}
