//! Bounded retry with a fixed delay between attempts.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
    /// A non-retryable error ended the loop early.
    Fatal(E),
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            RetryError::Fatal(e) => write!(f, "{e}"),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Run `op` until it succeeds, fails with an error `retryable` rejects, or
    /// the attempt budget is spent. `op` receives the 1-based attempt number.
    /// The delay applies between attempts, never after the last one.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        what: &str,
        mut op: F,
        retryable: R,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !retryable(&e) => return Err(RetryError::Fatal(e)),
                Err(e) => {
                    if !self.backoff(what, attempt, &e).await {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last: e,
                        });
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Account for a failed retryable attempt. Sleeps and returns `true` when
    /// another attempt is allowed, `false` once the budget is spent.
    /// Loops that mutate their own state between attempts call this directly.
    pub async fn backoff<E: fmt::Display>(&self, what: &str, attempt: u32, error: &E) -> bool {
        if attempt >= self.max_attempts {
            warn!(what, attempt, error = %error, "Retry budget exhausted");
            return false;
        }
        warn!(
            what,
            attempt,
            max_attempts = self.max_attempts,
            delay_secs = self.delay.as_secs(),
            error = %error,
            "Attempt failed, retrying"
        );
        tokio::time::sleep(self.delay).await;
        true
    }
}
