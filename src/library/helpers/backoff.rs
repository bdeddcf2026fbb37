//! Linear backoff and the retry policy built on top of it

use std::fmt::Display;
use std::future::Future;
use std::{iter::Iterator, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Linear backoff iterator
///
/// This struct implements the iterator trait and returns monotonically increasing values until a specified limit of iterations, specified by the `limit` field, is reached.
/// The n-th element in the Iterator is the base `delay` multiplied by `n`.
pub struct Backoff {
    retries: u32,
    limit: u32,
    delay: Duration,
}

impl Backoff {
    /// Creates a new instance which hands out at most `limit` delays
    pub fn new(delay: Duration, limit: u32) -> Self {
        Self {
            retries: 0,
            limit,
            delay,
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.retries += 1;

        if self.retries > self.limit {
            None
        } else {
            Some(self.delay * self.retries)
        }
    }
}

/// Error returned when every attempt permitted by a [`RetryPolicy`] failed
#[derive(Error, Debug)]
#[error("giving up after {attempts} attempts")]
pub struct RetriesExhausted<E> {
    /// Number of attempts that have been made
    pub attempts: u32,
    /// Error returned by the last attempt
    #[source]
    pub last_error: E,
}

/// Bounded number of attempts with a [`Backoff`] between them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Creates a new policy, at least one attempt is always made
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Total number of attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Base delay which is scaled linearly with each failed attempt
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Delays to wait between consecutive attempts
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.delay, self.max_attempts - 1)
    }

    /// Runs the operation until it succeeds or the attempts are used up
    ///
    /// The operation receives the one-based number of the current attempt.
    pub async fn retry<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetriesExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut backoff = self.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => match backoff.next() {
                    Some(delay) => {
                        warn!(attempt, max_attempts = self.max_attempts, %error, ?delay, "Attempt failed, retrying");
                        sleep(delay).await;
                    }
                    None => {
                        debug!(attempt, %error, "Final attempt failed");
                        return Err(RetriesExhausted {
                            attempts: attempt,
                            last_error: error,
                        });
                    }
                },
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(5))
    }
}
