use std::fmt::Display;
use std::time::Duration;
use tracing::debug;

/// Outcome of one attempt of a retried operation.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    /// Worth another try after the policy delay.
    Retry(E),
    /// Give up immediately.
    Fatal(E),
}

#[derive(Debug)]
pub struct RetryFailure<E> {
    pub attempts: u32,
    pub last: E,
}

/// Fixed-delay retry: up to `max_attempts` tries, sleeping `delay` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(3),
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

    /// Run `op` until it is done, fails fatally, or the attempt budget runs out.
    ///
    /// `op` receives the 1-based attempt number. The calling thread sleeps
    /// between attempts, never after the last one.
    pub fn run<T, E, F>(&self, mut op: F) -> Result<T, RetryFailure<E>>
    where
        E: Display,
        F: FnMut(u32) -> Attempt<T, E>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Attempt::Done(value) => return Ok(value),
                Attempt::Fatal(last) => {
                    return Err(RetryFailure {
                        attempts: attempt,
                        last,
                    })
                }
                Attempt::Retry(last) => {
                    if attempt >= self.max_attempts {
                        return Err(RetryFailure {
                            attempts: attempt,
                            last,
                        });
                    }
                    debug!(
                        attempt,
                        max_attempts = self.max_attempts,
                        "attempt failed, retrying: {last}"
                    );
                    std::thread::sleep(self.delay);
                    attempt += 1;
                }
            }
        }
    }
}
