use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Bounded retry with a fixed pause between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Runs `op` until it succeeds or attempts run out, returning the last error.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= self.max_attempts => {
                    warn!("{}: attempt {}/{} failed, giving up: {}", label, attempt, self.max_attempts, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("{}: attempt {}/{} failed: {}", label, attempt, self.max_attempts, e);
                    if !self.backoff.is_zero() {
                        sleep(self.backoff).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Answer of one status check while waiting on a remote job.
#[derive(Debug)]
pub enum PollStatus<T> {
    Ready(T),
    Pending(String),
    Failed(String),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PollError {
    #[error("remote processing failed: {0}")]
    Failed(String),
    #[error("timed out after {attempts} status checks")]
    TimedOut { attempts: u32 },
    #[error("status check failed: {0}")]
    Check(String),
}

/// Fixed-interval polling with a bounded number of checks.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn poll<T, E, F, Fut>(&self, label: &str, mut check: F) -> Result<T, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PollStatus<T>, E>>,
        E: Display,
    {
        for attempt in 1..=self.max_attempts {
            match check().await.map_err(|e| PollError::Check(e.to_string()))? {
                PollStatus::Ready(v) => {
                    info!("{}: ready after {} check(s)", label, attempt);
                    return Ok(v);
                }
                PollStatus::Failed(reason) => return Err(PollError::Failed(reason)),
                PollStatus::Pending(status) => {
                    info!(
                        "{}: status {}, waiting {:?} (check {}/{})",
                        label, status, self.interval, attempt, self.max_attempts
                    );
                    if attempt < self.max_attempts && !self.interval.is_zero() {
                        sleep(self.interval).await;
                    }
                }
            }
        }
        Err(PollError::TimedOut {
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let calls = Cell::new(0);
        let out: Result<u32, String> = policy
            .run("flaky", |attempt| {
                calls.set(calls.get() + 1);
                async move {
                    if attempt < 3 { Err(format!("boom {attempt}")) } else { Ok(attempt) }
                }
            })
            .await;
        assert_eq!(out, Ok(3));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn returns_last_error_when_exhausted() {
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let out: Result<(), String> = policy
            .run("always", |attempt| async move { Err(format!("fail {attempt}")) })
            .await;
        assert_eq!(out, Err("fail 2".to_string()));
    }

    #[tokio::test]
    async fn explicit_failure_status_is_terminal() {
        let policy = PollPolicy::new(Duration::ZERO, 30);
        let checks = Cell::new(0);
        let out: Result<(), PollError> = policy
            .poll("container", || {
                checks.set(checks.get() + 1);
                let n = checks.get();
                async move {
                    Ok::<_, String>(if n == 2 {
                        PollStatus::Failed("ERROR".into())
                    } else {
                        PollStatus::Pending("IN_PROGRESS".into())
                    })
                }
            })
            .await;
        assert_eq!(out, Err(PollError::Failed("ERROR".into())));
        assert_eq!(checks.get(), 2);
    }

    #[tokio::test]
    async fn pending_forever_times_out() {
        let policy = PollPolicy::new(Duration::ZERO, 4);
        let out: Result<(), PollError> = policy
            .poll("container", || async { Ok::<_, String>(PollStatus::Pending("IN_PROGRESS".into())) })
            .await;
        assert_eq!(out, Err(PollError::TimedOut { attempts: 4 }));
    }
}
