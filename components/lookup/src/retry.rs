use std::{ops::ControlFlow, thread, time::Duration};

use tracing::debug;

use crate::{
    config::LookupConfig,
    err::{Result, RetriesExhaustedSnafu},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LookupConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            backoff: config.retry_backoff,
            max_backoff: config.max_retry_backoff,
        }
    }

    pub fn delay(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Runs `f` until it breaks, sleeping with exponential backoff between
/// attempts. Fails with `RetriesExhausted` after `max_retries` attempts.
pub fn with_backoff<T>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut f: impl FnMut(usize) -> ControlFlow<T>,
) -> Result<T> {
    let attempts = policy.max_retries.max(1);
    for attempt in 0..attempts {
        if let ControlFlow::Break(v) = f(attempt) {
            return Ok(v);
        }
        if attempt + 1 < attempts {
            let delay = policy.delay(attempt);
            debug!("{operation}: attempt {} failed, retry in {delay:?}", attempt + 1);
            thread::sleep(delay);
        }
    }
    RetriesExhaustedSnafu { operation, attempts }.fail()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(3);
        assert_eq!(p.delay(0), Duration::from_millis(1));
        assert_eq!(p.delay(1), Duration::from_millis(2));
        assert_eq!(p.delay(2), Duration::from_millis(4));
        assert_eq!(p.delay(10), Duration::from_millis(4));
        assert_eq!(p.delay(usize::MAX), Duration::from_millis(4));
    }

    #[test]
    fn stops_on_break() {
        let mut calls = 0;
        let v = with_backoff(&policy(5), "test", |attempt| {
            calls += 1;
            if attempt == 2 {
                ControlFlow::Break(attempt * 10)
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();
        assert_eq!((v, calls), (20, 3));
    }

    #[test]
    fn gives_up() {
        let mut calls = 0;
        let err = with_backoff(&policy(3), "never", |_| -> ControlFlow<()> {
            calls += 1;
            ControlFlow::Continue(())
        })
        .unwrap_err();
        assert!(err.is_retries_exhausted());
        assert_eq!(calls, 3);
    }
}
