//! Exponential retry wrapper for calls that can fail transiently.
//!
//! The delay before retry `n` is `start_delay * factor^n`. Retries continue only
//! while that delay stays below the ceiling; once the next delay would reach it
//! the wrapper gives up with [`BackoffError::Exhausted`].

use crate::config::BackoffConfig;
use crate::error::EtlError;
use log::{error, warn};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Hard stop for factors at or near 1.0, where the schedule would never reach the ceiling.
const MAX_SCHEDULE_LEN: usize = 64;

/// Errors that know whether a retry could help.
pub trait Retryable: fmt::Display {
    fn is_transient(&self) -> bool;
}

impl Retryable for EtlError {
    fn is_transient(&self) -> bool {
        EtlError::is_transient(self)
    }
}

/// Outcome of a call that did not succeed under [`Backoff::retry`].
#[derive(Debug)]
pub enum BackoffError<E> {
    /// The call failed with an error that retrying cannot fix.
    Fatal(E),
    /// The call kept failing transiently until the delay hit the ceiling.
    Exhausted {
        operation: String,
        ceiling: Duration,
        attempts: u32,
        last_error: E,
    },
}

impl From<BackoffError<EtlError>> for EtlError {
    fn from(err: BackoffError<EtlError>) -> Self {
        match err {
            BackoffError::Fatal(err) => err,
            BackoffError::Exhausted {
                operation,
                ceiling,
                last_error,
                ..
            } => EtlError::RetryExhausted {
                operation,
                ceiling,
                source: Box::new(last_error),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    config: BackoffConfig,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Delays strictly below the ceiling, in the order they are used.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let start = self.config.start_delay.as_secs_f64();
        let factor = self.config.factor;
        let ceiling = self.config.ceiling;

        (0..MAX_SCHEDULE_LEN as i32)
            .map(move |n| Duration::from_secs_f64(start * factor.powi(n)))
            .take_while(move |delay| *delay < ceiling)
    }

    /// Run `call` until it succeeds, fails fatally, or the delay would reach the ceiling.
    ///
    /// The call is always attempted at least once. Every failed attempt is logged
    /// before sleeping.
    pub async fn retry<T, E, F, Fut>(
        &self,
        operation: &str,
        mut call: F,
    ) -> Result<T, BackoffError<E>>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut schedule = self.delays();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                warn!("{operation}: attempt {attempt} failed with non-retryable error: {err}");
                return Err(BackoffError::Fatal(err));
            }

            match schedule.next() {
                Some(delay) => {
                    warn!("{operation}: attempt {attempt} failed: {err}; retrying in {delay:?}");
                    sleep(delay).await;
                }
                None => {
                    error!(
                        "{operation}: giving up after {attempt} attempts, backoff reached the {:?} ceiling: {err}",
                        self.config.ceiling
                    );
                    return Err(BackoffError::Exhausted {
                        operation: operation.to_string(),
                        ceiling: self.config.ceiling,
                        attempts: attempt,
                        last_error: err,
                    });
                }
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(bool);

    impl fmt::Display for Flaky {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "flaky(transient={})", self.0)
        }
    }

    impl Retryable for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    fn fast_backoff() -> Backoff {
        Backoff::new(BackoffConfig {
            start_delay: Duration::from_millis(1),
            factor: 2.0,
            ceiling: Duration::from_millis(100),
        })
    }

    #[test]
    fn default_schedule_stops_below_ceiling() {
        let delays: Vec<u128> = Backoff::default().delays().map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200, 6400]);
    }

    #[test]
    fn unit_factor_schedule_is_bounded() {
        let backoff = Backoff::new(BackoffConfig {
            start_delay: Duration::from_millis(1),
            factor: 1.0,
            ceiling: Duration::from_secs(1),
        });
        assert_eq!(backoff.delays().count(), MAX_SCHEDULE_LEN);
    }

    #[tokio::test]
    async fn always_failing_call_stops_at_schedule_length() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_backoff()
            .retry("always_fails", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Flaky(true)) }
            })
            .await;

        match result {
            Err(BackoffError::Exhausted {
                operation,
                attempts,
                ceiling,
                ..
            }) => {
                assert_eq!(operation, "always_fails");
                // One attempt per delay in 1..=64 ms, plus the final one.
                assert_eq!(attempts, 8);
                assert_eq!(ceiling, Duration::from_millis(100));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn every_delay_below_ceiling_is_slept() {
        let backoff = Backoff::new(BackoffConfig {
            start_delay: Duration::from_millis(10),
            factor: 2.0,
            ceiling: Duration::from_millis(1000),
        });
        let started = tokio::time::Instant::now();
        let result: Result<(), _> = backoff
            .retry("always_fails", || async { Err(Flaky(true)) })
            .await;

        assert!(matches!(
            result,
            Err(BackoffError::Exhausted { attempts: 8, .. })
        ));
        // 10 + 20 + 40 + 80 + 160 + 320 + 640 ms, give or take timer rounding.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1265), "slept {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1290), "slept {elapsed:?}");
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let value = fast_backoff()
            .retry("recovers", || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(Flaky(true))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .expect("third attempt succeeds");

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_backoff()
            .retry("fatal", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Flaky(false)) }
            })
            .await;

        assert!(matches!(result, Err(BackoffError::Fatal(Flaky(false)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_converts_into_terminal_etl_error() {
        let backoff = Backoff::new(BackoffConfig {
            start_delay: Duration::from_millis(1),
            factor: 2.0,
            ceiling: Duration::from_millis(3),
        });
        let result: Result<(), BackoffError<EtlError>> = backoff
            .retry("films_modified", || async {
                Err(EtlError::Database(sqlx::Error::PoolTimedOut))
            })
            .await;

        let err: EtlError = result.unwrap_err().into();
        match err {
            EtlError::RetryExhausted {
                operation, ceiling, ..
            } => {
                assert_eq!(operation, "films_modified");
                assert_eq!(ceiling, Duration::from_millis(3));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
