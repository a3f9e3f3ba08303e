//! Consumer retry logic with exponential backoff
//!
//! Wraps any fallible async operation. Attempt 0 runs immediately; after a
//! failure of attempt `k` the engine sleeps `initial_backoff * multiplier^k`
//! (capped at `max_backoff`, optionally jittered by up to ±12.5%) before the
//! next attempt. Both running attempts and sleeps are interruptible through a
//! [`CancellationToken`].

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Jitter spread as a fraction of the base delay (±1/8)
const JITTER_FRACTION: f64 = 0.125;

/// Configuration for retry behavior
///
/// Immutable once built; one instance can be shared by any number of
/// concurrent invocations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = `max_retries + 1`)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
    /// Growth factor applied per attempt (values below 1.0 are treated as 1.0)
    pub multiplier: f64,
    /// Apply uniform jitter in `[-base/8, +base/8]`
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay before the attempt that follows failed attempt `attempt`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        let capped = secs.min(self.max_backoff.as_secs_f64());

        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_backoff
        }
    }

    /// Delay actually slept after failed attempt `attempt`, never above `max_backoff`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }

        let base_secs = base.as_secs_f64();
        let spread = base_secs * JITTER_FRACTION;
        let offset = rand::thread_rng().gen_range(-spread..=spread);

        Duration::from_secs_f64((base_secs + offset).max(0.0)).min(self.max_backoff)
    }
}

/// Why [`retry_with_backoff`] gave up
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The cancellation token fired before the first attempt, while an
    /// attempt was running, or during a backoff sleep
    #[error("{label}: cancelled after {attempts} attempt(s)")]
    Cancelled { label: String, attempts: u32 },

    /// Every attempt failed; carries the last underlying error
    #[error("{label}: failed after {attempts} attempt(s): {source}")]
    Exhausted {
        label: String,
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Cancelled { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// The last operation error, if the retries were exhausted
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Exhausted { source, .. } => Some(source),
            RetryError::Cancelled { .. } => None,
        }
    }
}

/// Retry a fallible async operation with exponential backoff
///
/// # Arguments
/// * `cancel` - Token that aborts the loop; checked at entry and raced against every
///   attempt and every sleep. A cancelled attempt's future is dropped.
/// * `config` - Retry configuration
/// * `operation` - The async operation to retry
/// * `label` - Context string for logging (e.g., "insert:alice")
///
/// # Returns
/// * `Ok(T)` on the first successful attempt
/// * `Err(RetryError::Exhausted)` after `max_retries + 1` failed attempts
/// * `Err(RetryError::Cancelled)` if the token fires first
///
/// # Example
/// ```rust
/// use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), event_bus::RetryError<String>> {
/// let config = RetryConfig::default();
/// let cancel = CancellationToken::new();
/// let value = retry_with_backoff(
///     &cancel,
///     &config,
///     || async { Ok::<_, String>(42) },
///     "example_operation",
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    cancel: &CancellationToken,
    config: &RetryConfig,
    mut operation: F,
    label: &str,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    if cancel.is_cancelled() {
        return Err(RetryError::Cancelled {
            label: label.to_string(),
            attempts: 0,
        });
    }

    let mut attempt: u32 = 0;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(label = %label, attempt = attempt + 1, "Operation cancelled while running");
                return Err(RetryError::Cancelled {
                    label: label.to_string(),
                    attempts: attempt + 1,
                });
            }
            outcome = operation() => outcome,
        };

        match outcome {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        label = %label,
                        attempts = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                let attempts = attempt + 1;

                if attempt >= config.max_retries {
                    warn!(
                        label = %label,
                        attempts = attempts,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(RetryError::Exhausted {
                        label: label.to_string(),
                        attempts,
                        source: e,
                    });
                }

                let delay = config.delay_for(attempt);

                warn!(
                    label = %label,
                    attempt = attempts,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying with backoff"
                );

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(label = %label, attempts = attempts, "Retry cancelled during backoff");
                        return Err(RetryError::Cancelled {
                            label: label.to_string(),
                            attempts,
                        });
                    }
                    _ = sleep(delay) => {}
                }

                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_attempt() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = retry_with_backoff(
            &cancel,
            &RetryConfig::default(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(42) }
            },
            "test_operation",
        )
        .await;

        assert_eq!(result.ok(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));

        let result = retry_with_backoff(
            &cancel,
            &fast_config(3),
            || {
                let attempts = attempts.clone();
                async move {
                    let count = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(format!("Attempt {}", count))
                    } else {
                        Ok(42)
                    }
                }
            },
            "test_operation",
        )
        .await;

        assert_eq!(result.ok(), Some(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_makes_n_plus_one_attempts() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = retry_with_backoff(
            &cancel,
            &fast_config(4),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<i32, _>("persistent error") }
            },
            "test_operation",
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        match result {
            Err(RetryError::Exhausted { attempts, source, .. }) => {
                assert_eq!(attempts, 5);
                assert_eq!(source, "persistent error");
            }
            other => panic!("expected exhausted error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = retry_with_backoff(
            &cancel,
            &fast_config(0),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("boom") }
            },
            "test_operation",
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().attempts(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_at_entry_never_runs_operation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let result = retry_with_backoff(
            &cancel,
            &fast_config(3),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            },
            "test_operation",
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let err = result.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.attempts(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff_sleep() {
        let cancel = CancellationToken::new();
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: false,
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result = retry_with_backoff(
            &cancel,
            &config,
            || async { Err::<(), _>("unavailable") },
            "test_operation",
        )
        .await;

        assert!(start.elapsed() < Duration::from_secs(2));
        let err = result.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.attempts(), 1);
        assert!(err.into_source().is_none());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_running_attempt() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result = retry_with_backoff(
            &cancel,
            &RetryConfig::default(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    sleep(Duration::from_secs(30)).await;
                    Ok::<_, String>(())
                }
            },
            "stuck_operation",
        )
        .await;

        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = result.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.attempts(), 1);
    }

    #[tokio::test]
    async fn test_exponential_backoff_waits() {
        let cancel = CancellationToken::new();
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(25),
            multiplier: 2.0,
            jitter: false,
        };

        let start = Instant::now();
        let _ = retry_with_backoff(
            &cancel,
            &config,
            || async { Err::<(), _>("error") },
            "test_operation",
        )
        .await;

        // 10ms + 20ms + 25ms (capped)
        assert!(start.elapsed() >= Duration::from_millis(55));
    }

    #[test]
    fn test_base_delay_grows_until_cap() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(config.base_delay(0), Duration::from_millis(100));
        assert_eq!(config.base_delay(1), Duration::from_millis(200));
        assert_eq!(config.base_delay(3), Duration::from_millis(800));

        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let delay = config.base_delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= config.max_backoff);
            previous = delay;
        }
        assert_eq!(config.base_delay(63), config.max_backoff);
    }

    #[test]
    fn test_multiplier_below_one_never_shrinks() {
        let config = RetryConfig {
            multiplier: 0.5,
            jitter: false,
            ..RetryConfig::default()
        };

        assert_eq!(config.base_delay(0), config.base_delay(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(800),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        };

        for attempt in 0..4 {
            let base = config.base_delay(attempt).as_secs_f64();
            for _ in 0..200 {
                let delay = config.delay_for(attempt).as_secs_f64();
                assert!(delay >= base * 0.875 - 1e-9);
                assert!(delay <= base * 1.125 + 1e-9);
            }
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: true,
        };

        for _ in 0..200 {
            assert!(config.delay_for(3) <= config.max_backoff);
        }
    }
}
