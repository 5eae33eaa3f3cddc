/// Retry policy with exponential backoff, jitter and error classification
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Growth factor applied after every retry
    pub backoff_multiplier: f64,
    /// Add random jitter to each delay (±30%)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// How a failed attempt should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("permanent failure after {attempts} attempt(s): {error}")]
    Permanent { attempts: u32, error: E },
    #[error("retries exhausted after {attempts} attempt(s): {error}")]
    Exhausted { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent { error, .. } | RetryError::Exhausted { error, .. } => error,
        }
    }
}

/// Successful value together with the number of attempts it took
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Delay schedule derived from a [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            next: config.initial_backoff,
            max: config.max_backoff,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Returns the delay to wait now and advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next.min(self.max);
        self.next = Duration::from_millis(
            (base.as_millis() as f64 * self.multiplier).min(self.max.as_millis() as f64) as u64,
        );
        if self.jitter {
            let factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
            Duration::from_millis((base.as_millis() as f64 * factor) as u64)
        } else {
            base
        }
    }
}

/// Run `op` until it succeeds, fails permanently or exhausts `max_retries`.
///
/// `op` receives the 1-based attempt number.
pub async fn with_retry<F, Fut, T, E, C>(
    config: &RetryConfig,
    classify: C,
    mut op: F,
) -> Result<Retried<T>, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> ErrorClass,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(config);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                })
            }
            Err(error) => {
                if classify(&error) == ErrorClass::Permanent {
                    return Err(RetryError::Permanent {
                        attempts: attempt,
                        error,
                    });
                }
                if attempt > config.max_retries {
                    warn!(
                        attempts = attempt,
                        %error,
                        "Max retries ({}) reached",
                        config.max_retries
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        error,
                    });
                }

                let delay = backoff.next_delay();
                warn!(
                    %error,
                    "Retry attempt {}/{}, waiting {:?}",
                    attempt, config.max_retries, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(5),
            jitter: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let result = with_retry(
            &RetryConfig::default(),
            |_: &String| ErrorClass::Transient,
            |_| async { Ok::<_, String>(7) },
        )
        .await
        .unwrap();

        assert_eq!(result, Retried { value: 7, attempts: 1 });
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = with_retry(
            &fast_config(3),
            |_: &&str| ErrorClass::Transient,
            move |attempt| {
                c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err("busy")
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result.attempts, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = with_retry(
            &fast_config(5),
            |_: &&str| ErrorClass::Permanent,
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("unsupported input") }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Permanent { attempts: 1, .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_counts_initial_attempt() {
        let result = with_retry(
            &fast_config(2),
            |_: &&str| ErrorClass::Transient,
            |_| async { Err::<(), _>("down") },
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { .. }));
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.into_inner(), "down");
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(&RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            backoff_multiplier: 2.0,
            jitter: false,
            ..Default::default()
        });

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(&RetryConfig {
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(1000),
            ..Default::default()
        });

        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(700));
            assert!(delay <= Duration::from_millis(1300));
        }
    }
}
