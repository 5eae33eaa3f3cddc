/// Integration tests for resilience library
use resilience::{with_retry, ErrorClass, RetryConfig, RetryError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
enum UpstreamError {
    Busy,
    Rejected,
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Busy => write!(f, "busy"),
            UpstreamError::Rejected => write!(f, "rejected"),
        }
    }
}

fn classify(err: &UpstreamError) -> ErrorClass {
    match err {
        UpstreamError::Busy => ErrorClass::Transient,
        UpstreamError::Rejected => ErrorClass::Permanent,
    }
}

#[tokio::test]
async fn test_backoff_timing_accumulates() {
    let config = RetryConfig {
        max_retries: 3,
        initial_backoff: Duration::from_millis(10),
        backoff_multiplier: 2.0,
        jitter: false,
        ..Default::default()
    };

    let start = Instant::now();
    let _ = with_retry(&config, classify, |_| async { Err::<(), _>(UpstreamError::Busy) }).await;

    // 10ms + 20ms + 40ms
    assert!(start.elapsed() >= Duration::from_millis(70));
}

#[tokio::test]
async fn test_transient_then_permanent_stops_retrying() {
    let config = RetryConfig {
        max_retries: 5,
        initial_backoff: Duration::from_millis(1),
        jitter: false,
        ..Default::default()
    };
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();

    let result = with_retry(&config, classify, move |attempt| {
        c.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 1 {
                Err::<(), _>(UpstreamError::Busy)
            } else {
                Err(UpstreamError::Rejected)
            }
        }
    })
    .await;

    assert!(matches!(
        result,
        Err(RetryError::Permanent {
            attempts: 2,
            error: UpstreamError::Rejected
        })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_zero_retries_runs_once() {
    let config = RetryConfig {
        max_retries: 0,
        ..Default::default()
    };

    let result = with_retry(&config, classify, |_| async {
        Err::<(), _>(UpstreamError::Busy)
    })
    .await;

    assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
}
