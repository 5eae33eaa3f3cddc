/// Retry primitives shared by the live services
///
/// - **Backoff**: exponential delay schedule with optional ±30% jitter
/// - **Classified retry**: only errors the caller marks transient are retried,
///   permanent errors surface immediately with the attempt count
///
/// # Example
///
/// ```rust,no_run
/// use resilience::{with_retry, ErrorClass, RetryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let config = RetryConfig::default();
///
///     let result = with_retry(
///         &config,
///         |_err: &String| ErrorClass::Transient,
///         |_attempt| async { Ok::<_, String>(()) },
///     )
///     .await;
///     assert!(result.is_ok());
/// }
/// ```

pub mod retry;

pub use retry::{with_retry, Backoff, ErrorClass, RetryConfig, RetryError, Retried};
