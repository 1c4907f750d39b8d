/// Resilience helpers shared by Nova services
///
/// - **Retry**: exponential backoff with jitter for transient failures
/// - **Timeout**: deadline wrappers that preserve the wrapped operation's error
///
/// # Example: retrying a store write
///
/// ```rust,no_run
/// use resilience::{with_retry, RetryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let result = with_retry(RetryConfig::default(), || async {
///         // Your store write here
///         Ok::<_, String>(())
///     })
///     .await;
///     assert!(result.is_ok());
/// }
/// ```
pub mod retry;
pub mod timeout;

pub use retry::{with_retry, RetryConfig, RetryError};
pub use timeout::{with_timeout_result, TimeoutError};
