/// Integration tests for resilience library
use resilience::{
    retry::{with_retry, RetryConfig, RetryError},
    timeout::{with_timeout_result, TimeoutError},
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        jitter: false,
        ..Default::default()
    }
}

// ==================== Combined Retry + Timeout Tests ====================

#[tokio::test]
async fn test_retry_recovers_from_timeouts() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();

    let result = with_retry(fast_retry(3), move || {
        let n = calls_clone.fetch_add(1, Ordering::SeqCst);
        async move {
            with_timeout_result(Duration::from_millis(20), async move {
                if n == 0 {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Ok::<_, String>(n)
            })
            .await
        }
    })
    .await;

    assert_eq!(result.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_reports_last_timeout() {
    let result = with_retry(fast_retry(1), || async {
        with_timeout_result(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, String>(())
        })
        .await
    })
    .await;

    match result {
        Err(RetryError::Exhausted {
            attempts,
            last_error,
        }) => {
            assert_eq!(attempts, 2);
            assert!(matches!(last_error, TimeoutError::Elapsed(_)));
        }
        Ok(()) => panic!("expected exhaustion"),
    }
}

#[tokio::test]
async fn test_concurrent_retries_are_independent() {
    let handles: Vec<_> = (0..8u32)
        .map(|i| {
            tokio::spawn(async move {
                let attempts = Arc::new(AtomicU32::new(0));
                let attempts_clone = attempts.clone();
                let result = with_retry(fast_retry(5), move || {
                    let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < i % 3 {
                            Err("transient")
                        } else {
                            Ok(i)
                        }
                    }
                })
                .await;
                (result.ok(), attempts.load(Ordering::SeqCst))
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let (value, attempts) = handle.await.unwrap();
        assert_eq!(value, Some(i as u32));
        assert_eq!(attempts, (i as u32 % 3) + 1);
    }
}
