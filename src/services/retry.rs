use anyhow::Result;
use log::warn;
use std::future::Future;
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

/// Rate-limit, overload and server-busy signals are worth another attempt;
/// everything else is treated as fatal.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    let text = format!("{:#}", err).to_lowercase();
    const MARKERS: &[&str] = &[
        "429",
        "rate limit",
        "too many requests",
        "resource_exhausted",
        "overloaded",
        "503",
        "unavailable",
        "server busy",
    ];
    MARKERS.iter().any(|m| text.contains(m))
}

/// Runs `op` with bounded exponential backoff: after the n-th retryable
/// failure the next attempt waits `base_delay * 2^(n-1)`. The first fatal
/// error, or the last error once the budget is spent, is returned unchanged.
/// Holds no state between invocations; concurrent calls are independent.
pub async fn call_with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.base_delay * 2u32.pow((attempt - 1) as u32);
                warn!(
                    "[call_with_retry] attempt {}/{} failed: {:#}; retrying in {:?}",
                    attempt, policy.max_attempts, err, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[test]
    fn classification_matches_upstream_signals() {
        assert!(is_retryable(&anyhow!("HTTP 429 Too Many Requests")));
        assert!(is_retryable(&anyhow!("model overloaded, try later")));
        assert!(is_retryable(&anyhow!("503 Service Unavailable")));
        assert!(is_retryable(&anyhow!(
            "Gemini API returned error: RESOURCE_EXHAUSTED"
        )));
        assert!(!is_retryable(&anyhow!("invalid api key")));
        assert!(!is_retryable(&anyhow!("Failed to parse plan JSON")));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = call_with_retry(fast_policy(), move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(anyhow!("429 too many requests"))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<u32> = call_with_retry(fast_policy(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("invalid request body"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_error_unchanged() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<u32> = call_with_retry(fast_policy(), move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("503 unavailable (call {})", n))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "503 unavailable (call 2)");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
