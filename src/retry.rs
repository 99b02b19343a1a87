//! Bounded exponential backoff for calls against external services.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Retry policy: exponential backoff with full jitter.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

/// Delay before retry number `attempt` (0-based).
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exp = config.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
    let capped = exp.min(config.max_delay.as_secs_f64());
    if config.jitter {
        // Full jitter: uniform over [0, capped].
        Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=capped))
    } else {
        Duration::from_secs_f64(capped)
    }
}

/// Run `op` until it succeeds or the attempt budget is exhausted, sleeping
/// between attempts. The last error is returned on exhaustion.
pub async fn retry_async<T, E, F, Fut>(
    operation_name: &str,
    config: &RetryConfig,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 >= config.max_attempts => {
                tracing::error!(
                    "{} failed after {} attempts: {}",
                    operation_name,
                    config.max_attempts,
                    e
                );
                return Err(e);
            }
            Err(e) => {
                let delay = calculate_delay(attempt, config);
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation_name,
                    attempt + 1,
                    config.max_attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            jitter: false,
        }
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let config = no_jitter();
        assert_eq!(calculate_delay(0, &config), Duration::from_millis(1));
        assert_eq!(calculate_delay(1, &config), Duration::from_millis(2));
        assert_eq!(calculate_delay(2, &config), Duration::from_millis(4));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = no_jitter();
        assert_eq!(calculate_delay(10, &config), Duration::from_millis(8));
    }

    #[test]
    fn test_jitter_bounded() {
        let config = RetryConfig {
            jitter: true,
            ..no_jitter()
        };
        for attempt in 0..5 {
            assert!(calculate_delay(attempt, &config) <= config.max_delay);
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<u32, String> = retry_async("test_op", &no_jitter(), move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<u32, String> = retry_async("test_op", &no_jitter(), move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("permanent".to_string())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
