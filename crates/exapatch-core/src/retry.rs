use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

/// Retry a fallible async operation with a fixed delay between attempts.
///
/// - `max_attempts`: Total attempts (including the first).
/// - `delay`: Pause after each failure; does not grow.
/// - `label`: Description for log messages.
/// - `f`: Produces a fresh future per attempt.
pub async fn retry_flat<F, Fut, T>(
    max_attempts: u32,
    delay: Duration,
    label: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f(attempt).await {
            Ok(val) => return Ok(val),
            Err(e) if attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{} failed, retrying",
                    label,
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result = retry_flat(3, Duration::from_millis(1), "test", |_| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let result = retry_flat(3, Duration::from_millis(1), "test", |attempt| async move {
            if attempt < 3 {
                anyhow::bail!("not yet");
            }
            Ok(attempt)
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_all_attempts() {
        let count = AtomicU32::new(0);
        let result: Result<i32> = retry_flat(3, Duration::from_millis(1), "test", |_| {
            count.fetch_add(1, Ordering::SeqCst);
            async { anyhow::bail!("always fails") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let count = AtomicU32::new(0);
        let _ = retry_flat(0, Duration::from_millis(1), "test", |_| {
            count.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
