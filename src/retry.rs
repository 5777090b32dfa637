use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::Result;

/// Retries allowed for a serialization conflict before giving up.
pub const DB_RETRIES: u32 = 5;
/// Retries allowed for a blob upload.
pub const BLOB_RETRIES: u32 = 3;

const BASE_DELAY_MS: u64 = 10;
const MAX_DELAY_MS: u64 = 500;

/// Run `op`, retrying transient (`Unavailable`) failures up to `retries`
/// times with jittered exponential backoff. Other errors return at once.
pub async fn with_retry<T, F, Fut>(name: &'static str, retries: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                let delay = backoff(attempt);
                tracing::warn!(
                    op = name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

/// Full jitter: uniform in `[0, min(max, base * 2^attempt)]`.
fn backoff(attempt: u32) -> Duration {
    let cap = BASE_DELAY_MS
        .saturating_mul(1u64 << attempt.min(16))
        .min(MAX_DELAY_MS);
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_unavailable_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retry("test", DB_RETRIES, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SchedulerError::Unavailable("busy".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry("test", BLOB_RETRIES, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SchedulerError::Unavailable("down".into()))
        })
        .await;
        assert!(matches!(result, Err(SchedulerError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), BLOB_RETRIES + 1);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry("test", DB_RETRIES, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SchedulerError::InvalidArgument("bad".into()))
        })
        .await;
        assert!(matches!(result, Err(SchedulerError::InvalidArgument(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_is_capped() {
        for attempt in 0..20 {
            assert!(backoff(attempt) <= Duration::from_millis(MAX_DELAY_MS));
        }
    }
}
