//! Bounded retry with exponential backoff and jitter for transient graph
//! failures. Fatal errors return immediately; exhaustion returns the last
//! error.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Backoff for the given zero-based attempt: base x 2^attempt, jittered
    /// +/-50%, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.5..=1.5);
        exp.mul_f64(jitter).min(self.max_delay)
    }
}

pub async fn retry_read<T, F, Fut>(name: &'static str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(query = name, attempt, ?delay, %err, "transient graph failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FabricError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient(message: &str) -> FabricError {
        FabricError::Graph {
            message: message.to_string(),
            transient: true,
        }
    }

    fn fatal() -> FabricError {
        FabricError::Graph {
            message: "syntax".into(),
            transient: false,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_read("t", fast_policy(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient("reset"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_return_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_read("t", fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(fatal()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_read("t", fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient("expired")) }
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::default();
        for attempt in 0..10 {
            assert!(policy.backoff(attempt) <= policy.max_delay);
        }
    }
}
