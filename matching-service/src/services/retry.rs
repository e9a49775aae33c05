//! Bounded exponential retry for transient store failures.

use backoff::future::retry;
use backoff::ExponentialBackoff;
use service_core::error::AppError;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_elapsed: Duration,
}

impl RetryPolicy {
    pub fn new(max_elapsed: Duration) -> Self {
        Self { max_elapsed }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(25),
            max_interval: Duration::from_millis(500),
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        }
    }

    /// Run `op`, retrying only errors that report themselves transient.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        retry(self.backoff(), || {
            let fut = op();
            async move {
                fut.await.map_err(|e| {
                    if e.is_transient() {
                        tracing::warn!(operation, error = %e, "Transient store error, retrying");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(2_000))
    }
}
