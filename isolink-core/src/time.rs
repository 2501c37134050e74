//! Time provider abstraction.
//!
//! Polling loops, reconnect back-off and response timeouts all read the
//! clock through [`TimeProvider`], which keeps them testable with Tokio's
//! paused clock.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during time operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// The operation timed out.
    #[error("operation timed out")]
    Elapsed,
}

/// Provider trait for time operations.
#[async_trait(?Send)]
pub trait TimeProvider: Clone {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration) -> Result<(), TimeError>;

    /// Elapsed time since the provider was created.
    fn now(&self) -> Duration;

    /// Run a future with a timeout.
    ///
    /// Returns `Ok(result)` if the future completes within the timeout,
    /// or `Err(TimeError::Elapsed)` if it times out.
    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T>;
}

/// Real time provider using Tokio's time facilities.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start: tokio::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new Tokio time provider.
    pub fn new() -> Self {
        Self {
            start: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) -> Result<(), TimeError> {
        tokio::time::sleep(duration).await;
        Ok(())
    }

    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(duration, future)
            .await
            .map_err(|_| TimeError::Elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_advances_now() {
        let time = TokioTimeProvider::new();
        time.sleep(Duration::from_millis(200)).await.expect("sleep");
        assert!(time.now() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_elapses() {
        let time = TokioTimeProvider::new();
        let result = time
            .timeout(Duration::from_millis(50), std::future::pending::<()>())
            .await;
        assert_eq!(result, Err(TimeError::Elapsed));

        let ready = time.timeout(Duration::from_millis(50), async { 7 }).await;
        assert_eq!(ready, Ok(7));
    }
}
