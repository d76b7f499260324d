//! Retry with Exponential Backoff
//!
//! Re-reads operation statuses while the server answers "temporary failure",
//! backing off between reads.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{OperationStatus, PendingOperation};
use crate::error::{Error, Result};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_tries: u32,
    /// Upper bound for a single backoff sleep
    pub max_delay: Duration,
    /// How long one status read may block
    pub status_timeout: Duration,
    /// Status reads attempted before giving up on timeouts
    pub status_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_tries: 3,
            max_delay: Duration::from_secs(1),
            status_timeout: Duration::from_millis(3000),
            status_retries: 3,
        }
    }
}

/// Bounded retry executor for remote operation statuses
#[derive(Debug, Clone, Default)]
pub struct RetryBackoff {
    config: RetryConfig,
    cancel: Option<CancellationToken>,
}

impl RetryBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    /// Abort backoff sleeps when `token` fires
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the retry numbered `attempt` (the first retry has none)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let millis = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(millis).min(self.config.max_delay)
    }

    /// Run `op` until it reports success or a non-retryable status.
    ///
    /// Returns `true` on success, and on a not-found status for a `remove`.
    /// Temporary failures are retried up to `max_tries` times; anything else,
    /// exhaustion, or cancellation returns `false`.
    pub async fn execute<F, Fut>(&self, label: &str, mut op: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<OperationStatus>>,
    {
        let is_remove = label.eq_ignore_ascii_case("remove");
        let mut attempt = 0u32;

        loop {
            if attempt > self.config.max_tries {
                error!(
                    "Could not perform a {} after {} tries",
                    label, self.config.max_tries
                );
                return false;
            }

            let Some(status) = self.fetch_status(label, &mut op).await else {
                return false;
            };

            if status.is_success() {
                return true;
            }
            if is_remove && status.is_not_found() {
                debug!("Remove found nothing to delete");
                return true;
            }
            warn!("{} failed with status={}", label, status);

            if !status.is_temporary_failure() {
                return false;
            }

            let delay = self.backoff_delay(attempt);
            if !delay.is_zero() {
                info!("{} backing off, tries so far={}", label, attempt);
                if !self.sleep(delay).await {
                    error!("Interrupted while backing off on {}", label);
                    return false;
                }
            }
            attempt += 1;
        }
    }

    /// Wait for the status of an enqueued operation.
    ///
    /// If no status ever arrived the operation is cancelled; later waits settle
    /// as a failure.
    pub async fn wait_for_response(&self, pending: &PendingOperation, label: &str) -> bool {
        let timeout = self.config.status_timeout;
        let ok = self.execute(label, || pending.wait(timeout)).await;
        if !ok && pending.status().is_none() && !pending.is_cancelled() {
            debug!("Cancelling {} with no status", label);
            pending.cancel();
        }
        ok
    }

    /// Read a status, retrying reads that time out
    async fn fetch_status<F, Fut>(&self, label: &str, op: &mut F) -> Option<OperationStatus>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<OperationStatus>>,
    {
        let tries = self.config.status_retries.max(1);
        for i in 0..tries {
            match op().await {
                Ok(status) => return Some(status),
                Err(Error::Timeout { .. }) => {
                    warn!("Try[{}] waiting for {} response timed out", tries - i, label);
                }
                Err(e) => {
                    warn!("Reading {} status failed: {}", label, e);
                    return None;
                }
            }
        }
        error!("No {} status after {} reads", label, tries);
        None
    }

    /// Sleep unless cancelled first; false if cancelled
    async fn sleep(&self, delay: Duration) -> bool {
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => false,
                    _ = tokio::time::sleep(delay) => true,
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn scripted(statuses: Vec<OperationStatus>) -> (AtomicU32, Vec<OperationStatus>) {
        (AtomicU32::new(0), statuses)
    }

    async fn run(backoff: &RetryBackoff, label: &str, statuses: Vec<OperationStatus>) -> (bool, u32) {
        let (calls, statuses) = scripted(statuses);
        let ok = backoff
            .execute(label, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) as usize;
                let status = statuses[n.min(statuses.len() - 1)].clone();
                async move { Ok(status) }
            })
            .await;
        (ok, calls.load(Ordering::SeqCst))
    }

    #[test]
    fn test_backoff_delays() {
        let backoff = RetryBackoff::default();
        assert_eq!(backoff.backoff_delay(0), Duration::ZERO);
        assert_eq!(backoff.backoff_delay(1), Duration::from_millis(2));
        assert_eq!(backoff.backoff_delay(3), Duration::from_millis(8));
        assert_eq!(backoff.backoff_delay(10), Duration::from_secs(1));
        assert_eq!(backoff.backoff_delay(200), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let (ok, calls) = run(&RetryBackoff::default(), "set", vec![OperationStatus::success()]).await;
        assert!(ok);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_temporary_failure_then_success() {
        let (ok, calls) = run(
            &RetryBackoff::default(),
            "set",
            vec![
                OperationStatus::temporary_failure(),
                OperationStatus::temporary_failure(),
                OperationStatus::success(),
            ],
        )
        .await;
        assert!(ok);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_temporary_failure_exhausts() {
        let (ok, calls) = run(
            &RetryBackoff::default(),
            "set",
            vec![OperationStatus::temporary_failure()],
        )
        .await;
        assert!(!ok);
        // First attempt plus max_tries retries
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn test_other_failure_not_retried() {
        let (ok, calls) = run(
            &RetryBackoff::default(),
            "set",
            vec![OperationStatus::failure("Data exists")],
        )
        .await;
        assert!(!ok);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_remove_not_found_is_benign() {
        let backoff = RetryBackoff::default();
        let (ok, calls) = run(&backoff, "remove", vec![OperationStatus::not_found()]).await;
        assert!(ok);
        assert_eq!(calls, 1);

        let (ok, _) = run(&backoff, "remove", vec![OperationStatus::failure("Not found")]).await;
        assert!(ok);

        // Only removes get that treatment
        let (ok, _) = run(&backoff, "set", vec![OperationStatus::not_found()]).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_status_timeouts_are_retried() {
        let backoff = RetryBackoff::default();
        let calls = AtomicU32::new(0);
        let ok = backoff
            .execute("set", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::timeout("status", "", Duration::from_millis(1)))
                    } else {
                        Ok(OperationStatus::success())
                    }
                }
            })
            .await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_status_timeouts_give_up() {
        let backoff = RetryBackoff::default();
        let calls = AtomicU32::new(0);
        let ok = backoff
            .execute("set", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::timeout("status", "", Duration::from_millis(1))) }
            })
            .await;
        assert!(!ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_backoff() {
        let token = CancellationToken::new();
        let backoff = RetryBackoff::new(RetryConfig {
            max_tries: 20,
            max_delay: Duration::from_secs(30),
            ..RetryConfig::default()
        })
        .with_cancellation(token.clone());
        token.cancel();

        let start = Instant::now();
        let (ok, calls) = run(&backoff, "set", vec![OperationStatus::temporary_failure()]).await;
        assert!(!ok);
        // No sleep before the first retry, the second sleep is cut short
        assert_eq!(calls, 2);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_for_response() {
        let backoff = RetryBackoff::default();

        let (pending, completer) = PendingOperation::channel();
        completer.complete(OperationStatus::success());
        assert!(backoff.wait_for_response(&pending, "add").await);

        let pending = PendingOperation::ready(OperationStatus::failure("Data exists"));
        assert!(!backoff.wait_for_response(&pending, "add").await);
    }

    #[tokio::test]
    async fn test_unanswered_operation_is_cancelled() {
        let backoff = RetryBackoff::new(RetryConfig {
            status_timeout: Duration::from_millis(5),
            ..RetryConfig::default()
        });

        let (pending, _completer) = PendingOperation::channel();
        assert!(!backoff.wait_for_response(&pending, "set").await);
        assert!(pending.is_cancelled());
        let status = pending.wait(Duration::from_secs(5)).await.unwrap();
        assert!(!status.is_success());

        // A settled failure is left alone
        let pending = PendingOperation::ready(OperationStatus::failure("Data exists"));
        assert!(!backoff.wait_for_response(&pending, "add").await);
        assert!(!pending.is_cancelled());
    }
}
