//! Remote Client Interface
//!
//! The contract a remote key/value cluster client must satisfy. Writes are
//! enqueued and hand back a [`PendingOperation`] whose status arrives later;
//! reads resolve directly.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheValue, Stats};
use crate::error::{Error, Result};

/// Message carried by a status the server wants retried
pub const TEMPORARY_FAILURE: &str = "Temporary failure";

/// Messages the server uses for a missing key
pub const NOT_FOUND_MESSAGES: [&str; 2] = ["NOT_FOUND", "Not found"];

/// Outcome of a remote operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationStatus {
    success: bool,
    message: String,
}

impl OperationStatus {
    pub fn success() -> Self {
        Self {
            success: true,
            message: "OK".to_string(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }

    pub fn temporary_failure() -> Self {
        Self::failure(TEMPORARY_FAILURE)
    }

    pub fn not_found() -> Self {
        Self::failure(NOT_FOUND_MESSAGES[0])
    }

    pub fn cancelled() -> Self {
        Self::failure("cancelled")
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.success
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_temporary_failure(&self) -> bool {
        !self.success && self.message == TEMPORARY_FAILURE
    }

    pub fn is_not_found(&self) -> bool {
        !self.success && NOT_FOUND_MESSAGES.contains(&self.message.as_str())
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{success={}, message={}}}",
            self.success, self.message
        )
    }
}

/// Handle for the status of an enqueued remote operation.
///
/// The status can be awaited any number of times; once received it is kept.
/// A wait that times out leaves the operation pending so it can be waited on
/// again, while [`cancel`](Self::cancel) settles it as failed for good.
#[derive(Debug)]
pub struct PendingOperation {
    receiver: Mutex<Option<oneshot::Receiver<OperationStatus>>>,
    outcome: OnceCell<OperationStatus>,
    cancel: CancellationToken,
}

/// Completing side of a [`PendingOperation`]
#[derive(Debug)]
pub struct OperationCompleter {
    sender: oneshot::Sender<OperationStatus>,
}

impl OperationCompleter {
    /// Deliver the status. Ignored if the handle is already gone.
    pub fn complete(self, status: OperationStatus) {
        let _ = self.sender.send(status);
    }
}

impl PendingOperation {
    /// Create a pending handle and its completer
    pub fn channel() -> (Self, OperationCompleter) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                receiver: Mutex::new(Some(receiver)),
                outcome: OnceCell::new(),
                cancel: CancellationToken::new(),
            },
            OperationCompleter { sender },
        )
    }

    /// Handle that is already settled
    pub fn ready(status: OperationStatus) -> Self {
        Self {
            receiver: Mutex::new(None),
            outcome: OnceCell::with_value(status),
            cancel: CancellationToken::new(),
        }
    }

    /// Wait up to `timeout` for the status.
    ///
    /// Returns `Err(Timeout)` if nothing arrived in time; the operation stays
    /// pending in that case.
    pub async fn wait(&self, timeout: Duration) -> Result<OperationStatus> {
        if let Some(status) = self.outcome.get() {
            return Ok(status.clone());
        }

        let mut receiver = self.receiver.lock().await;
        if let Some(status) = self.outcome.get() {
            return Ok(status.clone());
        }
        let Some(rx) = receiver.as_mut() else {
            return Ok(self.settle(OperationStatus::cancelled()));
        };

        let received = tokio::select! {
            _ = self.cancel.cancelled() => None,
            r = tokio::time::timeout(timeout, rx) => Some(r),
        };

        let status = match received {
            None => OperationStatus::cancelled(),
            Some(Err(_)) => return Err(Error::timeout("status", "", timeout)),
            Some(Ok(Ok(status))) => status,
            // Completer dropped without an answer
            Some(Ok(Err(_))) => OperationStatus::failure("operation abandoned"),
        };
        *receiver = None;
        Ok(self.settle(status))
    }

    /// Whether the operation succeeded within `timeout`
    pub async fn succeeded(&self, timeout: Duration) -> bool {
        matches!(self.wait(timeout).await, Ok(status) if status.is_success())
    }

    /// Give up on the operation. Pending and future waits report failure.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Status if it has already been received
    pub fn status(&self) -> Option<OperationStatus> {
        self.outcome.get().cloned()
    }

    fn settle(&self, status: OperationStatus) -> OperationStatus {
        let _ = self.outcome.set(status);
        // First settle wins
        self.outcome.get().cloned().unwrap_or_else(OperationStatus::cancelled)
    }
}

/// Value plus the version token needed for a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasValue {
    pub cas: u64,
    pub value: CacheValue,
}

/// Result of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResponse {
    /// Written
    Ok,
    /// Someone else wrote since the token was read
    Exists,
    /// Key is gone
    NotFound,
}

/// Client for one remote cache cluster
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>>;

    /// Fetch several keys in one round trip. Missing keys are absent from the map.
    async fn get_bulk(&self, keys: &[String]) -> Result<HashMap<String, CacheValue>>;

    async fn gets(&self, key: &str) -> Result<Option<CasValue>>;

    /// Enqueue a set. `Err(QueueFull)` when the client cannot take more work.
    async fn set(&self, key: &str, expiration: i32, value: CacheValue)
        -> Result<PendingOperation>;

    async fn add(&self, key: &str, expiration: i32, value: CacheValue)
        -> Result<PendingOperation>;

    /// Append raw text to an existing value
    async fn append(&self, key: &str, suffix: &str) -> Result<PendingOperation>;

    async fn delete(&self, key: &str) -> Result<PendingOperation>;

    async fn cas(&self, key: &str, cas: u64, expiration: i32, value: CacheValue)
        -> Result<CasResponse>;

    /// Increment in place; -1 if the key does not exist
    async fn incr(&self, key: &str, by: u64) -> Result<i64>;

    /// Decrement in place (floored at 0); -1 if the key does not exist
    async fn decr(&self, key: &str, by: u64) -> Result<i64>;

    /// Increment, creating the counter at `default_value` if absent
    async fn incr_or_create(&self, key: &str, by: u64, default_value: i64, expiration: i32)
        -> Result<i64>;

    /// Decrement, creating the counter at `default_value` if absent
    async fn decr_or_create(&self, key: &str, by: u64, default_value: i64, expiration: i32)
        -> Result<i64>;

    /// Wait until every queued operation has been written out
    async fn wait_for_queues(&self, timeout: Duration) -> Result<bool>;

    /// Destroy every item in the cluster
    async fn flush(&self) -> Result<PendingOperation>;

    /// Whether the client currently knows the cluster topology
    fn has_node_locator(&self) -> bool;

    async fn stats(&self) -> Result<Stats>;

    /// Close the client, waiting up to `timeout` for queued work
    async fn shutdown(&self, timeout: Duration) -> bool;
}

// =============================================================================
// Tests
// =============================================================================
