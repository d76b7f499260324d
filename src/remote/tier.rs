//! Remote Tier - Cluster-Backed Cache
//!
//! Adapts a [`RemoteClient`] to the [`CacheService`] surface: keys are hashed,
//! every wait is bounded, and in silent mode failures degrade to misses.
//!
//! # Write path
//!
//! - `put` throttles on a full client queue, then retries failed attempts
//! - in synchronous mode `put` waits for the server's acknowledgement
//! - `append` is add-then-append so a missing key is created without a comma

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use super::client::{CasResponse, CasValue, PendingOperation, RemoteClient};
use super::retry::{RetryBackoff, RetryConfig};
use crate::cache::listener::ListenerSlot;
use crate::cache::{
    local_stats_address, AdminCacheService, CacheListener, CacheService, CacheValue, KeyCodec,
    Stats,
};
use crate::error::{Error, Result};

/// Default single-operation timeout
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default bulk-operation timeout
pub const DEFAULT_BULK_TIMEOUT: Duration = Duration::from_millis(6000);

/// How long flush and clear_all wait for the cluster
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(180);

/// Remote tier configuration
#[derive(Debug, Clone)]
pub struct RemoteTierConfig {
    /// Name used in logs ("primary", "secondary")
    pub name: String,
    /// Bound for single-key operations
    pub operation_timeout: Duration,
    /// Bound for bulk reads
    pub bulk_timeout: Duration,
    /// Expiration used by `put`, `add` and `append` (seconds, 0 = never)
    pub default_expiration: i32,
    /// Degrade read failures to misses instead of returning errors
    pub silent: bool,
    /// Wait for the server to acknowledge each put
    pub synchronous_put: bool,
    /// Retries after a failed put attempt
    pub put_retries: u32,
    /// Pause between put attempts
    pub put_retry_pause: Duration,
    /// Poll interval while the client queue is full
    pub queue_full_poll: Duration,
    /// Give up throttling after this long
    pub queue_full_max_wait: Duration,
    /// Attempts for the add-then-append sequence
    pub append_tries: u32,
    /// Bound for flush and clear_all
    pub drain_timeout: Duration,
}

impl Default for RemoteTierConfig {
    fn default() -> Self {
        Self {
            name: "remote".to_string(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            bulk_timeout: DEFAULT_BULK_TIMEOUT,
            default_expiration: 0,
            silent: true,
            synchronous_put: false,
            put_retries: 3,
            put_retry_pause: Duration::from_millis(200),
            queue_full_poll: Duration::from_millis(250),
            queue_full_max_wait: Duration::from_secs(30),
            append_tries: 3,
            drain_timeout: DRAIN_TIMEOUT,
        }
    }
}

impl RemoteTierConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Cache tier backed by a remote cluster
pub struct RemoteTierCache {
    client: Arc<dyn RemoteClient>,
    config: RemoteTierConfig,
    codec: KeyCodec,
    synchronous: AtomicBool,
    retry: RetryBackoff,
    shutdown: CancellationToken,
    listener: ListenerSlot,
}

impl RemoteTierCache {
    /// Remote tier with default settings
    pub fn new(client: Arc<dyn RemoteClient>) -> Self {
        Self::with_config(client, RemoteTierConfig::default())
    }

    pub fn with_config(client: Arc<dyn RemoteClient>, config: RemoteTierConfig) -> Self {
        let shutdown = CancellationToken::new();
        let retry = RetryBackoff::new(RetryConfig {
            status_timeout: config.operation_timeout,
            ..RetryConfig::default()
        })
        .with_cancellation(shutdown.clone());

        Self {
            client,
            synchronous: AtomicBool::new(config.synchronous_put),
            config,
            codec: KeyCodec::sha1(),
            retry,
            shutdown,
            listener: ListenerSlot::default(),
        }
    }

    /// Replace the key codec
    pub fn with_codec(mut self, codec: KeyCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(&self) -> &RemoteTierConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn RemoteClient> {
        &self.client
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Versioned read; `None` on miss or failure
    pub async fn gets(&self, key: &str) -> Option<CasValue> {
        let normalized = self.codec.normalize(key).ok()?;
        match self.bounded("gets", key, self.client.gets(&normalized)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(tier = %self.config.name, "gets failed for key '{}', ignoring: {}", key, e);
                None
            }
        }
    }

    /// Conditional write against a version read with [`gets`](Self::gets)
    pub async fn cas(&self, key: &str, cas: u64, value: CacheValue) -> Option<CasResponse> {
        let normalized = self.codec.normalize(key).ok()?;
        let write = self
            .client
            .cas(&normalized, cas, self.config.default_expiration, value);
        match self.bounded("cas", key, write).await {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(tier = %self.config.name, "cas failed for key '{}', ignoring: {}", key, e);
                None
            }
        }
    }

    /// Run a client call under the single-operation timeout
    async fn bounded<T, F>(&self, operation: &str, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.config.operation_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(operation, key, timeout)),
        }
    }

    /// Apply the silent-mode policy to a failed read
    fn degrade<T: Default>(&self, err: Error) -> Result<T> {
        if self.config.silent {
            Ok(T::default())
        } else {
            Err(err)
        }
    }

    async fn fetch(&self, key: &str) -> Result<Option<CacheValue>> {
        let normalized = self.codec.normalize(key)?;
        match self.bounded("get", key, self.client.get(&normalized)).await {
            Ok(found) => Ok(found),
            Err(err @ Error::Timeout { .. }) => {
                warn!(
                    tier = %self.config.name,
                    "Timeout on get key='{}', timeout={}ms, returning none",
                    key,
                    self.config.operation_timeout.as_millis()
                );
                self.degrade(err)
            }
            Err(e) => {
                warn!(tier = %self.config.name, "Unable to retrieve key '{}': {}", key, e);
                self.degrade(Error::remote("get", e.to_string()))
            }
        }
    }

    async fn store(&self, key: &str, expiration: i32, value: &CacheValue) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("Key cannot be empty".to_string()));
        }
        if expiration < 0 {
            return Err(Error::InvalidArgument(format!(
                "Expiration time cannot be negative, exptime={}",
                expiration
            )));
        }

        let normalized = self.codec.normalize(key)?;
        self.put_with_retries(key, &normalized, expiration, value).await
    }

    #[instrument(skip(self, normalized, value), fields(tier = %self.config.name))]
    async fn put_with_retries(
        &self,
        key: &str,
        normalized: &str,
        expiration: i32,
        value: &CacheValue,
    ) -> Result<()> {
        let attempts = self.config.put_retries + 1;
        let mut attempt = 1;
        loop {
            let err = match self.try_put(normalized, expiration, value).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if attempt >= attempts || self.shutdown.is_cancelled() {
                error!("Error while putting key '{}' after {} attempts: {}", key, attempt, err);
                return Err(Error::OperationFailed {
                    operation: "put".to_string(),
                    key: key.to_string(),
                    attempts: attempt,
                });
            }
            warn!("Try[{}] put of key '{}' failed: {}", attempts - attempt, key, err);
            tokio::time::sleep(self.config.put_retry_pause).await;
            attempt += 1;
        }
    }

    async fn try_put(&self, normalized: &str, expiration: i32, value: &CacheValue) -> Result<()> {
        let pending = self.set_throttled(normalized, expiration, value).await?;
        if self.is_synchronous_put() && !self.retry.wait_for_response(&pending, "set").await {
            return Err(Error::remote("set", "set was not acknowledged"));
        }
        Ok(())
    }

    /// Enqueue a set, polling while the client queue is full
    async fn set_throttled(
        &self,
        normalized: &str,
        expiration: i32,
        value: &CacheValue,
    ) -> Result<PendingOperation> {
        let deadline = Instant::now() + self.config.queue_full_max_wait;
        loop {
            match self.client.set(normalized, expiration, value.clone()).await {
                Err(Error::QueueFull) if Instant::now() < deadline => {
                    debug!(tier = %self.config.name, "slow down");
                    tokio::time::sleep(self.config.queue_full_poll).await;
                }
                other => return other,
            }
        }
    }

    async fn try_add(&self, key: &str, value: &CacheValue) -> Result<bool> {
        let normalized = self.codec.normalize(key)?;
        let pending = self
            .client
            .add(&normalized, self.config.default_expiration, value.clone())
            .await?;
        Ok(self.retry.wait_for_response(&pending, "add").await)
    }

    /// Add-then-append. Returns true if the add created the key.
    #[instrument(skip(self, normalized, suffix), fields(tier = %self.config.name))]
    async fn full_append(&self, key: &str, normalized: &str, suffix: &str) -> bool {
        let mut tries = self.config.append_tries;
        while tries > 0 {
            match self.try_append(normalized, suffix).await {
                Ok(created) => return created,
                Err(e) => {
                    warn!("Try[{}] can't append to key '{}', trying again: {}", tries, key, e);
                    tries -= 1;
                }
            }
        }
        error!("Can't append to key '{}' after {} tries", key, self.config.append_tries);
        false
    }

    async fn try_append(&self, normalized: &str, suffix: &str) -> Result<bool> {
        let add = self
            .client
            .add(normalized, self.config.default_expiration, CacheValue::text(suffix))
            .await?;
        let add_status = add.wait(self.config.operation_timeout).await?;
        if add_status.is_success() {
            return Ok(true);
        }

        let append = self.client.append(normalized, &format!(",{}", suffix)).await?;
        if self.is_synchronous_put() && !self.retry.wait_for_response(&append, "append").await {
            warn!(
                tier = %self.config.name,
                "Both add and append failed for key '{}', add status={}, append status={:?}",
                normalized,
                add_status,
                append.status()
            );
        }
        Ok(false)
    }

    /// Counter call bounded by the operation timeout; -1 on any failure
    async fn counter<F>(&self, operation: &str, key: &str, fut: F) -> i64
    where
        F: Future<Output = Result<i64>>,
    {
        match self.bounded(operation, key, fut).await {
            Ok(value) => value,
            Err(e) => {
                error!(tier = %self.config.name, "{} failed for key '{}': {}", operation, key, e);
                -1
            }
        }
    }
}

#[async_trait]
impl CacheService for RemoteTierCache {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        if key.is_empty() {
            return Ok(None);
        }
        let result = self.fetch(key).await;
        self.listener.get_key(key);
        result
    }

    async fn get_batch(&self, keys: &[String]) -> Result<Vec<Option<CacheValue>>> {
        let mut normalized = Vec::with_capacity(keys.len());
        for key in keys {
            normalized.push(self.codec.normalize(key).ok());
            self.listener.get_key(key);
        }

        let wanted: Vec<String> = normalized.iter().flatten().cloned().collect();
        let found = if wanted.is_empty() {
            HashMap::new()
        } else {
            let timeout = self.config.bulk_timeout;
            match tokio::time::timeout(timeout, self.client.get_bulk(&wanted)).await {
                Ok(Ok(found)) => found,
                Ok(Err(e)) => {
                    error!(
                        tier = %self.config.name,
                        "Exception on get_batch keys='{}', returning none: {}",
                        keys.join(","),
                        e
                    );
                    HashMap::new()
                }
                Err(_) => {
                    warn!(
                        tier = %self.config.name,
                        "Timeout on get_batch keys='{}', returning none",
                        keys.join(",")
                    );
                    HashMap::new()
                }
            }
        };

        Ok(normalized
            .iter()
            .map(|n| n.as_ref().and_then(|k| found.get(k).cloned()))
            .collect())
    }

    async fn put(&self, key: &str, value: CacheValue) -> Result<()> {
        self.put_with_expiration(key, self.config.default_expiration, value)
            .await
    }

    async fn put_with_expiration(&self, key: &str, expiration: i32, value: CacheValue)
        -> Result<()> {
        let result = self.store(key, expiration, &value).await;
        self.listener.put(key, &value);
        result
    }

    async fn add(&self, key: &str, value: CacheValue) -> Result<bool> {
        if key.is_empty() {
            return Ok(true);
        }
        let accepted = match self.try_add(key, &value).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(tier = %self.config.name, "Unable to add key '{}': {}", key, e);
                false
            }
        };
        self.listener.put(key, &value);
        Ok(accepted)
    }

    async fn append(&self, key: &str, suffix: &str) -> Result<()> {
        let normalized = self.codec.normalize(key)?;
        if self.full_append(key, &normalized, suffix).await {
            self.listener.put(key, &CacheValue::text(suffix));
        } else {
            self.listener.append(key, suffix);
        }
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let normalized = self.codec.normalize(key)?;
        Ok(self.counter("incr", key, self.client.incr(&normalized, 1)).await)
    }

    async fn incr_by(&self, key: &str, by: u64, default_value: i64, expiration: i32)
        -> Result<i64> {
        let normalized = self.codec.normalize(key)?;
        let op = self
            .client
            .incr_or_create(&normalized, by, default_value, expiration);
        Ok(self.counter("incr", key, op).await)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let normalized = self.codec.normalize(key)?;
        Ok(self.counter("decr", key, self.client.decr(&normalized, 1)).await)
    }

    async fn decr_by(&self, key: &str, by: u64, default_value: i64, expiration: i32)
        -> Result<i64> {
        let normalized = self.codec.normalize(key)?;
        let op = self
            .client
            .decr_or_create(&normalized, by, default_value, expiration);
        Ok(self.counter("decr", key, op).await)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _notice = self.listener.remove_on_drop(key);
        let normalized = self.codec.normalize(key)?;

        match self.client.delete(&normalized).await {
            Ok(pending) => {
                if !self.retry.wait_for_response(&pending, "remove").await {
                    warn!(tier = %self.config.name, "Remove of key '{}' was not acknowledged", key);
                }
            }
            Err(e) => error!(tier = %self.config.name, "Error while removing key '{}': {}", key, e),
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.has_node_locator()
    }

    fn is_synchronous_put(&self) -> bool {
        self.synchronous.load(Ordering::Relaxed)
    }

    fn set_synchronous_put(&self, synchronous: bool) {
        self.synchronous.store(synchronous, Ordering::Relaxed);
    }

    /// Waits for the client queues to drain; never deletes data
    async fn flush(&self) -> Result<()> {
        match self.client.wait_for_queues(self.config.drain_timeout).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(tier = %self.config.name, "Client queues did not drain in time");
                Ok(())
            }
            Err(e) => {
                warn!(tier = %self.config.name, "Waiting for client queues failed: {}", e);
                self.degrade(e)
            }
        }
    }

    fn size(&self) -> u64 {
        0
    }

    async fn stats(&self) -> Stats {
        let mut stats = match self.client.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                debug!(tier = %self.config.name, "Client stats unavailable: {}", e);
                Stats::new()
            }
        };

        let mut s = BTreeMap::new();
        s.insert("isSynchronousPut".to_string(), self.is_synchronous_put().to_string());
        s.insert("isConnected".to_string(), self.is_connected().to_string());
        stats.insert(local_stats_address(), s);
        stats
    }

    fn listener(&self) -> Option<Arc<dyn CacheListener>> {
        self.listener.get()
    }

    fn set_listener(&self, listener: Option<Arc<dyn CacheListener>>) {
        self.listener.set(listener);
    }

    /// Aborts in-flight backoff waits. The client itself is shared and closed
    /// by its owner.
    async fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl AdminCacheService for RemoteTierCache {
    /// Destroys every item in the cluster
    async fn clear_all(&self) -> Result<()> {
        let pending = self.client.flush().await?;
        match pending.wait(self.config.drain_timeout).await {
            Ok(status) if status.is_success() => {}
            Ok(status) => warn!(tier = %self.config.name, "clear_all failed: {}", status),
            Err(e) => warn!(tier = %self.config.name, "clear_all failed: {}", e),
        }
        Ok(())
    }
}

impl std::fmt::Display for RemoteTierCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RemoteTierCache[{}, connected={}, synchronousPut={}]",
            self.config.name,
            self.is_connected(),
            self.is_synchronous_put()
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
