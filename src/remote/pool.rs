//! Round-Robin Client Pool
//!
//! Fixed set of pre-established clients to one cluster. Borrowing is a single
//! atomic increment; borrowed clients are shared, never validated and never
//! returned. An optional keep-alive loop polls every client's stats so idle
//! sockets are not reaped by firewalls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::client::{CasResponse, CasValue, PendingOperation, RemoteClient};
use crate::cache::{CacheValue, Stats};
use crate::error::{Error, Result};

/// Default number of clients
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Bound for shutting down a single client on close
pub const CLIENT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed-size round-robin pool of remote clients
pub struct RoundRobinPool {
    clients: Box<[Arc<dyn RemoteClient>]>,
    index: AtomicU64,
    closed: CancellationToken,
}

impl RoundRobinPool {
    /// Build `size` clients with `factory`. Any factory failure is fatal.
    pub fn new<F>(size: usize, mut factory: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<Arc<dyn RemoteClient>>,
    {
        info!("Initializing {} connections pool", size);
        let mut clients = Vec::with_capacity(size);
        for i in 0..size {
            match factory(i) {
                Ok(client) => clients.push(client),
                Err(e) => {
                    error!("Error creating connection {}: {}", i, e);
                    return Err(Error::Config(format!(
                        "unable to create remote connection {} of {}: {}",
                        i + 1,
                        size,
                        e
                    )));
                }
            }
        }
        Self::from_clients(clients)
    }

    /// Pool over already-built clients
    pub fn from_clients(clients: Vec<Arc<dyn RemoteClient>>) -> Result<Self> {
        if clients.is_empty() {
            return Err(Error::Config("pool size must be at least 1".to_string()));
        }
        Ok(Self {
            clients: clients.into_boxed_slice(),
            index: AtomicU64::new(0),
            closed: CancellationToken::new(),
        })
    }

    pub fn size(&self) -> usize {
        self.clients.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Next client in round-robin order
    #[inline]
    pub fn borrow(&self) -> &Arc<dyn RemoteClient> {
        let i = self.index.fetch_add(1, Ordering::Relaxed) % self.clients.len() as u64;
        &self.clients[i as usize]
    }

    /// Spawn the keep-alive loop on the current runtime
    pub fn spawn_keep_alive(self: &Arc<Self>, every: Duration) {
        if every.is_zero() {
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.run_keep_alive(every).await });
    }

    /// Poll every client's stats each `every` until the pool is closed
    #[instrument(skip(self))]
    pub async fn run_keep_alive(self: Arc<Self>, every: Duration) {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                _ = tick.tick() => {
                    for (i, client) in self.clients.iter().enumerate() {
                        if self.is_closed() {
                            break;
                        }
                        if let Err(e) = client.stats().await {
                            error!("Error checking connection {}: {}", i, e);
                        }
                    }
                    debug!("Keep-alive check executed");
                }
            }
        }
        debug!("Keep-alive loop stopped");
    }

    /// Stop the keep-alive loop and shut every client down in parallel
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        info!("Closing {} connections", self.clients.len());
        let closing = self.clients.iter().enumerate().map(|(i, client)| async move {
            match timeout(CLIENT_CLOSE_TIMEOUT, client.shutdown(CLIENT_CLOSE_TIMEOUT)).await {
                Ok(true) => {}
                Ok(false) => warn!("Connection {} did not drain before closing", i),
                Err(_) => warn!("Timed out closing connection {}, continuing", i),
            }
        });
        join_all(closing).await;
        info!("All connections are closed");
    }
}

impl std::fmt::Debug for RoundRobinPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundRobinPool")
            .field("size", &self.clients.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl RemoteClient for RoundRobinPool {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        self.borrow().get(key).await
    }

    async fn get_bulk(&self, keys: &[String]) -> Result<HashMap<String, CacheValue>> {
        self.borrow().get_bulk(keys).await
    }

    async fn gets(&self, key: &str) -> Result<Option<CasValue>> {
        self.borrow().gets(key).await
    }

    async fn set(&self, key: &str, expiration: i32, value: CacheValue)
        -> Result<PendingOperation> {
        self.borrow().set(key, expiration, value).await
    }

    async fn add(&self, key: &str, expiration: i32, value: CacheValue)
        -> Result<PendingOperation> {
        self.borrow().add(key, expiration, value).await
    }

    async fn append(&self, key: &str, suffix: &str) -> Result<PendingOperation> {
        self.borrow().append(key, suffix).await
    }

    async fn delete(&self, key: &str) -> Result<PendingOperation> {
        self.borrow().delete(key).await
    }

    async fn cas(&self, key: &str, cas: u64, expiration: i32, value: CacheValue)
        -> Result<CasResponse> {
        self.borrow().cas(key, cas, expiration, value).await
    }

    async fn incr(&self, key: &str, by: u64) -> Result<i64> {
        self.borrow().incr(key, by).await
    }

    async fn decr(&self, key: &str, by: u64) -> Result<i64> {
        self.borrow().decr(key, by).await
    }

    async fn incr_or_create(&self, key: &str, by: u64, default_value: i64, expiration: i32)
        -> Result<i64> {
        self.borrow()
            .incr_or_create(key, by, default_value, expiration)
            .await
    }

    async fn decr_or_create(&self, key: &str, by: u64, default_value: i64, expiration: i32)
        -> Result<i64> {
        self.borrow()
            .decr_or_create(key, by, default_value, expiration)
            .await
    }

    /// Waits on every client, since each has its own queue
    async fn wait_for_queues(&self, timeout: Duration) -> Result<bool> {
        let results = join_all(self.clients.iter().map(|c| c.wait_for_queues(timeout))).await;
        let mut drained = true;
        for result in results {
            drained &= result?;
        }
        Ok(drained)
    }

    async fn flush(&self) -> Result<PendingOperation> {
        self.borrow().flush().await
    }

    fn has_node_locator(&self) -> bool {
        !self.is_closed() && self.borrow().has_node_locator()
    }

    async fn stats(&self) -> Result<Stats> {
        self.borrow().stats().await
    }

    async fn shutdown(&self, _timeout: Duration) -> bool {
        self.close().await;
        true
    }
}

// =============================================================================
// Tests
// =============================================================================
