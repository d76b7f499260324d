//! In-Memory Remote Client
//!
//! A [`RemoteClient`] that keeps everything in process, with switches that
//! simulate the ways a real cluster misbehaves: lost topology, slow answers,
//! full queues, failing writes and temporary-failure statuses.
//! Uses DashMap so concurrent callers do not serialize on one lock.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::client::{CasResponse, CasValue, OperationStatus, PendingOperation, RemoteClient};
use crate::cache::{CacheValue, Payload, Stats};
use crate::error::{Error, Result};

/// Default address reported in stats
pub const MEMORY_CLIENT_ADDRESS: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 11211));

#[derive(Debug, Clone)]
struct StoredItem {
    value: CacheValue,
    cas: u64,
    expires_at: Option<Instant>,
}

impl StoredItem {
    fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |t| Instant::now() >= t)
    }
}

fn expiry(expiration: i32) -> Option<Instant> {
    if expiration > 0 {
        Some(Instant::now() + Duration::from_secs(expiration as u64))
    } else {
        None
    }
}

#[derive(Debug, Default)]
struct Counters {
    gets: AtomicU64,
    get_hits: AtomicU64,
    bulk_gets: AtomicU64,
    sets: AtomicU64,
    adds: AtomicU64,
    appends: AtomicU64,
    deletes: AtomicU64,
    stats: AtomicU64,
}

/// In-process stand-in for a cluster client
#[derive(Debug)]
pub struct MemoryClient {
    address: SocketAddr,
    items: DashMap<String, StoredItem>,
    next_cas: AtomicU64,
    counters: Counters,

    // Failure simulation
    connected: AtomicBool,
    latency_ms: AtomicU64,
    fail_writes: AtomicBool,
    queue_full_remaining: AtomicU32,
    temporary_failures_remaining: AtomicU32,
    set_rejection: Mutex<Option<String>>,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::with_address(MEMORY_CLIENT_ADDRESS)
    }

    /// Client reporting stats under `address`
    pub fn with_address(address: SocketAddr) -> Self {
        Self {
            address,
            items: DashMap::new(),
            next_cas: AtomicU64::new(1),
            counters: Counters::default(),
            connected: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
            queue_full_remaining: AtomicU32::new(0),
            temporary_failures_remaining: AtomicU32::new(0),
            set_rejection: Mutex::new(None),
        }
    }

    // =========================================================================
    // Simulation switches
    // =========================================================================

    /// Report (or stop reporting) a node locator
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Make every write call fail with a client error
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Reject the next `n` sets with `QueueFull`
    pub fn reject_queue_full(&self, n: u32) {
        self.queue_full_remaining.store(n, Ordering::Relaxed);
    }

    /// Settle the next `n` writes with a temporary-failure status
    pub fn temporary_failures(&self, n: u32) {
        self.temporary_failures_remaining.store(n, Ordering::Relaxed);
    }

    /// Settle every set with a failure status carrying `message`
    pub fn reject_sets_with(&self, message: impl Into<String>) {
        *self.set_rejection.lock() = Some(message.into());
    }

    /// Stop rejecting sets
    pub fn accept_sets(&self) {
        *self.set_rejection.lock() = None;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Whether a live item is stored under the exact (already hashed) key
    pub fn contains(&self, key: &str) -> bool {
        self.items.get(key).map_or(false, |item| !item.is_expired())
    }

    /// Live items
    pub fn len(&self) -> usize {
        self.items.iter().filter(|item| !item.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_calls(&self) -> u64 {
        self.counters.gets.load(Ordering::Relaxed)
    }

    pub fn bulk_calls(&self) -> u64 {
        self.counters.bulk_gets.load(Ordering::Relaxed)
    }

    pub fn set_calls(&self) -> u64 {
        self.counters.sets.load(Ordering::Relaxed)
    }

    pub fn add_calls(&self) -> u64 {
        self.counters.adds.load(Ordering::Relaxed)
    }

    pub fn append_calls(&self) -> u64 {
        self.counters.appends.load(Ordering::Relaxed)
    }

    pub fn delete_calls(&self) -> u64 {
        self.counters.deletes.load(Ordering::Relaxed)
    }

    pub fn stats_calls(&self) -> u64 {
        self.counters.stats.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn check_write(&self, operation: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::remote(operation, "simulated write failure"));
        }
        Ok(())
    }

    /// Consume one unit of a countdown switch
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    fn temporary_failure(&self) -> Option<PendingOperation> {
        Self::take(&self.temporary_failures_remaining)
            .then(|| PendingOperation::ready(OperationStatus::temporary_failure()))
    }

    fn cas_token(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::Relaxed)
    }

    fn live(&self, key: &str) -> Option<StoredItem> {
        let item = self.items.get(key)?.clone();
        if item.is_expired() {
            self.items.remove_if(key, |_, i| i.is_expired());
            return None;
        }
        Some(item)
    }

    fn store(&self, key: &str, expiration: i32, value: CacheValue) {
        self.items.insert(
            key.to_string(),
            StoredItem {
                value,
                cas: self.cas_token(),
                expires_at: expiry(expiration),
            },
        );
    }

    fn apply_counter(
        &self,
        key: &str,
        delta: i64,
        create: Option<(i64, i32)>,
    ) -> Result<i64> {
        if let Some(mut item) = self.items.get_mut(key).filter(|i| !i.is_expired()) {
            let current = item
                .value
                .as_integer()
                .ok_or_else(|| Error::remote("incr", "non-numeric value"))?;
            let next = current.saturating_add(delta).max(0);
            item.value = CacheValue::integer(next);
            item.cas = self.cas_token();
            return Ok(next);
        }

        match create {
            Some((default_value, expiration)) => {
                self.store(key, expiration, CacheValue::integer(default_value));
                Ok(default_value)
            }
            None => Ok(-1),
        }
    }
}

/// Counter step as a signed delta, saturating at `i64::MAX`
fn counter_delta(by: u64) -> i64 {
    i64::try_from(by).unwrap_or(i64::MAX)
}

#[async_trait]
impl RemoteClient for MemoryClient {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        self.delay().await;
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        let found = self.live(key).map(|item| item.value);
        if found.is_some() {
            self.counters.get_hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    async fn get_bulk(&self, keys: &[String]) -> Result<HashMap<String, CacheValue>> {
        self.delay().await;
        self.counters.bulk_gets.fetch_add(1, Ordering::Relaxed);
        Ok(keys
            .iter()
            .filter_map(|k| self.live(k).map(|item| (k.clone(), item.value)))
            .collect())
    }

    async fn gets(&self, key: &str) -> Result<Option<CasValue>> {
        self.delay().await;
        Ok(self.live(key).map(|item| CasValue {
            cas: item.cas,
            value: item.value,
        }))
    }

    async fn set(&self, key: &str, expiration: i32, value: CacheValue)
        -> Result<PendingOperation> {
        self.delay().await;
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        if Self::take(&self.queue_full_remaining) {
            return Err(Error::QueueFull);
        }
        self.check_write("set")?;
        if let Some(pending) = self.temporary_failure() {
            return Ok(pending);
        }
        if let Some(message) = self.set_rejection.lock().clone() {
            return Ok(PendingOperation::ready(OperationStatus::failure(message)));
        }

        self.store(key, expiration, value);
        Ok(PendingOperation::ready(OperationStatus::success()))
    }

    async fn add(&self, key: &str, expiration: i32, value: CacheValue)
        -> Result<PendingOperation> {
        self.delay().await;
        self.counters.adds.fetch_add(1, Ordering::Relaxed);
        self.check_write("add")?;
        if let Some(pending) = self.temporary_failure() {
            return Ok(pending);
        }

        let status = match self.items.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if slot.get().is_expired() {
                    slot.insert(StoredItem {
                        value,
                        cas: self.cas_token(),
                        expires_at: expiry(expiration),
                    });
                    OperationStatus::success()
                } else {
                    OperationStatus::failure("Data exists for key.")
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(StoredItem {
                    value,
                    cas: self.cas_token(),
                    expires_at: expiry(expiration),
                });
                OperationStatus::success()
            }
        };
        Ok(PendingOperation::ready(status))
    }

    async fn append(&self, key: &str, suffix: &str) -> Result<PendingOperation> {
        self.delay().await;
        self.counters.appends.fetch_add(1, Ordering::Relaxed);
        self.check_write("append")?;
        if let Some(pending) = self.temporary_failure() {
            return Ok(pending);
        }

        let status = match self.items.get_mut(key).filter(|i| !i.is_expired()) {
            Some(mut item) => {
                let appended = match item.value.payload() {
                    Payload::Text(text) => Some(format!("{}{}", text, suffix)),
                    _ => None,
                };
                match appended {
                    Some(text) => {
                        item.value = CacheValue::text(text);
                        item.cas = self.cas_token();
                        OperationStatus::success()
                    }
                    None => OperationStatus::failure("NOT_STORED"),
                }
            }
            None => OperationStatus::failure("NOT_STORED"),
        };
        Ok(PendingOperation::ready(status))
    }

    async fn delete(&self, key: &str) -> Result<PendingOperation> {
        self.delay().await;
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.check_write("delete")?;
        if let Some(pending) = self.temporary_failure() {
            return Ok(pending);
        }

        let status = match self.items.remove(key) {
            Some((_, item)) if !item.is_expired() => OperationStatus::success(),
            _ => OperationStatus::not_found(),
        };
        Ok(PendingOperation::ready(status))
    }

    async fn cas(&self, key: &str, cas: u64, expiration: i32, value: CacheValue)
        -> Result<CasResponse> {
        self.delay().await;
        self.check_write("cas")?;

        match self.items.get_mut(key).filter(|i| !i.is_expired()) {
            Some(mut item) if item.cas == cas => {
                item.value = value;
                item.cas = self.cas_token();
                item.expires_at = expiry(expiration);
                Ok(CasResponse::Ok)
            }
            Some(_) => Ok(CasResponse::Exists),
            None => Ok(CasResponse::NotFound),
        }
    }

    async fn incr(&self, key: &str, by: u64) -> Result<i64> {
        self.delay().await;
        self.apply_counter(key, counter_delta(by), None)
    }

    async fn decr(&self, key: &str, by: u64) -> Result<i64> {
        self.delay().await;
        self.apply_counter(key, counter_delta(by).saturating_neg(), None)
    }

    async fn incr_or_create(&self, key: &str, by: u64, default_value: i64, expiration: i32)
        -> Result<i64> {
        self.delay().await;
        self.apply_counter(key, counter_delta(by), Some((default_value, expiration)))
    }

    async fn decr_or_create(&self, key: &str, by: u64, default_value: i64, expiration: i32)
        -> Result<i64> {
        self.delay().await;
        let delta = counter_delta(by).saturating_neg();
        self.apply_counter(key, delta, Some((default_value, expiration)))
    }

    async fn wait_for_queues(&self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    async fn flush(&self) -> Result<PendingOperation> {
        self.delay().await;
        self.items.clear();
        Ok(PendingOperation::ready(OperationStatus::success()))
    }

    fn has_node_locator(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn stats(&self) -> Result<Stats> {
        self.counters.stats.fetch_add(1, Ordering::Relaxed);
        let gets = self.get_calls();
        let hits = self.counters.get_hits.load(Ordering::Relaxed);

        let mut s = BTreeMap::new();
        s.insert("curr_items".to_string(), self.len().to_string());
        s.insert("cmd_get".to_string(), gets.to_string());
        s.insert("get_hits".to_string(), hits.to_string());
        s.insert("get_misses".to_string(), (gets - hits).to_string());
        s.insert("cmd_set".to_string(), self.set_calls().to_string());

        let mut stats = Stats::new();
        stats.insert(self.address, s);
        Ok(stats)
    }

    async fn shutdown(&self, _timeout: Duration) -> bool {
        self.connected.store(false, Ordering::Relaxed);
        true
    }
}

// =============================================================================
// Tests
// =============================================================================
