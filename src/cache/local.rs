//! Local Tier - In-Process Cache
//!
//! Bounded key/value store held in process memory.
//!
//! # Design
//!
//! - ShardedMap keyed by the caller's key string
//! - Lock-free FIFO queue of (key, insertion sequence) drives eviction
//! - Atomic live counter; it may briefly overshoot capacity under contention
//!
//! Removed or re-inserted keys leave stale queue entries behind. Eviction
//! skips them by comparing sequences, and the queue is compacted once stale
//! entries outnumber the capacity. Pushes and pops share the queue gate;
//! compaction holds it exclusively so survivors keep their relative order
//! ahead of anything inserted afterwards.
//!
//! Counters and adds are never served locally: the key is dropped instead so
//! the next read falls through to the remote authority.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crossbeam::queue::SegQueue;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::key::KeyCodec;
use super::listener::{CacheListener, ListenerSlot};
use super::service::{local_stats_address, AdminCacheService, CacheService, Stats};
use super::shard::ShardedMap;
use super::strategy::{CachingStrategy, DefaultCachingStrategy};
use super::value::CacheValue;
use super::{DEFAULT_LOCAL_CAPACITY, SHARD_COUNT};
use crate::error::Result;

/// How the local tier behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalTierMode {
    /// Bounded first-level cache in front of remote tiers
    #[default]
    FirstLevel,
    /// Full in-process cache: never evicts, appends to absent keys create
    /// them, and puts bypass the caching strategy
    Authoritative,
}

/// Local tier configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTierConfig {
    /// Maximum number of entries; 0 disables the tier
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub mode: LocalTierMode,
}

fn default_capacity() -> usize {
    DEFAULT_LOCAL_CAPACITY
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LOCAL_CAPACITY,
            mode: LocalTierMode::FirstLevel,
        }
    }
}

#[derive(Debug, Clone)]
struct LocalEntry {
    value: CacheValue,
    /// Insertion sequence; kept when the value is replaced
    seq: u64,
}

/// In-process cache tier
pub struct LocalTierCache {
    config: LocalTierConfig,
    entries: ShardedMap<String, LocalEntry, SHARD_COUNT>,
    /// Insertion order, possibly holding stale entries
    fifo: SegQueue<(String, u64)>,
    /// Shared for push/pop, exclusive for compaction and clear
    fifo_gate: RwLock<()>,
    queued: AtomicUsize,
    live: AtomicU64,
    next_seq: AtomicU64,
    evictions: AtomicU64,
    codec: KeyCodec,
    strategy: Arc<dyn CachingStrategy>,
    listener: ListenerSlot,
}

impl Default for LocalTierCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTierCache {
    /// First-level cache with the default capacity
    pub fn new() -> Self {
        Self::with_config(LocalTierConfig::default())
    }

    /// First-level cache holding at most `capacity` entries
    pub fn first_level(capacity: usize) -> Self {
        Self::with_config(LocalTierConfig {
            capacity,
            mode: LocalTierMode::FirstLevel,
        })
    }

    /// Unbounded authoritative cache
    pub fn authoritative() -> Self {
        Self::with_config(LocalTierConfig {
            capacity: usize::MAX,
            mode: LocalTierMode::Authoritative,
        })
    }

    pub fn with_config(config: LocalTierConfig) -> Self {
        Self {
            config,
            entries: ShardedMap::new(),
            fifo: SegQueue::new(),
            fifo_gate: RwLock::new(()),
            queued: AtomicUsize::new(0),
            live: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            codec: KeyCodec::Local,
            strategy: Arc::new(DefaultCachingStrategy),
            listener: ListenerSlot::default(),
        }
    }

    /// Replace the caching strategy
    pub fn with_strategy(mut self, strategy: Arc<dyn CachingStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn config(&self) -> &LocalTierConfig {
        &self.config
    }

    pub fn mode(&self) -> LocalTierMode {
        self.config.mode
    }

    /// Whether the tier was configured with capacity 0
    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.config.capacity == 0
    }

    /// Entries evicted so far
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Queue entries currently held, live and stale
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    fn bounded(&self) -> bool {
        self.config.mode == LocalTierMode::FirstLevel
    }

    fn insert(&self, key: String, value: CacheValue) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let vacant = self.entries.upsert(
            key.clone(),
            LocalEntry { value, seq },
            |existing, new| existing.value = new.value,
        );
        if !vacant {
            return;
        }

        let live = self.live.fetch_add(1, Ordering::AcqRel) + 1;
        if self.bounded() {
            {
                let _gate = self.fifo_gate.read();
                self.fifo.push((key, seq));
                self.queued.fetch_add(1, Ordering::Relaxed);
            }
            if live > self.config.capacity as u64 {
                self.evict_oldest();
            }
        }
    }

    /// Evict the oldest live entry, skipping stale queue entries
    fn evict_oldest(&self) {
        let _gate = self.fifo_gate.read();
        while let Some((key, seq)) = self.fifo.pop() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            if self.entries.remove_if(key.as_str(), |e| e.seq == seq).is_some() {
                self.release_live();
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, "Evicted oldest local entry");
                return;
            }
        }
    }

    fn drop_key(&self, key: &str) -> bool {
        if self.entries.remove(key).is_some() {
            self.release_live();
            self.maybe_compact();
            true
        } else {
            false
        }
    }

    /// Decrement the live counter without wrapping below zero. A removal
    /// racing the insert of the same key can get here first.
    fn release_live(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    /// Drop stale queue entries once they outnumber the capacity
    fn maybe_compact(&self) {
        if !self.bounded() {
            return;
        }
        let queued = self.queued.load(Ordering::Relaxed) as u64;
        let stale = queued.saturating_sub(self.live.load(Ordering::Relaxed));
        if stale <= self.config.capacity as u64 {
            return;
        }
        // Queue busy; a later removal retries
        let Some(_gate) = self.fifo_gate.try_write() else {
            return;
        };

        let queued = self.queued.load(Ordering::Relaxed);
        let mut kept = Vec::new();
        let mut dropped = 0usize;
        for _ in 0..queued {
            let Some((key, seq)) = self.fifo.pop() else {
                break;
            };
            if self.entries.matches(key.as_str(), |e| e.seq == seq) {
                kept.push((key, seq));
            } else {
                dropped += 1;
            }
        }
        for item in kept {
            self.fifo.push(item);
        }
        self.queued.fetch_sub(dropped, Ordering::Relaxed);
        debug!(dropped, "Compacted local eviction queue");
    }

    fn clear(&self) {
        let _gate = self.fifo_gate.write();
        self.entries.clear();
        while self.fifo.pop().is_some() {}
        self.queued.store(0, Ordering::Relaxed);
        self.live.store(0, Ordering::Relaxed);
    }

    /// Local tier never keeps counters or add results; drop the key instead
    fn force_remote(&self, key: &str) {
        if key.is_empty() {
            return;
        }
        if self.drop_key(key) {
            trace!(key = %key, "Dropped local entry to defer to remote tier");
        }
    }
}

#[async_trait]
impl CacheService for LocalTierCache {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        if key.is_empty() {
            return Ok(None);
        }
        let value = self.entries.get(key).map(|e| e.value);
        self.listener.get_key(key);
        Ok(value)
    }

    async fn get_batch(&self, keys: &[String]) -> Result<Vec<Option<CacheValue>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    async fn put_with_expiration(&self, key: &str, _expiration: i32, value: CacheValue)
        -> Result<()> {
        if key.is_empty() || self.is_disabled() {
            return Ok(());
        }
        if self.bounded() && !self.strategy.is_cacheable(key, &value) {
            trace!(key = %key, "Value not cacheable locally");
            return Ok(());
        }

        let normalized = self.codec.normalize(key)?;
        self.insert(normalized, value.clone());
        self.listener.put(key, &value);
        Ok(())
    }

    async fn add(&self, key: &str, _value: CacheValue) -> Result<bool> {
        self.force_remote(key);
        Ok(true)
    }

    async fn append(&self, key: &str, suffix: &str) -> Result<()> {
        if key.is_empty() || self.is_disabled() {
            return Ok(());
        }

        match self.config.mode {
            LocalTierMode::FirstLevel => {
                if !self.strategy.is_cacheable(key, &CacheValue::text(suffix)) {
                    return Ok(());
                }
                self.entries.update(key, |e| match e.value.appended(suffix) {
                    Some(v) => {
                        e.value = v;
                        true
                    }
                    None => false,
                });
                self.listener.append(key, suffix);
            }
            LocalTierMode::Authoritative => {
                let present = self.entries.update(key, |e| {
                    if let Some(v) = e.value.appended(suffix) {
                        e.value = v;
                    }
                    true
                });
                if present {
                    self.listener.append(key, suffix);
                } else {
                    self.put(key, CacheValue::text(suffix)).await?;
                }
            }
        }
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.force_remote(key);
        Ok(-1)
    }

    async fn incr_by(&self, key: &str, _by: u64, _default_value: i64, _expiration: i32)
        -> Result<i64> {
        self.incr(key).await
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.force_remote(key);
        Ok(-1)
    }

    async fn decr_by(&self, key: &str, _by: u64, _default_value: i64, _expiration: i32)
        -> Result<i64> {
        self.decr(key).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Ok(());
        }
        if !self.is_disabled() {
            self.drop_key(key);
        }
        self.listener.remove(key);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn is_synchronous_put(&self) -> bool {
        true
    }

    fn set_synchronous_put(&self, _synchronous: bool) {}

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.entries.len() as u64
    }

    async fn stats(&self) -> Stats {
        let map = self.entries.stats();
        let mut s = std::collections::BTreeMap::new();
        s.insert("maxSize".to_string(), self.config.capacity.to_string());
        s.insert("items".to_string(), self.live.load(Ordering::Relaxed).to_string());
        s.insert("evictions".to_string(), self.evictions().to_string());
        s.insert("reads".to_string(), map.total_reads.to_string());
        s.insert("writes".to_string(), map.total_writes.to_string());
        s.insert("isSynchronousPut".to_string(), self.is_synchronous_put().to_string());

        let mut stats = Stats::new();
        stats.insert(local_stats_address(), s);
        stats
    }

    fn listener(&self) -> Option<Arc<dyn CacheListener>> {
        self.listener.get()
    }

    fn set_listener(&self, listener: Option<Arc<dyn CacheListener>>) {
        self.listener.set(listener);
    }

    async fn shutdown(&self) {
        self.clear();
    }
}

#[async_trait]
impl AdminCacheService for LocalTierCache {
    async fn clear_all(&self) -> Result<()> {
        self.clear();
        Ok(())
    }
}

impl std::fmt::Debug for LocalTierCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTierCache")
            .field("config", &self.config)
            .field("size", &self.size())
            .field("queued", &self.queued())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
