//! Tiered Cache Orchestrator
//!
//! Composes an optional local tier, a primary remote tier and an optional
//! secondary remote tier into one [`CacheService`].
//!
//! # Read path
//!
//! 1. Local tier; a hit returns immediately
//! 2. Primary, if usable
//! 3. Secondary, if usable and the primary missed
//! 4. A remote hit is written back into the local tier
//!
//! # Write path
//!
//! Every write goes to the local tier, then to each usable remote tier. A
//! failing tier is logged and counted; the remaining tiers are still written.
//! Only caller errors (bad key, bad argument) abort the fan-out.
//!
//! A remote tier is usable when it is configured, its [`TierSwitch`] flag is
//! on and it reports itself connected.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::listener::{CacheListener, ListenerSlot};
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use super::service::{local_stats_address, AdminCacheService, CacheService, Stats};
use super::strategy::{IdentityTransform, ValueTransform};
use super::value::CacheValue;
use crate::error::{Error, Result};

/// Runtime on/off flags for the remote tiers
#[derive(Debug)]
pub struct TierSwitch {
    primary_on: AtomicBool,
    secondary_on: AtomicBool,
}

static GLOBAL_SWITCH: Lazy<Arc<TierSwitch>> = Lazy::new(|| Arc::new(TierSwitch::default()));

impl Default for TierSwitch {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl TierSwitch {
    pub fn new(primary_on: bool, secondary_on: bool) -> Self {
        Self {
            primary_on: AtomicBool::new(primary_on),
            secondary_on: AtomicBool::new(secondary_on),
        }
    }

    /// Process-wide switch, for deployments where every cache instance should
    /// fail over together
    pub fn global() -> Arc<TierSwitch> {
        Arc::clone(&GLOBAL_SWITCH)
    }

    #[inline]
    pub fn is_primary_on(&self) -> bool {
        self.primary_on.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_secondary_on(&self) -> bool {
        self.secondary_on.load(Ordering::Relaxed)
    }

    pub fn set_primary_on(&self, on: bool) {
        info!("Primary tier switched {}", if on { "on" } else { "off" });
        self.primary_on.store(on, Ordering::Relaxed);
    }

    pub fn set_secondary_on(&self, on: bool) {
        info!("Secondary tier switched {}", if on { "on" } else { "off" });
        self.secondary_on.store(on, Ordering::Relaxed);
    }
}

/// Tier identifier used in logs and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Local,
    Primary,
    Secondary,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Local => write!(f, "local"),
            Tier::Primary => write!(f, "primary"),
            Tier::Secondary => write!(f, "secondary"),
        }
    }
}

type TierRef = Arc<dyn AdminCacheService>;

/// Multi-tier cache facade
pub struct TieredCache {
    id: Uuid,
    local: Option<TierRef>,
    primary: TierRef,
    secondary: Option<TierRef>,
    switch: Arc<TierSwitch>,
    transform: Arc<dyn ValueTransform>,
    synchronous: AtomicBool,
    listener: ListenerSlot,
    metrics: CacheMetrics,
}

impl TieredCache {
    pub fn builder() -> TieredCacheBuilder {
        TieredCacheBuilder::default()
    }

    /// Instance identifier, shown in logs and `Display`
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn switch(&self) -> &Arc<TierSwitch> {
        &self.switch
    }

    pub fn has_local(&self) -> bool {
        self.local.is_some()
    }

    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }

    /// Snapshot of hit/miss/failover counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // =========================================================================
    // Tier selection
    // =========================================================================

    fn usable(&self, tier: Tier) -> Option<&TierRef> {
        let (candidate, on) = match tier {
            Tier::Local => return self.local.as_ref(),
            Tier::Primary => (Some(&self.primary), self.switch.is_primary_on()),
            Tier::Secondary => (self.secondary.as_ref(), self.switch.is_secondary_on()),
        };
        let candidate = candidate?;
        if !on {
            return None;
        }
        if !candidate.is_connected() {
            debug!(cache = %self.id, "{} tier is not connected", tier);
            return None;
        }
        Some(candidate)
    }

    fn remote_tiers(&self) -> impl Iterator<Item = (Tier, &TierRef)> {
        [Tier::Primary, Tier::Secondary]
            .into_iter()
            .filter_map(move |t| self.usable(t).map(|tier| (t, tier)))
    }

    /// Apply the fan-out error policy: caller errors abort, anything else is
    /// logged, counted and treated as "no result from this tier".
    fn absorb<T>(&self, tier: Tier, operation: &str, key: &str, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_caller_error() => Err(e),
            Err(e) => {
                warn!(
                    cache = %self.id,
                    "{} on {} tier failed for key '{}', continuing: {}",
                    operation, tier, key, e
                );
                match tier {
                    Tier::Primary => self.metrics.record_primary_error(),
                    Tier::Secondary => self.metrics.record_secondary_error(),
                    Tier::Local => {}
                }
                Ok(None)
            }
        }
    }

    fn reject_proxy(&self, operation: &str, key: &str, value: &CacheValue) -> bool {
        if value.is_proxy() {
            warn!(
                cache = %self.id,
                "Refusing to {} a proxied value under key '{}'",
                operation, key
            );
            self.metrics.record_rejected_proxy();
            return true;
        }
        false
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn read_remote(&self, tier: Tier, remote: &TierRef, key: &str) -> Result<Option<CacheValue>> {
        let tracker = LatencyTracker::start();
        let value = self
            .absorb(tier, "get", key, remote.get(key).await)?
            .flatten();
        self.metrics.record_remote_read_latency(tracker.elapsed());

        match (tier, value.is_some()) {
            (Tier::Primary, true) => self.metrics.record_primary_hit(),
            (Tier::Primary, false) => self.metrics.record_primary_miss(),
            (Tier::Secondary, true) => self.metrics.record_secondary_hit(),
            (Tier::Secondary, false) => self.metrics.record_secondary_miss(),
            (Tier::Local, _) => {}
        }
        debug!(cache = %self.id, "Get from {}: {} found={}", tier, key, value.is_some());
        Ok(value)
    }

    /// One batch read against the preferred usable remote tier
    async fn read_remote_batch(&self, keys: &[String]) -> Result<Option<Vec<Option<CacheValue>>>> {
        let (tier, remote) = match self.remote_tiers().next() {
            Some(found) => found,
            None => {
                info!(cache = %self.id, "Unable to access primary and secondary tiers");
                return Ok(None);
            }
        };
        let found = self.absorb(tier, "get_batch", &keys.join(","), remote.get_batch(keys).await)?;
        match found {
            Some(values) if values.len() == keys.len() => Ok(Some(values)),
            Some(values) => {
                warn!(
                    cache = %self.id,
                    "{} tier returned {} values for {} keys, ignoring",
                    tier,
                    values.len(),
                    keys.len()
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn store(&self, key: &str, expiration: i32, value: &CacheValue) -> Result<()> {
        if let Some(local) = &self.local {
            self.absorb(Tier::Local, "put", key, local.put_with_expiration(key, expiration, value.clone()).await)?;
        }
        for (tier, remote) in self.remote_tiers() {
            debug!(cache = %self.id, "Put to {}: {}", tier, key);
            self.absorb(tier, "put", key, remote.put_with_expiration(key, expiration, value.clone()).await)?;
        }
        Ok(())
    }

    async fn add_everywhere(&self, key: &str, value: &CacheValue) -> Result<bool> {
        if let Some(local) = &self.local {
            self.absorb(Tier::Local, "add", key, local.add(key, value.clone()).await)?;
        }
        let mut accepted = false;
        for (tier, remote) in self.remote_tiers() {
            debug!(cache = %self.id, "Add to {}: {}", tier, key);
            let added = self.absorb(tier, "add", key, remote.add(key, value.clone()).await)?;
            accepted |= added.unwrap_or(false);
        }
        Ok(accepted)
    }

    async fn append_everywhere(&self, key: &str, suffix: &str) -> Result<()> {
        if let Some(local) = &self.local {
            self.absorb(Tier::Local, "append", key, local.append(key, suffix).await)?;
        }
        for (tier, remote) in self.remote_tiers() {
            self.absorb(tier, "append", key, remote.append(key, suffix).await)?;
        }
        Ok(())
    }

    async fn remove_everywhere(&self, key: &str) -> Result<()> {
        if let Some(local) = &self.local {
            self.absorb(Tier::Local, "remove", key, local.remove(key).await)?;
        }
        for (tier, remote) in self.remote_tiers() {
            self.absorb(tier, "remove", key, remote.remove(key).await)?;
        }
        Ok(())
    }

    /// Run a counter operation on every tier. The local tier only drops the
    /// key; the last remote tier that ran decides the result, so with both
    /// remotes usable the secondary's value replaces the primary's.
    async fn counter<'a, F>(&'a self, operation: &'static str, key: &'a str, op: F) -> Result<i64>
    where
        F: Fn(&'a dyn AdminCacheService) -> BoxFuture<'a, Result<i64>> + Send + Sync,
    {
        if let Some(local) = &self.local {
            self.absorb(Tier::Local, operation, key, op(local.as_ref()).await)?;
        }
        let mut result = -1;
        for (tier, remote) in self.remote_tiers() {
            result = self
                .absorb(tier, operation, key, op(remote.as_ref()).await)?
                .unwrap_or(-1);
        }
        Ok(result)
    }

    fn all_tiers(&self) -> impl Iterator<Item = (Tier, &TierRef)> {
        self.local
            .iter()
            .map(|t| (Tier::Local, t))
            .chain(std::iter::once((Tier::Primary, &self.primary)))
            .chain(self.secondary.iter().map(|t| (Tier::Secondary, t)))
    }
}

#[async_trait]
impl CacheService for TieredCache {
    #[instrument(skip(self), fields(cache = %self.id))]
    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        let mut value = match &self.local {
            Some(local) => self.absorb(Tier::Local, "get", key, local.get(key).await)?.flatten(),
            None => None,
        };

        if value.is_some() {
            self.metrics.record_l1_hit();
        } else {
            self.metrics.record_l1_miss();

            if let Some(primary) = self.usable(Tier::Primary) {
                value = self.read_remote(Tier::Primary, primary, key).await?;
            }
            if value.is_none() {
                if let Some(secondary) = self.usable(Tier::Secondary) {
                    value = self.read_remote(Tier::Secondary, secondary, key).await?;
                    if value.is_some() {
                        self.metrics.record_failover();
                    }
                }
            }

            if let (Some(local), Some(found)) = (&self.local, &value) {
                self.absorb(Tier::Local, "repopulate", key, local.put(key, found.clone()).await)?;
                self.metrics.record_repopulation();
            }
        }

        self.listener.get_key(key);
        Ok(value.map(|v| self.transform.transform(v)))
    }

    async fn get_batch(&self, keys: &[String]) -> Result<Vec<Option<CacheValue>>> {
        let results = match &self.local {
            Some(local) => {
                let mut results = self
                    .absorb(Tier::Local, "get_batch", &keys.join(","), local.get_batch(keys).await)?
                    .filter(|r| r.len() == keys.len())
                    .unwrap_or_else(|| vec![None; keys.len()]);

                let misses: Vec<String> = keys
                    .iter()
                    .zip(&results)
                    .filter(|(_, r)| r.is_none())
                    .map(|(k, _)| k.clone())
                    .collect();
                for _ in 0..keys.len() - misses.len() {
                    self.metrics.record_l1_hit();
                }
                for _ in 0..misses.len() {
                    self.metrics.record_l1_miss();
                }

                if !misses.is_empty() {
                    if let Some(found) = self.read_remote_batch(&misses).await? {
                        let mut found = found.into_iter();
                        for slot in results.iter_mut().filter(|r| r.is_none()) {
                            *slot = found.next().flatten();
                        }
                    }
                }
                results
            }
            None => self
                .read_remote_batch(keys)
                .await?
                .unwrap_or_else(|| vec![None; keys.len()]),
        };

        for key in keys {
            self.listener.get_key(key);
        }
        Ok(results
            .into_iter()
            .map(|v| v.map(|v| self.transform.transform(v)))
            .collect())
    }

    async fn put_with_expiration(&self, key: &str, expiration: i32, value: CacheValue)
        -> Result<()> {
        if self.reject_proxy("put", key, &value) {
            return Ok(());
        }
        let result = self.store(key, expiration, &value).await;
        self.listener.put(key, &value);
        result
    }

    async fn add(&self, key: &str, value: CacheValue) -> Result<bool> {
        if self.reject_proxy("add", key, &value) {
            return Ok(true);
        }
        let result = self.add_everywhere(key, &value).await;
        self.listener.put(key, &value);
        result
    }

    async fn append(&self, key: &str, suffix: &str) -> Result<()> {
        let result = self.append_everywhere(key, suffix).await;
        self.listener.append(key, suffix);
        result
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.counter("incr", key, |tier| tier.incr(key)).await
    }

    async fn incr_by(&self, key: &str, by: u64, default_value: i64, expiration: i32)
        -> Result<i64> {
        self.counter("incr", key, |tier| tier.incr_by(key, by, default_value, expiration))
            .await
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.counter("decr", key, |tier| tier.decr(key)).await
    }

    async fn decr_by(&self, key: &str, by: u64, default_value: i64, expiration: i32)
        -> Result<i64> {
        self.counter("decr", key, |tier| tier.decr_by(key, by, default_value, expiration))
            .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _notice = self.listener.remove_on_drop(key);
        self.remove_everywhere(key).await
    }

    fn is_connected(&self) -> bool {
        self.usable(Tier::Primary).is_some() || self.usable(Tier::Secondary).is_some()
    }

    fn is_synchronous_put(&self) -> bool {
        self.synchronous.load(Ordering::Relaxed)
    }

    fn set_synchronous_put(&self, synchronous: bool) {
        self.synchronous.store(synchronous, Ordering::Relaxed);
        for (_, tier) in self.all_tiers() {
            tier.set_synchronous_put(synchronous);
        }
    }

    async fn flush(&self) -> Result<()> {
        for (tier, remote) in self.remote_tiers() {
            self.absorb(tier, "flush", "", remote.flush().await)?;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.local.as_ref().map_or(0, |local| local.size())
    }

    async fn stats(&self) -> Stats {
        let m = self.metrics.snapshot();
        let mut s = BTreeMap::new();
        s.insert("misses".to_string(), m.l1_misses.to_string());
        s.insert("hits".to_string(), m.l1_hits.to_string());
        s.insert("repopulations".to_string(), m.repopulations.to_string());
        s.insert("failovers".to_string(), m.failovers.to_string());
        s.insert("isSynchronousPut".to_string(), self.is_synchronous_put().to_string());
        s.insert("isPrimaryOn".to_string(), self.switch.is_primary_on().to_string());
        s.insert("isSecondaryOn".to_string(), self.switch.is_secondary_on().to_string());
        s.insert(
            "isPrimaryConnected".to_string(),
            self.primary.is_connected().to_string(),
        );
        s.insert(
            "isSecondaryConnected".to_string(),
            self.secondary
                .as_ref()
                .map(|t| t.is_connected().to_string())
                .unwrap_or_default(),
        );

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
        for (tier, t) in self.all_tiers() {
            debug!(cache = %self.id, "Shutting down {} tier", tier);
            t.shutdown().await;
        }
    }
}

#[async_trait]
impl AdminCacheService for TieredCache {
    async fn clear_all(&self) -> Result<()> {
        let mut first_error = None;
        let tiers = self
            .local
            .iter()
            .map(|t| (Tier::Local, t))
            .chain(self.remote_tiers());
        for (tier, t) in tiers {
            if let Err(e) = t.clear_all().await {
                warn!(cache = %self.id, "clear_all on {} tier failed: {}", tier, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Display for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TieredCache[id={}, local={}, primaryConnected={}, secondaryConnected={}, l1Hits={}, l1Misses={}, isPrimaryOn={}, isSecondaryOn={}]",
            self.id,
            self.local.is_some(),
            self.primary.is_connected(),
            self.secondary.as_ref().map_or(false, |t| t.is_connected()),
            self.metrics.l1_hits(),
            self.metrics.l1_misses(),
            self.switch.is_primary_on(),
            self.switch.is_secondary_on()
        )
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("id", &self.id)
            .field("local", &self.local.is_some())
            .field("secondary", &self.secondary.is_some())
            .field("switch", &self.switch)
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Composition root for [`TieredCache`]
#[derive(Default)]
pub struct TieredCacheBuilder {
    local: Option<TierRef>,
    primary: Option<TierRef>,
    secondary: Option<TierRef>,
    switch: Option<Arc<TierSwitch>>,
    listener: Option<Arc<dyn CacheListener>>,
    transform: Option<Arc<dyn ValueTransform>>,
    synchronous_put: Option<bool>,
}

impl TieredCacheBuilder {
    pub fn local<T: AdminCacheService + 'static>(mut self, tier: Arc<T>) -> Self {
        self.local = Some(tier);
        self
    }

    pub fn primary<T: AdminCacheService + 'static>(mut self, tier: Arc<T>) -> Self {
        self.primary = Some(tier);
        self
    }

    pub fn secondary<T: AdminCacheService + 'static>(mut self, tier: Arc<T>) -> Self {
        self.secondary = Some(tier);
        self
    }

    /// Share a switch between instances (defaults to a private one)
    pub fn switch(mut self, switch: Arc<TierSwitch>) -> Self {
        self.switch = Some(switch);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn CacheListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn transform(mut self, transform: Arc<dyn ValueTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Put mode pushed to every tier at build time
    pub fn synchronous_put(mut self, synchronous: bool) -> Self {
        self.synchronous_put = Some(synchronous);
        self
    }

    pub fn build(self) -> Result<TieredCache> {
        let primary = self
            .primary
            .ok_or_else(|| Error::Config("a primary tier is required".to_string()))?;

        let cache = TieredCache {
            id: Uuid::new_v4(),
            local: self.local,
            primary,
            secondary: self.secondary,
            switch: self.switch.unwrap_or_default(),
            transform: self.transform.unwrap_or_else(|| Arc::new(IdentityTransform)),
            synchronous: AtomicBool::new(false),
            listener: ListenerSlot::default(),
            metrics: CacheMetrics::new(),
        };
        cache.listener.set(self.listener);
        if let Some(synchronous) = self.synchronous_put {
            cache.set_synchronous_put(synchronous);
        }

        info!(
            cache = %cache.id,
            local = cache.local.is_some(),
            secondary = cache.secondary.is_some(),
            "Tiered cache assembled"
        );
        Ok(cache)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::listener::{ListenerEvent, RecordingListener};
    use crate::cache::strategy::ProxyTransform;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, AtomicUsize};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FailMode {
        Never,
        Transient,
        Caller,
    }

    /// Scriptable tier recording every call it receives
    struct StubTier {
        values: Mutex<HashMap<String, CacheValue>>,
        calls: Mutex<Vec<String>>,
        batches: Mutex<Vec<Vec<String>>>,
        connected: AtomicBool,
        accept_add: AtomicBool,
        counter: AtomicI64,
        synchronous: AtomicBool,
        fail: Mutex<FailMode>,
    }

    impl StubTier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                values: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                batches: Mutex::new(Vec::new()),
                connected: AtomicBool::new(true),
                accept_add: AtomicBool::new(true),
                counter: AtomicI64::new(-1),
                synchronous: AtomicBool::new(false),
                fail: Mutex::new(FailMode::Never),
            })
        }

        fn with(self: Arc<Self>, key: &str, value: &str) -> Arc<Self> {
            self.values
                .lock()
                .insert(key.to_string(), CacheValue::text(value));
            self
        }

        fn failing(self: Arc<Self>, mode: FailMode) -> Arc<Self> {
            *self.fail.lock() = mode;
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn holds(&self, key: &str) -> Option<CacheValue> {
            self.values.lock().get(key).cloned()
        }

        fn record(&self, op: &str, key: &str) -> Result<()> {
            self.calls.lock().push(format!("{}:{}", op, key));
            match *self.fail.lock() {
                FailMode::Never => Ok(()),
                FailMode::Transient => Err(Error::remote(op, "stub failure")),
                FailMode::Caller => Err(Error::InvalidArgument("stub rejects".to_string())),
            }
        }
    }

    #[async_trait]
    impl CacheService for StubTier {
        async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
            self.record("get", key)?;
            Ok(self.holds(key))
        }

        async fn get_batch(&self, keys: &[String]) -> Result<Vec<Option<CacheValue>>> {
            self.record("get_batch", &keys.join(","))?;
            self.batches.lock().push(keys.to_vec());
            Ok(keys.iter().map(|k| self.holds(k)).collect())
        }

        async fn put_with_expiration(&self, key: &str, _expiration: i32, value: CacheValue)
            -> Result<()> {
            self.record("put", key)?;
            self.values.lock().insert(key.to_string(), value);
            Ok(())
        }

        async fn add(&self, key: &str, value: CacheValue) -> Result<bool> {
            self.record("add", key)?;
            let accepted = self.accept_add.load(Ordering::Relaxed);
            if accepted {
                self.values.lock().insert(key.to_string(), value);
            }
            Ok(accepted)
        }

        async fn append(&self, key: &str, _suffix: &str) -> Result<()> {
            self.record("append", key)
        }

        async fn incr(&self, key: &str) -> Result<i64> {
            self.record("incr", key)?;
            Ok(self.counter.load(Ordering::Relaxed))
        }

        async fn incr_by(&self, key: &str, _by: u64, _default: i64, _exp: i32) -> Result<i64> {
            self.record("incr_by", key)?;
            Ok(self.counter.load(Ordering::Relaxed))
        }

        async fn decr(&self, key: &str) -> Result<i64> {
            self.record("decr", key)?;
            Ok(self.counter.load(Ordering::Relaxed))
        }

        async fn decr_by(&self, key: &str, _by: u64, _default: i64, _exp: i32) -> Result<i64> {
            self.record("decr_by", key)?;
            Ok(self.counter.load(Ordering::Relaxed))
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.record("remove", key)?;
            self.values.lock().remove(key);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }

        fn is_synchronous_put(&self) -> bool {
            self.synchronous.load(Ordering::Relaxed)
        }

        fn set_synchronous_put(&self, synchronous: bool) {
            self.synchronous.store(synchronous, Ordering::Relaxed);
        }

        async fn flush(&self) -> Result<()> {
            self.record("flush", "")
        }

        fn size(&self) -> u64 {
            self.values.lock().len() as u64
        }

        async fn stats(&self) -> Stats {
            Stats::new()
        }

        fn listener(&self) -> Option<Arc<dyn CacheListener>> {
            None
        }

        fn set_listener(&self, _listener: Option<Arc<dyn CacheListener>>) {}

        async fn shutdown(&self) {
            self.calls.lock().push("shutdown:".to_string());
        }
    }

    #[async_trait]
    impl AdminCacheService for StubTier {
        async fn clear_all(&self) -> Result<()> {
            self.record("clear_all", "")?;
            self.values.lock().clear();
            Ok(())
        }
    }

    struct Fixture {
        local: Arc<StubTier>,
        primary: Arc<StubTier>,
        secondary: Arc<StubTier>,
        listener: Arc<RecordingListener>,
        cache: TieredCache,
    }

    fn fixture() -> Fixture {
        fixture_with(StubTier::new(), StubTier::new(), StubTier::new())
    }

    fn fixture_with(local: Arc<StubTier>, primary: Arc<StubTier>, secondary: Arc<StubTier>) -> Fixture {
        let listener = Arc::new(RecordingListener::new());
        let cache = TieredCache::builder()
            .local(local.clone())
            .primary(primary.clone())
            .secondary(secondary.clone())
            .listener(listener.clone())
            .build()
            .unwrap();
        Fixture {
            local,
            primary,
            secondary,
            listener,
            cache,
        }
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    // ===== Tier switch =====

    #[test]
    fn test_switch_flags() {
        let switch = TierSwitch::default();
        assert!(switch.is_primary_on() && switch.is_secondary_on());
        switch.set_primary_on(false);
        assert!(!switch.is_primary_on());
        assert!(switch.is_secondary_on());
    }

    #[test]
    fn test_global_switch_is_shared() {
        assert!(Arc::ptr_eq(&TierSwitch::global(), &TierSwitch::global()));
    }

    #[test]
    fn test_builder_requires_primary() {
        assert_matches!(TieredCache::builder().build(), Err(Error::Config(_)));
    }

    // ===== Read path =====

    #[tokio::test]
    async fn test_local_hit_skips_remote() {
        let f = fixture_with(StubTier::new().with("k", "v"), StubTier::new(), StubTier::new());

        assert_eq!(f.cache.get("k").await.unwrap(), Some(CacheValue::text("v")));
        assert!(f.primary.calls().is_empty());
        assert!(f.secondary.calls().is_empty());
        assert_eq!(f.cache.metrics().l1_hits, 1);
        assert_eq!(f.listener.events(), vec![ListenerEvent::Get("k".into())]);
    }

    #[tokio::test]
    async fn test_primary_hit_repopulates_local() {
        let f = fixture_with(StubTier::new(), StubTier::new().with("k", "p"), StubTier::new());

        assert_eq!(f.cache.get("k").await.unwrap(), Some(CacheValue::text("p")));
        assert_eq!(f.local.holds("k"), Some(CacheValue::text("p")));
        assert!(f.secondary.calls().is_empty());

        let m = f.cache.metrics();
        assert_eq!((m.l1_misses, m.primary_hits, m.repopulations), (1, 1, 1));
        assert_eq!(m.failovers, 0);
    }

    #[tokio::test]
    async fn test_primary_miss_falls_through_to_secondary() {
        let f = fixture_with(StubTier::new(), StubTier::new(), StubTier::new().with("k", "s"));

        assert_eq!(f.cache.get("k").await.unwrap(), Some(CacheValue::text("s")));
        assert_eq!(f.primary.calls(), vec!["get:k"]);
        assert_eq!(f.local.holds("k"), Some(CacheValue::text("s")));

        let m = f.cache.metrics();
        assert_eq!((m.primary_misses, m.secondary_hits, m.failovers), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_disconnected_primary_is_skipped() {
        let f = fixture_with(StubTier::new(), StubTier::new().with("k", "p"), StubTier::new().with("k", "s"));
        f.primary.connected.store(false, Ordering::Relaxed);

        assert_eq!(f.cache.get("k").await.unwrap(), Some(CacheValue::text("s")));
        assert!(f.primary.calls().is_empty());
    }

    #[tokio::test]
    async fn test_switched_off_primary_is_skipped() {
        let f = fixture_with(StubTier::new(), StubTier::new().with("k", "p"), StubTier::new().with("k", "s"));
        f.cache.switch().set_primary_on(false);

        assert_eq!(f.cache.get("k").await.unwrap(), Some(CacheValue::text("s")));
        assert!(f.primary.calls().is_empty());
    }

    #[tokio::test]
    async fn test_primary_error_falls_through() {
        let f = fixture_with(
            StubTier::new(),
            StubTier::new().failing(FailMode::Transient),
            StubTier::new().with("k", "s"),
        );

        assert_eq!(f.cache.get("k").await.unwrap(), Some(CacheValue::text("s")));
        assert_eq!(f.cache.metrics().primary_errors, 1);
    }

    #[tokio::test]
    async fn test_total_miss() {
        let f = fixture();
        assert_eq!(f.cache.get("k").await.unwrap(), None);
        assert!(f.local.holds("k").is_none());
        assert_eq!(f.listener.count(|e| matches!(e, ListenerEvent::Get(_))), 1);
    }

    #[tokio::test]
    async fn test_get_applies_transform() {
        let f = fixture_with(StubTier::new().with("k", "v"), StubTier::new(), StubTier::new());
        let cache = TieredCache::builder()
            .local(f.local.clone())
            .primary(f.primary.clone())
            .transform(Arc::new(ProxyTransform))
            .build()
            .unwrap();

        assert!(cache.get("k").await.unwrap().unwrap().is_proxy());
        // The stored copy is untouched
        assert!(!f.local.holds("k").unwrap().is_proxy());
    }

    // ===== Batch reads =====

    #[tokio::test]
    async fn test_batch_splices_remote_results() {
        let local = StubTier::new().with("k0", "l0").with("k2", "l2");
        let primary = StubTier::new().with("k1", "p1").with("k3", "p3").with("k0", "stale");
        let f = fixture_with(local, primary, StubTier::new());

        let got = f.cache.get_batch(&keys(&["k0", "k1", "k2", "k3"])).await.unwrap();
        assert_eq!(
            got,
            vec![
                Some(CacheValue::text("l0")),
                Some(CacheValue::text("p1")),
                Some(CacheValue::text("l2")),
                Some(CacheValue::text("p3")),
            ]
        );
        assert_eq!(*f.primary.batches.lock(), vec![keys(&["k1", "k3"])]);
        assert!(f.secondary.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_batch_all_local_hits_skips_remote() {
        let f = fixture_with(StubTier::new().with("a", "1"), StubTier::new(), StubTier::new());
        let got = f.cache.get_batch(&keys(&["a"])).await.unwrap();
        assert_eq!(got, vec![Some(CacheValue::text("1"))]);
        assert!(f.primary.calls().is_empty());
    }

    #[tokio::test]
    async fn test_batch_uses_secondary_when_primary_unusable() {
        let f = fixture_with(StubTier::new(), StubTier::new(), StubTier::new().with("b", "s"));
        f.primary.connected.store(false, Ordering::Relaxed);

        let got = f.cache.get_batch(&keys(&["a", "b"])).await.unwrap();
        assert_eq!(got, vec![None, Some(CacheValue::text("s"))]);
        assert_eq!(*f.secondary.batches.lock(), vec![keys(&["a", "b"])]);
    }

    #[tokio::test]
    async fn test_batch_without_local_tier() {
        let primary = StubTier::new().with("a", "1");
        let cache = TieredCache::builder().primary(primary.clone()).build().unwrap();

        let got = cache.get_batch(&keys(&["a", "b"])).await.unwrap();
        assert_eq!(got, vec![Some(CacheValue::text("1")), None]);

        primary.connected.store(false, Ordering::Relaxed);
        assert_eq!(cache.get_batch(&keys(&["a", "b"])).await.unwrap(), vec![None, None]);
    }

    #[tokio::test]
    async fn test_batch_transforms_each_value_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let transform = move |v: CacheValue| {
            counted.fetch_add(1, Ordering::Relaxed);
            v.into_proxy()
        };

        let local = StubTier::new().with("a", "1");
        let primary = StubTier::new().with("c", "3");
        let cache = TieredCache::builder()
            .local(local)
            .primary(primary)
            .transform(Arc::new(transform))
            .build()
            .unwrap();

        let got = cache.get_batch(&keys(&["a", "b", "c"])).await.unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert!(got[0].as_ref().unwrap().is_proxy());
        assert!(got[1].is_none());
        assert!(got[2].as_ref().unwrap().is_proxy());
    }

    // ===== Write path =====

    #[tokio::test]
    async fn test_put_fans_out_in_order() {
        let f = fixture();
        f.cache.put("k", CacheValue::text("v")).await.unwrap();

        for tier in [&f.local, &f.primary, &f.secondary] {
            assert_eq!(tier.holds("k"), Some(CacheValue::text("v")));
        }
        assert_eq!(
            f.listener.events(),
            vec![ListenerEvent::Put("k".into(), CacheValue::text("v"))]
        );
    }

    #[tokio::test]
    async fn test_put_survives_failing_primary() {
        let f = fixture_with(StubTier::new(), StubTier::new().failing(FailMode::Transient), StubTier::new());

        f.cache.put("k", CacheValue::text("v")).await.unwrap();
        assert_eq!(f.secondary.holds("k"), Some(CacheValue::text("v")));
        assert_eq!(f.cache.metrics().primary_errors, 1);
    }

    #[tokio::test]
    async fn test_caller_error_aborts_fan_out() {
        let f = fixture_with(StubTier::new(), StubTier::new().failing(FailMode::Caller), StubTier::new());

        let result = f.cache.put("k", CacheValue::text("v")).await;
        assert_matches!(result, Err(Error::InvalidArgument(_)));
        assert!(f.secondary.calls().is_empty());
    }

    #[tokio::test]
    async fn test_proxied_values_are_rejected() {
        let f = fixture();
        let proxied = CacheValue::text("v").into_proxy();

        f.cache.put("k", proxied.clone()).await.unwrap();
        assert!(f.cache.add("k", proxied).await.unwrap());

        for tier in [&f.local, &f.primary, &f.secondary] {
            assert!(tier.calls().is_empty());
        }
        assert_eq!(f.cache.metrics().rejected_proxies, 2);
        assert!(f.listener.events().is_empty());
    }

    #[tokio::test]
    async fn test_add_is_or_across_remote_tiers() {
        let f = fixture();

        f.primary.accept_add.store(false, Ordering::Relaxed);
        assert!(f.cache.add("k", CacheValue::text("v")).await.unwrap());

        f.primary.accept_add.store(true, Ordering::Relaxed);
        f.secondary.accept_add.store(false, Ordering::Relaxed);
        assert!(f.cache.add("k", CacheValue::text("v")).await.unwrap());

        f.primary.accept_add.store(false, Ordering::Relaxed);
        assert!(!f.cache.add("k", CacheValue::text("v")).await.unwrap());

        assert_eq!(f.local.calls(), vec!["add:k", "add:k", "add:k"]);
        assert_eq!(f.listener.count(|e| matches!(e, ListenerEvent::Put(..))), 3);
    }

    #[tokio::test]
    async fn test_add_without_usable_remote_is_false() {
        let f = fixture();
        f.cache.switch().set_primary_on(false);
        f.cache.switch().set_secondary_on(false);
        assert!(!f.cache.add("k", CacheValue::text("v")).await.unwrap());
    }

    #[tokio::test]
    async fn test_append_fans_out() {
        let f = fixture();
        f.cache.append("k", "x").await.unwrap();
        for tier in [&f.local, &f.primary, &f.secondary] {
            assert_eq!(tier.calls(), vec!["append:k"]);
        }
        assert_eq!(
            f.listener.events(),
            vec![ListenerEvent::Append("k".into(), "x".into())]
        );
    }

    // ===== Remove =====

    #[tokio::test]
    async fn test_remove_notifies_once_when_every_tier_fails() {
        let f = fixture_with(
            StubTier::new().failing(FailMode::Transient),
            StubTier::new().failing(FailMode::Transient),
            StubTier::new().failing(FailMode::Transient),
        );

        f.cache.remove("k").await.unwrap();
        assert_eq!(f.listener.events(), vec![ListenerEvent::Remove("k".into())]);
        assert_eq!(f.secondary.calls(), vec!["remove:k"]);
    }

    #[tokio::test]
    async fn test_remove_notifies_on_abort() {
        let f = fixture_with(StubTier::new().failing(FailMode::Caller), StubTier::new(), StubTier::new());

        assert!(f.cache.remove("k").await.is_err());
        assert_eq!(f.listener.events(), vec![ListenerEvent::Remove("k".into())]);
        assert!(f.primary.calls().is_empty());
    }

    #[tokio::test]
    async fn test_remove_batch() {
        let f = fixture_with(StubTier::new().with("a", "1").with("b", "2"), StubTier::new(), StubTier::new());
        f.cache.remove_batch(&keys(&["a", "b"])).await.unwrap();
        assert_eq!(f.cache.size(), 0);
        assert_eq!(f.listener.count(|e| matches!(e, ListenerEvent::Remove(_))), 2);
    }

    // ===== Counters =====

    #[tokio::test]
    async fn test_counter_last_tier_wins() {
        let f = fixture();
        f.primary.counter.store(5, Ordering::Relaxed);
        f.secondary.counter.store(9, Ordering::Relaxed);

        assert_eq!(f.cache.incr("c").await.unwrap(), 9);
        assert_eq!(f.cache.decr_by("c", 2, 0, 0).await.unwrap(), 9);
        assert_eq!(f.local.calls(), vec!["incr:c", "decr_by:c"]);

        f.cache.switch().set_secondary_on(false);
        assert_eq!(f.cache.incr_by("c", 1, 0, 0).await.unwrap(), 5);

        f.cache.switch().set_primary_on(false);
        assert_eq!(f.cache.decr("c").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_failing_secondary_counter_reports_sentinel() {
        let f = fixture_with(StubTier::new(), StubTier::new(), StubTier::new().failing(FailMode::Transient));
        f.primary.counter.store(5, Ordering::Relaxed);
        assert_eq!(f.cache.incr("c").await.unwrap(), -1);
    }

    // ===== Administration =====

    #[tokio::test]
    async fn test_connectivity() {
        let f = fixture();
        assert!(f.cache.is_connected());

        f.primary.connected.store(false, Ordering::Relaxed);
        assert!(f.cache.is_connected());

        f.cache.switch().set_secondary_on(false);
        assert!(!f.cache.is_connected());
    }

    #[tokio::test]
    async fn test_shared_switch_between_instances() {
        let switch = Arc::new(TierSwitch::default());
        let a = TieredCache::builder()
            .primary(StubTier::new())
            .switch(switch.clone())
            .build()
            .unwrap();
        let b = TieredCache::builder()
            .primary(StubTier::new())
            .switch(switch.clone())
            .build()
            .unwrap();
        let c = TieredCache::builder().primary(StubTier::new()).build().unwrap();

        switch.set_primary_on(false);
        assert!(!a.is_connected());
        assert!(!b.is_connected());
        assert!(c.is_connected());
    }

    #[tokio::test]
    async fn test_synchronous_put_reaches_every_tier() {
        let f = fixture();
        f.primary.connected.store(false, Ordering::Relaxed);
        f.cache.set_synchronous_put(true);

        assert!(f.cache.is_synchronous_put());
        for tier in [&f.local, &f.primary, &f.secondary] {
            assert!(tier.is_synchronous_put());
        }
    }

    #[tokio::test]
    async fn test_builder_applies_synchronous_put() {
        let primary = StubTier::new();
        let cache = TieredCache::builder()
            .primary(primary.clone())
            .synchronous_put(true)
            .build()
            .unwrap();
        assert!(cache.is_synchronous_put());
        assert!(primary.is_synchronous_put());
    }

    #[tokio::test]
    async fn test_flush_and_shutdown() {
        let f = fixture();
        f.secondary.connected.store(false, Ordering::Relaxed);

        f.cache.flush().await.unwrap();
        assert_eq!(f.primary.calls(), vec!["flush:"]);
        assert!(f.secondary.calls().is_empty());
        assert!(f.local.calls().is_empty());

        f.cache.shutdown().await;
        assert!(f.secondary.calls().contains(&"shutdown:".to_string()));
        assert!(f.local.calls().contains(&"shutdown:".to_string()));
    }

    #[tokio::test]
    async fn test_clear_all_reports_first_error() {
        let f = fixture_with(StubTier::new().with("a", "1"), StubTier::new().failing(FailMode::Transient), StubTier::new().with("a", "1"));

        assert!(f.cache.clear_all().await.is_err());
        assert_eq!(f.local.size(), 0);
        assert_eq!(f.secondary.size(), 0);
    }

    #[tokio::test]
    async fn test_stats_and_display() {
        let f = fixture_with(StubTier::new().with("a", "1"), StubTier::new(), StubTier::new());
        f.cache.get("a").await.unwrap();
        f.cache.get("b").await.unwrap();
        f.secondary.connected.store(false, Ordering::Relaxed);

        let stats = f.cache.stats().await;
        let s = &stats[&local_stats_address()];
        assert_eq!(s["hits"], "1");
        assert_eq!(s["misses"], "1");
        assert_eq!(s["isSynchronousPut"], "false");
        assert_eq!(s["isPrimaryOn"], "true");
        assert_eq!(s["isPrimaryConnected"], "true");
        assert_eq!(s["isSecondaryConnected"], "false");

        let text = f.cache.to_string();
        assert!(text.starts_with("TieredCache["));
        assert!(text.contains("l1Hits=1"));
        assert_eq!(f.cache.size(), 1);
    }

    #[tokio::test]
    async fn test_stats_without_secondary() {
        let cache = TieredCache::builder().primary(StubTier::new()).build().unwrap();
        let stats = cache.stats().await;
        assert_eq!(stats[&local_stats_address()]["isSecondaryConnected"], "");
        assert_eq!(cache.size(), 0);
    }
}
