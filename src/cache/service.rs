//! Cache Service Interface
//!
//! The capability surface shared by the local tier, the remote tiers and the
//! orchestrator. Every tier can stand in for any other, which is what lets the
//! orchestrator compose them (and lets tests swap in fakes).

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;

use super::listener::CacheListener;
use super::value::CacheValue;
use crate::error::{Error, Result};

/// Per-server named metrics
pub type Stats = HashMap<SocketAddr, BTreeMap<String, String>>;

/// Address used for stats that describe the process rather than a server
pub fn local_stats_address() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

/// Uniform cache API
#[async_trait]
pub trait CacheService: Send + Sync {
    /// Look a key up. `None` on miss or (silent) failure.
    async fn get(&self, key: &str) -> Result<Option<CacheValue>>;

    /// Look several keys up; the result mirrors the input order.
    async fn get_batch(&self, keys: &[String]) -> Result<Vec<Option<CacheValue>>>;

    /// Store a value with the tier's default expiration
    async fn put(&self, key: &str, value: CacheValue) -> Result<()> {
        self.put_with_expiration(key, 0, value).await
    }

    /// Store a value with an expiration in seconds (0 = never)
    async fn put_with_expiration(&self, key: &str, expiration: i32, value: CacheValue)
        -> Result<()>;

    /// Store only if absent. `true` if the value was accepted.
    async fn add(&self, key: &str, value: CacheValue) -> Result<bool>;

    /// Append `","` + `suffix` to a text value
    async fn append(&self, key: &str, suffix: &str) -> Result<()>;

    /// Increment a counter by one; -1 if it could not be incremented
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Increment by `by`, creating the counter at `default_value` if absent
    async fn incr_by(&self, key: &str, by: u64, default_value: i64, expiration: i32)
        -> Result<i64>;

    /// Decrement a counter by one; -1 if it could not be decremented
    async fn decr(&self, key: &str) -> Result<i64>;

    /// Decrement by `by`, creating the counter at `default_value` if absent
    async fn decr_by(&self, key: &str, by: u64, default_value: i64, expiration: i32)
        -> Result<i64>;

    /// Remove a key
    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove several keys, one at a time
    async fn remove_batch(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }

    /// Store `values[i]` under `keys[i]`
    async fn put_batch(&self, keys: &[String], values: &[CacheValue]) -> Result<()> {
        if keys.len() != values.len() {
            return Err(Error::InvalidArgument(format!(
                "put_batch got {} keys and {} values",
                keys.len(),
                values.len()
            )));
        }
        for (key, value) in keys.iter().zip(values) {
            self.put(key, value.clone()).await?;
        }
        Ok(())
    }

    /// Store every pair of a map
    async fn put_map(&self, entries: &HashMap<String, CacheValue>) -> Result<()> {
        for (key, value) in entries {
            self.put(key, value.clone()).await?;
        }
        Ok(())
    }

    /// Whether the tier can currently serve requests
    fn is_connected(&self) -> bool;

    /// Whether puts wait for the remote acknowledgement
    fn is_synchronous_put(&self) -> bool;

    fn set_synchronous_put(&self, synchronous: bool);

    /// Wait for queued work to drain. Never deletes data.
    async fn flush(&self) -> Result<()>;

    /// Number of locally held entries (0 for remote tiers)
    fn size(&self) -> u64;

    /// Named metrics per server address
    async fn stats(&self) -> Stats;

    fn listener(&self) -> Option<Arc<dyn CacheListener>>;

    fn set_listener(&self, listener: Option<Arc<dyn CacheListener>>);

    /// Release resources. The tier should not be used afterwards.
    async fn shutdown(&self);
}

/// Administrative operations, never used on the request path
#[async_trait]
pub trait AdminCacheService: CacheService {
    /// Destroy every entry the tier holds
    async fn clear_all(&self) -> Result<()>;
}
