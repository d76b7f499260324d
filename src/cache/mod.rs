//! Tiered Cache
//!
//! One logical cache over an in-process tier and up to two remote clusters.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            TieredCache                                   │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Local Tier           │ Primary Cluster     │ Secondary Cluster          │
//! │  ┌────────────────┐   │ ┌────────────────┐  │ ┌────────────────────┐     │
//! │  │ ShardedMap     │   │ │ RemoteTierCache│  │ │ RemoteTierCache    │     │
//! │  │ + FIFO queue   │   │ │ + client pool  │  │ │ + client pool      │     │
//! │  └────────────────┘   │ └────────────────┘  │ └────────────────────┘     │
//! │         │             │         │           │           │                │
//! │         └─────────────┴─────────┴───────────┴───────────┘                │
//! │                              │                                           │
//! │                 Read fall-through + write fan-out                        │
//! │                 (TierSwitch + connectivity gating)                       │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reads stop at the first tier that has the key and repopulate the local
//! tier on a remote hit. Writes go to every usable tier; one tier failing
//! never stops the others.

mod key;
pub(crate) mod listener;
mod local;
mod metrics;
mod service;
mod shard;
mod strategy;
mod tiered;
mod value;

pub use key::{KeyCodec, KeyDigest, Sha1Hex};
pub use listener::{CacheListener, ListenerEvent, RecordingListener};
pub use local::{LocalTierCache, LocalTierConfig, LocalTierMode};
pub use metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
pub use service::{local_stats_address, AdminCacheService, CacheService, Stats};
pub use shard::ShardedMap;
pub use strategy::{
    CachingStrategy, DefaultCachingStrategy, ExcludedTypes, IdentityTransform, ProxyTransform,
    ValueTransform,
};
pub use tiered::{TierSwitch, TieredCache, TieredCacheBuilder};
pub use value::{CacheValue, Payload};

/// Number of shards in the local tier
pub const SHARD_COUNT: usize = 64;

/// Cache line size for alignment (x86-64)
pub const CACHE_LINE_SIZE: usize = 64;

/// Default local tier capacity (entries)
pub const DEFAULT_LOCAL_CAPACITY: usize = 1000;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_count_is_power_of_two() {
        assert!(SHARD_COUNT.is_power_of_two());
    }

    #[test]
    fn test_cache_line_alignment() {
        assert_eq!(CACHE_LINE_SIZE, 64);
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(DEFAULT_LOCAL_CAPACITY, 1000);
        assert_eq!(LocalTierConfig::default().capacity, DEFAULT_LOCAL_CAPACITY);
    }
}
