//! tiercache - Three-Level Cache Facade
//!
//! One cache API over an in-process tier and two independent remote cache
//! clusters (primary and secondary), with automatic failover, round-robin
//! client pools, retry with backoff, and operation listeners.
//!
//! # Architecture
//!
//! ```text
//! caller ─▶ TieredCache ─▶ LocalTierCache ──(miss)──▶ RemoteTierCache (primary)
//!                │                                          │ (miss / down)
//!                │                                          ▼
//!                │                                  RemoteTierCache (secondary)
//!                └──── writes fan out to every usable tier ──┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Cache API, local tier, orchestrator, strategies, listeners
//! - [`remote`] - Remote client seam, retry/backoff, remote tier, client pool
//! - [`config`] - YAML settings, validation and composition root
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod error;
pub mod remote;

// Re-export commonly used types
pub use cache::{
    AdminCacheService, CacheListener, CacheService, CacheValue, KeyCodec, LocalTierCache,
    TierSwitch, TieredCache, TieredCacheBuilder,
};
pub use config::{CacheDeployment, CacheSettings, ClusterSettings};
pub use error::{Error, Result};
pub use remote::{MemoryClient, RemoteClient, RemoteTierCache, RoundRobinPool};
