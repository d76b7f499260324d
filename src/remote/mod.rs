//! Remote Cache Clusters
//!
//! Everything between the cache API and a remote cluster:
//!
//! - [`client`]: the wire-client seam ([`RemoteClient`]) and pending write handles
//! - [`retry`]: bounded retry with exponential backoff on operation statuses
//! - [`tier`]: the [`RemoteTierCache`] adapter (hashing, timeouts, silent mode)
//! - [`pool`]: fixed-size round-robin pool of clients with keep-alive
//! - [`memory`]: in-process client with failure simulation
//! - [`disconnected`]: null client for clusters without endpoints

pub mod client;
pub mod disconnected;
pub mod memory;
pub mod pool;
pub mod retry;
pub mod tier;

pub use client::{
    CasResponse, CasValue, OperationCompleter, OperationStatus, PendingOperation, RemoteClient,
};
pub use disconnected::DisconnectedClient;
pub use memory::MemoryClient;
pub use pool::RoundRobinPool;
pub use retry::{RetryBackoff, RetryConfig};
pub use tier::{RemoteTierCache, RemoteTierConfig};
