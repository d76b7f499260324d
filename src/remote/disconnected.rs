//! Null remote client for clusters without endpoints.
//!
//! Never reports a node locator, so tiers built on it are never used by the
//! orchestrator; direct calls fail with `NotConnected`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::client::{CasResponse, CasValue, PendingOperation, RemoteClient};
use crate::cache::{CacheValue, Stats};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct DisconnectedClient {
    reason: String,
}

impl DisconnectedClient {
    pub fn new() -> Self {
        Self::with_reason("no endpoints configured")
    }

    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn fail<T>(&self) -> Result<T> {
        Err(Error::NotConnected(self.reason.clone()))
    }
}

#[async_trait]
impl RemoteClient for DisconnectedClient {
    async fn get(&self, _key: &str) -> Result<Option<CacheValue>> {
        self.fail()
    }

    async fn get_bulk(&self, _keys: &[String]) -> Result<HashMap<String, CacheValue>> {
        self.fail()
    }

    async fn gets(&self, _key: &str) -> Result<Option<CasValue>> {
        self.fail()
    }

    async fn set(&self, _key: &str, _expiration: i32, _value: CacheValue)
        -> Result<PendingOperation> {
        self.fail()
    }

    async fn add(&self, _key: &str, _expiration: i32, _value: CacheValue)
        -> Result<PendingOperation> {
        self.fail()
    }

    async fn append(&self, _key: &str, _suffix: &str) -> Result<PendingOperation> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> Result<PendingOperation> {
        self.fail()
    }

    async fn cas(&self, _key: &str, _cas: u64, _expiration: i32, _value: CacheValue)
        -> Result<CasResponse> {
        self.fail()
    }

    async fn incr(&self, _key: &str, _by: u64) -> Result<i64> {
        self.fail()
    }

    async fn decr(&self, _key: &str, _by: u64) -> Result<i64> {
        self.fail()
    }

    async fn incr_or_create(&self, _key: &str, _by: u64, _default: i64, _expiration: i32)
        -> Result<i64> {
        self.fail()
    }

    async fn decr_or_create(&self, _key: &str, _by: u64, _default: i64, _expiration: i32)
        -> Result<i64> {
        self.fail()
    }

    async fn wait_for_queues(&self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    async fn flush(&self) -> Result<PendingOperation> {
        self.fail()
    }

    fn has_node_locator(&self) -> bool {
        false
    }

    async fn stats(&self) -> Result<Stats> {
        Ok(Stats::new())
    }

    async fn shutdown(&self, _timeout: Duration) -> bool {
        true
    }
}
