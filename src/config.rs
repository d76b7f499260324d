//! Cache Settings
//!
//! YAML settings for the local tier and both remote clusters, the startup
//! validation rules, and the composition root that turns settings into a
//! running [`TieredCache`].
//!
//! ```yaml
//! local:
//!   capacity: 1000
//!   mode: first_level
//! primary:
//!   url: http://cache-a:8091/pools
//!   bucket: sessions
//!   pool_size: 10
//! secondary:
//!   nodes: [cache-b1:11211, cache-b2:11211]
//!   protocol: text
//! synchronous_put: false
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{
    CacheListener, CacheService, LocalTierCache, LocalTierConfig, TierSwitch, TieredCache,
    ValueTransform,
};
use crate::error::{Error, Result};
use crate::remote::pool::DEFAULT_POOL_SIZE;
use crate::remote::tier::{DEFAULT_BULK_TIMEOUT, DEFAULT_OPERATION_TIMEOUT};
use crate::remote::{DisconnectedClient, RemoteClient, RemoteTierCache, RemoteTierConfig, RoundRobinPool};

/// Wire protocol spoken to a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    #[default]
    Binary,
    Text,
}

/// Which remote cluster a setting block describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRole {
    Primary,
    Secondary,
}

impl ClusterRole {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterRole::Primary => "primary",
            ClusterRole::Secondary => "secondary",
        }
    }
}

impl std::fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One remote cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Comma-separated cluster URLs
    pub url: String,
    pub bucket: String,
    /// Plain `host:port` node addresses, used when no URL is set
    pub nodes: Vec<String>,
    pub protocol: WireProtocol,
    pub operation_timeout_ms: u64,
    pub bulk_timeout_ms: u64,
    /// Longest wait for room in a full client queue
    pub queue_block_ms: u64,
    /// Client operation queue length
    pub queue_size: usize,
    pub pool_size: usize,
    /// Keep-alive interval; 0 disables it
    pub keep_alive_secs: u64,
    pub default_expiration: i32,
    pub silent: bool,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            bucket: String::new(),
            nodes: Vec::new(),
            protocol: WireProtocol::Binary,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT.as_millis() as u64,
            bulk_timeout_ms: DEFAULT_BULK_TIMEOUT.as_millis() as u64,
            queue_block_ms: 30_000,
            queue_size: 16_384,
            pool_size: DEFAULT_POOL_SIZE,
            keep_alive_secs: 60,
            default_expiration: 0,
            silent: true,
        }
    }
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

impl ClusterSettings {
    /// Whether any endpoint is configured
    pub fn is_configured(&self) -> bool {
        !is_blank(&self.url) || self.nodes.iter().any(|n| !is_blank(n))
    }

    /// Individual URLs of the comma-separated `url` field
    pub fn urls(&self) -> Vec<String> {
        self.url
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn node_list(&self) -> String {
        self.nodes
            .iter()
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Settings for the remote tier adapter of this cluster
    pub fn tier_config(&self, role: ClusterRole, synchronous_put: bool) -> RemoteTierConfig {
        RemoteTierConfig {
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
            bulk_timeout: Duration::from_millis(self.bulk_timeout_ms),
            default_expiration: self.default_expiration,
            silent: self.silent,
            synchronous_put,
            queue_full_max_wait: Duration::from_millis(self.queue_block_ms),
            ..RemoteTierConfig::named(role.name())
        }
    }

    fn validate(&self, role: ClusterRole) -> Result<()> {
        if !self.is_configured() {
            return Ok(());
        }
        if self.pool_size == 0 {
            return Err(Error::Config(format!("{} pool_size must be at least 1", role)));
        }
        if self.operation_timeout_ms == 0 || self.bulk_timeout_ms == 0 {
            return Err(Error::Config(format!("{} timeouts must be positive", role)));
        }
        if self.default_expiration < 0 {
            return Err(Error::Config(format!(
                "{} default_expiration must not be negative",
                role
            )));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

/// Complete cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub local: LocalTierConfig,
    #[serde(default)]
    pub primary: ClusterSettings,
    #[serde(default)]
    pub secondary: ClusterSettings,
    #[serde(default)]
    pub synchronous_put: bool,
    #[serde(default = "default_true")]
    pub primary_on: bool,
    #[serde(default = "default_true")]
    pub secondary_on: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            local: LocalTierConfig::default(),
            primary: ClusterSettings::default(),
            secondary: ClusterSettings::default(),
            synchronous_put: false,
            primary_on: true,
            secondary_on: true,
        }
    }
}

impl CacheSettings {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a settings file (not validated)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let settings = Self::from_yaml(&text)?;
        info!("Loaded cache settings from {}", path.display());
        Ok(settings)
    }

    /// Startup checks on the cluster layout
    pub fn validate(&self) -> Result<()> {
        let (p, s) = (&self.primary, &self.secondary);

        if !is_blank(&p.url)
            && !is_blank(&s.url)
            && p.url.trim().eq_ignore_ascii_case(s.url.trim())
            && p.bucket.trim().eq_ignore_ascii_case(s.bucket.trim())
        {
            return Err(Error::Config(format!(
                "primary and secondary share URL '{}' and bucket '{}'; set the primary and leave the secondary blank",
                p.url, p.bucket
            )));
        }

        let (p_nodes, s_nodes) = (p.node_list(), s.node_list());
        if !p_nodes.is_empty() && p_nodes == s_nodes {
            return Err(Error::Config(
                "primary and secondary share the same node list; set the primary and leave the secondary blank"
                    .to_string(),
            ));
        }

        if !p.is_configured() && !s.is_configured() {
            return Err(Error::Config(
                "no primary cluster configured; the cache needs at least one URL or node list"
                    .to_string(),
            ));
        }

        if !is_blank(&p.url) && !is_blank(&s.url) && is_blank(&p.bucket) && is_blank(&s.bucket) {
            return Err(Error::Config(
                "primary and secondary URLs are set but neither has a bucket".to_string(),
            ));
        }

        if is_blank(&p.url) && !is_blank(&s.url) && is_blank(&p.bucket) && !is_blank(&s.bucket) {
            return Err(Error::Config(
                "secondary cluster configured without a primary".to_string(),
            ));
        }

        p.validate(ClusterRole::Primary)?;
        s.validate(ClusterRole::Secondary)?;
        Ok(())
    }

    /// Switch carrying the configured on/off flags
    pub fn tier_switch(&self) -> TierSwitch {
        TierSwitch::new(self.primary_on, self.secondary_on)
    }

    /// Validate, then build every tier and compose them.
    ///
    /// `connect` builds one client of a cluster's pool; it is called
    /// `pool_size` times per configured cluster. Must run inside a tokio
    /// runtime when keep-alive is enabled.
    pub fn build<F>(&self, connect: F) -> Result<CacheDeployment>
    where
        F: FnMut(ClusterRole, &ClusterSettings, usize) -> Result<Arc<dyn RemoteClient>>,
    {
        self.build_with_transform(None, connect)
    }

    /// [`build`](Self::build) with a post-get value transform
    pub fn build_with_transform<F>(
        &self,
        transform: Option<Arc<dyn ValueTransform>>,
        mut connect: F,
    ) -> Result<CacheDeployment>
    where
        F: FnMut(ClusterRole, &ClusterSettings, usize) -> Result<Arc<dyn RemoteClient>>,
    {
        self.validate()?;
        CacheDeploymentBuilder::new(self, transform).build(&mut connect)
    }
}

// =============================================================================
// Composition root
// =============================================================================

/// A composed cache together with the pools it owns
pub struct CacheDeployment {
    cache: Arc<TieredCache>,
    local: Arc<LocalTierCache>,
    pools: Vec<Arc<RoundRobinPool>>,
}

impl CacheDeployment {
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn local(&self) -> &Arc<LocalTierCache> {
        &self.local
    }

    pub fn pools(&self) -> &[Arc<RoundRobinPool>] {
        &self.pools
    }

    pub fn set_listener(&self, listener: Arc<dyn CacheListener>) {
        self.cache.set_listener(Some(listener));
    }

    /// Shut every tier down, then close the pools
    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
        for pool in &self.pools {
            pool.close().await;
        }
    }
}

impl std::fmt::Debug for CacheDeployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheDeployment")
            .field("cache", &self.cache)
            .field("pools", &self.pools)
            .finish()
    }
}

struct CacheDeploymentBuilder<'a> {
    settings: &'a CacheSettings,
    transform: Option<Arc<dyn ValueTransform>>,
    pools: Vec<Arc<RoundRobinPool>>,
}

impl<'a> CacheDeploymentBuilder<'a> {
    fn new(settings: &'a CacheSettings, transform: Option<Arc<dyn ValueTransform>>) -> Self {
        Self {
            settings,
            transform,
            pools: Vec::new(),
        }
    }

    fn cluster_client<F>(&mut self, role: ClusterRole, connect: &mut F) -> Result<Arc<dyn RemoteClient>>
    where
        F: FnMut(ClusterRole, &ClusterSettings, usize) -> Result<Arc<dyn RemoteClient>>,
    {
        let settings = self.settings;
        let cluster = match role {
            ClusterRole::Primary => &settings.primary,
            ClusterRole::Secondary => &settings.secondary,
        };
        if !cluster.is_configured() {
            warn!("{} cluster has no endpoints, using a disconnected client", role);
            return Ok(Arc::new(DisconnectedClient::with_reason(format!(
                "{} cluster has no endpoints configured",
                role
            ))));
        }

        let pool = Arc::new(RoundRobinPool::new(cluster.pool_size, |i| connect(role, cluster, i))?);
        pool.spawn_keep_alive(Duration::from_secs(cluster.keep_alive_secs));
        self.pools.push(Arc::clone(&pool));
        Ok(pool)
    }

    fn build<F>(mut self, connect: &mut F) -> Result<CacheDeployment>
    where
        F: FnMut(ClusterRole, &ClusterSettings, usize) -> Result<Arc<dyn RemoteClient>>,
    {
        let settings = self.settings;
        let local = Arc::new(LocalTierCache::with_config(settings.local.clone()));

        let primary_client = self.cluster_client(ClusterRole::Primary, connect)?;
        let primary = Arc::new(RemoteTierCache::with_config(
            primary_client,
            settings
                .primary
                .tier_config(ClusterRole::Primary, settings.synchronous_put),
        ));

        let mut builder = TieredCache::builder()
            .local(Arc::clone(&local))
            .primary(primary)
            .switch(Arc::new(settings.tier_switch()))
            .synchronous_put(settings.synchronous_put);

        if let Some(transform) = self.transform.take() {
            builder = builder.transform(transform);
        }
        if settings.secondary.is_configured() {
            let secondary_client = self.cluster_client(ClusterRole::Secondary, connect)?;
            builder = builder.secondary(Arc::new(RemoteTierCache::with_config(
                secondary_client,
                settings
                    .secondary
                    .tier_config(ClusterRole::Secondary, settings.synchronous_put),
            )));
        }

        Ok(CacheDeployment {
            cache: Arc::new(builder.build()?),
            local,
            pools: self.pools,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
