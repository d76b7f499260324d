//! tiercache - operator CLI
//!
//! Validates settings files, shows how keys are normalized per tier, and runs
//! a scripted session against in-memory clusters.
//!
//! ```text
//! tiercache check cache.yaml
//! tiercache key "user:42"
//! tiercache demo --fail-primary
//! ```

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::{CacheService, CacheValue, KeyCodec, RecordingListener};
use tiercache::config::{CacheSettings, ClusterRole, ClusterSettings};
use tiercache::remote::{MemoryClient, RemoteClient};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - three-level cache facade tooling
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate a settings file, then print the resolved settings
    Check {
        /// Settings file (YAML)
        #[arg(env = "TIERCACHE_CONFIG")]
        path: PathBuf,
    },

    /// Print the local and remote forms of a key
    Key {
        key: String,
    },

    /// Run a scripted session against in-memory clusters and print stats
    Demo {
        /// Settings file; endpoints are replaced by in-memory clusters
        #[arg(long, env = "TIERCACHE_CONFIG")]
        config: Option<PathBuf>,

        /// Local tier capacity when no settings file is given
        #[arg(long, default_value = "100")]
        capacity: usize,

        /// Take the primary cluster down halfway through
        #[arg(long)]
        fail_primary: bool,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    match args.command {
        Command::Check { path } => check(path),
        Command::Key { key } => print_key(&key),
        Command::Demo {
            config,
            capacity,
            fail_primary,
        } => demo(config, capacity, fail_primary).await,
    }
}

fn check(path: PathBuf) -> anyhow::Result<()> {
    let settings = CacheSettings::load(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("{} is not a valid cache layout", path.display()))?;

    info!("Settings in {} are valid", path.display());
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

fn print_key(key: &str) -> anyhow::Result<()> {
    let local = KeyCodec::Local.normalize(key)?;
    let remote = KeyCodec::sha1().normalize(key)?;
    println!("local:  {}", local);
    println!("remote: {}", remote);
    Ok(())
}

fn demo_settings(capacity: usize) -> CacheSettings {
    let cluster = |node: &str| ClusterSettings {
        nodes: vec![node.to_string()],
        pool_size: 2,
        ..ClusterSettings::default()
    };
    let mut settings = CacheSettings {
        primary: cluster("primary.memory:11211"),
        secondary: cluster("secondary.memory:11211"),
        ..CacheSettings::default()
    };
    settings.local.capacity = capacity;
    settings
}

async fn demo(config: Option<PathBuf>, capacity: usize, fail_primary: bool) -> anyhow::Result<()> {
    let settings = match &config {
        Some(path) => CacheSettings::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => demo_settings(capacity),
    };

    // One shared in-memory cluster per role; every pooled client talks to it
    let primary = Arc::new(MemoryClient::with_address(SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::LOCALHOST,
        11211,
    ))));
    let secondary = Arc::new(MemoryClient::with_address(SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::LOCALHOST,
        11212,
    ))));

    let deployment = {
        let (primary, secondary) = (primary.clone(), secondary.clone());
        settings.build(move |role, _, _| {
            let client: Arc<dyn RemoteClient> = match role {
                ClusterRole::Primary => primary.clone(),
                ClusterRole::Secondary => secondary.clone(),
            };
            Ok(client)
        })?
    };
    let listener = Arc::new(RecordingListener::new());
    deployment.set_listener(listener.clone());
    let cache = deployment.cache();
    info!("Demo cache ready: {}", cache);

    for i in 0..10 {
        cache
            .put(&format!("user:{}", i), CacheValue::text(format!("profile-{}", i)))
            .await?;
    }
    cache.get("user:3").await?;
    cache.append("user:3", "premium").await?;
    cache.add("user:3", CacheValue::text("ignored")).await?;
    cache.incr_by("visits", 1, 100, 0).await?;

    if fail_primary {
        warn!("Taking the primary cluster down");
        primary.set_connected(false);
    }

    let keys: Vec<String> = (0..12).map(|i| format!("user:{}", i)).collect();
    let found = cache.get_batch(&keys).await?;
    info!(
        "Batch read found {} of {} keys",
        found.iter().filter(|v| v.is_some()).count(),
        keys.len()
    );
    cache.remove("user:0").await?;

    let stats: BTreeMap<String, BTreeMap<String, String>> = cache
        .stats()
        .await
        .into_iter()
        .map(|(addr, s)| (addr.to_string(), s))
        .collect();

    let report = serde_json::json!({
        "cache": cache.to_string(),
        "stats": stats,
        "metrics": cache.metrics(),
        "local_items": cache.size(),
        "primary_items": primary.len(),
        "secondary_items": secondary.len(),
        "listener_events": listener.events().len(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    deployment.shutdown().await;
    info!("Demo complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
