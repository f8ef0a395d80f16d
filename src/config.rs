//! Runtime configuration for asset-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Every knob of the server (listen port, storage limits, upstream link,
//! tick cadence) lives here.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::evictor::EvictionPolicy;

/// Default port of the cache protocol.
pub const DEFAULT_PORT: u16 = 44234;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "asset-cache", about = "Distributed build-artifact cache server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "asset-cache.json")]
    pub config: PathBuf,

    /// Override the cache protocol listen port.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Local storage configuration.
    pub storage: StorageConfig,

    /// Optional upstream cache.
    pub upstream: Option<UpstreamConfig>,
}

/// Cache protocol server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind (e.g. "0.0.0.0").
    pub bind_address: String,

    /// Cache protocol port (0 = pick a free port).
    pub port: u16,

    /// Identity recorded in value provenance. Generated when unset.
    pub node_name: Option<String>,

    /// Period of the orchestrator tick (relay draining, autosave checks).
    pub tick_interval_ms: u64,

    /// Listen address of the admin HTTP endpoint (disabled when unset).
    pub admin_listen: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            node_name: None,
            tick_interval_ms: 100,
            admin_listen: None,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Configured node name, or a generated one.
    pub fn resolve_node_name(&self) -> String {
        if let Some(name) = &self.node_name {
            return name.clone();
        }
        match std::env::var("HOSTNAME") {
            Ok(host) if !host.is_empty() => host,
            _ => format!("cache-{}", uuid::Uuid::new_v4().simple()),
        }
    }
}

/// Local storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the persisted store.
    pub root: PathBuf,

    /// Maximum bytes of cached values.
    pub capacity_bytes: u64,

    /// Maximum number of cached items (0 = unlimited).
    pub max_items: usize,

    /// Persist a changed store at most this often (0 = only on shutdown).
    pub autosave_interval_secs: u64,

    /// Which entries to evict first when full.
    pub eviction: EvictionPolicy,

    /// zstd compression level of the store file (1-22).
    pub zstd_level: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/tmp/asset-cache"),
            capacity_bytes: 5 * 1024 * 1024 * 1024, // 5 GB
            max_items: 100_000,
            autosave_interval_secs: 60,
            eviction: EvictionPolicy::LeastRecentlyWarmed,
            zstd_level: 3,
        }
    }
}

impl StorageConfig {
    pub fn autosave_interval(&self) -> Option<Duration> {
        (self.autosave_interval_secs > 0).then(|| Duration::from_secs(self.autosave_interval_secs))
    }
}

/// Upstream cache link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Upstream host name or IP.
    pub host: String,

    /// Upstream cache protocol port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds to wait before reconnecting after the link drops
    /// (unset = never reconnect).
    #[serde(default)]
    pub reconnect_secs: Option<u64>,

    /// Maximum number of values relayed to upstream at once.
    #[serde(default = "default_relays_in_flight")]
    pub max_relays_in_flight: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_relays_in_flight() -> usize {
    4
}

impl UpstreamConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_interval(&self) -> Option<Duration> {
        self.reconnect_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides.
    pub fn with_cli_overrides(mut self, cli: &Cli) -> Self {
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        self
    }
}
