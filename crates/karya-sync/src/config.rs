//! Node configuration.
//!
//! A node is configured either from `KARYA_*` environment variables or from
//! a JSON file. Both paths go through the same validation.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use karya_sync_core::{PeerId, Tier};
use karya_sync_engine::SyncConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// An upstream peer this node syncs with.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: PeerId,
    #[serde(default = "default_peer_tier")]
    pub tier: Tier,
    pub base_url: String,
    /// Initial credential, used until the first renewal.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_peer_tier() -> Tier {
    Tier::Central
}

impl fmt::Debug for PeerConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PeerConfig")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub tier: Tier,
    pub node_id: PeerId,
    pub database_path: PathBuf,
    pub files_root: PathBuf,
    pub peers: Vec<PeerConfig>,
    pub sync: SyncConfig,
    /// Where to serve downstream nodes over HTTP. Unset on nodes with no
    /// downstream tier to serve.
    pub listen_addr: Option<SocketAddr>,
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("NodeConfig")
            .field("tier", &self.tier)
            .field("node_id", &self.node_id)
            .field("database_path", &self.database_path)
            .field("files_root", &self.files_root)
            .field("peers", &self.peers)
            .field("sync", &self.sync)
            .field("listen_addr", &self.listen_addr)
            .finish()
    }
}

/// On-disk shape of [`NodeConfig`].
#[derive(Debug, Deserialize)]
struct FileConfig {
    tier: String,
    node_id: String,
    #[serde(default = "default_database_path")]
    database_path: PathBuf,
    #[serde(default = "default_files_root")]
    files_root: PathBuf,
    #[serde(default)]
    peers: Vec<PeerConfig>,
    #[serde(default)]
    sync: FileSyncConfig,
    #[serde(default)]
    listen_addr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileSyncConfig {
    batch_limit: Option<usize>,
    request_timeout_secs: Option<u64>,
    tick_interval_secs: Option<u64>,
    refresh_views: Option<bool>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("karya-sync.db")
}

fn default_files_root() -> PathBuf {
    PathBuf::from("files")
}

impl NodeConfig {
    /// A config with default paths and sync settings and no peers.
    pub fn new(tier: Tier, node_id: PeerId) -> Self {
        Self {
            tier,
            node_id,
            database_path: default_database_path(),
            files_root: default_files_root(),
            peers: Vec::new(),
            sync: SyncConfig::default(),
            listen_addr: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Invalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let raw: FileConfig = serde_json::from_str(text)
            .map_err(|e| ConfigError::Invalid(format!("malformed config JSON: {}", e)))?;

        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            batch_limit: raw.sync.batch_limit.unwrap_or(defaults.batch_limit),
            request_timeout: raw
                .sync
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            tick_interval: raw
                .sync
                .tick_interval_secs
                .map_or(defaults.tick_interval, Duration::from_secs),
            refresh_views: raw.sync.refresh_views.unwrap_or(defaults.refresh_views),
        };

        let config = Self {
            tier: parse_tier("tier", &raw.tier)?,
            node_id: parse_node_id(&raw.node_id)?,
            database_path: raw.database_path,
            files_root: raw.files_root,
            peers: raw.peers,
            sync,
            listen_addr: raw
                .listen_addr
                .as_deref()
                .map(|addr| parse_listen_addr("listen_addr", addr))
                .transpose()?,
        };
        config.validate()?;
        Ok(config)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tier = parse_tier("KARYA_TIER", &required_trimmed(&lookup, "KARYA_TIER")?)?;
        let node_id = parse_node_id(&required_trimmed(&lookup, "KARYA_NODE_ID")?)?;
        let database_path = PathBuf::from(value_or_default(&lookup, "KARYA_DATABASE_PATH", "karya-sync.db"));
        let files_root = PathBuf::from(value_or_default(&lookup, "KARYA_FILES_ROOT", "files"));

        let batch_limit = parse_number::<usize>(&lookup, "KARYA_BATCH_LIMIT", "500")?;
        let request_timeout_secs = parse_number::<u64>(&lookup, "KARYA_REQUEST_TIMEOUT_SECS", "30")?;
        let tick_interval_secs = parse_number::<u64>(&lookup, "KARYA_SYNC_INTERVAL_SECS", "60")?;
        let refresh_views = match value_or_default(&lookup, "KARYA_REFRESH_VIEWS", "false")
            .to_ascii_lowercase()
            .as_str()
        {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => {
                return Err(ConfigError::Invalid(
                    "KARYA_REFRESH_VIEWS must be true or false".to_string(),
                ))
            }
        };

        let config = Self {
            tier,
            node_id,
            database_path,
            files_root,
            peers: parse_upstream(&lookup)?.into_iter().collect(),
            sync: SyncConfig {
                batch_limit,
                request_timeout: Duration::from_secs(request_timeout_secs),
                tick_interval: Duration::from_secs(tick_interval_secs),
                refresh_views,
            },
            listen_addr: optional_trimmed(&lookup, "KARYA_LISTEN_ADDR")
                .map(|addr| parse_listen_addr("KARYA_LISTEN_ADDR", &addr))
                .transpose()?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.batch_limit == 0 {
            return Err(ConfigError::Invalid("batch limit must be at least 1".to_string()));
        }
        if self.sync.request_timeout.is_zero() {
            return Err(ConfigError::Invalid("request timeout must be positive".to_string()));
        }
        if self.sync.tick_interval.is_zero() {
            return Err(ConfigError::Invalid("sync interval must be positive".to_string()));
        }

        if self.listen_addr.is_some() && self.tier.below().is_none() {
            return Err(ConfigError::Invalid(format!(
                "a {} node has no downstream nodes to serve",
                self.tier
            )));
        }

        for peer in &self.peers {
            if !peer.tier.is_above(self.tier) {
                return Err(ConfigError::Invalid(format!(
                    "peer {} ({}) is not upstream of a {} node",
                    peer.id, peer.tier, self.tier
                )));
            }
            if !is_http_url(&peer.base_url) {
                return Err(ConfigError::Invalid(format!(
                    "base url of peer {} must start with http:// or https://",
                    peer.id
                )));
            }
        }
        Ok(())
    }
}

fn parse_upstream(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<PeerConfig>, ConfigError> {
    let id = optional_trimmed(&lookup, "KARYA_UPSTREAM_ID");
    let base_url = optional_trimmed(&lookup, "KARYA_UPSTREAM_URL");
    let token = optional_trimmed(&lookup, "KARYA_UPSTREAM_TOKEN");

    if id.is_none() && base_url.is_none() && token.is_none() {
        return Ok(None);
    }

    let id = id.ok_or(ConfigError::MissingVar("KARYA_UPSTREAM_ID"))?;
    let base_url = base_url.ok_or(ConfigError::MissingVar("KARYA_UPSTREAM_URL"))?;
    let tier = parse_tier(
        "KARYA_UPSTREAM_TIER",
        &value_or_default(&lookup, "KARYA_UPSTREAM_TIER", "central"),
    )?;

    Ok(Some(PeerConfig {
        id: parse_node_id(&id)?,
        tier,
        base_url: trim_trailing(&base_url).to_string(),
        token,
    }))
}

fn parse_tier(name: &str, value: &str) -> Result<Tier, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} must be central, edge or client", name)))
}

fn parse_listen_addr(name: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} must be an address like 0.0.0.0:8080", name)))
}

fn parse_node_id(value: &str) -> Result<PeerId, ConfigError> {
    let value = value.trim();
    if value.is_empty() || value.contains(['/', ' ']) {
        return Err(ConfigError::Invalid(format!("'{}' is not a valid node id", value)));
    }
    Ok(PeerId::new(value))
}

fn parse_number<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: &str,
) -> Result<T, ConfigError> {
    value_or_default(&lookup, name, default)
        .parse::<T>()
        .map_err(|_| ConfigError::Invalid(format!("{} must be a non-negative integer", name)))
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn trim_trailing(value: &str) -> &str {
    value.trim_end_matches('/')
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}
