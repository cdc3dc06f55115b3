//! Configuration loading and management

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use catalog_core::{NodeConfig, PeerId};
use serde::{Deserialize, Serialize};

use crate::outgoing::ReconnectConfig;

pub const CONFIG_FILE: &str = "config.json";

/// Main configuration for the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Address to listen on for incoming connections
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Name announced to peers in the handshake (generated on first run)
    #[serde(default)]
    pub identity: Option<String>,

    /// Peer ID as 16 hex chars (generated on first run)
    #[serde(default)]
    pub peer_id: Option<String>,

    /// WebSocket URLs of peers to dial at startup
    #[serde(default)]
    pub peers: Vec<String>,

    /// Send entries in the compact binary form
    #[serde(default = "default_true")]
    pub prefer_binary: bool,

    /// Forward accepted remote entries to the other peers
    #[serde(default = "default_true")]
    pub relay_entries: bool,

    /// Bound on remembered entry versions
    #[serde(default = "default_known_entries_capacity")]
    pub known_entries_capacity: usize,

    /// How long to wait for query answers before requesting entries
    #[serde(default = "default_query_grace_ms")]
    pub query_grace_ms: u64,

    /// Reconnection backoff for dialed peers
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Up to this fraction of each delay is added at random
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// None = retry forever
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
            max_attempts: None,
        }
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_factor: settings.backoff_factor,
            jitter: settings.jitter,
            max_attempts: settings.max_attempts,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9427".to_string()
}

fn default_true() -> bool {
    true
}

fn default_known_entries_capacity() -> usize {
    catalog_core::gossip::DEFAULT_KNOWN_CAPACITY
}

fn default_query_grace_ms() -> u64 {
    1000
}

fn default_initial_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.25
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            identity: None,
            peer_id: None,
            peers: Vec::new(),
            prefer_binary: true,
            relay_entries: true,
            known_entries_capacity: default_known_entries_capacity(),
            query_grace_ms: default_query_grace_ms(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from the data directory.
    ///
    /// A missing file is created with defaults. A missing peer ID or identity
    /// is generated and written back so both survive restarts.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_file = data_dir.join(CONFIG_FILE);

        let mut config = if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", CONFIG_FILE))?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            config
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            Config::default()
        };

        if config.fill_generated() || !config_file.exists() {
            config.save(data_dir)?;
            tracing::info!("Wrote config to {:?}", config_file);
        }

        Ok(config)
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;
        let config_file = data_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_file, content)
            .with_context(|| format!("Failed to write config: {:?}", config_file))?;
        Ok(())
    }

    /// Generate whatever identity fields are missing. Returns true if any were.
    fn fill_generated(&mut self) -> bool {
        let mut changed = false;
        if self.peer_id.is_none() {
            let peer_id = PeerId::generate();
            tracing::info!("Generated peer ID: {}", peer_id);
            self.peer_id = Some(peer_id.to_string());
            changed = true;
        }
        if self.identity.is_none() {
            let short: String = self.peer_id.iter().flat_map(|id| id.chars()).take(8).collect();
            self.identity = Some(format!("peer-{short}"));
            changed = true;
        }
        changed
    }

    pub fn peer_id(&self) -> Result<PeerId> {
        match &self.peer_id {
            Some(id) => id
                .parse()
                .with_context(|| format!("Invalid peer_id in config: {}", id)),
            None => Ok(PeerId::generate()),
        }
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig::from(&self.reconnect)
    }

    pub fn to_node_config(&self) -> Result<NodeConfig> {
        let peer_id = self.peer_id()?;
        let identity = self
            .identity
            .clone()
            .unwrap_or_else(|| format!("peer-{}", peer_id.short()));

        let mut node = NodeConfig::new(identity).with_peer_id(peer_id);
        node.prefer_binary = self.prefer_binary;
        node.relay_entries = self.relay_entries;
        node.known_entries_capacity = self.known_entries_capacity;
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_load_writes_defaults_with_generated_identity() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();

        assert!(dir.path().join(CONFIG_FILE).exists());
        assert_eq!(config.listen, "0.0.0.0:9427");
        assert_eq!(config.query_grace_ms, 1000);
        assert!(config.prefer_binary);

        let peer_id = config.peer_id().unwrap();
        assert_eq!(
            config.identity.as_deref(),
            Some(format!("peer-{}", peer_id.short()).as_str())
        );
    }

    #[test]
    fn test_reload_keeps_peer_id() {
        let dir = TempDir::new().unwrap();
        let first = Config::load(dir.path()).unwrap();
        let second = Config::load(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"identity": "swift-otter", "peers": ["ws://10.0.0.2:9427"], "reconnect": {"max_attempts": 3}}"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.identity.as_deref(), Some("swift-otter"));
        assert_eq!(config.peers, vec!["ws://10.0.0.2:9427".to_string()]);
        assert_eq!(config.reconnect.max_attempts, Some(3));
        assert_eq!(config.reconnect.initial_delay_ms, 5_000);
        assert!(config.peer_id.is_some());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }

    #[test]
    fn test_to_node_config() {
        let config = Config {
            identity: Some("swift-otter".into()),
            peer_id: Some("00000000000000aa".into()),
            prefer_binary: false,
            relay_entries: false,
            known_entries_capacity: 5,
            ..Config::default()
        };

        let node = config.to_node_config().unwrap();
        assert_eq!(node.identity, "swift-otter");
        assert_eq!(node.peer_id, PeerId::from(0xaa));
        assert!(!node.prefer_binary);
        assert!(!node.relay_entries);
        assert_eq!(node.known_entries_capacity, 5);
    }

    #[test]
    fn test_bad_peer_id_is_rejected() {
        let config = Config {
            peer_id: Some("zz".into()),
            ..Config::default()
        };
        assert!(config.to_node_config().is_err());
    }

    #[test]
    fn test_reconnect_settings_convert() {
        let reconnect = Config::default().reconnect_config();
        assert_eq!(reconnect.initial_delay, Duration::from_secs(5));
        assert_eq!(reconnect.max_delay, Duration::from_secs(60));
        assert_eq!(reconnect.backoff_factor, 2.0);
        assert_eq!(reconnect.jitter, 0.25);
    }
}
