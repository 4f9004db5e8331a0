//! Cluster configuration.
//!
//! Every struct has a `Default` carrying the documented values and can be
//! loaded from TOML. Missing keys fall back to the defaults, so a file only
//! needs to list what it overrides.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ClusterError;

/// Gossip timing and dissemination settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Interval between gossip rounds.
    pub gossip_interval_ms: u64,
    /// Clusters up to this many members gossip with `speed_up_fanout`
    /// peers per round instead of one.
    pub speed_up_size: usize,
    /// Peers contacted per round in small clusters.
    pub speed_up_fanout: usize,
    /// Minimum delay between join attempts against seed nodes.
    pub seed_retry_interval_ms: u64,
    /// How often seed addresses are refreshed from the provider.
    pub seed_cleanup_interval_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            gossip_interval_ms: 1000,
            speed_up_size: 100,
            speed_up_fanout: 3,
            seed_retry_interval_ms: 1000,
            seed_cleanup_interval_ms: 60_000,
        }
    }
}

impl GossipConfig {
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn seed_retry_interval(&self) -> Duration {
        Duration::from_millis(self.seed_retry_interval_ms)
    }

    pub fn seed_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.seed_cleanup_interval_ms)
    }

    /// Number of peers to gossip with for a cluster of `members` nodes.
    pub fn fanout(&self, members: usize) -> usize {
        if members <= self.speed_up_size {
            self.speed_up_fanout.max(1)
        } else {
            1
        }
    }
}

/// Heartbeat failure detector settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureDetectorConfig {
    /// Consecutive gossip rounds without a heartbeat reply before a
    /// monitored node is suspected.
    pub heartbeat_loss_threshold: u32,
    /// How many nodes monitor each node. Also the number of suspicions
    /// needed before the coordinator declares a node down.
    pub failure_quorum: usize,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_loss_threshold: 6,
            failure_quorum: 2,
        }
    }
}

/// Top-level cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Nodes only join clusters with the same name.
    pub cluster_name: String,
    pub gossip: GossipConfig,
    pub failure_detector: FailureDetectorConfig,
    /// Static seed addresses.
    pub seed_nodes: Vec<SocketAddr>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_name: "default".into(),
            gossip: GossipConfig::default(),
            failure_detector: FailureDetectorConfig::default(),
            seed_nodes: Vec::new(),
        }
    }
}

impl ClusterConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ClusterError> {
        let config: ClusterConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClusterError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml(&self) -> Result<String, ClusterError> {
        toml::to_string_pretty(self).map_err(|e| ClusterError::Configuration(e.to_string()))
    }

    /// Checks values that would make gossip stall.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.cluster_name.is_empty() {
            return Err(ClusterError::Configuration(
                "cluster_name must not be empty".into(),
            ));
        }
        if self.gossip.gossip_interval_ms == 0 {
            return Err(ClusterError::Configuration(
                "gossip_interval_ms must be positive".into(),
            ));
        }
        if self.gossip.seed_cleanup_interval_ms == 0 {
            return Err(ClusterError::Configuration(
                "seed_cleanup_interval_ms must be positive".into(),
            ));
        }
        if self.failure_detector.heartbeat_loss_threshold == 0 {
            return Err(ClusterError::Configuration(
                "heartbeat_loss_threshold must be positive".into(),
            ));
        }
        if self.failure_detector.failure_quorum == 0 {
            return Err(ClusterError::Configuration(
                "failure_quorum must be positive".into(),
            ));
        }
        Ok(())
    }
}
