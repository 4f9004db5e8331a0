//! Lock and election configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lock::RetryPolicy;
use crate::CoordError;

/// Lock client retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Delay between retried lock, unlock and owner requests.
    pub retry_interval_ms: u64,
    /// Gives up a lock attempt after this many failed requests. `None`
    /// retries for as long as the attempt is still pending.
    pub max_retries: Option<u32>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 50,
            max_retries: None,
        }
    }
}

impl LockConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_interval(), self.max_retries)
    }
}

/// Leader election settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Lock region holding one lock per election group.
    pub region: String,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            region: "cinder.election".into(),
        }
    }
}

/// Combined coordination configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    pub lock: LockConfig,
    pub election: ElectionConfig,
}

impl CoordConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, CoordError> {
        let config: CoordConfig = toml::from_str(s)?;
        if config.election.region.is_empty() {
            return Err(CoordError::Configuration(
                "election region must not be empty".into(),
            ));
        }
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoordError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CoordError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml(&self) -> Result<String, CoordError> {
        toml::to_string_pretty(self).map_err(|e| CoordError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CoordConfig::default();
        assert_eq!(config.lock.retry_interval(), Duration::from_millis(50));
        assert_eq!(config.lock.max_retries, None);
        assert_eq!(config.election.region, "cinder.election");
    }

    #[test]
    fn partial_toml() {
        let config = CoordConfig::from_toml_str("[lock]\nmax_retries = 3\n").unwrap();
        assert_eq!(config.lock.max_retries, Some(3));
        assert_eq!(config.lock.retry_interval_ms, 50);
        assert_eq!(config.lock.retry_policy().max_attempts(), Some(3));
    }

    #[test]
    fn roundtrip() {
        let mut config = CoordConfig::default();
        config.lock.retry_interval_ms = 5;
        let text = config.to_toml().unwrap();
        assert_eq!(CoordConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn empty_region_rejected() {
        let err = CoordConfig::from_toml_str("[election]\nregion = \"\"\n").unwrap_err();
        assert!(matches!(err, CoordError::Configuration(_)));
    }
}
