//! Typed settings consumed by the engine's components.
//!
//! Every field has a default, so an empty document is a valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::NpmOptions;
use crate::models::NodeId;

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepfleetConfig {
    /// Identity this process reports inventory under.
    pub node_id: String,

    pub database_path: PathBuf,

    pub registry: RegistryConfig,

    pub npm: NpmConfig,
}

impl Default for DepfleetConfig {
    fn default() -> Self {
        Self {
            node_id: "local".to_string(),
            database_path: PathBuf::from("depfleet.sqlite3"),
            registry: RegistryConfig::default(),
            npm: NpmConfig::default(),
        }
    }
}

impl DepfleetConfig {
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node_id.clone())
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Root of the npms API, without a trailing `/search` or `/package`.
    pub base_url: String,
    pub search_timeout_secs: u64,
    pub detail_timeout_secs: u64,
    pub user_agent: String,
    pub page_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.npms.io/v2".to_string(),
            search_timeout_secs: 15,
            detail_timeout_secs: 60,
            user_agent: concat!("depfleet/", env!("CARGO_PKG_VERSION")).to_string(),
            page_size: 20,
        }
    }
}

impl RegistryConfig {
    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    pub fn detail_timeout(&self) -> Duration {
        Duration::from_secs(self.detail_timeout_secs)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NpmConfig {
    pub command: PathBuf,

    /// Keep `--registry <proxy>` on installs that use npm's own package list.
    pub apply_proxy_with_default_config: bool,

    pub list_timeout_secs: u64,
}

impl Default for NpmConfig {
    fn default() -> Self {
        let options = NpmOptions::default();
        Self {
            command: PathBuf::from("npm"),
            apply_proxy_with_default_config: options.apply_proxy_with_default_config,
            list_timeout_secs: options.list_timeout.as_secs(),
        }
    }
}

impl NpmConfig {
    pub fn options(&self) -> NpmOptions {
        NpmOptions {
            apply_proxy_with_default_config: self.apply_proxy_with_default_config,
            list_timeout: Duration::from_secs(self.list_timeout_secs.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{DepfleetConfig, NpmConfig};

    #[test]
    fn defaults_match_registry_timeouts() {
        let config = DepfleetConfig::default();
        assert_eq!(config.registry.search_timeout(), Duration::from_secs(15));
        assert_eq!(config.registry.detail_timeout(), Duration::from_secs(60));
        assert_eq!(config.registry.page_size, 20);
        assert!(config.npm.apply_proxy_with_default_config);
    }

    #[test]
    fn zero_list_timeout_is_clamped() {
        let config = NpmConfig {
            list_timeout_secs: 0,
            ..NpmConfig::default()
        };
        assert_eq!(config.options().list_timeout, Duration::from_secs(1));
    }
}
