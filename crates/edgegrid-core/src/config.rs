//! Controller configuration, loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Numeric region prefix of every store key.
    pub region: u32,
    pub data_dir: PathBuf,
    /// DNS suffix used when building app instance URIs.
    pub app_dns_root: String,
    /// Collapse all agent waits to a few seconds (test deployments).
    pub short_timeouts: bool,
    pub timeouts: TimeoutConfig,
    pub stm: StmRetryConfig,
    pub leases: LeaseConfig,
}

/// Agent wait timeouts, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub create_cluster_inst: u64,
    pub update_cluster_inst: u64,
    pub delete_cluster_inst: u64,
    pub create_app_inst: u64,
    pub update_app_inst: u64,
    pub delete_app_inst: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StmRetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub stream_ttl_secs: u64,
    pub keep_alive_interval_ms: u64,
    pub reaper_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            region: 1,
            data_dir: PathBuf::from("/var/lib/edgegrid"),
            app_dns_root: "edgegrid.net".to_string(),
            short_timeouts: false,
            timeouts: TimeoutConfig::default(),
            stm: StmRetryConfig::default(),
            leases: LeaseConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            create_cluster_inst: 30 * 60,
            update_cluster_inst: 20 * 60,
            delete_cluster_inst: 20 * 60,
            create_app_inst: 30 * 60,
            update_app_inst: 20 * 60,
            delete_app_inst: 20 * 60,
        }
    }
}

impl Default for StmRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 32,
            base_backoff_ms: 2,
            max_backoff_ms: 200,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            stream_ttl_secs: 60,
            keep_alive_interval_ms: 1000,
            reaper_interval_ms: 500,
        }
    }
}

/// Resolved agent wait timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub create_cluster_inst: Duration,
    pub update_cluster_inst: Duration,
    pub delete_cluster_inst: Duration,
    pub create_app_inst: Duration,
    pub update_app_inst: Duration,
    pub delete_app_inst: Duration,
}

impl Timeouts {
    /// Fixed short waits for test configurations.
    pub fn short() -> Self {
        let create = Duration::from_secs(3);
        let other = Duration::from_secs(2);
        Self {
            create_cluster_inst: create,
            update_cluster_inst: other,
            delete_cluster_inst: other,
            create_app_inst: create,
            update_app_inst: other,
            delete_app_inst: other,
        }
    }
}

impl ControllerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: ControllerConfig = toml::from_str(content)?;
        anyhow::ensure!(config.stm.max_attempts > 0, "stm.max_attempts must be positive");
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Configuration for tests: in-memory friendly, short waits, fast leases.
    pub fn for_tests() -> Self {
        Self {
            short_timeouts: true,
            leases: LeaseConfig {
                stream_ttl_secs: 2,
                keep_alive_interval_ms: 200,
                reaper_interval_ms: 100,
            },
            ..Default::default()
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        if self.short_timeouts {
            return Timeouts::short();
        }
        let t = &self.timeouts;
        Timeouts {
            create_cluster_inst: Duration::from_secs(t.create_cluster_inst),
            update_cluster_inst: Duration::from_secs(t.update_cluster_inst),
            delete_cluster_inst: Duration::from_secs(t.delete_cluster_inst),
            create_app_inst: Duration::from_secs(t.create_app_inst),
            update_app_inst: Duration::from_secs(t.update_app_inst),
            delete_app_inst: Duration::from_secs(t.delete_app_inst),
        }
    }
}
