//! Daemon configuration loading and validation

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MonetError, Result};
use crate::layout::constants::{DEFAULT_LIVENESS_THRESHOLD_MS, DEFAULT_MONITOR_TICK_MS};

/// One mempool entry of a group: `chunk_count` chunks of `chunk_size` bytes
///
/// `chunk_size` is the full chunk footprint; the chunk header is carved out
/// of it, the remainder is payload capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub chunk_size: u32,
    pub chunk_count: u32,
}

/// Shared memory layout for one user group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentGroupConfig {
    /// Segment name, unique across the configuration
    pub name: String,
    /// POSIX group granted write access; `None` admits every user
    #[serde(default)]
    pub group: Option<String>,
    /// Mempool table carved into this group's segment
    pub pools: Vec<PoolEntry>,
}

/// Top-level daemon configuration, loaded from a TOML document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path of the control IPC socket
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Directory holding segment backing files (tmpfs recommended)
    #[serde(default = "default_segment_dir")]
    pub segment_dir: PathBuf,
    /// Max age of a keep-alive before a process is declared lost
    #[serde(default = "default_liveness_threshold_ms")]
    pub liveness_threshold_ms: u64,
    /// Period of the liveness/introspection tick
    #[serde(default = "default_monitor_tick_ms")]
    pub monitor_tick_ms: u64,
    /// Log verbosity (`error`, `warn`, `info`, `debug`, `trace`)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Segment groups and their pool tables
    pub groups: Vec<SegmentGroupConfig>,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/monet.control")
}

fn default_segment_dir() -> PathBuf {
    PathBuf::from("/dev/shm")
}

fn default_liveness_threshold_ms() -> u64 {
    DEFAULT_LIVENESS_THRESHOLD_MS
}

fn default_monitor_tick_ms() -> u64 {
    DEFAULT_MONITOR_TICK_MS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            segment_dir: default_segment_dir(),
            liveness_threshold_ms: default_liveness_threshold_ms(),
            monitor_tick_ms: default_monitor_tick_ms(),
            log_level: default_log_level(),
            groups: vec![SegmentGroupConfig {
                name: "default".to_string(),
                group: None,
                pools: vec![
                    PoolEntry {
                        chunk_size: 128,
                        chunk_count: 64,
                    },
                    PoolEntry {
                        chunk_size: 1024,
                        chunk_count: 32,
                    },
                ],
            }],
        }
    }
}

impl DaemonConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| MonetError::config("file", format!("{}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| MonetError::config("file", format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural constraints before any resource is created
    pub fn validate(&self) -> Result<()> {
        if self.groups.is_empty() {
            return Err(MonetError::config("groups", "at least one group is required"));
        }
        if self.liveness_threshold_ms == 0 {
            return Err(MonetError::config(
                "liveness_threshold_ms",
                "liveness threshold must be non-zero",
            ));
        }
        if self.monitor_tick_ms == 0 || self.monitor_tick_ms > self.liveness_threshold_ms {
            return Err(MonetError::config(
                "monitor_tick_ms",
                "monitor tick must be non-zero and at most the liveness threshold",
            ));
        }

        let mut names = std::collections::HashSet::new();
        for group in &self.groups {
            if group.name.is_empty() {
                return Err(MonetError::config("groups", "group name cannot be empty"));
            }
            if !names.insert(group.name.as_str()) {
                return Err(MonetError::config(
                    "groups",
                    format!("duplicate group name {}", group.name),
                ));
            }
            if group.pools.is_empty() {
                return Err(MonetError::config(
                    "pools",
                    format!("group {} defines no pools", group.name),
                ));
            }
            for pool in &group.pools {
                if pool.chunk_count == 0 {
                    return Err(MonetError::config(
                        "chunk_count",
                        format!("group {}: chunk count must be non-zero", group.name),
                    ));
                }
                if pool.chunk_size == 0 || !pool.chunk_size.is_power_of_two() {
                    return Err(MonetError::config(
                        "chunk_size",
                        format!(
                            "group {}: chunk size must be a power of two",
                            group.name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}
