//! Node-level configuration for gwctl
//!
//! One `gwctl.toml` per node covers paths and endpoints shared by all
//! daemons. Per-client and per-ring state lives in the property store,
//! not here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use crate::error::{GwctlError, GwctlResult};

/// Role a node (or a daemon definition) is associated with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeMode {
    /// Full control-plane node; owns the LAN default route
    Gateway,
    /// Wi-Fi bridge node polling the gateway MCP
    Satellite,
    /// Cloud-hosted instance of the stack
    Cloudapp,
    /// Runs on every node regardless of role
    Core,
    /// Development-only HTTP surface
    HttpDev,
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeMode::Gateway => "gateway",
            NodeMode::Satellite => "satellite",
            NodeMode::Cloudapp => "cloudapp",
            NodeMode::Core => "core",
            NodeMode::HttpDev => "http-dev",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for NodeMode {
    type Err = GwctlError;

    fn from_str(s: &str) -> GwctlResult<Self> {
        match s {
            "gateway" => Ok(NodeMode::Gateway),
            "satellite" => Ok(NodeMode::Satellite),
            "cloudapp" => Ok(NodeMode::Cloudapp),
            "core" => Ok(NodeMode::Core),
            "http-dev" => Ok(NodeMode::HttpDev),
            _ => Err(GwctlError::InvalidParameter(format!("Unknown node mode: {}", s))),
        }
    }
}

/// Main gwctl configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GwctlConfig {
    /// Configuration file paths
    pub paths: ConfigPaths,
    /// Node identity and role
    pub node: NodeSettings,
    /// Local service endpoints
    pub endpoints: Endpoints,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// Base configuration directory
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Runtime state directory
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Daemon definitions file (JSON array)
    #[serde(default = "default_daemons_file")]
    pub daemons_file: PathBuf,
    /// MCP pid lockfile
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    /// Persisted autostart list
    #[serde(default = "default_autostart_file")]
    pub autostart_file: PathBuf,
    /// DNS blocklist file
    #[serde(default = "default_blocklist_file")]
    pub blocklist_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Node identifier used in CTL UPDATE pushes
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Role override; empty means discover via DHCP
    #[serde(default)]
    pub mode: Option<NodeMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoints {
    /// Local pub/sub broker
    #[serde(default = "default_broker_addr")]
    pub broker: String,
    /// Property store (configd)
    #[serde(default = "default_configd_addr")]
    pub configd: String,
    /// MCP control socket; satellites replace the host with the gateway IP
    #[serde(default = "default_ctl_addr")]
    pub ctl: String,
    /// Upstream recursive resolver, overridden by @/network/dnsserver
    #[serde(default = "default_upstream_dns")]
    pub upstream_dns: String,
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/gwctl")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/spool/gwctl")
}

fn default_daemons_file() -> PathBuf {
    PathBuf::from("/etc/gwctl/daemons.json")
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/var/tmp/ap.mcp.pid")
}

fn default_autostart_file() -> PathBuf {
    PathBuf::from("/tmp/mcp.online")
}

fn default_blocklist_file() -> PathBuf {
    PathBuf::from("/var/spool/gwctl/dns_blocklist")
}

fn default_node_id() -> String {
    // Hostname doubles as node id until the property store says otherwise
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "node0".to_string())
}

fn default_broker_addr() -> String {
    "127.0.0.1:3131".to_string()
}

fn default_configd_addr() -> String {
    "127.0.0.1:3140".to_string()
}

fn default_ctl_addr() -> String {
    "127.0.0.1:3600".to_string()
}

fn default_upstream_dns() -> String {
    "8.8.8.8:53".to_string()
}

impl Default for GwctlConfig {
    fn default() -> Self {
        Self {
            paths: ConfigPaths {
                config_dir: default_config_dir(),
                state_dir: default_state_dir(),
                daemons_file: default_daemons_file(),
                pid_file: default_pid_file(),
                autostart_file: default_autostart_file(),
                blocklist_file: default_blocklist_file(),
            },
            node: NodeSettings {
                node_id: default_node_id(),
                mode: None,
            },
            endpoints: Endpoints {
                broker: default_broker_addr(),
                configd: default_configd_addr(),
                ctl: default_ctl_addr(),
                upstream_dns: default_upstream_dns(),
            },
        }
    }
}

impl GwctlConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> GwctlResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| GwctlError::ConfigError(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| GwctlError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> GwctlResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| GwctlError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| GwctlError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Ensure all directories exist
    pub fn ensure_directories(&self) -> GwctlResult<()> {
        for dir in [&self.paths.config_dir, &self.paths.state_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| GwctlError::ConfigError(format!("Failed to create directory {:?}: {}", dir, e)))?;
        }
        Ok(())
    }
}
