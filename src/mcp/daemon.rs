//! Daemon definitions and runtime state
//!
//! Definitions come from a JSON file, filtered by the node's mode; the
//! dependency graph is computed once per load and a cycle fails the
//! load outright.

use crate::config::NodeMode;
use crate::error::{GwctlError, GwctlResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

/// Default failure budget before a daemon goes BROKEN
pub const DEFAULT_FAILURES_ALLOWED: u32 = 10;

/// Default grace period between SIGTERM and SIGKILL
const DEFAULT_SOFT_TIMEOUT_MS: u64 = 5000;

/// Lifecycle state of a supervised daemon
///
/// Exactly one state at a time. Only the daemon itself may move to
/// Online (via CTL SET); every other transition belongs to MCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DaemonState {
    Offline,
    Blocked,
    Starting,
    Initing,
    Online,
    Failsafe,
    Stopping,
    Broken,
    Inactive,
}

impl DaemonState {
    /// States in which a child process may be attached
    pub fn has_child(self) -> bool {
        matches!(
            self,
            DaemonState::Starting
                | DaemonState::Initing
                | DaemonState::Online
                | DaemonState::Failsafe
                | DaemonState::Stopping
        )
    }

    /// Whether this state satisfies a dependent's gate
    ///
    /// Failsafe gates like Online; the child is degraded but serving.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, DaemonState::Online | DaemonState::Failsafe)
    }

    /// States that only an explicit external goal can leave
    pub fn is_terminal(self) -> bool {
        matches!(self, DaemonState::Broken | DaemonState::Inactive)
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DaemonState::Offline => "OFFLINE",
            DaemonState::Blocked => "BLOCKED",
            DaemonState::Starting => "STARTING",
            DaemonState::Initing => "INITING",
            DaemonState::Online => "ONLINE",
            DaemonState::Failsafe => "FAILSAFE",
            DaemonState::Stopping => "STOPPING",
            DaemonState::Broken => "BROKEN",
            DaemonState::Inactive => "INACTIVE",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for DaemonState {
    type Err = GwctlError;

    fn from_str(s: &str) -> GwctlResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "OFFLINE" => Ok(DaemonState::Offline),
            "BLOCKED" => Ok(DaemonState::Blocked),
            "STARTING" => Ok(DaemonState::Starting),
            "INITING" => Ok(DaemonState::Initing),
            "ONLINE" => Ok(DaemonState::Online),
            "FAILSAFE" => Ok(DaemonState::Failsafe),
            "STOPPING" => Ok(DaemonState::Stopping),
            "BROKEN" => Ok(DaemonState::Broken),
            "INACTIVE" => Ok(DaemonState::Inactive),
            _ => Err(GwctlError::InvalidParameter(format!("Unknown daemon state: {}", s))),
        }
    }
}

/// Where the supervisor is trying to drive its daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Goal {
    Online,
    Offline,
}

/// One entry of the daemon definitions file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonDef {
    pub name: String,
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Node modes this daemon runs under
    pub modes: Vec<NodeMode>,
    #[serde(default)]
    pub depends_on: Option<String>,
    /// Run as root rather than the unprivileged uid
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub mem_warn_mb: Option<u64>,
    #[serde(default)]
    pub mem_kill_mb: Option<u64>,
    #[serde(default = "default_soft_timeout_ms")]
    pub soft_timeout_ms: u64,
    #[serde(default = "default_failures_allowed")]
    pub failures_allowed: u32,
}

fn default_soft_timeout_ms() -> u64 {
    DEFAULT_SOFT_TIMEOUT_MS
}

fn default_failures_allowed() -> u32 {
    DEFAULT_FAILURES_ALLOWED
}

/// State summary sent over CTL, for both local and remote daemons
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub name: String,
    pub state: DaemonState,
    pub since: DateTime<Utc>,
    pub pid: Option<u32>,
    pub failure_count: u32,
    /// Node the daemon runs on; None for local entries
    pub node: Option<String>,
}

/// Parse a definitions file and keep the entries matching `mode`
pub fn load_definitions(path: &Path, mode: NodeMode) -> GwctlResult<Vec<DaemonDef>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        GwctlError::ConfigError(format!("Cannot read daemon definitions {}: {}", path.display(), e))
    })?;
    let all: Vec<DaemonDef> = serde_json::from_str(&content).map_err(|e| {
        GwctlError::ConfigError(format!("Bad daemon definitions {}: {}", path.display(), e))
    })?;
    filter_definitions(all, mode)
}

/// Mode-filter plus structural validation
pub fn filter_definitions(all: Vec<DaemonDef>, mode: NodeMode) -> GwctlResult<Vec<DaemonDef>> {
    let defs: Vec<DaemonDef> = all
        .into_iter()
        .filter(|d| d.modes.contains(&mode) || d.modes.contains(&NodeMode::Core))
        .collect();

    let mut seen = HashSet::new();
    for def in &defs {
        crate::validation::validate_daemon_name(&def.name)?;
        if !seen.insert(def.name.clone()) {
            return Err(GwctlError::ConfigError(format!("Duplicate daemon name: {}", def.name)));
        }
    }

    // A dependency must be part of the same filtered set
    let names: HashSet<&str> = defs.iter().map(|d| d.name.as_str()).collect();
    for def in &defs {
        if let Some(dep) = &def.depends_on {
            if !names.contains(dep.as_str()) {
                return Err(GwctlError::ConfigError(format!(
                    "Daemon {} depends on unknown daemon {}", def.name, dep
                )));
            }
        }
    }

    check_cycles(&defs)?;
    Ok(defs)
}

/// Dependencies and dependents as parallel adjacency lists
pub fn build_graph(
    defs: &[DaemonDef],
) -> (HashMap<String, Vec<String>>, HashMap<String, Vec<String>>) {
    let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for def in defs {
        dependencies.entry(def.name.clone()).or_default();
        dependents.entry(def.name.clone()).or_default();
    }
    for def in defs {
        if let Some(dep) = &def.depends_on {
            dependencies.get_mut(&def.name).unwrap().push(dep.clone());
            dependents.get_mut(dep).unwrap().push(def.name.clone());
        }
    }
    (dependencies, dependents)
}

/// Walk each dependency chain; a repeat inside one walk is a cycle
fn check_cycles(defs: &[DaemonDef]) -> GwctlResult<()> {
    let by_name: HashMap<&str, &DaemonDef> = defs.iter().map(|d| (d.name.as_str(), d)).collect();
    for def in defs {
        let mut visited = HashSet::new();
        let mut current = def;
        while let Some(dep) = &current.depends_on {
            if !visited.insert(dep.clone()) {
                return Err(GwctlError::ConfigError(format!(
                    "Dependency cycle involving {}", dep
                )));
            }
            match by_name.get(dep.as_str()) {
                Some(next) => current = next,
                None => break,
            }
        }
    }
    Ok(())
}
