//! Satellite role: gateway discovery and state push
//!
//! A satellite MCP locates the gateway from the node's current DHCP
//! lease, pushes its local daemon list every second, and mirrors the
//! gateway's list back. Losing the gateway stops the local daemons so
//! they restart against fresh state once the link returns.

use crate::config::NodeMode;
use crate::mcp::api::CtlClient;
use crate::mcp::daemon::{DaemonState, Goal};
use crate::mcp::supervisor::Intent;
use crate::mcp::Mcp;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Push cadence
const PUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Lifetime sent with each push; the gateway ages us out past it
const PUSH_LIFETIME_SECS: u64 = 5;

/// Mode-discovery back-off cap
const DISCOVERY_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// CTL port on the gateway
const CTL_PORT: u16 = 3600;

/// Fields of the node's current DHCP lease we act on
///
/// Written by the DHCP client hook as JSON in the state directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseInfo {
    /// Default route, which is the gateway node's address
    #[serde(default)]
    pub route: Option<String>,
    /// Role the gateway assigned this node
    #[serde(default)]
    pub mode: Option<NodeMode>,
}

/// Read the lease file; absent or malformed reads as no lease
pub fn read_lease(path: &Path) -> Option<LeaseInfo> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(lease) => Some(lease),
        Err(e) => {
            warn!("Malformed lease file {}: {}", path.display(), e);
            None
        }
    }
}

/// Startup role determination
///
/// No configured mode and no lease yet means gateway; the mode monitor
/// corrects us if a lease later says otherwise.
pub fn discover_mode(lease_path: &Path) -> NodeMode {
    match read_lease(lease_path).and_then(|l| l.mode) {
        Some(NodeMode::Satellite) => NodeMode::Satellite,
        _ => NodeMode::Gateway,
    }
}

/// Watch for a lease that contradicts the running role
///
/// Polls with exponential back-off capped at one minute; sends one
/// message and returns when the role flips.
pub async fn mode_monitor(
    lease_path: PathBuf,
    current: NodeMode,
    change_tx: mpsc::UnboundedSender<NodeMode>,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        sleep(backoff).await;
        backoff = (backoff * 2).min(DISCOVERY_BACKOFF_MAX);

        let Some(mode) = read_lease(&lease_path).and_then(|l| l.mode) else {
            continue;
        };
        let observed = match mode {
            NodeMode::Satellite => NodeMode::Satellite,
            _ => NodeMode::Gateway,
        };
        if observed != current {
            info!("Lease reports role {}; currently {}", observed, current);
            let _ = change_tx.send(observed);
            return;
        }
    }
}

/// The satellite push loop
pub struct SatelliteLoop {
    mcp: Arc<Mcp>,
    lease_path: PathBuf,
    ctl_port: u16,
    gateway: Option<String>,
    /// Daemons we stopped when the gateway went away, by name
    stopped_for_reconnect: Vec<String>,
    connected: bool,
}

impl SatelliteLoop {
    pub fn new(mcp: Arc<Mcp>, lease_path: PathBuf) -> Self {
        Self {
            mcp,
            lease_path,
            ctl_port: CTL_PORT,
            gateway: None,
            stopped_for_reconnect: Vec::new(),
            connected: false,
        }
    }

    /// Override the gateway CTL port
    pub fn with_ctl_port(mut self, port: u16) -> Self {
        self.ctl_port = port;
        self
    }

    pub async fn run(mut self) {
        loop {
            sleep(PUSH_INTERVAL).await;
            self.tick().await;
        }
    }

    /// One iteration: discover if needed, push, react to the outcome
    ///
    /// Returns true when a role change demands a reboot.
    pub async fn tick(&mut self) -> bool {
        if self.gateway.is_none() {
            match read_lease(&self.lease_path) {
                Some(lease) => {
                    if !matches!(lease.mode, Some(NodeMode::Satellite) | None) {
                        warn!("Lease now assigns this node the {} role; rebooting",
                            lease.mode.unwrap());
                        reboot_host().await;
                        return true;
                    }
                    match lease.route {
                        Some(route) => {
                            info!("Gateway located at {}", route);
                            self.mcp.set_gateway(Some(route.clone())).await;
                            self.gateway = Some(route);
                        }
                        None => {
                            debug!("Lease has no route yet");
                            return false;
                        }
                    }
                }
                None => {
                    debug!("No DHCP lease yet");
                    return false;
                }
            }
        }

        let gateway = self.gateway.clone().unwrap();
        let client = CtlClient::new(
            &format!("{}:{}", gateway, self.ctl_port),
            &format!("{}-mcpd", self.mcp.node_id()),
        );
        let local = self.mcp.local_statuses().await;

        match client
            .update(self.mcp.node_id(), local, PUSH_LIFETIME_SECS)
            .await
        {
            Ok(gateway_list) => {
                self.mcp
                    .remotes()
                    .update("gateway", gateway_list, Duration::from_secs(PUSH_LIFETIME_SECS))
                    .await;
                if !self.connected {
                    self.connected = true;
                    self.restart_after_reconnect().await;
                }
            }
            Err(e) => {
                if self.connected {
                    warn!("Lost gateway CTL at {}: {}", gateway, e);
                    self.connected = false;
                    self.gateway = None;
                    self.mcp.set_gateway(None).await;
                    self.stop_for_reconnect().await;
                } else {
                    debug!("Gateway CTL at {} unreachable: {}", gateway, e);
                }
            }
        }
        false
    }

    /// Stop everything local so daemons repull state on reconnect
    async fn stop_for_reconnect(&mut self) {
        let statuses = self.mcp.local_statuses().await;
        self.stopped_for_reconnect = statuses
            .iter()
            .filter(|s| {
                !matches!(s.state, DaemonState::Offline | DaemonState::Broken | DaemonState::Inactive)
            })
            .map(|s| s.name.clone())
            .collect();
        info!(
            "Stopping {} daemons pending gateway reconnect",
            self.stopped_for_reconnect.len()
        );

        let table = self.mcp.daemons().read().await;
        for name in &self.stopped_for_reconnect {
            if let Some(shared) = table.get(name) {
                shared.send_intent(Intent::SetGoal(Goal::Offline));
            }
        }
    }

    /// Restore the set we stopped once the gateway answers again
    async fn restart_after_reconnect(&mut self) {
        if self.stopped_for_reconnect.is_empty() {
            return;
        }
        info!(
            "Gateway back; restarting {} daemons",
            self.stopped_for_reconnect.len()
        );
        let table = self.mcp.daemons().read().await;
        for name in self.stopped_for_reconnect.drain(..) {
            if let Some(shared) = table.get(&name) {
                shared.send_intent(Intent::SetGoal(Goal::Online));
            }
        }
    }
}

/// Host reboot for detected role changes
async fn reboot_host() {
    warn!("Rebooting host");
    let _ = tokio::process::Command::new("/sbin/reboot").status().await;
}
