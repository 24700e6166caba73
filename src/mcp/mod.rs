//! Master control process
//!
//! Brings every locally-assigned daemon to ONLINE and keeps it there,
//! respecting declared dependencies; answers CTL requests; aggregates
//! satellite state when running as the gateway.

pub mod api;
pub mod daemon;
pub mod lifecycle;
pub mod remote;
pub mod resource;
pub mod satellite;
pub mod supervisor;

use crate::cfgapi::CfgClient;
use crate::config::NodeMode;
use crate::error::{GwctlError, GwctlResult};
use self::api::{DaemonCommand, McpCode, McpOp, McpRequest, McpResponse, CTL_VERSION, TARGET_ALL};
use self::daemon::{build_graph, DaemonDef, DaemonState, DaemonStatus, Goal};
use self::lifecycle::Autostart;
use self::remote::RemoteNodes;
use self::supervisor::{ChildEnv, DaemonShared, DaemonTable, Intent};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Name MCP reports as the CTL response sender
const SENDER: &str = "mcpd";

/// The per-node supervisor
pub struct Mcp {
    node_id: String,
    mode: std::sync::Mutex<NodeMode>,
    daemons: DaemonTable,
    remotes: RemoteNodes,
    gateway: Arc<RwLock<Option<String>>>,
    autostart: Mutex<Autostart>,
    autostart_path: PathBuf,
    reports_dir: Option<PathBuf>,
    cfg: Option<CfgClient>,
    supervisors: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Mcp {
    /// Install supervisors for a filtered definition set
    pub async fn new(
        node_id: &str,
        mode: NodeMode,
        defs: Vec<DaemonDef>,
        autostart_path: PathBuf,
        reports_dir: Option<PathBuf>,
        cfg: Option<CfgClient>,
    ) -> GwctlResult<Arc<Self>> {
        let autostart = Autostart::load(&autostart_path)?;
        let mcp = Arc::new(Self {
            node_id: node_id.to_string(),
            mode: std::sync::Mutex::new(mode),
            daemons: Arc::new(RwLock::new(HashMap::new())),
            remotes: RemoteNodes::new(),
            gateway: Arc::new(RwLock::new(None)),
            autostart: Mutex::new(autostart),
            autostart_path,
            reports_dir,
            cfg,
            supervisors: Mutex::new(Vec::new()),
        });

        mcp.install_definitions(defs).await?;
        Ok(mcp)
    }

    pub fn mode(&self) -> NodeMode {
        *self.mode.lock().unwrap()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn remotes(&self) -> &RemoteNodes {
        &self.remotes
    }

    pub fn daemons(&self) -> &DaemonTable {
        &self.daemons
    }

    pub async fn set_gateway(&self, addr: Option<String>) {
        *self.gateway.write().await = addr;
    }

    pub async fn gateway(&self) -> Option<String> {
        self.gateway.read().await.clone()
    }

    fn child_env(&self) -> ChildEnv {
        ChildEnv {
            mode: self.mode(),
            node_id: self.node_id.clone(),
            gateway: self.gateway.clone(),
            reports_dir: self.reports_dir.clone(),
        }
    }

    /// Detected role change: stop everything, adopt the new mode, and
    /// install the definition set filtered for it
    pub async fn switch_mode(self: &Arc<Self>, mode: NodeMode, defs: Vec<DaemonDef>) -> GwctlResult<()> {
        info!("Switching role to {}", mode);
        self.shutdown().await;
        self.daemons.write().await.clear();
        *self.mode.lock().unwrap() = mode;
        self.install_definitions(defs).await?;
        self.apply_autostart().await;
        Ok(())
    }

    async fn install_definitions(self: &Arc<Self>, defs: Vec<DaemonDef>) -> GwctlResult<()> {
        let (dependencies, dependents) = build_graph(&defs);
        let mut handles = Vec::new();
        {
            let mut table = self.daemons.write().await;
            for def in defs {
                let name = def.name.clone();
                let (shared, intent_rx) = supervisor::new_daemon(
                    def,
                    dependencies.get(&name).cloned().unwrap_or_default(),
                    dependents.get(&name).cloned().unwrap_or_default(),
                );
                table.insert(name, shared.clone());
                handles.push(supervisor::spawn_supervisor(
                    shared,
                    intent_rx,
                    self.daemons.clone(),
                    self.child_env(),
                    self.cfg.clone(),
                ));
            }
        }
        self.supervisors.lock().await.extend(handles);
        Ok(())
    }

    /// Goal daemons flagged in the persisted autostart list
    pub async fn apply_autostart(&self) {
        let names = self.autostart.lock().await.online_set();
        let table = self.daemons.read().await;
        for name in names {
            match table.get(&name) {
                Some(shared) => {
                    info!("Autostart: {}", name);
                    shared.send_intent(Intent::SetGoal(Goal::Online));
                }
                None => debug!("Autostart entry {} not in this mode's set", name),
            }
        }
    }

    /// Replace the definition set after SIGHUP
    ///
    /// Removed daemons are shut down, new ones installed, and changed
    /// definitions take effect on the next start.
    pub async fn reload_definitions(self: &Arc<Self>, defs: Vec<DaemonDef>) -> GwctlResult<()> {
        let new_names: Vec<String> = defs.iter().map(|d| d.name.clone()).collect();

        let removed: Vec<Arc<DaemonShared>> = {
            let mut table = self.daemons.write().await;
            let gone: Vec<String> = table
                .keys()
                .filter(|name| !new_names.contains(name))
                .cloned()
                .collect();
            gone.iter().filter_map(|name| table.remove(name)).collect()
        };
        for shared in removed {
            info!("Dropping daemon {} after reload", shared.name());
            shared.send_intent(Intent::Shutdown);
        }

        let mut fresh = Vec::new();
        {
            let table = self.daemons.read().await;
            for def in defs {
                match table.get(&def.name) {
                    Some(shared) => {
                        *shared.def.lock().unwrap() = def;
                    }
                    None => fresh.push(def),
                }
            }
        }
        if !fresh.is_empty() {
            self.install_definitions(fresh).await?;
        }
        Ok(())
    }

    /// Local state list, sorted by daemon name
    pub async fn local_statuses(&self) -> Vec<DaemonStatus> {
        let table = self.daemons.read().await;
        let mut statuses: Vec<DaemonStatus> = table.values().map(|s| s.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Persist an autostart flag change
    async fn update_autostart(&self, name: &str, online: bool) {
        let mut autostart = self.autostart.lock().await;
        autostart.set(name, online);
        if let Err(e) = autostart.save(&self.autostart_path) {
            warn!("Autostart save failed: {}", e);
        }
    }

    /// Handle one CTL request
    pub async fn handle_request(&self, request: McpRequest) -> McpResponse {
        if request.version != CTL_VERSION {
            warn!(
                "CTL request from {} with version {} (want {})",
                request.sender, request.version, CTL_VERSION
            );
            return McpResponse::new(SENDER, McpCode::BadVersion);
        }

        match request.op {
            McpOp::Ping => McpResponse::new(SENDER, McpCode::Ok),
            McpOp::Get { target, include_remote } => {
                self.handle_get(&target, include_remote).await
            }
            McpOp::Set { target, state } => {
                self.handle_set(&request.sender, &target, state).await
            }
            McpOp::Do { target, command } => self.handle_do(&target, command).await,
            McpOp::Update { node, daemons, lifetime_secs } => {
                self.remotes
                    .update(&node, daemons, Duration::from_secs(lifetime_secs))
                    .await;
                // The push is answered with our own state list
                let mut response = McpResponse::new(SENDER, McpCode::Ok);
                response.daemons = self.local_statuses().await;
                response
            }
            McpOp::Reboot => {
                warn!("Reboot requested over CTL by {}", request.sender);
                tokio::spawn(async {
                    let _ = tokio::process::Command::new("/sbin/reboot").status().await;
                });
                McpResponse::new(SENDER, McpCode::Ok)
            }
            McpOp::Gateway => {
                let mut response = McpResponse::new(SENDER, McpCode::Ok);
                response.gateway = self.gateway().await;
                response
            }
        }
    }

    async fn handle_get(&self, target: &str, include_remote: bool) -> McpResponse {
        let mut daemons = if target == TARGET_ALL {
            self.local_statuses().await
        } else {
            let table = self.daemons.read().await;
            match table.get(target) {
                Some(shared) => vec![shared.status()],
                None => return McpResponse::new(SENDER, McpCode::NoDaemon),
            }
        };

        if include_remote {
            let mut remote = self.remotes.snapshot().await;
            if target != TARGET_ALL {
                remote.retain(|s| s.name == target);
            }
            daemons.extend(remote);
        }

        let mut response = McpResponse::new(SENDER, McpCode::Ok);
        response.daemons = daemons;
        response
    }

    async fn handle_set(&self, sender: &str, target: &str, state: DaemonState) -> McpResponse {
        // A daemon updates its own state only
        if sender != target || target == TARGET_ALL {
            warn!("Rejecting SET of {} from {}", target, sender);
            return McpResponse::new(SENDER, McpCode::Invalid);
        }
        let table = self.daemons.read().await;
        match table.get(target) {
            Some(shared) => {
                shared.send_intent(Intent::SelfSet(state));
                McpResponse::new(SENDER, McpCode::Ok)
            }
            None => McpResponse::new(SENDER, McpCode::NoDaemon),
        }
    }

    async fn handle_do(&self, target: &str, command: DaemonCommand) -> McpResponse {
        let targets: Vec<Arc<DaemonShared>> = {
            let table = self.daemons.read().await;
            if target == TARGET_ALL {
                table.values().cloned().collect()
            } else {
                match table.get(target) {
                    Some(shared) => vec![shared.clone()],
                    None => return McpResponse::new(SENDER, McpCode::NoDaemon),
                }
            }
        };

        for shared in targets {
            let name = shared.name();
            match command {
                DaemonCommand::Start => {
                    info!("DO start {}", name);
                    shared.send_intent(Intent::SetGoal(Goal::Online));
                    self.update_autostart(&name, true).await;
                }
                DaemonCommand::Stop => {
                    info!("DO stop {}", name);
                    shared.send_intent(Intent::SetGoal(Goal::Offline));
                    self.update_autostart(&name, false).await;
                }
                DaemonCommand::Crash => {
                    warn!("DO crash {}", name);
                    shared.send_intent(Intent::Crash);
                }
            }
        }
        McpResponse::new(SENDER, McpCode::Ok)
    }

    /// Accept CTL connections until the listener fails
    pub async fn serve_ctl(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (mut stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("CTL accept failed: {}", e);
                    continue;
                }
            };
            debug!("CTL connection from {}", peer);

            let mcp = self.clone();
            tokio::spawn(async move {
                loop {
                    let request = match api::read_request(&mut stream).await {
                        Ok(request) => request,
                        Err(_) => return,
                    };
                    let response = mcp.handle_request(request).await;
                    if api::write_response(&mut stream, &response).await.is_err() {
                        return;
                    }
                }
            });
        }
    }

    /// Stop everything: used on SIGINT/SIGTERM and self memory-kill
    pub async fn shutdown(&self) {
        info!("Stopping all daemons");
        {
            let table = self.daemons.read().await;
            for shared in table.values() {
                shared.send_intent(Intent::Shutdown);
            }
        }
        let handles: Vec<_> = self.supervisors.lock().await.drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(supervisor::OFFLINE_TIMEOUT, handle)
                .await
                .is_err()
            {
                warn!("A supervisor did not stop within {:?}", supervisor::OFFLINE_TIMEOUT);
            }
        }
    }

    /// Binary paths of every configured daemon, for orphan cleanup
    pub async fn daemon_binaries(&self) -> Vec<String> {
        let table = self.daemons.read().await;
        table
            .values()
            .map(|s| s.def.lock().unwrap().binary.clone())
            .collect()
    }
}

/// Bind the CTL listener
pub async fn bind_ctl(addr: &str) -> GwctlResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| GwctlError::ServiceError(format!("CTL bind {}: {}", addr, e)))
}
