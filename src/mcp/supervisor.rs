//! Per-daemon supervisor tasks
//!
//! One task per daemon owns that daemon's state machine. Outside
//! actors never touch the state directly; they send intents (goal
//! changes, crash requests, self-reported states) over the daemon's
//! channel, and the supervisor re-evaluates on every intent, on every
//! dependency change, and on a 100 ms tick.

use crate::cfgapi::{paths, CfgClient};
use crate::config::NodeMode;
use crate::error::{GwctlError, GwctlResult};
use crate::mcp::daemon::{DaemonDef, DaemonState, DaemonStatus, Goal};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// A child must self-report ONLINE within this window of the fork
pub const ONLINE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hard ceiling on a stop sequence
pub const OFFLINE_TIMEOUT: Duration = Duration::from_secs(15);

/// Runtime after which a child counts as successfully started
pub const SUCCESS_TIME: Duration = Duration::from_secs(60);

/// Evaluation tick
const TICK: Duration = Duration::from_millis(100);

/// Delay before signalling a daemon that has dependents, so they can
/// exit cleanly first
const DEPENDENT_GRACE: Duration = Duration::from_secs(1);

/// Environment variable marking a failsafe-mode start
pub const FAILSAFE_ENV: &str = "GW_FAILSAFE";

/// Retained child log bytes for crash reports
const LOG_TAIL_BYTES: usize = 32 * 1024;

/// The "nobody" uid/gid for unprivileged children
const UNPRIVILEGED_ID: u32 = 65534;

/// Messages accepted by a supervisor
#[derive(Debug, Clone)]
pub enum Intent {
    SetGoal(Goal),
    /// SIGABRT for diagnostics, stop, then start again
    Crash,
    /// SIGABRT then stop; set by the resource monitor
    MemKill,
    /// The daemon reporting its own state over CTL
    SelfSet(DaemonState),
    /// A dependency changed state
    Evaluate,
    /// MCP is exiting
    Shutdown,
}

/// State visible outside the supervisor
#[derive(Debug)]
pub struct Runtime {
    pub state: DaemonState,
    pub since: DateTime<Utc>,
    pub goal: Goal,
    pub failure_count: u32,
    pub pid: Option<u32>,
}

/// Per-daemon shared record in the daemons table
pub struct DaemonShared {
    pub def: Mutex<DaemonDef>,
    pub runtime: Mutex<Runtime>,
    pub intent_tx: mpsc::UnboundedSender<Intent>,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    /// Last 32 KB of child output
    pub log_tail: Mutex<VecDeque<u8>>,
}

impl DaemonShared {
    pub fn name(&self) -> String {
        self.def.lock().unwrap().name.clone()
    }

    pub fn status(&self) -> DaemonStatus {
        let def = self.def.lock().unwrap();
        let runtime = self.runtime.lock().unwrap();
        DaemonStatus {
            name: def.name.clone(),
            state: runtime.state,
            since: runtime.since,
            pid: runtime.pid,
            failure_count: runtime.failure_count,
            node: None,
        }
    }

    pub fn send_intent(&self, intent: Intent) {
        let _ = self.intent_tx.send(intent);
    }

    /// Child log tail as UTF-8, for crash reports
    pub fn log_snapshot(&self) -> String {
        let tail = self.log_tail.lock().unwrap();
        String::from_utf8_lossy(&tail.iter().copied().collect::<Vec<u8>>()).to_string()
    }
}

/// The daemons table shared by supervisors, the CTL server, and the
/// resource monitor
pub type DaemonTable = Arc<RwLock<HashMap<String, Arc<DaemonShared>>>>;

/// Environment every child inherits
#[derive(Clone)]
pub struct ChildEnv {
    pub mode: NodeMode,
    pub node_id: String,
    pub gateway: Arc<RwLock<Option<String>>>,
    /// Where crash reports (captured log tails) are written
    pub reports_dir: Option<std::path::PathBuf>,
}

/// Create the shared record and its intent channel
pub fn new_daemon(
    def: DaemonDef,
    dependencies: Vec<String>,
    dependents: Vec<String>,
) -> (Arc<DaemonShared>, mpsc::UnboundedReceiver<Intent>) {
    let (intent_tx, intent_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(DaemonShared {
        def: Mutex::new(def),
        runtime: Mutex::new(Runtime {
            state: DaemonState::Offline,
            since: Utc::now(),
            goal: Goal::Offline,
            failure_count: 0,
            pid: None,
        }),
        intent_tx,
        dependencies,
        dependents,
        log_tail: Mutex::new(VecDeque::new()),
    });
    (shared, intent_rx)
}

/// Spawn the supervisor task for one daemon
pub fn spawn_supervisor(
    shared: Arc<DaemonShared>,
    intent_rx: mpsc::UnboundedReceiver<Intent>,
    table: DaemonTable,
    env: ChildEnv,
    cfg: Option<CfgClient>,
) -> tokio::task::JoinHandle<()> {
    let supervisor = Supervisor {
        shared,
        table,
        env,
        cfg,
        intent_rx,
        child: None,
        start_instant: None,
        stop_instant: None,
        stopping: None,
        crashed: false,
        restart_after_stop: false,
    };
    tokio::spawn(supervisor.run())
}

/// Stop-sequence bookkeeping while in STOPPING
struct Stopping {
    started: Instant,
    signal_at: Instant,
    term_sent: bool,
    kill_sent: bool,
}

struct Supervisor {
    shared: Arc<DaemonShared>,
    table: DaemonTable,
    env: ChildEnv,
    cfg: Option<CfgClient>,
    intent_rx: mpsc::UnboundedReceiver<Intent>,
    child: Option<Child>,
    start_instant: Option<Instant>,
    stop_instant: Option<Instant>,
    stopping: Option<Stopping>,
    /// The current child was deliberately crashed; its exit counts as
    /// a failure regardless of runtime
    crashed: bool,
    restart_after_stop: bool,
}

impl Supervisor {
    async fn run(mut self) {
        let name = self.shared.name();
        debug!("Supervisor for {} running", name);
        loop {
            tokio::select! {
                intent = self.intent_rx.recv() => {
                    match intent {
                        Some(intent) => {
                            if !self.handle_intent(intent).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(TICK) => {}
            }
            self.reap_child().await;
            self.evaluate().await;
        }
        debug!("Supervisor for {} exiting", name);
    }

    async fn handle_intent(&mut self, intent: Intent) -> bool {
        match intent {
            Intent::SetGoal(goal) => {
                let revive = {
                    let mut runtime = self.shared.runtime.lock().unwrap();
                    runtime.goal = goal;
                    goal == Goal::Online && runtime.state.is_terminal()
                };
                // An explicit start resets a BROKEN daemon's budget
                if revive {
                    self.shared.runtime.lock().unwrap().failure_count = 0;
                    self.transition(DaemonState::Offline).await;
                }
            }
            Intent::Crash => {
                if self.child.is_some() {
                    self.send_abort();
                    self.crashed = true;
                    self.restart_after_stop = true;
                    self.shared.runtime.lock().unwrap().goal = Goal::Offline;
                } else {
                    // Nothing running to diagnose; just start it
                    self.shared.runtime.lock().unwrap().goal = Goal::Online;
                }
            }
            Intent::MemKill => {
                if self.child.is_some() {
                    self.send_abort();
                    self.crashed = true;
                    self.shared.runtime.lock().unwrap().goal = Goal::Offline;
                }
            }
            Intent::SelfSet(state) => {
                let allowed = matches!(
                    state,
                    DaemonState::Initing | DaemonState::Online | DaemonState::Failsafe
                );
                let current = self.shared.runtime.lock().unwrap().state;
                if allowed && current.has_child() && current != DaemonState::Stopping {
                    self.transition(state).await;
                } else {
                    warn!(
                        "Rejecting self-set {} for {} in state {}",
                        state, self.shared.name(), current
                    );
                }
            }
            Intent::Evaluate => {}
            Intent::Shutdown => {
                self.shared.runtime.lock().unwrap().goal = Goal::Offline;
                self.shutdown_child().await;
                return false;
            }
        }
        true
    }

    /// Run the evaluator for the current state
    async fn evaluate(&mut self) {
        let (state, goal, failure_count) = {
            let runtime = self.shared.runtime.lock().unwrap();
            (runtime.state, runtime.goal, runtime.failure_count)
        };
        let def = self.shared.def.lock().unwrap().clone();

        match state {
            DaemonState::Offline => {
                if goal != Goal::Online {
                    return;
                }
                if failure_count > def.failures_allowed {
                    warn!(
                        "{} exceeded its failure budget ({} > {}); BROKEN",
                        def.name, failure_count, def.failures_allowed
                    );
                    self.transition(DaemonState::Broken).await;
                    return;
                }
                if self.blocked().await {
                    self.transition(DaemonState::Blocked).await;
                    return;
                }
                // Back off one second per accumulated failure
                let backoff = Duration::from_secs(u64::from(failure_count));
                let ready = self
                    .stop_instant
                    .map(|t| t.elapsed() >= backoff)
                    .unwrap_or(true);
                if ready {
                    if let Err(e) = self.spawn_child(&def).await {
                        warn!("Failed to start {}: {}", def.name, e);
                        let mut runtime = self.shared.runtime.lock().unwrap();
                        runtime.failure_count += 1;
                        drop(runtime);
                        self.stop_instant = Some(Instant::now());
                    }
                }
            }
            DaemonState::Blocked => {
                if goal == Goal::Offline || !self.blocked().await {
                    self.shared.runtime.lock().unwrap().failure_count = 0;
                    self.transition(DaemonState::Offline).await;
                }
            }
            DaemonState::Starting | DaemonState::Initing => {
                if goal == Goal::Offline || self.blocked().await {
                    self.begin_stop(&def).await;
                } else if self
                    .start_instant
                    .map(|t| t.elapsed() > ONLINE_TIMEOUT)
                    .unwrap_or(false)
                {
                    warn!("{} failed to come online within {:?}", def.name, ONLINE_TIMEOUT);
                    self.shared.runtime.lock().unwrap().failure_count += 1;
                    self.kill_group();
                    self.begin_stop_killed().await;
                }
            }
            DaemonState::Online | DaemonState::Failsafe => {
                if goal == Goal::Offline || self.blocked().await {
                    self.begin_stop(&def).await;
                } else if failure_count > 0
                    && self
                        .start_instant
                        .map(|t| t.elapsed() > SUCCESS_TIME)
                        .unwrap_or(false)
                {
                    debug!("{} has run {:?}; failure budget reset", def.name, SUCCESS_TIME);
                    self.shared.runtime.lock().unwrap().failure_count = 0;
                }
            }
            DaemonState::Stopping => {
                if self.child.is_none() {
                    self.finish_stop().await;
                    return;
                }
                let soft = Duration::from_millis(def.soft_timeout_ms);
                if let Some(stopping) = &mut self.stopping {
                    let now = Instant::now();
                    if !stopping.term_sent && now >= stopping.signal_at {
                        stopping.term_sent = true;
                        signal_child(&self.shared, self.child.as_ref(), libc::SIGTERM);
                    }
                    if stopping.term_sent
                        && !stopping.kill_sent
                        && now >= stopping.signal_at + soft
                    {
                        warn!("{} ignored SIGTERM; killing group", def.name);
                        stopping.kill_sent = true;
                        signal_child(&self.shared, self.child.as_ref(), libc::SIGKILL);
                    }
                    if now.duration_since(stopping.started) > OFFLINE_TIMEOUT {
                        warn!("{} stop sequence exceeded {:?}", def.name, OFFLINE_TIMEOUT);
                        signal_child(&self.shared, self.child.as_ref(), libc::SIGKILL);
                    }
                }
            }
            DaemonState::Broken | DaemonState::Inactive => {}
        }
    }

    /// Any declared dependency not in {ONLINE, FAILSAFE} blocks us
    async fn blocked(&self) -> bool {
        if self.shared.dependencies.is_empty() {
            return false;
        }
        let table = self.table.read().await;
        for dep in &self.shared.dependencies {
            match table.get(dep) {
                Some(shared) => {
                    let state = shared.runtime.lock().unwrap().state;
                    if !state.satisfies_dependency() {
                        return true;
                    }
                }
                None => return true,
            }
        }
        false
    }

    async fn spawn_child(&mut self, def: &DaemonDef) -> GwctlResult<()> {
        let failure_count = self.shared.runtime.lock().unwrap().failure_count;
        let failsafe = def.failures_allowed >= 2 && failure_count >= def.failures_allowed / 2;

        let mut command = Command::new(&def.binary);
        command
            .args(&def.args)
            .env("GW_MODE", self.env.mode.to_string())
            .env("GW_NODE_ID", &self.env.node_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        if let Some(gateway) = self.env.gateway.read().await.as_deref() {
            command.env("GW_GATEWAY", gateway);
        }
        if let Some(warn_mb) = def.mem_warn_mb {
            command.env("GW_MEM_WARN_MB", warn_mb.to_string());
        }
        if let Some(kill_mb) = def.mem_kill_mb {
            command.env("GW_MEM_KILL_MB", kill_mb.to_string());
        }
        if failsafe {
            info!("Starting {} in failsafe mode (attempt {})", def.name, failure_count + 1);
            command.env(FAILSAFE_ENV, "1");
        }
        if !def.privileged && unsafe { libc::geteuid() } == 0 {
            command.uid(UNPRIVILEGED_ID).gid(UNPRIVILEGED_ID);
        }

        let mut child = command.spawn().map_err(|e| {
            GwctlError::ServiceError(format!("fork {} ({}): {}", def.name, def.binary, e))
        })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            spawn_log_capture(self.shared.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_capture(self.shared.clone(), stderr);
        }

        info!("Started {} (pid {:?})", def.name, pid);
        self.child = Some(child);
        self.start_instant = Some(Instant::now());
        self.crashed = false;
        self.shared.runtime.lock().unwrap().pid = pid;
        self.transition(DaemonState::Starting).await;
        Ok(())
    }

    /// Enter STOPPING, delaying the TERM when dependents need to see
    /// the transition first
    async fn begin_stop(&mut self, def: &DaemonDef) {
        let grace = if self.shared.dependents.is_empty() {
            Duration::ZERO
        } else {
            DEPENDENT_GRACE
        };
        debug!("Stopping {} (grace {:?})", def.name, grace);
        let now = Instant::now();
        self.stopping = Some(Stopping {
            started: now,
            signal_at: now + grace,
            term_sent: false,
            kill_sent: false,
        });
        self.transition(DaemonState::Stopping).await;
    }

    /// Enter STOPPING after the child was already killed
    async fn begin_stop_killed(&mut self) {
        let now = Instant::now();
        self.stopping = Some(Stopping {
            started: now,
            signal_at: now,
            term_sent: true,
            kill_sent: true,
        });
        self.transition(DaemonState::Stopping).await;
    }

    /// Collect an exited child, counting quick deaths
    async fn reap_child(&mut self) {
        let Some(child) = &mut self.child else { return };
        let status = match child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return,
            Err(e) => {
                warn!("wait for {} failed: {}", self.shared.name(), e);
                return;
            }
        };

        let name = self.shared.name();
        self.child = None;
        self.stop_instant = Some(Instant::now());

        let was_stopping =
            self.shared.runtime.lock().unwrap().state == DaemonState::Stopping;
        if was_stopping && !self.crashed {
            debug!("{} exited after stop request ({})", name, status);
        } else {
            let quick = self
                .start_instant
                .map(|t| t.elapsed() < SUCCESS_TIME)
                .unwrap_or(true);
            if quick || self.crashed || !status.success() {
                let mut runtime = self.shared.runtime.lock().unwrap();
                runtime.failure_count += 1;
                warn!(
                    "{} exited ({}); failure {} of {}",
                    name,
                    status,
                    runtime.failure_count,
                    self.shared.def.lock().unwrap().failures_allowed
                );
                drop(runtime);
                self.write_crash_report(&name, &status.to_string());
            } else {
                warn!("{} exited ({}) after a successful run", name, status);
            }
        }
        self.crashed = false;
        self.shared.runtime.lock().unwrap().pid = None;

        // Either path ends at OFFLINE; STOPPING finishes via its own
        // bookkeeping so the restart flag is honoured in one place
        self.finish_stop().await;
    }

    /// Post-exit transition out of STOPPING (or any state, once the
    /// child is gone)
    async fn finish_stop(&mut self) {
        self.stopping = None;
        self.transition(DaemonState::Offline).await;
        if self.restart_after_stop {
            self.restart_after_stop = false;
            self.shared.runtime.lock().unwrap().goal = Goal::Online;
        }
    }

    /// Preserve the captured log tail next to the failure
    fn write_crash_report(&self, name: &str, status: &str) {
        let Some(dir) = &self.env.reports_dir else { return };
        let tail = self.shared.log_snapshot();
        if tail.is_empty() {
            return;
        }
        if let Err(e) = std::fs::create_dir_all(dir) {
            debug!("Cannot create report dir {}: {}", dir.display(), e);
            return;
        }
        let path = dir.join(format!("{}.log", name));
        let report = format!("{} {}\n{}", name, status, tail);
        match std::fs::write(&path, report) {
            Ok(()) => info!("Crash report for {} at {}", name, path.display()),
            Err(e) => debug!("Crash report write failed: {}", e),
        }
    }

    fn send_abort(&self) {
        if self.child.is_some() {
            info!("Sending SIGABRT to {} for diagnostics", self.shared.name());
            signal_child(&self.shared, self.child.as_ref(), libc::SIGABRT);
        }
    }

    fn kill_group(&self) {
        signal_child(&self.shared, self.child.as_ref(), libc::SIGKILL);
    }

    /// Bounded synchronous stop for MCP shutdown
    async fn shutdown_child(&mut self) {
        let Some(mut child) = self.child.take() else { return };
        let def = self.shared.def.lock().unwrap().clone();
        let soft = Duration::from_millis(def.soft_timeout_ms);

        if let Some(pid) = child.id() {
            unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
        }
        if tokio::time::timeout(soft, child.wait()).await.is_err() {
            warn!("{} did not stop in {:?}; killing", def.name, soft);
            if let Some(pid) = child.id() {
                unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
            }
            let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
        }
        self.shared.runtime.lock().unwrap().pid = None;
        self.transition(DaemonState::Offline).await;
    }

    /// Record a state change, wake dependents, mirror to metrics
    async fn transition(&self, new_state: DaemonState) {
        let name = self.shared.name();
        {
            let mut runtime = self.shared.runtime.lock().unwrap();
            if runtime.state == new_state {
                return;
            }
            info!("{}: {} -> {}", name, runtime.state, new_state);
            runtime.state = new_state;
            runtime.since = Utc::now();
        }

        // Wake every dependent so it re-evaluates its gate
        {
            let table = self.table.read().await;
            for dependent in &self.shared.dependents {
                if let Some(shared) = table.get(dependent) {
                    shared.send_intent(Intent::Evaluate);
                }
            }
        }

        if let Some(cfg) = &self.cfg {
            let cfg = cfg.clone();
            let metric = paths::daemon_metric(&name, "state");
            let value = new_state.to_string();
            tokio::spawn(async move {
                if let Err(e) = cfg.set(&metric, &value, None).await {
                    debug!("Metric write {} failed: {}", metric, e);
                }
            });
        }
    }
}

/// Signal the child's process group, falling back to the child itself
fn signal_child(shared: &DaemonShared, child: Option<&Child>, signal: i32) {
    let Some(pid) = child.and_then(|c| c.id()) else {
        debug!("No live child for {}; signal {} dropped", shared.name(), signal);
        return;
    };
    let rc = unsafe { libc::kill(-(pid as i32), signal) };
    if rc != 0 {
        unsafe { libc::kill(pid as i32, signal) };
    }
}

/// Stream child output into the rolling tail and the debug log
fn spawn_log_capture<R>(shared: Arc<DaemonShared>, reader: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[{}] {}", shared.name(), line);
            let mut tail = shared.log_tail.lock().unwrap();
            tail.extend(line.as_bytes());
            tail.push_back(b'\n');
            while tail.len() > LOG_TAIL_BYTES {
                tail.pop_front();
            }
        }
    });
}
