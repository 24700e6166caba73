//! Master Control Process daemon (mcpd)
//!
//! Supervises the node's daemon set: starts them in dependency order,
//! restarts them on failure, answers CTL requests, and (as a gateway)
//! aggregates satellite state.
//!
//! # Usage
//!
//! ```bash
//! # Start the supervisor (requires root)
//! sudo mcpd
//!
//! # Start with verbose logging and an explicit config
//! sudo mcpd --verbose --config /etc/gwctl/gwctl.toml
//! ```

use clap::Parser;
use libgwctl::config::{GwctlConfig, NodeMode};
use libgwctl::mcp::daemon::load_definitions;
use libgwctl::mcp::satellite::{discover_mode, mode_monitor, SatelliteLoop};
use libgwctl::mcp::{bind_ctl, lifecycle, resource, Mcp};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Master Control Process
#[derive(Parser, Debug)]
#[command(name = "mcpd")]
#[command(author = "gwctl contributors")]
#[command(version)]
#[command(about = "Per-node daemon supervisor for the gateway control plane", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Node configuration file
    #[arg(long, default_value = "/etc/gwctl/gwctl.toml")]
    config: PathBuf,

    /// Role override (gateway or satellite)
    #[arg(long)]
    mode: Option<NodeMode>,

    /// Kill threshold for mcpd's own memory, in MB
    #[arg(long, default_value_t = 256)]
    self_mem_kill_mb: u64,

    /// Skip the root check (development only)
    #[arg(long)]
    skip_root_check: bool,
}

/// Serialized signal and lifecycle events for the main loop
enum ControlEvent {
    Shutdown(&'static str),
    Reload,
    RoleChange(NodeMode),
    SelfMemKill(String),
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting Master Control Process (mcpd)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    if !args.skip_root_check && unsafe { libc::geteuid() } != 0 {
        anyhow::bail!("mcpd must run as root to manage privileged daemons");
    }

    let config = if args.config.exists() {
        GwctlConfig::load(&args.config)?
    } else {
        warn!("Config {} not found; using defaults", args.config.display());
        GwctlConfig::default()
    };
    config.ensure_directories()?;

    // Refuse to run beside another live instance
    let pid_lock = lifecycle::PidLock::acquire(&config.paths.pid_file)?;

    // Role: flag, then config, then DHCP-lease discovery
    let lease_path = config.paths.state_dir.join("lease.json");
    let mode = args
        .mode
        .or(config.node.mode)
        .unwrap_or_else(|| discover_mode(&lease_path));
    info!("Node {} running as {}", config.node.node_id, mode);

    let defs = load_definitions(&config.paths.daemons_file, mode)?;
    info!("Loaded {} daemon definitions", defs.len());

    // Clean up after any unclean previous run
    let binaries: Vec<String> = defs.iter().map(|d| d.binary.clone()).collect();
    let reaped = lifecycle::reap_orphans(&binaries);
    if reaped > 0 {
        warn!("Reaped {} orphaned processes", reaped);
    }

    let cfg_client = libgwctl::CfgClient::new(&config.endpoints.configd, "mcpd");
    let mcp = Mcp::new(
        &config.node.node_id,
        mode,
        defs,
        config.paths.autostart_file.clone(),
        Some(config.paths.state_dir.join("reports")),
        Some(cfg_client),
    )
    .await?;
    mcp.apply_autostart().await;

    let listener = bind_ctl(&config.endpoints.ctl).await?;
    info!("CTL listening on {}", config.endpoints.ctl);
    tokio::spawn(mcp.clone().serve_ctl(listener));

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    // Resource monitor, with a channel back for self memory-kill
    {
        let (mem_tx, mut mem_rx) = mpsc::unbounded_channel();
        tokio::spawn(resource::run(
            mcp.daemons().clone(),
            Some(args.self_mem_kill_mb),
            mem_tx,
        ));
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            if let Some(reason) = mem_rx.recv().await {
                let _ = event_tx.send(ControlEvent::SelfMemKill(reason));
            }
        });
    }

    // Satellites dial the gateway on whatever port our own CTL uses
    let ctl_port: u16 = config
        .endpoints
        .ctl
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3600);

    // Role-specific background loops
    match mode {
        NodeMode::Satellite => {
            tokio::spawn(
                SatelliteLoop::new(mcp.clone(), lease_path.clone())
                    .with_ctl_port(ctl_port)
                    .run(),
            );
        }
        _ => {
            let (role_tx, mut role_rx) = mpsc::unbounded_channel();
            tokio::spawn(mode_monitor(lease_path.clone(), mode, role_tx));
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                if let Some(new_mode) = role_rx.recv().await {
                    let _ = event_tx.send(ControlEvent::RoleChange(new_mode));
                }
            });
        }
    }

    spawn_signal_task(event_tx);

    info!("mcpd ready ({} mode)", mode);

    // All signals and lifecycle events funnel through one queue so
    // reload and shutdown never race the supervisors
    while let Some(event) = event_rx.recv().await {
        match event {
            ControlEvent::Shutdown(signal) => {
                info!("Received {}, shutting down daemons", signal);
                mcp.shutdown().await;
                break;
            }
            ControlEvent::SelfMemKill(reason) => {
                error!("Self resource limit hit ({}); shutting down", reason);
                mcp.shutdown().await;
                break;
            }
            ControlEvent::Reload => {
                info!("Reloading daemon definitions");
                match load_definitions(&config.paths.daemons_file, mcp.mode()) {
                    Ok(defs) => {
                        if let Err(e) = mcp.reload_definitions(defs).await {
                            warn!("Reload failed: {}", e);
                        }
                    }
                    Err(e) => warn!("Reload skipped, definitions unreadable: {}", e),
                }
            }
            ControlEvent::RoleChange(new_mode) => {
                warn!("Role change detected: now {}", new_mode);
                // Pick up any interface reconfiguration before restarting
                let _ = tokio::process::Command::new("dhcpcd")
                    .arg("--rebind")
                    .status()
                    .await;
                match load_definitions(&config.paths.daemons_file, new_mode) {
                    Ok(defs) => {
                        if let Err(e) = mcp.switch_mode(new_mode, defs).await {
                            warn!("Role switch failed: {}", e);
                        } else if new_mode == NodeMode::Satellite {
                            tokio::spawn(
                                SatelliteLoop::new(mcp.clone(), lease_path.clone())
                                    .with_ctl_port(ctl_port)
                                    .run(),
                            );
                        }
                    }
                    Err(e) => warn!("Role switch skipped, definitions unreadable: {}", e),
                }
            }
        }
    }

    pid_lock.release();
    info!("mcpd stopped");
    Ok(())
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose { "debug" } else { &args.log_level };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("mcpd={},libgwctl={}", log_level, log_level))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .init();
}

/// Route Unix signals into the control-event queue
fn spawn_signal_task(event_tx: mpsc::UnboundedSender<ControlEvent>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to register SIGTERM handler: {}", e);
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to register SIGINT handler: {}", e);
                return;
            }
        };
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to register SIGHUP handler: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    let _ = event_tx.send(ControlEvent::Shutdown("SIGTERM"));
                }
                _ = sigint.recv() => {
                    let _ = event_tx.send(ControlEvent::Shutdown("SIGINT"));
                }
                _ = sighup.recv() => {
                    let _ = event_tx.send(ControlEvent::Reload);
                }
            }
        }
    });
}
