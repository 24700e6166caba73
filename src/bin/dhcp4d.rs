//! DHCPv4 daemon (dhcp4d)
//!
//! Serves DISCOVER/REQUEST/RELEASE/DECLINE for all configured rings,
//! persisting leases to the property store and publishing lease
//! lifecycle on the site bus.

use clap::Parser;
use libgwctl::bus::BusClient;
use libgwctl::cfgapi::watchdog::CfgWatchdog;
use libgwctl::cfgapi::{paths, CfgClient};
use libgwctl::config::GwctlConfig;
use libgwctl::dhcp::server::{wan_iface_for_mac, DhcpConfig, DhcpServer};
use libgwctl::events::topics;
use libgwctl::mcp::api::{CtlClient, DaemonCommand};
use libgwctl::mcp::daemon::DaemonState;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// DHCPv4 Daemon
#[derive(Parser, Debug)]
#[command(name = "dhcp4d")]
#[command(author = "gwctl contributors")]
#[command(version)]
#[command(about = "Multi-ring DHCPv4 server for the gateway control plane", long_about = None)]
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
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting DHCPv4 daemon (dhcp4d)");

    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = if args.config.exists() {
        GwctlConfig::load(&args.config)?
    } else {
        GwctlConfig::default()
    };

    let bus = BusClient::connect(&config.endpoints.broker, "dhcp4d").await?;
    let cfg = CfgClient::new(&config.endpoints.configd, "dhcp4d");

    // Watchdog asks MCP to crash configd after repeated failures
    let (crash_tx, mut crash_rx) = mpsc::unbounded_channel();
    let watchdog = CfgWatchdog::new("dhcp4d", bus.clone(), crash_tx);
    {
        let ctl = CtlClient::new(&config.endpoints.ctl, "dhcp4d");
        tokio::spawn(async move {
            while let Some(daemon) = crash_rx.recv().await {
                if let Err(e) = ctl.do_command(&daemon, DaemonCommand::Crash).await {
                    warn!("Crash request for {} failed: {}", daemon, e);
                }
            }
        });
    }

    // Ring configuration lives in the property store
    let dhcp_config: DhcpConfig = match cfg.get(paths::DHCP_CONFIG).await {
        Ok(Some(raw)) => {
            watchdog.record_ok();
            serde_json::from_str(&raw)?
        }
        Ok(None) => anyhow::bail!("No DHCP configuration at {}", paths::DHCP_CONFIG),
        Err(e) => {
            watchdog.record_error(&e.to_string());
            return Err(e.into());
        }
    };

    // WAN-side requests are dropped; two interfaces with the WAN MAC
    // is a wiring fault we refuse to serve through
    let wan_iface = match cfg.get(paths::WAN_MAC).await {
        Ok(Some(wan_mac)) => wan_iface_for_mac(&wan_mac)?,
        _ => None,
    };
    if let Some(iface) = &wan_iface {
        info!("WAN interface: {}", iface);
    }

    let server = Arc::new(
        DhcpServer::new(&dhcp_config, wan_iface)?
            .with_bus(bus.clone())
            .with_cfg(cfg.clone()),
    );

    let recovered = server.recover_leases().await?;
    info!("Recovered {} leases from the property store", recovered);

    // Config change feed: static assignments, expirations, client edits
    {
        let server = server.clone();
        let mut config_rx = bus.subscribe(topics::CONFIG).await;
        tokio::spawn(async move {
            while let Some(envelope) = config_rx.recv().await {
                match libgwctl::bus::decode_payload(&envelope) {
                    Ok(event) => server.handle_config_event(&event).await,
                    Err(e) => warn!("Undecodable config event: {}", e),
                }
            }
        });
    }

    // Report ourselves to MCP
    let ctl = CtlClient::new(&config.endpoints.ctl, "dhcp4d");
    if let Err(e) = ctl.set_state(DaemonState::Online).await {
        warn!("Could not report ONLINE to mcpd: {}", e);
    }

    info!("dhcp4d ready ({} rings)", dhcp_config.rings.len());
    server.serve().await?;
    Ok(())
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose { "debug" } else { &args.log_level };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("dhcp4d={},libgwctl={}", log_level, log_level))
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
