//! Operator CLI (gwcli)
//!
//! Talks to the local MCP over the CTL channel: daemon status, start,
//! stop, crash-for-diagnostics, and gateway discovery.

use clap::{Parser, Subcommand};
use libgwctl::mcp::api::{CtlClient, DaemonCommand, TARGET_ALL};
use libgwctl::mcp::daemon::DaemonStatus;
use tracing_subscriber::{fmt, EnvFilter};

/// Gateway control-plane CLI
#[derive(Parser, Debug)]
#[command(name = "gwcli")]
#[command(author = "gwctl contributors")]
#[command(version)]
#[command(about = "Operator CLI for the gateway control plane", long_about = None)]
struct Args {
    /// MCP control address
    #[arg(long, default_value = "127.0.0.1:3600")]
    ctl: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that mcpd is answering
    Ping,
    /// Show daemon state
    Status {
        /// Daemon name, or all
        #[arg(default_value = TARGET_ALL)]
        daemon: String,
        /// Include satellite nodes
        #[arg(short, long)]
        remote: bool,
    },
    /// Drive a daemon (or all) toward ONLINE
    Start { daemon: String },
    /// Drive a daemon (or all) toward OFFLINE
    Stop { daemon: String },
    /// SIGABRT a daemon for diagnostics, then restart it
    Crash { daemon: String },
    /// Show the known gateway address
    Gateway,
    /// Reboot the host
    Reboot,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gwcli={}", args.log_level)));
    fmt().with_env_filter(filter).with_target(false).init();

    let client = CtlClient::new(&args.ctl, "gwcli");

    let result = match args.command {
        Command::Ping => client.ping().await.map(|_| println!("mcpd is alive")),
        Command::Status { daemon, remote } => client
            .get(&daemon, remote)
            .await
            .map(|statuses| print_statuses(&statuses)),
        Command::Start { daemon } => client
            .do_command(&daemon, DaemonCommand::Start)
            .await
            .map(|_| println!("start requested for {}", daemon)),
        Command::Stop { daemon } => client
            .do_command(&daemon, DaemonCommand::Stop)
            .await
            .map(|_| println!("stop requested for {}", daemon)),
        Command::Crash { daemon } => client
            .do_command(&daemon, DaemonCommand::Crash)
            .await
            .map(|_| println!("crash requested for {}", daemon)),
        Command::Gateway => client.gateway().await.map(|gateway| match gateway {
            Some(addr) => println!("{}", addr),
            None => println!("gateway unknown"),
        }),
        Command::Reboot => client.reboot().await.map(|_| println!("reboot requested")),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_statuses(statuses: &[DaemonStatus]) {
    println!(
        "{:<12} {:<10} {:<9} {:<8} {:<6} SINCE",
        "DAEMON", "STATE", "NODE", "PID", "FAILS"
    );
    for status in statuses {
        println!(
            "{:<12} {:<10} {:<9} {:<8} {:<6} {}",
            status.name,
            status.state.to_string(),
            status.node.as_deref().unwrap_or("local"),
            status
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            status.failure_count,
            status.since.format("%Y-%m-%d %H:%M:%S"),
        );
    }
}
