//! DNS daemon (dns4d)
//!
//! Authoritative for the site domain, recursive proxy for everything
//! else, with blocklist interception answered by the querying client's
//! ring router.

use clap::Parser;
use libgwctl::bus::BusClient;
use libgwctl::cfgapi::{paths, CfgClient};
use libgwctl::clients::ClientMap;
use libgwctl::config::GwctlConfig;
use libgwctl::dhcp::server::DhcpConfig;
use libgwctl::dns::blocklist::Blocklist;
use libgwctl::dns::server::DnsServer;
use libgwctl::events::topics;
use libgwctl::mcp::api::CtlClient;
use libgwctl::mcp::daemon::DaemonState;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// DNS Daemon
#[derive(Parser, Debug)]
#[command(name = "dns4d")]
#[command(author = "gwctl contributors")]
#[command(version)]
#[command(about = "Authoritative + proxying DNS server for the gateway control plane", long_about = None)]
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

    /// Listen address
    #[arg(long, default_value = "0.0.0.0:53")]
    listen: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting DNS daemon (dns4d)");

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

    let bus = BusClient::connect(&config.endpoints.broker, "dns4d").await?;
    let cfg = CfgClient::new(&config.endpoints.configd, "dns4d");

    // The served domain derives from the site id
    let siteid = cfg
        .get(paths::SITEID)
        .await?
        .unwrap_or_else(|| "0".to_string());
    let domain = format!("{}.brightgate.net", siteid);
    info!("Authoritative for {}", domain);

    let dhcp_config: DhcpConfig = match cfg.get(paths::DHCP_CONFIG).await? {
        Some(raw) => serde_json::from_str(&raw)?,
        None => anyhow::bail!("No DHCP configuration at {}", paths::DHCP_CONFIG),
    };

    let upstream = match cfg.get(paths::DNS_SERVER).await? {
        Some(raw) => raw
            .parse::<SocketAddr>()
            .or_else(|_| raw.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, 53)))
            .unwrap_or_else(|_| config.endpoints.upstream_dns.parse().unwrap()),
        None => config.endpoints.upstream_dns.parse()?,
    };
    info!("Upstream resolver: {}", upstream);

    let blocklist = Blocklist::new(&config.paths.blocklist_file);
    if let Err(e) = blocklist.reload().await {
        warn!("Initial blocklist load failed: {}", e);
    }

    let clients = ClientMap::new();
    let imported = clients.import(&cfg).await.unwrap_or_else(|e| {
        warn!("Client import failed: {}", e);
        0
    });
    info!("Imported {} client records", imported);

    let server = Arc::new(
        DnsServer::new(&domain, &dhcp_config, blocklist, clients, upstream)?.with_bus(bus.clone()),
    );
    server.import_clients().await;

    // Host map and blocklist follow the property store
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

    let ctl = CtlClient::new(&config.endpoints.ctl, "dns4d");
    if let Err(e) = ctl.set_state(DaemonState::Online).await {
        warn!("Could not report ONLINE to mcpd: {}", e);
    }

    info!("dns4d ready on {}", args.listen);
    server.serve(&args.listen).await?;
    Ok(())
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose { "debug" } else { &args.log_level };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("dns4d={},libgwctl={}", log_level, log_level))
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
