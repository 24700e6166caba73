//! gwctl - Gateway Control Plane Library
//!
//! Async control plane for a small multi-node network gateway:
//! - MCP process supervisor (per-daemon state machines, dependency
//!   gating, satellite aggregation)
//! - Multi-ring DHCPv4 leasing
//! - Authoritative + proxying DNS with policy blocking
//! - Site bus (topic pub/sub) and property-store client glue
//!
//! The binaries (`mcpd`, `dhcp4d`, `dns4d`, `gwcli`) are thin wrappers
//! over these modules.

pub mod error;
pub mod validation;
pub mod config;
pub mod events;
pub mod bus;
pub mod cfgapi;
pub mod clients;
pub mod mcp;
pub mod dhcp;
pub mod dns;

// Re-export commonly used types
pub use error::{GwctlError, GwctlResult};
pub use config::{GwctlConfig, NodeMode};
pub use bus::{Broker, BusClient, Envelope};
pub use cfgapi::{CfgClient, CfgOp};
pub use clients::{ClientMap, ClientRecord};
pub use events::{
    EventConfig, EventEntity, EventException, EventPing, EventResource, EventSysError,
    ExceptionReason, ResourceAction,
};
pub use mcp::api::{CtlClient, DaemonCommand, McpCode, McpRequest, McpResponse};
pub use mcp::daemon::{DaemonDef, DaemonState, DaemonStatus};
pub use mcp::Mcp;
pub use dhcp::{DhcpConfig, DhcpServer};
pub use dns::{Blocklist, DnsServer, HostMap};
