//! Bus event payloads
//!
//! Every message crossing the site bus is one of the structs below,
//! bincode-encoded inside a topic envelope (see `bus`). Per-publisher
//! ordering within a topic is preserved by the broker; consumers must
//! not assume ordering across topics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Topic names understood by the broker
pub mod topics {
    /// First observation of a client MAC
    pub const ENTITY: &str = "entity";
    /// Lease lifecycle (provisioned/claimed/released)
    pub const RESOURCE: &str = "resource";
    /// Inter-daemon requests
    pub const REQUEST: &str = "request";
    /// Policy exceptions (blocked DNS names etc.)
    pub const EXCEPTION: &str = "exception";
    /// Property-store change/delete/expire notifications
    pub const CONFIG: &str = "config";
    /// System errors (watchdog trips etc.)
    pub const ERROR: &str = "error";
    /// Liveness probes
    pub const PING: &str = "ping";
}

/// Lease lifecycle actions carried on the `resource` topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceAction {
    /// Offered to a client, not yet confirmed
    Provisioned,
    /// Confirmed by REQUEST/ACK
    Claimed,
    /// Returned to the pool
    Released,
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceAction::Provisioned => "PROVISIONED",
            ResourceAction::Claimed => "CLAIMED",
            ResourceAction::Released => "RELEASED",
        };
        write!(f, "{}", s)
    }
}

/// Reasons carried on the `exception` topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionReason {
    /// Client resolved a name on the blocklist
    PhishingAddress,
    /// Client attempted a known-bad connection
    BadConnection,
}

impl fmt::Display for ExceptionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExceptionReason::PhishingAddress => "PHISHING_ADDRESS",
            ExceptionReason::BadConnection => "BAD_CONNECTION",
        };
        write!(f, "{}", s)
    }
}

/// Property-store notification kinds on the `config` topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigChange {
    Change,
    Delete,
    Expire,
}

/// First sighting of a client MAC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntity {
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub mac: String,
    pub ipv4: Option<Ipv4Addr>,
    pub hostname: Option<String>,
}

/// Lease lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResource {
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub action: ResourceAction,
    pub ipv4: Ipv4Addr,
    pub hwaddr: String,
    pub hostname: String,
    /// Lease duration in seconds; absent for static leases
    pub duration: Option<u32>,
}

/// Policy exception event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventException {
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub reason: ExceptionReason,
    pub mac: Option<String>,
    pub ipv4: Option<Ipv4Addr>,
    pub details: String,
}

/// Property-store change notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub change: ConfigChange,
    /// Property path, e.g. `@/clients/aa:bb:cc:00:11:22/ipv4`
    pub property: String,
    pub new_value: Option<String>,
    pub expires: Option<DateTime<Utc>>,
}

/// System error event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSysError {
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub reason: String,
    pub message: String,
}

/// Liveness probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPing {
    pub timestamp: DateTime<Utc>,
    pub sender: String,
}
