//! Client records
//!
//! The source of truth for per-client state is the property store under
//! `@/clients/<mac>/*`; this module keeps an in-memory mirror keyed by
//! MAC, updated from config events on the bus. DHCP and DNS both read
//! it; only DHCP and the operator tools write the store.

use crate::cfgapi::{paths, CfgClient};
use crate::error::GwctlResult;
use crate::events::{ConfigChange, EventConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Built-in ring for clients that have not enrolled yet
pub const RING_UNENROLLED: &str = "unenrolled";
/// Built-in ring for clients on the setup interface
pub const RING_SETUP: &str = "setup";
/// Built-in ring for wired clients
pub const RING_WIRED: &str = "wired";

/// One client's mirrored state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientRecord {
    pub mac: String,
    pub ring: Option<String>,
    pub ipv4: Option<Ipv4Addr>,
    pub expires: Option<DateTime<Utc>>,
    pub dhcp_name: Option<String>,
    pub dns_name: Option<String>,
    pub identity: Option<String>,
}

impl ClientRecord {
    /// Preferred display/DNS name: dns_name wins over dhcp_name
    pub fn display_name(&self) -> Option<&str> {
        self.dns_name.as_deref().or(self.dhcp_name.as_deref())
    }
}

/// In-memory mirror of `@/clients`
///
/// Lock is held only over map reads and writes, never across IO.
#[derive(Clone, Default)]
pub struct ClientMap {
    inner: Arc<RwLock<HashMap<String, ClientRecord>>>,
}

impl ClientMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate from the property store at startup
    ///
    /// Malformed records are skipped and logged once each.
    pub async fn import(&self, cfg: &CfgClient) -> GwctlResult<usize> {
        let subtree = match cfg.get_subtree(paths::CLIENTS).await? {
            Some(serde_json::Value::Object(map)) => map,
            _ => return Ok(0),
        };

        let mut records: HashMap<String, ClientRecord> = HashMap::new();
        for (key, value) in subtree {
            // Flattened subtree keys look like "<mac>/<field>"; values
            // are plain strings, or {value, expires} for expiring ones
            let Some((mac, field)) = key.split_once('/') else {
                continue;
            };
            let (value, expires) = match &value {
                serde_json::Value::String(s) => (s.as_str(), None),
                serde_json::Value::Object(obj) => {
                    let Some(inner) = obj.get("value").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let expires = obj
                        .get("expires")
                        .and_then(|e| e.as_str())
                        .and_then(|e| DateTime::parse_from_rfc3339(e).ok())
                        .map(|e| e.with_timezone(&Utc));
                    (inner, expires)
                }
                _ => continue,
            };
            let record = records.entry(mac.to_string()).or_insert_with(|| ClientRecord {
                mac: mac.to_string(),
                ..Default::default()
            });
            if field == "ipv4" {
                record.expires = expires;
            }
            if !apply_field(record, field, Some(value)) {
                warn!("Skipping malformed client property {}/{} = {}", mac, field, value);
            }
        }

        let count = records.len();
        *self.inner.write().await = records;
        Ok(count)
    }

    /// Apply a `@/clients/...` change or delete event
    ///
    /// Returns the affected MAC when the event touched a client field.
    pub async fn apply_event(&self, event: &EventConfig) -> Option<String> {
        let rest = event.property.strip_prefix("@/clients/")?;

        let mut map = self.inner.write().await;
        match event.change {
            ConfigChange::Change => {
                let (mac, field) = rest.split_once('/')?;
                let record = map.entry(mac.to_string()).or_insert_with(|| ClientRecord {
                    mac: mac.to_string(),
                    ..Default::default()
                });
                if field == "ipv4" {
                    record.expires = event.expires;
                }
                if !apply_field(record, field, event.new_value.as_deref()) {
                    warn!("Ignoring malformed client update {} = {:?}", event.property, event.new_value);
                    return None;
                }
                Some(mac.to_string())
            }
            ConfigChange::Delete | ConfigChange::Expire => {
                match rest.split_once('/') {
                    Some((mac, field)) => {
                        if let Some(record) = map.get_mut(mac) {
                            apply_field(record, field, None);
                        }
                        Some(mac.to_string())
                    }
                    None => {
                        // Whole-client delete
                        map.remove(rest);
                        Some(rest.to_string())
                    }
                }
            }
        }
    }

    pub async fn get(&self, mac: &str) -> Option<ClientRecord> {
        self.inner.read().await.get(mac).cloned()
    }

    /// Reverse lookup by current IPv4
    pub async fn get_by_ip(&self, ip: Ipv4Addr) -> Option<ClientRecord> {
        self.inner
            .read()
            .await
            .values()
            .find(|r| r.ipv4 == Some(ip))
            .cloned()
    }

    pub async fn ring_of(&self, mac: &str) -> Option<String> {
        self.inner.read().await.get(mac).and_then(|r| r.ring.clone())
    }

    /// Record or update a ring assignment in memory only
    pub async fn set_ring(&self, mac: &str, ring: &str) {
        let mut map = self.inner.write().await;
        let record = map.entry(mac.to_string()).or_insert_with(|| ClientRecord {
            mac: mac.to_string(),
            ..Default::default()
        });
        debug!("Client {} ring {:?} -> {}", mac, record.ring, ring);
        record.ring = Some(ring.to_string());
    }

    pub async fn snapshot(&self) -> Vec<ClientRecord> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Apply one field; false means the value did not parse
fn apply_field(record: &mut ClientRecord, field: &str, value: Option<&str>) -> bool {
    match field {
        "ipv4" => match value {
            Some(v) => match v.parse::<Ipv4Addr>() {
                Ok(ip) => record.ipv4 = Some(ip),
                Err(_) => return false,
            },
            None => {
                record.ipv4 = None;
                record.expires = None;
            }
        },
        "ring" => record.ring = value.map(|v| v.to_string()),
        "dhcp_name" => record.dhcp_name = value.map(|v| v.to_string()),
        "dns_name" => record.dns_name = value.map(|v| v.to_string()),
        "identity" => record.identity = value.map(|v| v.to_string()),
        _ => {
            // Unknown fields are preserved in the store but not mirrored
        }
    }
    true
}
