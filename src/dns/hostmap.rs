//! Local zone host map
//!
//! In-memory A/PTR/CNAME records for the site domain, built from client
//! records and `@/dns/cnames/*`, updated from config events. The per-ring
//! override names always resolve to the querying client's ring router and
//! are answered ahead of the map.

use crate::clients::ClientRecord;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Names that always resolve to the client's ring router
pub const OVERRIDE_PREFIXES: [&str; 4] = ["gateway", "phishing", "malware", "captive"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecType {
    A,
    Ptr,
    Cname,
}

#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub rectype: RecType,
    /// Dotted IPv4 for A, target FQDN for PTR/CNAME
    pub value: String,
    pub expires: Option<DateTime<Utc>>,
}

/// What one client currently contributes to the map
#[derive(Debug, Clone)]
struct Installed {
    a_name: String,
    ip: Ipv4Addr,
}

/// The authoritative map for `<domain>.`
#[derive(Clone)]
pub struct HostMap {
    /// Site domain with no leading/trailing dots, e.g. `7410.brightgate.net`
    domain: String,
    records: Arc<Mutex<HashMap<String, DnsRecord>>>,
    by_mac: Arc<Mutex<HashMap<String, Installed>>>,
}

impl HostMap {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.trim_matches('.').to_string(),
            records: Arc::new(Mutex::new(HashMap::new())),
            by_mac: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Whether a query name (with trailing dot) falls inside the domain
    pub fn in_domain(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        name == format!("{}.", self.domain) || name.ends_with(&format!(".{}.", self.domain))
    }

    /// Whether the name is one of the per-ring overrides
    pub fn is_override(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        OVERRIDE_PREFIXES
            .iter()
            .any(|p| name == format!("{}.{}.", p, self.domain))
    }

    /// Fully qualify a bare hostname into the domain
    pub fn qualify(&self, hostname: &str) -> String {
        format!("{}.{}.", hostname.trim_end_matches('.').to_ascii_lowercase(), self.domain)
    }

    pub async fn lookup(&self, name: &str) -> Option<DnsRecord> {
        self.records.lock().await.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Install or replace the records contributed by one client
    ///
    /// Passing a record with no address (or None) removes the client's
    /// entries.
    pub async fn update_client(&self, mac: &str, record: Option<&ClientRecord>) {
        let mut records = self.records.lock().await;
        let mut by_mac = self.by_mac.lock().await;

        if let Some(old) = by_mac.remove(mac) {
            records.remove(&old.a_name);
            records.remove(&reverse_name(old.ip));
        }

        let Some(record) = record else { return };
        let (Some(ip), Some(name)) = (record.ipv4, record.display_name()) else {
            return;
        };
        if crate::validation::validate_hostname(name).is_err() {
            debug!("Client {} has unusable hostname {:?}", mac, name);
            return;
        }

        let a_name = self.qualify(name);
        records.insert(
            a_name.clone(),
            DnsRecord { rectype: RecType::A, value: ip.to_string(), expires: record.expires },
        );
        records.insert(
            reverse_name(ip),
            DnsRecord { rectype: RecType::Ptr, value: a_name.clone(), expires: record.expires },
        );
        by_mac.insert(mac.to_string(), Installed { a_name, ip });
    }

    /// Install or remove a CNAME from `@/dns/cnames/<name>`
    ///
    /// Bare names on either side are qualified into the domain.
    pub async fn update_cname(&self, name: &str, target: Option<&str>) {
        let key = if name.ends_with('.') {
            name.to_ascii_lowercase()
        } else {
            self.qualify(name)
        };

        let mut records = self.records.lock().await;
        match target {
            Some(target) => {
                let target = if target.ends_with('.') {
                    target.to_ascii_lowercase()
                } else {
                    self.qualify(target)
                };
                records.insert(
                    key,
                    DnsRecord { rectype: RecType::Cname, value: target, expires: None },
                );
            }
            None => {
                records.remove(&key);
            }
        }
    }

    /// Rebuild the whole map from a set of client records
    pub async fn import_clients(&self, clients: &[ClientRecord]) -> usize {
        let mut count = 0;
        for record in clients {
            if record.ipv4.is_some() && record.display_name().is_some() {
                self.update_client(&record.mac, Some(record)).await;
                count += 1;
            }
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

/// `10.0.1.15` -> `15.1.0.10.in-addr.arpa.`
pub fn reverse_name(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0])
}

/// Parse `15.1.0.10.in-addr.arpa.` back into an address
pub fn parse_reverse_name(name: &str) -> Option<Ipv4Addr> {
    let lower = name.to_ascii_lowercase();
    let rest = lower
        .strip_suffix(".in-addr.arpa.")
        .or_else(|| lower.strip_suffix(".in-addr.arpa"))?;
    let mut parts = rest.split('.').collect::<Vec<_>>();
    if parts.len() != 4 {
        return None;
    }
    parts.reverse();
    let octets: Vec<u8> = parts.iter().filter_map(|p| p.parse().ok()).collect();
    if octets.len() != 4 {
        return None;
    }
    Some(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
}
