//! Per-ring lease tables
//!
//! Each ring owns a fixed array of lease slots, one per address in its
//! subnet, indexed by offset from the network address. Slot 0 (network)
//! and slot 1 (gateway) are permanently assigned. Expired leases are
//! reclaimed lazily when the next DISCOVER probes the slot.

use crate::error::{GwctlError, GwctlResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::net::Ipv4Addr;

/// One lease slot
#[derive(Debug, Clone, Default)]
pub struct Lease {
    /// Client-chosen hostname, from DHCP option 12
    pub name: Option<String>,
    /// Owning MAC; None for the reserved slots
    pub hwaddr: Option<String>,
    /// None means static (never expires)
    pub expires: Option<DateTime<Utc>>,
    pub assigned: bool,
}

impl Lease {
    /// An assigned lease whose expiry has passed is dead, not free;
    /// DISCOVER may reuse the slot but REQUEST against it must fail
    pub fn live(&self, now: DateTime<Utc>) -> bool {
        self.assigned && self.expires.map(|e| e > now).unwrap_or(true)
    }

    pub fn is_static(&self) -> bool {
        self.assigned && self.expires.is_none()
    }
}

/// Outcome of a REQUEST against a ring
#[derive(Debug, Clone)]
pub struct Claim {
    pub ipaddr: Ipv4Addr,
    pub expires: Option<DateTime<Utc>>,
    pub hostname: String,
}

/// Lease table for one ring
#[derive(Debug)]
pub struct RingHandler {
    pub ring_name: String,
    pub interface: String,
    /// Network address; slot 0
    pub range_start: Ipv4Addr,
    pub range_size: u32,
    pub prefix_len: u8,
    /// Gateway/server address; slot 1
    pub server_ip: Ipv4Addr,
    pub name_server: Option<Ipv4Addr>,
    pub domain: Option<String>,
    pub duration: ChronoDuration,
    leases: Vec<Lease>,
}

impl RingHandler {
    /// Build a handler from a subnet in CIDR form
    ///
    /// The broadcast address is excluded from the table entirely.
    pub fn new(
        ring_name: &str,
        subnet: &str,
        interface: &str,
        duration_minutes: u32,
        name_server: Option<Ipv4Addr>,
        domain: Option<String>,
    ) -> GwctlResult<Self> {
        let (base, prefix_len) = parse_cidr(subnet)?;
        if prefix_len < 16 || prefix_len > 30 {
            return Err(GwctlError::ConfigError(format!(
                "Ring {} subnet prefix /{} out of supported range /16../30",
                ring_name, prefix_len
            )));
        }

        let total = 1u32 << (32 - prefix_len);
        let range_size = total - 1; // drop the broadcast slot
        let mut leases = vec![Lease::default(); range_size as usize];

        // Network and gateway slots are never handed out
        leases[0].assigned = true;
        leases[1].assigned = true;

        Ok(Self {
            ring_name: ring_name.to_string(),
            interface: interface.to_string(),
            range_start: base,
            range_size,
            prefix_len,
            server_ip: nth_ip(base, 1),
            name_server,
            domain,
            duration: ChronoDuration::minutes(i64::from(duration_minutes)),
            leases,
        })
    }

    /// Subnet mask for replies
    pub fn subnet_mask(&self) -> Ipv4Addr {
        let mask = u32::MAX << (32 - self.prefix_len);
        Ipv4Addr::from(mask)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.slot_of(ip).is_some()
    }

    /// Slot index of an address, if it falls inside this ring's range
    pub fn slot_of(&self, ip: Ipv4Addr) -> Option<u32> {
        let base = u32::from(self.range_start);
        let addr = u32::from(ip);
        let offset = addr.checked_sub(base)?;
        (offset < self.range_size).then_some(offset)
    }

    pub fn ip_of(&self, slot: u32) -> Ipv4Addr {
        nth_ip(self.range_start, slot)
    }

    pub fn lease_at(&self, slot: u32) -> Option<&Lease> {
        self.leases.get(slot as usize)
    }

    /// Slot currently assigned to this MAC, live or expired
    fn slot_for_mac(&self, mac: &str) -> Option<u32> {
        self.leases
            .iter()
            .position(|l| l.assigned && l.hwaddr.as_deref() == Some(mac))
            .map(|i| i as u32)
    }

    /// Lease duration in whole seconds, for DHCP option 51
    pub fn duration_secs(&self) -> u32 {
        self.duration.num_seconds().max(0) as u32
    }

    /// Address currently held by this MAC, if the lease is live
    pub fn live_ip_for_mac(&self, mac: &str, now: DateTime<Utc>) -> Option<Ipv4Addr> {
        let slot = self.slot_for_mac(mac)?;
        self.leases[slot as usize].live(now).then(|| self.ip_of(slot))
    }

    /// Handle DISCOVER: return the address to offer, or None if the
    /// ring is exhausted
    pub fn offer(&mut self, mac: &str, now: DateTime<Utc>) -> Option<Ipv4Addr> {
        if let Some(slot) = self.slot_for_mac(mac) {
            if self.leases[slot as usize].live(now) {
                return Some(self.ip_of(slot));
            }
            // Expired lease for this MAC: refresh it in place
            let lease = &mut self.leases[slot as usize];
            lease.expires = Some(now + self.duration);
            return Some(self.ip_of(slot));
        }

        let slot = self.probe_free_slot(now)?;
        let lease = &mut self.leases[slot as usize];
        lease.assigned = true;
        lease.hwaddr = Some(mac.to_string());
        lease.name = None;
        lease.expires = Some(now + self.duration);
        Some(self.ip_of(slot))
    }

    /// Random-start linear probe over the usable slots
    fn probe_free_slot(&self, now: DateTime<Utc>) -> Option<u32> {
        if self.range_size <= 2 {
            return None;
        }
        let usable = self.range_size - 2;
        let start = 2 + rand::thread_rng().gen_range(0..usable);
        for step in 0..usable {
            let slot = 2 + (start - 2 + step) % usable;
            let lease = &self.leases[slot as usize];
            if !lease.assigned || (!lease.is_static() && !lease.live(now)) {
                return Some(slot);
            }
        }
        None
    }

    /// Handle REQUEST: validate the address and confirm the claim
    pub fn request(
        &mut self,
        mac: &str,
        req_ip: Ipv4Addr,
        hostname: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<Claim> {
        let slot = self.slot_of(req_ip)?;
        let lease = &mut self.leases[slot as usize];
        if !lease.assigned || lease.hwaddr.as_deref() != Some(mac) {
            return None;
        }

        if let Some(name) = hostname {
            lease.name = Some(name.to_string());
        }
        // Static leases keep a nil expiry
        if !lease.is_static() {
            lease.expires = Some(now + self.duration);
        }

        Some(Claim {
            ipaddr: req_ip,
            expires: lease.expires,
            hostname: lease.name.clone().unwrap_or_default(),
        })
    }

    /// Handle RELEASE; static leases survive unless forced
    ///
    /// Returns the released address when the release was honoured.
    pub fn release(&mut self, mac: &str, ip: Ipv4Addr, force: bool) -> Option<Ipv4Addr> {
        let slot = self.slot_of(ip)?;
        if slot < 2 {
            return None;
        }
        let lease = &mut self.leases[slot as usize];
        if !lease.assigned || lease.hwaddr.as_deref() != Some(mac) {
            return None;
        }
        if lease.is_static() && !force {
            return None;
        }
        *lease = Lease::default();
        Some(ip)
    }

    /// Handle DECLINE: drop whatever this MAC holds
    pub fn decline(&mut self, mac: &str) -> Option<Ipv4Addr> {
        let slot = self.slot_for_mac(mac)?;
        if slot < 2 {
            return None;
        }
        self.leases[slot as usize] = Lease::default();
        Some(self.ip_of(slot))
    }

    /// Record a static assignment, releasing any current lease for the
    /// MAC in this ring
    ///
    /// Returns the previously held address, if any differed.
    pub fn set_static(&mut self, mac: &str, ip: Ipv4Addr) -> GwctlResult<Option<Ipv4Addr>> {
        let slot = self.slot_of(ip).ok_or_else(|| {
            GwctlError::InvalidParameter(format!(
                "{} outside ring {} range", ip, self.ring_name
            ))
        })?;
        if slot < 2 {
            return Err(GwctlError::InvalidParameter(format!(
                "{} is a reserved address in ring {}", ip, self.ring_name
            )));
        }

        let previous = self.slot_for_mac(mac).filter(|&s| s != slot).map(|s| {
            self.leases[s as usize] = Lease::default();
            self.ip_of(s)
        });

        let lease = &mut self.leases[slot as usize];
        lease.assigned = true;
        lease.hwaddr = Some(mac.to_string());
        lease.expires = None;
        Ok(previous)
    }

    /// Install a lease recovered from the property store at startup
    pub fn recover(
        &mut self,
        mac: &str,
        ip: Ipv4Addr,
        expires: Option<DateTime<Utc>>,
        name: Option<String>,
    ) -> GwctlResult<()> {
        let slot = self.slot_of(ip).ok_or_else(|| {
            GwctlError::InvalidParameter(format!(
                "{} outside ring {} range", ip, self.ring_name
            ))
        })?;
        if slot < 2 {
            return Err(GwctlError::InvalidParameter(format!(
                "{} is a reserved address in ring {}", ip, self.ring_name
            )));
        }
        let lease = &mut self.leases[slot as usize];
        lease.assigned = true;
        lease.hwaddr = Some(mac.to_string());
        lease.expires = expires;
        lease.name = name;
        Ok(())
    }

    /// Count of assigned, non-reserved slots; for status reporting
    pub fn assigned_count(&self) -> usize {
        self.leases.iter().skip(2).filter(|l| l.assigned).count()
    }
}

/// Parse "a.b.c.d/len" into the network address and prefix length
pub fn parse_cidr(subnet: &str) -> GwctlResult<(Ipv4Addr, u8)> {
    let (addr, len) = subnet.split_once('/').ok_or_else(|| {
        GwctlError::ParseError(format!("Subnet {} is not in CIDR form", subnet))
    })?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| GwctlError::ParseError(format!("Bad subnet address: {}", addr)))?;
    let len: u8 = len
        .parse()
        .map_err(|_| GwctlError::ParseError(format!("Bad prefix length: {}", len)))?;
    if len > 32 {
        return Err(GwctlError::ParseError(format!("Prefix length {} too large", len)));
    }
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    Ok((Ipv4Addr::from(u32::from(addr) & mask), len))
}

fn nth_ip(base: Ipv4Addr, n: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(base).wrapping_add(n))
}
