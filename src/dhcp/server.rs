//! DHCPv4 serving
//!
//! One UDP socket per configured interface (SO_BINDTODEVICE), so the
//! interface of arrival is known per socket and drives ring
//! classification. Ring handlers are independent; the only shared lock
//! is the client-ring map.

use crate::bus::BusClient;
use crate::cfgapi::{paths, CfgClient};
use crate::clients::{ClientMap, RING_SETUP, RING_UNENROLLED, RING_WIRED};
use crate::dhcp::packet::{
    self, DhcpPacket, MessageType, OPT_DNS_SERVER, OPT_LEASE_TIME, OPT_ROUTER, OPT_SERVER_ID,
    OPT_SUBNET_MASK,
};
use crate::dhcp::ring::RingHandler;
use crate::error::{GwctlError, GwctlResult};
use crate::events::{topics, EventEntity, EventResource, ResourceAction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Daemon name used as event sender and store writer
const SENDER: &str = "dhcp4d";

/// Per-ring definition as stored at `@/dhcp/config`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingDef {
    pub subnet: String,
    pub interface: String,
    pub lease_duration_minutes: u32,
}

/// The `@/dhcp/config` document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpConfig {
    pub rings: HashMap<String, RingDef>,
    #[serde(default)]
    pub name_server: Option<Ipv4Addr>,
    #[serde(default)]
    pub domain: Option<String>,
}

/// How an arrival interface is treated for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IfaceKind {
    Setup,
    Wireless,
    Wired,
    Wan,
}

/// Where a reply should be sent
#[derive(Debug, Clone)]
pub struct Reply {
    pub packet: DhcpPacket,
    pub dest: SocketAddrV4,
}

/// The DHCPv4 server
pub struct DhcpServer {
    rings: HashMap<String, Mutex<RingHandler>>,
    /// interface -> wireless?
    wireless_ifaces: Vec<String>,
    setup_iface: Option<String>,
    wan_iface: Option<String>,
    clients: ClientMap,
    bus: Option<BusClient>,
    cfg: Option<CfgClient>,
}

impl DhcpServer {
    /// Build ring handlers from the stored configuration
    pub fn new(config: &DhcpConfig, wan_iface: Option<String>) -> GwctlResult<Self> {
        if config.rings.is_empty() {
            return Err(GwctlError::ConfigError("No rings configured".to_string()));
        }

        let mut rings = HashMap::new();
        let mut setup_iface = None;
        let mut wireless_ifaces = Vec::new();

        for (name, def) in &config.rings {
            crate::validation::validate_ring_name(name)?;
            crate::validation::validate_interface_name(&def.interface)?;
            let handler = RingHandler::new(
                name,
                &def.subnet,
                &def.interface,
                def.lease_duration_minutes,
                config.name_server,
                config.domain.clone(),
            )?;
            info!(
                "Ring {}: {} on {} ({} slots, {}m leases)",
                name, def.subnet, def.interface, handler.range_size, def.lease_duration_minutes
            );

            if name == RING_SETUP {
                setup_iface = Some(def.interface.clone());
            } else if name != RING_WIRED && !wireless_ifaces.contains(&def.interface) {
                wireless_ifaces.push(def.interface.clone());
            }
            rings.insert(name.clone(), Mutex::new(handler));
        }

        Ok(Self {
            rings,
            wireless_ifaces,
            setup_iface,
            wan_iface,
            clients: ClientMap::new(),
            bus: None,
            cfg: None,
        })
    }

    pub fn with_bus(mut self, bus: BusClient) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_cfg(mut self, cfg: CfgClient) -> Self {
        self.cfg = Some(cfg);
        self
    }

    pub fn clients(&self) -> &ClientMap {
        &self.clients
    }

    /// Import client records and re-install their leases
    ///
    /// Also honours the legacy `@/dhcp/leases/<ipv4>` layout when the
    /// store still carries it.
    pub async fn recover_leases(&self) -> GwctlResult<usize> {
        let Some(cfg) = &self.cfg else {
            return Ok(0);
        };

        self.clients.import(cfg).await?;
        let mut recovered = 0;

        for record in self.clients.snapshot().await {
            let Some(ip) = record.ipv4 else { continue };
            let Some(ring_name) = record.ring.as_deref() else {
                warn!("Client {} has an address but no ring; skipping", record.mac);
                continue;
            };
            let Some(ring) = self.rings.get(ring_name) else {
                warn!("Client {} in unconfigured ring {}; skipping", record.mac, ring_name);
                continue;
            };
            let mut ring = ring.lock().await;
            match ring.recover(&record.mac, ip, record.expires, record.dhcp_name.clone()) {
                Ok(()) => recovered += 1,
                Err(e) => warn!("Skipping lease {} for {}: {}", ip, record.mac, e),
            }
        }

        // Legacy layout: @/dhcp/leases/<ipv4> = <mac>
        if let Ok(Some(serde_json::Value::Object(legacy))) =
            cfg.get_subtree(paths::DHCP_LEASES).await
        {
            for (ip_str, mac_value) in legacy {
                let (Ok(ip), Some(mac)) = (ip_str.parse::<Ipv4Addr>(), mac_value.as_str()) else {
                    warn!("Skipping malformed legacy lease {}", ip_str);
                    continue;
                };
                for ring in self.rings.values() {
                    let mut ring = ring.lock().await;
                    if ring.contains(ip) {
                        if ring.recover(mac, ip, None, None).is_ok() {
                            recovered += 1;
                        }
                        break;
                    }
                }
            }
        }

        info!("Recovered {} leases", recovered);
        Ok(recovered)
    }

    fn iface_kind(&self, iface: &str) -> IfaceKind {
        if Some(iface) == self.wan_iface.as_deref() {
            return IfaceKind::Wan;
        }
        if Some(iface) == self.setup_iface.as_deref() {
            return IfaceKind::Setup;
        }
        if self.wireless_ifaces.iter().any(|i| i == iface) || iface.starts_with("wlan") {
            return IfaceKind::Wireless;
        }
        IfaceKind::Wired
    }

    /// Assign or confirm the sender's ring from the arrival interface
    async fn classify(&self, mac: &str, kind: IfaceKind) -> Option<String> {
        let previous = self.clients.ring_of(mac).await;
        let ring = match kind {
            IfaceKind::Wan => return None,
            IfaceKind::Setup => RING_SETUP.to_string(),
            IfaceKind::Wireless => match previous.as_deref() {
                None | Some(RING_SETUP) | Some(RING_WIRED) => RING_UNENROLLED.to_string(),
                Some(existing) => existing.to_string(),
            },
            IfaceKind::Wired => RING_WIRED.to_string(),
        };

        if previous.as_deref() != Some(ring.as_str()) {
            self.clients.set_ring(mac, &ring).await;
            if let Some(cfg) = &self.cfg {
                if let Err(e) = cfg.set(&paths::client_prop(mac, "ring"), &ring, None).await {
                    warn!("Failed to persist ring for {}: {}", mac, e);
                }
            }
        }
        Some(ring)
    }

    /// Publish first-sight ENTITY for a MAC we have never seen
    async fn note_entity(&self, mac: &str, packet: &DhcpPacket) {
        if self.clients.get(mac).await.is_some() {
            return;
        }
        let Some(bus) = &self.bus else { return };
        let event = EventEntity {
            timestamp: Utc::now(),
            sender: SENDER.to_string(),
            mac: mac.to_string(),
            ipv4: (packet.ciaddr != Ipv4Addr::UNSPECIFIED).then_some(packet.ciaddr),
            hostname: packet.hostname(),
        };
        if let Err(e) = bus.publish(topics::ENTITY, &event) {
            warn!("Failed to publish entity event: {}", e);
        }
    }

    fn publish_resource(
        &self,
        action: ResourceAction,
        ipv4: Ipv4Addr,
        mac: &str,
        hostname: &str,
        duration: Option<u32>,
    ) {
        let Some(bus) = &self.bus else { return };
        let event = EventResource {
            timestamp: Utc::now(),
            sender: SENDER.to_string(),
            action,
            ipv4,
            hwaddr: mac.to_string(),
            hostname: hostname.to_string(),
            duration,
        };
        if let Err(e) = bus.publish(topics::RESOURCE, &event) {
            warn!("Failed to publish resource event: {}", e);
        }
    }

    /// Process one packet; the reply, if any, goes back out the same
    /// interface
    pub async fn handle_packet(&self, iface: &str, packet: &DhcpPacket, now: DateTime<Utc>) -> Option<Reply> {
        if packet.op != packet::OP_REQUEST || packet.htype != 1 || packet.hlen != 6 {
            debug!("Ignoring non-client DHCP packet on {}", iface);
            return None;
        }

        let kind = self.iface_kind(iface);
        if kind == IfaceKind::Wan {
            // WAN-side requests are dropped silently
            return None;
        }

        let mac = packet.mac_string();
        self.note_entity(&mac, packet).await;
        let ring_name = self.classify(&mac, kind).await?;

        let Some(ring) = self.rings.get(&ring_name) else {
            warn!("Client {} classified into unconfigured ring {}", mac, ring_name);
            return None;
        };

        match packet.message_type() {
            Some(MessageType::Discover) => self.handle_discover(ring, &ring_name, &mac, packet, now).await,
            Some(MessageType::Request) => self.handle_request(ring, &ring_name, &mac, packet, now).await,
            Some(MessageType::Release) => {
                self.handle_release(ring, &mac, packet.ciaddr, false).await;
                None
            }
            Some(MessageType::Decline) => {
                self.handle_decline(ring, &mac).await;
                None
            }
            other => {
                debug!("Ignoring DHCP message {:?} from {}", other, mac);
                None
            }
        }
    }

    async fn handle_discover(
        &self,
        ring: &Mutex<RingHandler>,
        ring_name: &str,
        mac: &str,
        packet: &DhcpPacket,
        now: DateTime<Utc>,
    ) -> Option<Reply> {
        let mut ring = ring.lock().await;
        match ring.offer(mac, now) {
            Some(ip) => {
                info!("OFFER {} to {} (ring {})", ip, mac, ring_name);
                self.publish_resource(
                    ResourceAction::Provisioned,
                    ip,
                    mac,
                    packet.hostname().as_deref().unwrap_or(""),
                    Some(ring.duration_secs()),
                );
                Some(build_reply(&ring, packet, MessageType::Offer, Some(ip)))
            }
            None => {
                warn!("Ring {} exhausted; NAK to {}", ring_name, mac);
                Some(build_reply(&ring, packet, MessageType::Nak, None))
            }
        }
    }

    async fn handle_request(
        &self,
        ring: &Mutex<RingHandler>,
        ring_name: &str,
        mac: &str,
        packet: &DhcpPacket,
        now: DateTime<Utc>,
    ) -> Option<Reply> {
        let mut ring = ring.lock().await;

        // Requested address resolution order: held lease, option 50, ciaddr
        let req_ip = ring
            .live_ip_for_mac(mac, now)
            .or_else(|| packet.requested_ip())
            .or_else(|| (packet.ciaddr != Ipv4Addr::UNSPECIFIED).then_some(packet.ciaddr));

        // A server-identifier naming someone else is not ours to answer
        if let Some(server_id) = packet.server_identifier() {
            if server_id != ring.server_ip {
                debug!("REQUEST from {} names server {}; NAK", mac, server_id);
                return Some(build_reply(&ring, packet, MessageType::Nak, None));
            }
        }

        let Some(req_ip) = req_ip else {
            return Some(build_reply(&ring, packet, MessageType::Nak, None));
        };

        match ring.request(mac, req_ip, packet.hostname().as_deref(), now) {
            Some(claim) => {
                info!("ACK {} to {} (ring {})", claim.ipaddr, mac, ring_name);
                self.persist_claim(mac, &claim.hostname, claim.ipaddr, claim.expires).await;
                let duration = claim.expires.map(|_| ring.duration_secs());
                self.publish_resource(
                    ResourceAction::Claimed,
                    claim.ipaddr,
                    mac,
                    &claim.hostname,
                    duration,
                );
                Some(build_reply(&ring, packet, MessageType::Ack, Some(claim.ipaddr)))
            }
            None => {
                warn!("Invalid REQUEST for {} from {}; NAK", req_ip, mac);
                Some(build_reply(&ring, packet, MessageType::Nak, None))
            }
        }
    }

    async fn persist_claim(
        &self,
        mac: &str,
        hostname: &str,
        ip: Ipv4Addr,
        expires: Option<DateTime<Utc>>,
    ) {
        // Mirror locally even when the store is unreachable
        self.clients
            .apply_event(&crate::events::EventConfig {
                timestamp: Utc::now(),
                sender: SENDER.to_string(),
                change: crate::events::ConfigChange::Change,
                property: paths::client_prop(mac, "ipv4"),
                new_value: Some(ip.to_string()),
                expires,
            })
            .await;

        let Some(cfg) = &self.cfg else { return };
        if let Err(e) = cfg.set(&paths::client_prop(mac, "ipv4"), &ip.to_string(), expires).await {
            warn!("Failed to persist lease for {}: {}", mac, e);
        }
        if !hostname.is_empty() {
            if let Err(e) = cfg
                .set(&paths::client_prop(mac, "dhcp_name"), hostname, None)
                .await
            {
                warn!("Failed to persist dhcp_name for {}: {}", mac, e);
            }
        }
    }

    async fn handle_release(&self, ring: &Mutex<RingHandler>, mac: &str, ip: Ipv4Addr, force: bool) {
        let released = {
            let mut ring = ring.lock().await;
            ring.release(mac, ip, force)
        };
        if let Some(ip) = released {
            info!("RELEASE {} from {}", ip, mac);
            self.publish_resource(ResourceAction::Released, ip, mac, "", None);
            if let Some(cfg) = &self.cfg {
                if let Err(e) = cfg.delete(&paths::client_prop(mac, "ipv4")).await {
                    warn!("Failed to clear lease for {}: {}", mac, e);
                }
            }
        }
    }

    async fn handle_decline(&self, ring: &Mutex<RingHandler>, mac: &str) {
        let declined = {
            let mut ring = ring.lock().await;
            ring.decline(mac)
        };
        if let Some(ip) = declined {
            warn!("DECLINE of {} by {}", ip, mac);
            self.publish_resource(ResourceAction::Released, ip, mac, "", None);
        }
    }

    /// React to a property-store change: static assignment, expiry, or
    /// another daemon editing client state
    pub async fn handle_config_event(&self, event: &crate::events::EventConfig) {
        use crate::events::ConfigChange;

        let is_ipv4_change = event.change == ConfigChange::Change
            && event
                .property
                .strip_prefix("@/clients/")
                .and_then(|rest| rest.split_once('/'))
                .map(|(_, field)| field == "ipv4")
                .unwrap_or(false);

        if event.change == ConfigChange::Expire {
            // Lazy expiration: the slot is reclaimed at the next DISCOVER
            info!("Lease expired: {}", event.property);
            self.clients.apply_event(event).await;
            return;
        }

        let touched = self.clients.apply_event(event).await;

        if !is_ipv4_change {
            return;
        }
        let (Some(mac), Some(new_value)) = (touched, event.new_value.as_deref()) else {
            return;
        };
        let Ok(new_ip) = new_value.parse::<Ipv4Addr>() else {
            return;
        };

        let Some(ring_name) = self.clients.ring_of(&mac).await else {
            return;
        };
        let Some(ring) = self.rings.get(&ring_name) else {
            return;
        };

        let mut ring = ring.lock().await;
        if !ring.contains(new_ip) {
            debug!("Static address {} for {} outside ring {}", new_ip, mac, ring_name);
            return;
        }
        // No-op when the lease already matches (our own ACK writes)
        if ring.live_ip_for_mac(&mac, Utc::now()) == Some(new_ip) {
            return;
        }

        match ring.set_static(&mac, new_ip) {
            Ok(previous) => {
                info!("Static assignment {} -> {} (ring {})", mac, new_ip, ring_name);
                if let Some(old_ip) = previous {
                    self.publish_resource(ResourceAction::Released, old_ip, &mac, "", None);
                }
            }
            Err(e) => warn!("Static assignment {} -> {} rejected: {}", mac, new_ip, e),
        }
    }

    /// Bind one socket per distinct ring interface and serve forever
    pub async fn serve(self: Arc<Self>) -> GwctlResult<()> {
        let mut ifaces: Vec<String> = Vec::new();
        for ring in self.rings.values() {
            let iface = ring.lock().await.interface.clone();
            if !ifaces.contains(&iface) {
                ifaces.push(iface);
            }
        }

        let mut tasks = Vec::new();
        for iface in ifaces {
            let socket = bind_dhcp_socket(&iface)?;
            let server = self.clone();
            info!("DHCP listening on {} port 67", iface);
            tasks.push(tokio::spawn(async move {
                server.serve_socket(iface, socket).await;
            }));
        }

        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    async fn serve_socket(&self, iface: String, socket: UdpSocket) {
        let mut buf = vec![0u8; 1500];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("DHCP recv on {} failed: {}", iface, e);
                    continue;
                }
            };
            let packet = match DhcpPacket::parse(&buf[..len]) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Bad DHCP packet from {}: {}", src, e);
                    continue;
                }
            };

            if let Some(reply) = self.handle_packet(&iface, &packet, Utc::now()).await {
                let bytes = reply.packet.encode();
                if let Err(e) = socket.send_to(&bytes, SocketAddr::V4(reply.dest)).await {
                    warn!("DHCP send to {} failed: {}", reply.dest, e);
                }
            }
        }
    }
}

/// Build an OFFER/ACK/NAK for one ring
fn build_reply(
    ring: &RingHandler,
    request: &DhcpPacket,
    msg_type: MessageType,
    yiaddr: Option<Ipv4Addr>,
) -> Reply {
    let mut reply = request.reply_skeleton();
    reply.siaddr = ring.server_ip;
    reply.options.push(packet::opt_msg_type(msg_type));
    reply.options.push(packet::opt_ip(OPT_SERVER_ID, ring.server_ip));

    if msg_type != MessageType::Nak {
        if let Some(ip) = yiaddr {
            reply.yiaddr = ip;
        }
        reply.options.push(packet::opt_u32(OPT_LEASE_TIME, ring.duration_secs()));

        // Configuration options, in the client's requested order when
        // it sent a parameter request list
        let mut config_options = vec![
            packet::opt_ip(OPT_SUBNET_MASK, ring.subnet_mask()),
            packet::opt_ip(OPT_ROUTER, ring.server_ip),
            packet::opt_ip(OPT_DNS_SERVER, ring.name_server.unwrap_or(ring.server_ip)),
        ];
        let requested = request.param_request_list();
        if !requested.is_empty() {
            config_options.sort_by_key(|option| {
                requested
                    .iter()
                    .position(|&code| code == option.code)
                    .unwrap_or(usize::MAX)
            });
        }
        reply.options.extend(config_options);
    }

    let dest = reply_destination(request, msg_type, yiaddr);
    Reply { packet: reply, dest }
}

/// RFC 2131 §4.1 reply addressing, minus the relay cases we never see
fn reply_destination(
    request: &DhcpPacket,
    msg_type: MessageType,
    yiaddr: Option<Ipv4Addr>,
) -> SocketAddrV4 {
    if request.giaddr != Ipv4Addr::UNSPECIFIED {
        return SocketAddrV4::new(request.giaddr, 67);
    }
    if msg_type == MessageType::Nak || request.broadcast() {
        return SocketAddrV4::new(Ipv4Addr::BROADCAST, 68);
    }
    if request.ciaddr != Ipv4Addr::UNSPECIFIED {
        return SocketAddrV4::new(request.ciaddr, 68);
    }
    match yiaddr {
        Some(ip) => SocketAddrV4::new(ip, 68),
        None => SocketAddrV4::new(Ipv4Addr::BROADCAST, 68),
    }
}

/// Port-67 socket bound to one interface with broadcast enabled
fn bind_dhcp_socket(iface: &str) -> GwctlResult<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    #[cfg(target_os = "linux")]
    socket.bind_device(Some(iface.as_bytes()))?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 67)).into())?;
    socket.set_nonblocking(true)?;

    Ok(UdpSocket::from_std(socket.into())?)
}

/// Resolve the WAN interface from `@/network/wan_mac`
///
/// Two interfaces presenting the same MAC is a startup error.
pub fn wan_iface_for_mac(wan_mac: &str) -> GwctlResult<Option<String>> {
    let mut found: Option<String> = None;
    let entries = match std::fs::read_dir("/sys/class/net") {
        Ok(entries) => entries,
        Err(_) => return Ok(None),
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let address_path = format!("/sys/class/net/{}/address", name);
        if let Ok(mac) = std::fs::read_to_string(&address_path) {
            if mac.trim().eq_ignore_ascii_case(wan_mac) {
                if let Some(ref existing) = found {
                    return Err(GwctlError::ConfigError(format!(
                        "WAN MAC {} on both {} and {}", wan_mac, existing, name
                    )));
                }
                found = Some(name);
            }
        }
    }
    Ok(found)
}
