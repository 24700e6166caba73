//! DNS serving
//!
//! Two handlers behind one entry point: the local handler answers
//! authoritatively for the site domain (client host map, CNAMEs, and
//! the per-ring override names); the proxy handler intercepts
//! blocklisted names and forwards everything else upstream. UDP and
//! TCP listeners run in parallel on port 53.

use crate::bus::BusClient;
use crate::clients::ClientMap;
use crate::dhcp::server::DhcpConfig;
use crate::dhcp::ring::parse_cidr;
use crate::dns::blocklist::Blocklist;
use crate::dns::hostmap::{parse_reverse_name, HostMap, RecType};
use crate::error::{GwctlError, GwctlResult};
use crate::events::{topics, EventException, ExceptionReason};
use chrono::Utc;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, CNAME, PTR, SOA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Daemon name used as event sender
const SENDER: &str = "dns4d";

/// Answer TTL for local-zone records
const LOCAL_TTL: u32 = 300;

/// UDP payload ceiling before truncation
const MAX_UDP_REPLY: usize = 512;

/// Upstream query deadline
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);

/// Rate limit window for exception events and unknown-source warnings
const RATE_LIMIT: Duration = Duration::from_secs(3600);

pub struct DnsServer {
    hostmap: HostMap,
    blocklist: Blocklist,
    clients: ClientMap,
    /// ring name -> router address
    ring_routers: HashMap<String, Ipv4Addr>,
    /// ring subnets for local PTR detection
    ring_subnets: Vec<(Ipv4Addr, u8)>,
    upstream: RwLock<SocketAddr>,
    bus: Option<BusClient>,
    /// (mac, hostname) -> last exception published
    exception_times: Mutex<HashMap<(String, String), Instant>>,
    /// unknown source -> last warning
    unknown_sources: Mutex<HashMap<IpAddr, Instant>>,
}

impl DnsServer {
    pub fn new(
        domain: &str,
        dhcp_config: &DhcpConfig,
        blocklist: Blocklist,
        clients: ClientMap,
        upstream: SocketAddr,
    ) -> GwctlResult<Self> {
        let mut ring_routers = HashMap::new();
        let mut ring_subnets = Vec::new();
        for (name, def) in &dhcp_config.rings {
            let (base, prefix) = parse_cidr(&def.subnet)?;
            ring_routers.insert(name.clone(), Ipv4Addr::from(u32::from(base) + 1));
            ring_subnets.push((base, prefix));
        }

        Ok(Self {
            hostmap: HostMap::new(domain),
            blocklist,
            clients,
            ring_routers,
            ring_subnets,
            upstream: RwLock::new(upstream),
            bus: None,
            exception_times: Mutex::new(HashMap::new()),
            unknown_sources: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_bus(mut self, bus: BusClient) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn hostmap(&self) -> &HostMap {
        &self.hostmap
    }

    /// Build the host map from the current client set
    pub async fn import_clients(&self) -> usize {
        let clients = self.clients.snapshot().await;
        let count = self.hostmap.import_clients(&clients).await;
        info!("Host map imported {} clients", count);
        count
    }

    /// Whether an address falls in any configured ring subnet
    fn is_local_subnet(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        self.ring_subnets.iter().any(|(base, prefix)| {
            let mask = if *prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            (addr & mask) == u32::from(*base)
        })
    }

    /// Router address for the querying client's ring
    async fn router_for(&self, src: IpAddr) -> Option<Ipv4Addr> {
        let IpAddr::V4(src_v4) = src else { return None };
        let record = self.clients.get_by_ip(src_v4).await?;
        let ring = record.ring?;
        self.ring_routers.get(&ring).copied()
    }

    /// Log unknown sources at most once per hour each
    async fn note_unknown_source(&self, src: IpAddr) {
        let mut sources = self.unknown_sources.lock().await;
        let now = Instant::now();
        match sources.get(&src) {
            Some(last) if now.duration_since(*last) < RATE_LIMIT => {}
            _ => {
                sources.insert(src, now);
                warn!("DNS query from unknown client {}", src);
            }
        }
    }

    /// Publish a blocklist exception, rate-limited per (mac, hostname)
    async fn publish_exception(&self, src: IpAddr, hostname: &str) {
        let IpAddr::V4(src_v4) = src else { return };
        let mac = match self.clients.get_by_ip(src_v4).await {
            Some(record) => record.mac,
            None => return,
        };

        let key = (mac.clone(), hostname.to_string());
        {
            let mut times = self.exception_times.lock().await;
            let now = Instant::now();
            if let Some(last) = times.get(&key) {
                if now.duration_since(*last) < RATE_LIMIT {
                    return;
                }
            }
            times.insert(key, now);
        }

        info!("Blocked {} for {} ({})", hostname, mac, src);
        let Some(bus) = &self.bus else { return };
        let event = EventException {
            timestamp: Utc::now(),
            sender: SENDER.to_string(),
            reason: ExceptionReason::PhishingAddress,
            mac: Some(mac),
            ipv4: Some(src_v4),
            details: hostname.to_string(),
        };
        if let Err(e) = bus.publish(topics::EXCEPTION, &event) {
            warn!("Failed to publish exception event: {}", e);
        }
    }

    /// Answer one query; every well-formed request gets a response
    pub async fn handle_query(&self, src: SocketAddr, request: &Message) -> Message {
        let mut response = base_response(request);

        let Some(query) = request.queries().first() else {
            response.set_response_code(ResponseCode::FormErr);
            return response;
        };
        if request.op_code() != OpCode::Query {
            response.set_response_code(ResponseCode::NotImp);
            return response;
        }

        let mut qname = query.name().to_string().to_ascii_lowercase();
        if !qname.ends_with('.') {
            qname.push('.');
        }
        let qtype = query.query_type();

        if self.clients.get_by_ip(match src.ip() {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        }).await.is_none()
        {
            self.note_unknown_source(src.ip()).await;
        }

        if self.hostmap.in_domain(&qname) {
            self.answer_local(&mut response, src, &qname, qtype).await;
        } else {
            self.answer_proxy(&mut response, request, src, &qname, qtype).await;
        }
        response
    }

    /// Authoritative handler for the site domain
    async fn answer_local(
        &self,
        response: &mut Message,
        src: SocketAddr,
        qname: &str,
        qtype: RecordType,
    ) {
        response.set_authoritative(true);

        // Override names resolve to the client's ring router
        if self.hostmap.is_override(qname) {
            if let Some(router) = self.router_for(src.ip()).await {
                if matches!(qtype, RecordType::A | RecordType::ANY) {
                    push_a(response, qname, router);
                }
                return;
            }
            // Unknown client falls through to the regular map
        }

        let Some(record) = self.hostmap.lookup(qname).await else {
            response.set_response_code(ResponseCode::NXDomain);
            push_soa(response, self.hostmap.domain());
            return;
        };

        match (record.rectype, qtype) {
            (RecType::A, RecordType::A | RecordType::ANY) => {
                if let Ok(ip) = record.value.parse::<Ipv4Addr>() {
                    push_a(response, qname, ip);
                }
            }
            (RecType::Ptr, RecordType::PTR | RecordType::ANY) => {
                push_name_record(response, qname, RecordType::PTR, &record.value);
            }
            (RecType::Cname, _) => {
                push_name_record(response, qname, RecordType::CNAME, &record.value);
                // Chase the target when the client wanted an address
                if matches!(qtype, RecordType::A | RecordType::ANY) {
                    if let Some(target) = self.hostmap.lookup(&record.value).await {
                        if target.rectype == RecType::A {
                            if let Ok(ip) = target.value.parse::<Ipv4Addr>() {
                                push_a(response, &record.value, ip);
                            }
                        }
                    }
                }
            }
            _ => {
                // Name exists with a different type: NOERROR, no answers
            }
        }
    }

    /// Recursive proxy with blocklist interception
    async fn answer_proxy(
        &self,
        response: &mut Message,
        request: &Message,
        src: SocketAddr,
        qname: &str,
        qtype: RecordType,
    ) {
        // Blocked names short-circuit before any upstream traffic
        if self.blocklist.blocked(qname).await {
            let hostname = qname.trim_end_matches('.').to_string();
            if let Some(router) = self.router_for(src.ip()).await {
                if matches!(qtype, RecordType::A | RecordType::ANY) {
                    push_a(response, qname, router);
                }
                self.publish_exception(src.ip(), &hostname).await;
            } else {
                response.set_response_code(ResponseCode::NXDomain);
            }
            return;
        }

        // Reverse lookups for our own subnets are answered locally
        if qtype == RecordType::PTR {
            if let Some(ip) = parse_reverse_name(qname) {
                if self.is_local_subnet(ip) {
                    match self.hostmap.lookup(qname).await {
                        Some(record) if record.rectype == RecType::Ptr => {
                            push_name_record(response, qname, RecordType::PTR, &record.value);
                        }
                        _ => {
                            response.set_response_code(ResponseCode::NXDomain);
                        }
                    }
                    return;
                }
            }
        }

        match self.forward_upstream(request).await {
            Ok(mut upstream_response) => {
                upstream_response.set_id(request.id());
                *response = upstream_response;
            }
            Err(e) => {
                warn!("Upstream query for {} failed: {}", qname, e);
                response.set_response_code(ResponseCode::ServFail);
            }
        }
    }

    /// Forward a request verbatim and return the spliced answer
    async fn forward_upstream(&self, request: &Message) -> GwctlResult<Message> {
        let upstream = *self.upstream.read().await;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let bytes = request
            .to_vec()
            .map_err(|e| GwctlError::ParseError(e.to_string()))?;
        socket.send_to(&bytes, upstream).await?;

        let mut buf = vec![0u8; 4096];
        let (len, _) = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| GwctlError::Timeout(format!("upstream {}", upstream)))??;

        Message::from_vec(&buf[..len]).map_err(|e| GwctlError::ParseError(e.to_string()))
    }

    /// React to property-store changes affecting DNS state
    pub async fn handle_config_event(&self, event: &crate::events::EventConfig) {
        use crate::cfgapi::paths;
        use crate::events::ConfigChange;

        if let Some(mac) = self.clients.apply_event(event).await {
            let record = self.clients.get(&mac).await;
            self.hostmap.update_client(&mac, record.as_ref()).await;
            return;
        }

        if let Some(name) = event.property.strip_prefix("@/dns/cnames/") {
            match event.change {
                ConfigChange::Change => {
                    self.hostmap.update_cname(name, event.new_value.as_deref()).await;
                }
                ConfigChange::Delete | ConfigChange::Expire => {
                    self.hostmap.update_cname(name, None).await;
                }
            }
            return;
        }

        if event.property == paths::BLOCKLIST_UPDATE {
            if let Err(e) = self.blocklist.reload().await {
                warn!("Blocklist reload failed: {}", e);
            }
            return;
        }

        if event.property == paths::DNS_SERVER {
            if let Some(raw) = event.new_value.as_deref() {
                let parsed = raw
                    .parse::<SocketAddr>()
                    .or_else(|_| raw.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, 53)));
                match parsed {
                    Ok(addr) => {
                        info!("Upstream resolver changed to {}", addr);
                        *self.upstream.write().await = addr;
                    }
                    Err(_) => warn!("Ignoring bad upstream resolver: {}", raw),
                }
            }
        }
    }

    /// Run UDP and TCP listeners until shutdown
    pub async fn serve(self: Arc<Self>, bind_addr: &str) -> GwctlResult<()> {
        let udp = UdpSocket::bind(bind_addr).await?;
        let tcp = TcpListener::bind(bind_addr).await?;
        info!("DNS listening on {} (udp+tcp)", bind_addr);
        self.serve_with(udp, tcp).await
    }

    /// Serve on pre-bound sockets
    pub async fn serve_with(self: Arc<Self>, udp: UdpSocket, tcp: TcpListener) -> GwctlResult<()> {
        let udp_server = self.clone();
        let udp_task = tokio::spawn(async move {
            udp_server.serve_udp(udp).await;
        });
        let tcp_server = self;
        let tcp_task = tokio::spawn(async move {
            tcp_server.serve_tcp(tcp).await;
        });

        let _ = tokio::join!(udp_task, tcp_task);
        Ok(())
    }

    async fn serve_udp(self: Arc<Self>, socket: UdpSocket) {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("DNS udp recv failed: {}", e);
                    continue;
                }
            };
            let request = match Message::from_vec(&buf[..len]) {
                Ok(m) => m,
                Err(e) => {
                    debug!("Bad DNS message from {}: {}", src, e);
                    continue;
                }
            };

            let server = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                let response = server.handle_query(src, &request).await;
                match encode_udp_response(&response) {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, src).await {
                            warn!("DNS udp send to {} failed: {}", src, e);
                        }
                    }
                    Err(e) => warn!("DNS encode failed: {}", e),
                }
            });
        }
    }

    async fn serve_tcp(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (mut stream, src) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("DNS tcp accept failed: {}", e);
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                loop {
                    let mut len_buf = [0u8; 2];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let len = u16::from_be_bytes(len_buf) as usize;
                    let mut body = vec![0u8; len];
                    if stream.read_exact(&mut body).await.is_err() {
                        return;
                    }
                    let request = match Message::from_vec(&body) {
                        Ok(m) => m,
                        Err(e) => {
                            debug!("Bad DNS tcp message from {}: {}", src, e);
                            return;
                        }
                    };

                    let response = server.handle_query(src, &request).await;
                    let Ok(bytes) = response.to_vec() else { return };
                    if stream.write_all(&(bytes.len() as u16).to_be_bytes()).await.is_err() {
                        return;
                    }
                    if stream.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
            });
        }
    }
}

/// Response skeleton mirroring the request's id, query, and RD flag
fn base_response(request: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response
}

fn push_a(response: &mut Message, name: &str, ip: Ipv4Addr) {
    if let Ok(name) = Name::from_str(name) {
        response.add_answer(Record::from_rdata(name, LOCAL_TTL, RData::A(A::from(ip))));
    }
}

fn push_name_record(response: &mut Message, name: &str, rtype: RecordType, target: &str) {
    let (Ok(name), Ok(target)) = (Name::from_str(name), Name::from_str(target)) else {
        return;
    };
    let rdata = match rtype {
        RecordType::PTR => RData::PTR(PTR(target)),
        RecordType::CNAME => RData::CNAME(CNAME(target)),
        _ => return,
    };
    response.add_answer(Record::from_rdata(name, LOCAL_TTL, rdata));
}

/// Negative-answer SOA for the local zone
fn push_soa(response: &mut Message, domain: &str) {
    let (Ok(zone), Ok(mname), Ok(rname)) = (
        Name::from_str(&format!("{}.", domain)),
        Name::from_str(&format!("gateway.{}.", domain)),
        Name::from_str(&format!("admin.{}.", domain)),
    ) else {
        return;
    };
    let soa = SOA::new(mname, rname, 1, 3600, 600, 86400, LOCAL_TTL);
    response.add_name_server(Record::from_rdata(zone, LOCAL_TTL, RData::SOA(soa)));
}

/// Encode for UDP, truncating over the 512-byte ceiling
fn encode_udp_response(response: &Message) -> GwctlResult<Vec<u8>> {
    let bytes = response
        .to_vec()
        .map_err(|e| GwctlError::ParseError(e.to_string()))?;
    if bytes.len() <= MAX_UDP_REPLY {
        return Ok(bytes);
    }

    // Strip answers and signal TC so the client retries over TCP
    let mut truncated = response.clone();
    truncated.take_answers();
    truncated.take_name_servers();
    truncated.take_additionals();
    truncated.set_truncated(true);
    truncated
        .to_vec()
        .map_err(|e| GwctlError::ParseError(e.to_string()))
}
