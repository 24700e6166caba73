//! DHCP end-to-end tests
//!
//! Full wiring: broker, in-memory property store, and the DHCP server
//! exchanging real packets, events, and store writes.

use chrono::Utc;
use libgwctl::bus::{decode_payload, Broker, BusClient};
use libgwctl::cfgapi::{paths, CfgClient, MemStore};
use libgwctl::dhcp::packet::{
    opt_ip, opt_msg_type, DhcpPacket, MessageType, OPT_REQUESTED_IP, OP_REQUEST,
};
use libgwctl::dhcp::server::{DhcpConfig, DhcpServer, RingDef};
use libgwctl::events::{topics, EventResource, ResourceAction};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

const MAC: &str = "aa:bb:cc:00:00:01";

fn ring_config() -> DhcpConfig {
    let mut rings = HashMap::new();
    rings.insert(
        "standard".to_string(),
        RingDef {
            subnet: "10.0.1.0/24".to_string(),
            interface: "wlan0".to_string(),
            lease_duration_minutes: 60,
        },
    );
    rings.insert(
        "unenrolled".to_string(),
        RingDef {
            subnet: "10.0.2.0/24".to_string(),
            interface: "wlan0".to_string(),
            lease_duration_minutes: 10,
        },
    );
    DhcpConfig { rings, name_server: None, domain: None }
}

fn packet(msg_type: MessageType, extra: Vec<libgwctl::dhcp::packet::DhcpOption>) -> DhcpPacket {
    let mut chaddr = [0u8; 16];
    chaddr[..6].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0, 0, 1]);
    let mut options = vec![opt_msg_type(msg_type)];
    options.extend(extra);
    DhcpPacket {
        op: OP_REQUEST,
        htype: 1,
        hlen: 6,
        hops: 0,
        xid: 7,
        secs: 0,
        flags: 0x8000,
        ciaddr: Ipv4Addr::UNSPECIFIED,
        yiaddr: Ipv4Addr::UNSPECIFIED,
        siaddr: Ipv4Addr::UNSPECIFIED,
        giaddr: Ipv4Addr::UNSPECIFIED,
        chaddr,
        options,
    }
}

struct Rig {
    server: Arc<DhcpServer>,
    cfg: CfgClient,
    broker_addr: String,
}

impl Rig {
    /// Fresh bus connection; the broker does not loop a publisher's
    /// frames back to its own subscriptions
    async fn watcher(&self) -> BusClient {
        BusClient::connect(&self.broker_addr, "watcher").await.unwrap()
    }
}

/// Broker + store + server, with config events feeding the server the
/// way dhcp4d wires them
async fn rig() -> Rig {
    let broker = Broker::bind("127.0.0.1:0").await.unwrap();
    let broker_addr = broker.local_addr().unwrap().to_string();
    tokio::spawn(broker.run());

    let store_bus = BusClient::connect(&broker_addr, "configd").await.unwrap();
    let store = MemStore::bind("127.0.0.1:0").await.unwrap().with_bus(store_bus);
    let store_addr = store.local_addr().unwrap().to_string();
    tokio::spawn(store.run());

    let bus = BusClient::connect(&broker_addr, "dhcp4d").await.unwrap();
    let cfg = CfgClient::new(&store_addr, "dhcp4d");

    let server = Arc::new(
        DhcpServer::new(&ring_config(), Some("eth0".to_string()))
            .unwrap()
            .with_bus(bus.clone())
            .with_cfg(cfg.clone()),
    );

    // Feed config events into the server like the daemon does
    {
        let server = server.clone();
        let mut config_rx = bus.subscribe(topics::CONFIG).await;
        tokio::spawn(async move {
            while let Some(envelope) = config_rx.recv().await {
                if let Ok(event) = decode_payload(&envelope) {
                    server.handle_config_event(&event).await;
                }
            }
        });
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    Rig { server, cfg, broker_addr }
}

#[tokio::test]
async fn test_first_contact_full_flow() {
    let rig = rig().await;
    let watcher = rig.watcher().await;
    let mut resource_rx = watcher.subscribe(topics::RESOURCE).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Client enrolled in standard so the flow lands in 10.0.1.0/24
    rig.server.clients().set_ring(MAC, "standard").await;

    let now = Utc::now();
    let offer = rig
        .server
        .handle_packet("wlan0", &packet(MessageType::Discover, vec![]), now)
        .await
        .expect("discover should be answered");
    assert_eq!(offer.packet.message_type(), Some(MessageType::Offer));
    let offered_ip = offer.packet.yiaddr;

    let ack = rig
        .server
        .handle_packet(
            "wlan0",
            &packet(MessageType::Request, vec![opt_ip(OPT_REQUESTED_IP, offered_ip)]),
            now,
        )
        .await
        .expect("request should be answered");
    assert_eq!(ack.packet.message_type(), Some(MessageType::Ack));
    assert_eq!(ack.packet.yiaddr, offered_ip);

    // Events arrive in lease-lifecycle order for this MAC
    let first: EventResource = decode_payload(
        &tokio::time::timeout(Duration::from_secs(5), resource_rx.recv())
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(first.action, ResourceAction::Provisioned);
    assert_eq!(first.hwaddr, MAC);

    let second: EventResource = decode_payload(
        &tokio::time::timeout(Duration::from_secs(5), resource_rx.recv())
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(second.action, ResourceAction::Claimed);
    assert_eq!(second.ipv4, offered_ip);

    // The lease landed in the property store with an expiry
    let stored = rig.cfg.get(&paths::client_prop(MAC, "ipv4")).await.unwrap();
    assert_eq!(stored, Some(offered_ip.to_string()));
}

#[tokio::test]
async fn test_static_override_via_store_write() {
    let rig = rig().await;
    rig.server.clients().set_ring(MAC, "standard").await;

    // Establish a dynamic lease first
    let now = Utc::now();
    let offer = rig
        .server
        .handle_packet("wlan0", &packet(MessageType::Discover, vec![]), now)
        .await
        .unwrap();
    let old_ip = offer.packet.yiaddr;
    rig.server
        .handle_packet(
            "wlan0",
            &packet(MessageType::Request, vec![opt_ip(OPT_REQUESTED_IP, old_ip)]),
            now,
        )
        .await
        .unwrap();

    // An operator writes a different in-range address
    rig.cfg
        .set(&paths::client_prop(MAC, "ipv4"), "10.0.1.50", None)
        .await
        .unwrap();

    // The event flows through the bus; the next REQUEST for .50 ACKs
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let target = Ipv4Addr::new(10, 0, 1, 50);
    let mut acked = false;
    while std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let reply = rig
            .server
            .handle_packet(
                "wlan0",
                &packet(MessageType::Request, vec![opt_ip(OPT_REQUESTED_IP, target)]),
                Utc::now(),
            )
            .await
            .unwrap();
        if reply.packet.message_type() == Some(MessageType::Ack) {
            assert_eq!(reply.packet.yiaddr, target);
            acked = true;
            break;
        }
    }
    assert!(acked, "static override should be claimable");
}

#[tokio::test]
async fn test_lease_recovery_across_restart() {
    let rig = rig().await;

    // A previous run left a static client in the store
    rig.cfg
        .set(&paths::client_prop(MAC, "ring"), "standard", None)
        .await
        .unwrap();
    rig.cfg
        .set(&paths::client_prop(MAC, "ipv4"), "10.0.1.40", None)
        .await
        .unwrap();
    rig.cfg
        .set(&paths::client_prop(MAC, "dhcp_name"), "printer", None)
        .await
        .unwrap();

    let recovered = rig.server.recover_leases().await.unwrap();
    assert_eq!(recovered, 1);

    // The recovered lease answers a REQUEST without a fresh DISCOVER
    let reply = rig
        .server
        .handle_packet(
            "wlan0",
            &packet(
                MessageType::Request,
                vec![opt_ip(OPT_REQUESTED_IP, Ipv4Addr::new(10, 0, 1, 40))],
            ),
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(reply.packet.message_type(), Some(MessageType::Ack));
}

#[tokio::test]
async fn test_exhausted_ring_naks_without_event() {
    let broker = Broker::bind("127.0.0.1:0").await.unwrap();
    let broker_addr = broker.local_addr().unwrap().to_string();
    tokio::spawn(broker.run());
    let bus = BusClient::connect(&broker_addr, "dhcp4d").await.unwrap();
    let watcher = BusClient::connect(&broker_addr, "watcher").await.unwrap();
    let mut resource_rx = watcher.subscribe(topics::RESOURCE).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A /30 ring holds exactly one usable slot
    let mut rings = HashMap::new();
    rings.insert(
        "standard".to_string(),
        RingDef {
            subnet: "10.0.9.0/30".to_string(),
            interface: "wlan0".to_string(),
            lease_duration_minutes: 60,
        },
    );
    let config = DhcpConfig { rings, name_server: None, domain: None };
    let server = Arc::new(DhcpServer::new(&config, None).unwrap().with_bus(bus));

    server.clients().set_ring(MAC, "standard").await;
    server.clients().set_ring("aa:bb:cc:00:00:02", "standard").await;

    let now = Utc::now();
    let first = server
        .handle_packet("wlan0", &packet(MessageType::Discover, vec![]), now)
        .await
        .unwrap();
    assert_eq!(first.packet.message_type(), Some(MessageType::Offer));

    // Second client gets a NAK and no PROVISIONED event
    let mut second_packet = packet(MessageType::Discover, vec![]);
    second_packet.chaddr[5] = 2;
    let second = server.handle_packet("wlan0", &second_packet, now).await.unwrap();
    assert_eq!(second.packet.message_type(), Some(MessageType::Nak));

    // Only the first client's event is on the bus
    let event: EventResource = decode_payload(
        &tokio::time::timeout(Duration::from_secs(5), resource_rx.recv())
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(event.hwaddr, MAC);
    let nothing = tokio::time::timeout(Duration::from_millis(300), resource_rx.recv()).await;
    assert!(nothing.is_err(), "NAK must not publish a resource event");
}
