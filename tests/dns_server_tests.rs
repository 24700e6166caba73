//! DNS end-to-end tests
//!
//! Local authority, upstream splicing against a fake resolver, and the
//! TCP framing path.

use hickory_proto::op::{Message, MessageType as DnsMessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use libgwctl::cfgapi::{paths, CfgClient, MemStore};
use libgwctl::clients::ClientMap;
use libgwctl::dhcp::server::{DhcpConfig, RingDef};
use libgwctl::dns::blocklist::Blocklist;
use libgwctl::dns::server::DnsServer;
use libgwctl::events::{ConfigChange, EventConfig};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

const DOMAIN: &str = "7410.brightgate.net";

fn dhcp_config() -> DhcpConfig {
    let mut rings = HashMap::new();
    rings.insert(
        "standard".to_string(),
        RingDef {
            subnet: "10.0.1.0/24".to_string(),
            interface: "wlan0".to_string(),
            lease_duration_minutes: 60,
        },
    );
    DhcpConfig { rings, name_server: None, domain: None }
}

fn query(name: &str, qtype: RecordType) -> Message {
    let mut message = Message::new();
    message.set_id(4242).set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
    message
}

async fn seeded_clients() -> ClientMap {
    let clients = ClientMap::new();
    clients
        .apply_event(&EventConfig {
            timestamp: chrono::Utc::now(),
            sender: "test".to_string(),
            change: ConfigChange::Change,
            property: "@/clients/aa:bb:cc:00:00:01/ipv4".to_string(),
            new_value: Some("10.0.1.15".to_string()),
            expires: None,
        })
        .await;
    clients
        .apply_event(&EventConfig {
            timestamp: chrono::Utc::now(),
            sender: "test".to_string(),
            change: ConfigChange::Change,
            property: "@/clients/aa:bb:cc:00:00:01/dns_name".to_string(),
            new_value: Some("laptop".to_string()),
            expires: None,
        })
        .await;
    clients.set_ring("aa:bb:cc:00:00:01", "standard").await;
    clients
}

/// Fake upstream answering every A query with a fixed address
async fn fake_upstream(answer: Ipv4Addr) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else { return };
            let Ok(request) = Message::from_vec(&buf[..len]) else { continue };
            let mut response = Message::new();
            response
                .set_id(request.id())
                .set_message_type(DnsMessageType::Response)
                .set_recursion_available(true);
            for q in request.queries() {
                response.add_query(q.clone());
                response.add_answer(Record::from_rdata(
                    q.name().clone(),
                    60,
                    RData::A(A::from(answer)),
                ));
            }
            let _ = socket.send_to(&response.to_vec().unwrap(), src).await;
        }
    });
    addr
}

#[tokio::test]
async fn test_local_names_never_go_upstream() {
    // An upstream that answers 9.9.9.9; local names must not see it
    let upstream = fake_upstream(Ipv4Addr::new(9, 9, 9, 9)).await;
    let server = DnsServer::new(
        DOMAIN,
        &dhcp_config(),
        Blocklist::new("/nonexistent"),
        seeded_clients().await,
        upstream,
    )
    .unwrap();
    server.import_clients().await;

    let src: SocketAddr = "10.0.1.15:5353".parse().unwrap();
    let response = server
        .handle_query(src, &query("laptop.7410.brightgate.net.", RecordType::A))
        .await;

    assert!(response.authoritative());
    match response.answers()[0].data().unwrap() {
        RData::A(a) => assert_eq!(Ipv4Addr::from(*a), Ipv4Addr::new(10, 0, 1, 15)),
        other => panic!("expected A, got {:?}", other),
    }
}

#[tokio::test]
async fn test_external_names_spliced_from_upstream() {
    let upstream = fake_upstream(Ipv4Addr::new(93, 184, 216, 34)).await;
    let server = DnsServer::new(
        DOMAIN,
        &dhcp_config(),
        Blocklist::new("/nonexistent"),
        seeded_clients().await,
        upstream,
    )
    .unwrap();

    let src: SocketAddr = "10.0.1.15:5353".parse().unwrap();
    let request = query("example.com.", RecordType::A);
    let response = server.handle_query(src, &request).await;

    // The answer is spliced back under the original transaction id
    assert_eq!(response.id(), request.id());
    match response.answers()[0].data().unwrap() {
        RData::A(a) => assert_eq!(Ipv4Addr::from(*a), Ipv4Addr::new(93, 184, 216, 34)),
        other => panic!("expected A, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_upstream_servfails() {
    let server = DnsServer::new(
        DOMAIN,
        &dhcp_config(),
        Blocklist::new("/nonexistent"),
        seeded_clients().await,
        "127.0.0.1:1".parse().unwrap(),
    )
    .unwrap();

    let src: SocketAddr = "10.0.1.15:5353".parse().unwrap();
    let response = server.handle_query(src, &query("example.com.", RecordType::A)).await;
    assert_eq!(response.response_code(), ResponseCode::ServFail);
}

#[tokio::test]
async fn test_blocklist_reload_via_config_event() {
    use std::io::Write;
    let dir = tempfile::tempdir().unwrap();
    let blocklist_path = dir.path().join("blocklist");
    std::fs::write(&blocklist_path, "").unwrap();

    let upstream = fake_upstream(Ipv4Addr::new(9, 9, 9, 9)).await;
    let blocklist = Blocklist::new(&blocklist_path);
    blocklist.reload().await.unwrap();
    let server = DnsServer::new(DOMAIN, &dhcp_config(), blocklist, seeded_clients().await, upstream)
        .unwrap();

    let src: SocketAddr = "10.0.1.15:5353".parse().unwrap();

    // Initially unblocked: answered from upstream
    let response = server.handle_query(src, &query("phish.example.", RecordType::A)).await;
    match response.answers()[0].data().unwrap() {
        RData::A(a) => assert_eq!(Ipv4Addr::from(*a), Ipv4Addr::new(9, 9, 9, 9)),
        other => panic!("expected A, got {:?}", other),
    }

    // The ingest pipeline rewrites the file and pokes the trigger
    let mut file = std::fs::File::create(&blocklist_path).unwrap();
    writeln!(file, "phish.example").unwrap();
    drop(file);
    server
        .handle_config_event(&EventConfig {
            timestamp: chrono::Utc::now(),
            sender: "updated".to_string(),
            change: ConfigChange::Change,
            property: paths::BLOCKLIST_UPDATE.to_string(),
            new_value: Some("1".to_string()),
            expires: None,
        })
        .await;

    // Now intercepted with the ring router
    let response = server.handle_query(src, &query("phish.example.", RecordType::A)).await;
    match response.answers()[0].data().unwrap() {
        RData::A(a) => assert_eq!(Ipv4Addr::from(*a), Ipv4Addr::new(10, 0, 1, 1)),
        other => panic!("expected A, got {:?}", other),
    }
}

#[tokio::test]
async fn test_udp_listener_answers_on_the_wire() {
    let server = Arc::new(
        DnsServer::new(
            DOMAIN,
            &dhcp_config(),
            Blocklist::new("/nonexistent"),
            seeded_clients().await,
            "127.0.0.1:1".parse().unwrap(),
        )
        .unwrap(),
    );
    server.import_clients().await;

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let udp_addr = udp.local_addr().unwrap();
    let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    tokio::spawn(server.serve_with(udp, tcp));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = query("laptop.7410.brightgate.net.", RecordType::A);
    client.send_to(&request.to_vec().unwrap(), udp_addr).await.unwrap();

    let mut buf = vec![0u8; 512];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = Message::from_vec(&buf[..len]).unwrap();
    assert_eq!(response.id(), request.id());
    assert_eq!(response.answers().len(), 1);
}

#[tokio::test]
async fn test_tcp_listener_frames_correctly() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let server = Arc::new(
        DnsServer::new(
            DOMAIN,
            &dhcp_config(),
            Blocklist::new("/nonexistent"),
            seeded_clients().await,
            "127.0.0.1:1".parse().unwrap(),
        )
        .unwrap(),
    );
    server.import_clients().await;

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tcp_addr = tcp.local_addr().unwrap();
    tokio::spawn(server.serve_with(udp, tcp));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut stream = tokio::net::TcpStream::connect(tcp_addr).await.unwrap();
    let request = query("laptop.7410.brightgate.net.", RecordType::A);
    let bytes = request.to_vec().unwrap();
    stream.write_all(&(bytes.len() as u16).to_be_bytes()).await.unwrap();
    stream.write_all(&bytes).await.unwrap();

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();

    let response = Message::from_vec(&body).unwrap();
    assert_eq!(response.id(), request.id());
    assert_eq!(response.answers().len(), 1);
}

#[tokio::test]
async fn test_hostmap_built_from_store_import() {
    let store = MemStore::bind("127.0.0.1:0").await.unwrap();
    let store_addr = store.local_addr().unwrap().to_string();
    tokio::spawn(store.run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cfg = CfgClient::new(&store_addr, "test");
    let mac = "aa:bb:cc:00:00:05";
    cfg.set(&paths::client_prop(mac, "ipv4"), "10.0.1.22", None).await.unwrap();
    cfg.set(&paths::client_prop(mac, "dns_name"), "camera", None).await.unwrap();
    cfg.set(&paths::client_prop(mac, "ring"), "standard", None).await.unwrap();

    let clients = ClientMap::new();
    clients.import(&cfg).await.unwrap();

    let server = Arc::new(
        DnsServer::new(
            DOMAIN,
            &dhcp_config(),
            Blocklist::new("/nonexistent"),
            clients,
            "127.0.0.1:1".parse().unwrap(),
        )
        .unwrap(),
    );
    assert_eq!(server.import_clients().await, 1);

    let src: SocketAddr = "10.0.1.22:5353".parse().unwrap();
    let response = server
        .handle_query(src, &query("camera.7410.brightgate.net.", RecordType::A))
        .await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 1);
}
