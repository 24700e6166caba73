//! CTL protocol and CLI tests

use assert_cmd::Command;
use libgwctl::config::NodeMode;
use libgwctl::mcp::api::{
    read_response, write_request, McpCode, McpOp, McpRequest, CTL_VERSION,
};
use libgwctl::mcp::daemon::DaemonDef;
use libgwctl::mcp::{bind_ctl, Mcp};
use predicates::prelude::*;
use std::sync::Arc;
use tokio::net::TcpStream;

fn sleeper(name: &str) -> DaemonDef {
    DaemonDef {
        name: name.to_string(),
        binary: "/bin/sleep".to_string(),
        args: vec!["60".to_string()],
        modes: vec![NodeMode::Core],
        depends_on: None,
        privileged: true,
        mem_warn_mb: None,
        mem_kill_mb: None,
        soft_timeout_ms: 500,
        failures_allowed: 10,
    }
}

async fn served() -> (Arc<Mcp>, String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mcp = Mcp::new(
        "test-node",
        NodeMode::Gateway,
        vec![sleeper("dhcp4d"), sleeper("dns4d")],
        dir.path().join("mcp.online"),
        None,
        None,
    )
    .await
    .unwrap();
    let listener = bind_ctl("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(mcp.clone().serve_ctl(listener));
    (mcp, addr, dir)
}

#[tokio::test]
async fn test_bad_version_rejected_on_the_wire() {
    let (_mcp, addr, _dir) = served().await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    let request = McpRequest {
        version: CTL_VERSION + 7,
        sender: "time-traveller".to_string(),
        op: McpOp::Ping,
    };
    write_request(&mut stream, &request).await.unwrap();
    let response = read_response(&mut stream).await.unwrap();
    assert_eq!(response.code, McpCode::BadVersion);
}

#[tokio::test]
async fn test_multiple_requests_per_connection() {
    let (_mcp, addr, _dir) = served().await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    for _ in 0..3 {
        let request = McpRequest {
            version: CTL_VERSION,
            sender: "gwcli".to_string(),
            op: McpOp::Ping,
        };
        write_request(&mut stream, &request).await.unwrap();
        let response = read_response(&mut stream).await.unwrap();
        assert_eq!(response.code, McpCode::Ok);
    }
}

#[tokio::test]
async fn test_gwcli_ping_and_status() {
    let (_mcp, addr, _dir) = served().await;

    // The binary runs in its own process against our in-test server
    let addr_clone = addr.clone();
    tokio::task::spawn_blocking(move || {
        Command::cargo_bin("gwcli")
            .unwrap()
            .args(["--ctl", &addr_clone, "ping"])
            .assert()
            .success()
            .stdout(predicate::str::contains("alive"));
    })
    .await
    .unwrap();

    tokio::task::spawn_blocking(move || {
        Command::cargo_bin("gwcli")
            .unwrap()
            .args(["--ctl", &addr, "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("dhcp4d"))
            .stdout(predicate::str::contains("dns4d"))
            .stdout(predicate::str::contains("OFFLINE"));
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_gwcli_unknown_daemon_fails() {
    let (_mcp, addr, _dir) = served().await;

    tokio::task::spawn_blocking(move || {
        Command::cargo_bin("gwcli")
            .unwrap()
            .args(["--ctl", &addr, "status", "ghost"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("ghost"));
    })
    .await
    .unwrap();
}

#[test]
fn test_gwcli_refuses_unreachable_mcp() {
    Command::cargo_bin("gwcli")
        .unwrap()
        .args(["--ctl", "127.0.0.1:1", "ping"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
}
