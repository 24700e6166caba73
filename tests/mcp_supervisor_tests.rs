//! MCP supervisor integration tests
//!
//! End-to-end scenarios driven over the CTL channel: dependency
//! gating, failure budgets and failsafe mode, autostart persistence.

use libgwctl::config::NodeMode;
use libgwctl::mcp::api::{CtlClient, DaemonCommand, TARGET_ALL};
use libgwctl::mcp::daemon::{DaemonDef, DaemonState};
use libgwctl::mcp::{bind_ctl, Mcp};
use serial_test::serial;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn def(name: &str, binary: &str, args: &[&str], depends_on: Option<&str>) -> DaemonDef {
    DaemonDef {
        name: name.to_string(),
        binary: binary.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        modes: vec![NodeMode::Core],
        depends_on: depends_on.map(|s| s.to_string()),
        privileged: true,
        mem_warn_mb: None,
        mem_kill_mb: None,
        soft_timeout_ms: 500,
        failures_allowed: 10,
    }
}

async fn served(defs: Vec<DaemonDef>, dir: &Path) -> (Arc<Mcp>, CtlClient) {
    let mcp = Mcp::new(
        "test-node",
        NodeMode::Gateway,
        defs,
        dir.join("mcp.online"),
        None,
        None,
    )
    .await
    .unwrap();
    let listener = bind_ctl("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(mcp.clone().serve_ctl(listener));
    (mcp, CtlClient::new(&addr, "gwcli"))
}

async fn state_of(client: &CtlClient, name: &str) -> DaemonState {
    client.get(name, false).await.unwrap()[0].state
}

async fn wait_for(client: &CtlClient, name: &str, state: DaemonState, max: Duration) -> bool {
    let deadline = Instant::now() + max;
    while Instant::now() < deadline {
        if state_of(client, name).await == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// The daemon binary in these tests is a shell that self-reports
/// nothing, so ONLINE is simulated through the CTL SET path the real
/// daemons use.
async fn self_report(addr: &str, name: &str, state: DaemonState) {
    let client = CtlClient::new(addr, name);
    client.set_state(state).await.unwrap();
}

#[tokio::test]
async fn test_dependency_gating_via_ctl() {
    let dir = tempfile::tempdir().unwrap();
    let defs = vec![
        def("a", "/bin/sleep", &["60"], None),
        def("b", "/bin/sleep", &["60"], Some("a")),
    ];
    let (mcp, client) = served(defs, dir.path()).await;
    let addr = client.addr().to_string();

    // Starting the dependent alone blocks it without a fork
    client.do_command("b", DaemonCommand::Start).await.unwrap();
    assert!(wait_for(&client, "b", DaemonState::Blocked, Duration::from_secs(3)).await);
    assert!(client.get("b", false).await.unwrap()[0].pid.is_none());

    // Starting the dependency unblocks it
    client.do_command("a", DaemonCommand::Start).await.unwrap();
    assert!(wait_for(&client, "a", DaemonState::Starting, Duration::from_secs(3)).await);
    self_report(&addr, "a", DaemonState::Online).await;
    assert!(wait_for(&client, "a", DaemonState::Online, Duration::from_secs(3)).await);
    assert!(wait_for(&client, "b", DaemonState::Starting, Duration::from_secs(5)).await);
    self_report(&addr, "b", DaemonState::Online).await;
    assert!(wait_for(&client, "b", DaemonState::Online, Duration::from_secs(3)).await);

    mcp.shutdown().await;
}

#[tokio::test]
async fn test_stop_all_brings_everything_down() {
    let dir = tempfile::tempdir().unwrap();
    let defs = vec![
        def("a", "/bin/sleep", &["60"], None),
        def("b", "/bin/sleep", &["60"], None),
    ];
    let (mcp, client) = served(defs, dir.path()).await;

    client.do_command(TARGET_ALL, DaemonCommand::Start).await.unwrap();
    assert!(wait_for(&client, "a", DaemonState::Starting, Duration::from_secs(3)).await);
    assert!(wait_for(&client, "b", DaemonState::Starting, Duration::from_secs(3)).await);

    client.do_command(TARGET_ALL, DaemonCommand::Stop).await.unwrap();
    assert!(wait_for(&client, "a", DaemonState::Offline, Duration::from_secs(5)).await);
    assert!(wait_for(&client, "b", DaemonState::Offline, Duration::from_secs(5)).await);

    mcp.shutdown().await;
}

// Timing-sensitive: many short-lived children with per-failure back-offs
#[tokio::test]
#[serial]
async fn test_failure_budget_failsafe_then_broken() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("failsafe-seen");
    // Exits immediately, recording whether the failsafe env was set
    let script = format!(
        "if [ -n \"$GW_FAILSAFE\" ]; then echo 1 >> {}; fi; exit 1",
        marker.display()
    );
    let mut flapper = def("flapper", "/bin/sh", &["-c", &script], None);
    flapper.failures_allowed = 4;
    let (mcp, client) = served(vec![flapper], dir.path()).await;

    client.do_command("flapper", DaemonCommand::Start).await.unwrap();

    // Budget of 4: exhausted after 5 failures, with 1s-per-failure
    // back-offs in between
    assert!(
        wait_for(&client, "flapper", DaemonState::Broken, Duration::from_secs(30)).await,
        "flapper should exhaust its failure budget"
    );

    // From failures_allowed/2 onward the child saw GW_FAILSAFE
    let recorded = std::fs::read_to_string(&marker).unwrap_or_default();
    assert!(
        !recorded.is_empty(),
        "at least one start should have been in failsafe mode"
    );

    // BROKEN is terminal until an explicit start retries with a clean
    // budget
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(state_of(&client, "flapper").await, DaemonState::Broken);

    client.do_command("flapper", DaemonCommand::Start).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut left_broken = false;
    while Instant::now() < deadline {
        if state_of(&client, "flapper").await != DaemonState::Broken {
            left_broken = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(left_broken, "an explicit start must revive a BROKEN daemon");

    mcp.shutdown().await;
}

#[tokio::test]
async fn test_autostart_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let defs = || {
        vec![
            def("a", "/bin/sleep", &["60"], None),
            def("b", "/bin/sleep", &["60"], None),
        ]
    };

    {
        let (mcp, client) = served(defs(), dir.path()).await;
        client.do_command("a", DaemonCommand::Start).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        mcp.shutdown().await;
    }

    // A fresh MCP over the same autostart file re-goals only `a`
    let (mcp, client) = served(defs(), dir.path()).await;
    mcp.apply_autostart().await;

    assert!(wait_for(&client, "a", DaemonState::Starting, Duration::from_secs(3)).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(state_of(&client, "b").await, DaemonState::Offline);

    mcp.shutdown().await;
}

#[tokio::test]
async fn test_crash_command_restarts_with_new_pid() {
    let dir = tempfile::tempdir().unwrap();
    let (mcp, client) = served(vec![def("a", "/bin/sleep", &["60"], None)], dir.path()).await;
    let addr = client.addr().to_string();

    client.do_command("a", DaemonCommand::Start).await.unwrap();
    assert!(wait_for(&client, "a", DaemonState::Starting, Duration::from_secs(3)).await);
    self_report(&addr, "a", DaemonState::Online).await;

    let first_pid = client.get("a", false).await.unwrap()[0].pid.unwrap();

    client.do_command("a", DaemonCommand::Crash).await.unwrap();
    assert!(wait_for(&client, "a", DaemonState::Starting, Duration::from_secs(10)).await);
    let second_pid = client.get("a", false).await.unwrap()[0].pid.unwrap();
    assert_ne!(first_pid, second_pid);

    mcp.shutdown().await;
}
