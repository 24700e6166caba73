//! Peer state aggregation
//!
//! The gateway MCP keeps one snapshot per satellite node, refreshed by
//! CTL UPDATE pushes. Each snapshot carries a monotonic end-of-life;
//! past it, every entry is reported OFFLINE until the peer reappears.

use crate::mcp::daemon::{DaemonState, DaemonStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

struct RemoteNode {
    eol: Instant,
    daemons: Vec<DaemonStatus>,
}

/// Map of peer node id to its last pushed state list
#[derive(Clone, Default)]
pub struct RemoteNodes {
    inner: Arc<Mutex<HashMap<String, RemoteNode>>>,
}

impl RemoteNodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a peer's push with `eol = now + lifetime`
    pub async fn update(&self, node: &str, daemons: Vec<DaemonStatus>, lifetime: Duration) {
        debug!("Peer {} pushed {} daemons, lifetime {:?}", node, daemons.len(), lifetime);
        let mut inner = self.inner.lock().await;
        inner.insert(
            node.to_string(),
            RemoteNode { eol: Instant::now() + lifetime, daemons },
        );
    }

    pub async fn remove(&self, node: &str) {
        self.inner.lock().await.remove(node);
    }

    /// All remote entries, with expired nodes forced OFFLINE
    pub async fn snapshot(&self) -> Vec<DaemonStatus> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        let mut statuses = Vec::new();
        for (node, remote) in inner.iter() {
            let expired = now >= remote.eol;
            for daemon in &remote.daemons {
                let mut status = daemon.clone();
                status.node = Some(node.clone());
                if expired {
                    status.state = DaemonState::Offline;
                    status.pid = None;
                }
                statuses.push(status);
            }
        }
        statuses
    }

    pub async fn node_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}
