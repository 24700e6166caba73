//! Property-store client
//!
//! Synchronous request/reply to configd over a length-delimited frame
//! protocol. All reads and writes of the `@/` namespace go through
//! here; change notifications come back asynchronously on the bus
//! `config` topic, not on this channel.

pub mod watchdog;

use crate::error::{GwctlError, GwctlResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Config protocol version
pub const CFG_VERSION: u32 = 1;

/// Default per-request deadline
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

/// Frame size cap shared with the store
const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

/// One operation in an atomic batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CfgOp {
    /// Read a property or subtree
    Get { path: String },
    /// Update an existing property
    Set {
        path: String,
        value: String,
        expires: Option<DateTime<Utc>>,
    },
    /// Create a property, failing if it exists... or updating, per the
    /// store's upsert semantics for `@/clients` subtrees
    Create {
        path: String,
        value: String,
        expires: Option<DateTime<Utc>>,
    },
    /// Remove a property or subtree
    Delete { path: String },
    /// Attach a validation pattern to a subtree
    AddValidation { path: String, pattern: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CfgRequest {
    pub version: u32,
    pub sender: String,
    pub ops: Vec<CfgOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CfgCode {
    Ok,
    NoProp,
    BadOp,
    BadVersion,
    StoreError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CfgResponse {
    pub version: u32,
    pub code: CfgCode,
    /// Single string for a leaf Get, JSON for a subtree Get
    pub value: Option<String>,
}

/// Property path helpers for the `@/` namespace
pub mod paths {
    /// Per-client property, e.g. `client_prop("aa:..", "ipv4")`
    pub fn client_prop(mac: &str, field: &str) -> String {
        format!("@/clients/{}/{}", mac, field)
    }

    /// Root of one client's subtree
    pub fn client_root(mac: &str) -> String {
        format!("@/clients/{}", mac)
    }

    pub const CLIENTS: &str = "@/clients";
    pub const DHCP_CONFIG: &str = "@/dhcp/config";
    pub const DHCP_LEASES: &str = "@/dhcp/leases";
    pub const DNS_CNAMES: &str = "@/dns/cnames";
    pub const SITEID: &str = "@/siteid";
    pub const WAN_MAC: &str = "@/network/wan_mac";
    pub const WIFI_MAC: &str = "@/network/wifi_mac";
    pub const DNS_SERVER: &str = "@/network/dnsserver";
    pub const BLOCKLIST_UPDATE: &str = "@/updates/dns_blocklist";

    /// Per-daemon metric property
    pub fn daemon_metric(daemon: &str, metric: &str) -> String {
        format!("@/metrics/daemons/{}/{}", daemon, metric)
    }

    /// Certificate renewal state, keyed by fingerprint; written by the
    /// cert machinery, watched by its downstream consumers
    pub fn cert_state(fingerprint: &str) -> String {
        format!("@/certs/{}/state", fingerprint)
    }
}

/// Client handle onto configd
///
/// Requests are serialized over a single connection; the store
/// serializes concurrent writers on its side.
#[derive(Clone)]
pub struct CfgClient {
    addr: String,
    sender_name: String,
    deadline: Duration,
    conn: Arc<Mutex<Option<TcpStream>>>,
}

impl CfgClient {
    pub fn new(addr: &str, sender_name: &str) -> Self {
        Self {
            addr: addr.to_string(),
            sender_name: sender_name.to_string(),
            deadline: DEFAULT_DEADLINE,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Override the per-request deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Liveness probe
    pub async fn ping(&self) -> GwctlResult<()> {
        // An empty batch round-trips without touching the tree
        self.execute(Vec::new()).await.map(|_| ())
    }

    /// Run a batch of ops atomically; returns the last Get's value
    pub async fn execute(&self, ops: Vec<CfgOp>) -> GwctlResult<Option<String>> {
        let (_, never) = oneshot::channel::<()>();
        self.execute_cancellable(ops, never).await
    }

    /// Run a batch with a caller-held cancellation handle
    ///
    /// Dropping the paired sender does not cancel; sending on it does.
    /// On cancellation the reply is discarded and `Cancelled` returned.
    pub async fn execute_cancellable(
        &self,
        ops: Vec<CfgOp>,
        mut cancel: oneshot::Receiver<()>,
    ) -> GwctlResult<Option<String>> {
        let request = CfgRequest {
            version: CFG_VERSION,
            sender: self.sender_name.clone(),
            ops,
        };

        // The in-flight future owns the connection lock while polled;
        // it must be dropped before the cancel path can poison it
        let outcome = {
            let work = self.round_trip(&request);
            tokio::pin!(work);
            tokio::select! {
                result = &mut work => Some(result),
                cancelled = &mut cancel => {
                    if cancelled.is_ok() {
                        None
                    } else {
                        // Sender dropped without cancelling; keep waiting
                        Some(work.await)
                    }
                }
            }
        };

        let response = match outcome {
            Some(result) => result?,
            None => {
                // The reply is undeliverable; drop the connection so
                // the next request starts clean
                *self.conn.lock().await = None;
                return Err(GwctlError::Cancelled);
            }
        };

        if response.version != CFG_VERSION {
            return Err(GwctlError::BadVersion { got: response.version, want: CFG_VERSION });
        }
        match response.code {
            CfgCode::Ok => Ok(response.value),
            CfgCode::NoProp => Err(GwctlError::NotFound("No such property".to_string())),
            CfgCode::BadOp => Err(GwctlError::InvalidParameter("Rejected op".to_string())),
            CfgCode::BadVersion => {
                Err(GwctlError::BadVersion { got: CFG_VERSION, want: response.version })
            }
            CfgCode::StoreError => Err(GwctlError::ServiceError("Store error".to_string())),
        }
    }

    /// Read a leaf property; Ok(None) when absent
    pub async fn get(&self, path: &str) -> GwctlResult<Option<String>> {
        match self.execute(vec![CfgOp::Get { path: path.to_string() }]).await {
            Ok(value) => Ok(value),
            Err(GwctlError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read a subtree as JSON
    pub async fn get_subtree(&self, path: &str) -> GwctlResult<Option<serde_json::Value>> {
        match self.get(path).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Create-or-update a property
    pub async fn set(
        &self,
        path: &str,
        value: &str,
        expires: Option<DateTime<Utc>>,
    ) -> GwctlResult<()> {
        let value = crate::validation::sanitize_property_value(value)?;
        self.execute(vec![CfgOp::Create {
            path: path.to_string(),
            value,
            expires,
        }])
        .await
        .map(|_| ())
    }

    /// Delete a property or subtree
    pub async fn delete(&self, path: &str) -> GwctlResult<()> {
        match self.execute(vec![CfgOp::Delete { path: path.to_string() }]).await {
            Ok(_) => Ok(()),
            Err(GwctlError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// One request/reply exchange, reconnecting once on a stale socket
    async fn round_trip(&self, request: &CfgRequest) -> GwctlResult<CfgResponse> {
        let deadline = self.deadline;
        match timeout(deadline, self.round_trip_inner(request)).await {
            Ok(result) => result,
            Err(_) => {
                // Poison the connection so the next call redials
                *self.conn.lock().await = None;
                Err(GwctlError::Timeout(format!("configd request after {:?}", deadline)))
            }
        }
    }

    async fn round_trip_inner(&self, request: &CfgRequest) -> GwctlResult<CfgResponse> {
        let mut guard = self.conn.lock().await;

        for attempt in 0..2 {
            if guard.is_none() {
                let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
                    GwctlError::ConnectionFailed { reason: format!("configd at {}: {}", self.addr, e) }
                })?;
                *guard = Some(stream);
            }

            let stream = guard.as_mut().unwrap();
            match exchange(stream, request).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt == 0 => {
                    debug!("configd exchange failed, redialing: {}", e);
                    *guard = None;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!()
    }
}

async fn exchange(stream: &mut TcpStream, request: &CfgRequest) -> GwctlResult<CfgResponse> {
    let body = bincode::serialize(request)?;
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(GwctlError::ParseError(format!("Reply length {} exceeds limit", len)));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}

/// In-memory property store speaking the configd protocol
///
/// Stands in for the external store in tests and single-node
/// development. Writes fan change notifications out on the bus when a
/// bus client is attached.
pub struct MemStore {
    listener: tokio::net::TcpListener,
    tree: Arc<Mutex<BTreeMap<String, (String, Option<DateTime<Utc>>)>>>,
    bus: Option<crate::bus::BusClient>,
}

impl MemStore {
    pub async fn bind(addr: &str) -> GwctlResult<Self> {
        Ok(Self {
            listener: tokio::net::TcpListener::bind(addr).await?,
            tree: Arc::new(Mutex::new(BTreeMap::new())),
            bus: None,
        })
    }

    /// Attach a bus client for change notifications
    pub fn with_bus(mut self, bus: crate::bus::BusClient) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn local_addr(&self) -> GwctlResult<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Seed a property before serving
    pub async fn preload(&self, path: &str, value: &str, expires: Option<DateTime<Utc>>) {
        self.tree
            .lock()
            .await
            .insert(path.to_string(), (value.to_string(), expires));
    }

    pub async fn run(self) {
        loop {
            let (mut stream, _) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Store accept failed: {}", e);
                    continue;
                }
            };

            let tree = self.tree.clone();
            let bus = self.bus.clone();
            tokio::spawn(async move {
                loop {
                    let mut len_buf = [0u8; 4];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        break;
                    }
                    let len = u32::from_be_bytes(len_buf);
                    if len > MAX_FRAME_LEN {
                        break;
                    }
                    let mut body = vec![0u8; len as usize];
                    if stream.read_exact(&mut body).await.is_err() {
                        break;
                    }
                    let request: CfgRequest = match bincode::deserialize(&body) {
                        Ok(r) => r,
                        Err(_) => break,
                    };

                    let response = apply(&tree, &bus, request).await;
                    let reply = match bincode::serialize(&response) {
                        Ok(r) => r,
                        Err(_) => break,
                    };
                    if stream.write_all(&(reply.len() as u32).to_be_bytes()).await.is_err() {
                        break;
                    }
                    if stream.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    }
}

async fn apply(
    tree: &Arc<Mutex<BTreeMap<String, (String, Option<DateTime<Utc>>)>>>,
    bus: &Option<crate::bus::BusClient>,
    request: CfgRequest,
) -> CfgResponse {
    use crate::events::{topics, ConfigChange, EventConfig};

    if request.version != CFG_VERSION {
        return CfgResponse { version: CFG_VERSION, code: CfgCode::BadVersion, value: None };
    }

    let mut tree = tree.lock().await;
    let mut last_value: Option<String> = None;
    let mut notifications = Vec::new();

    for op in request.ops {
        match op {
            CfgOp::Get { path } => {
                if let Some((value, _)) = tree.get(&path) {
                    last_value = Some(value.clone());
                } else {
                    // Subtree get: assemble JSON object of descendants
                    let prefix = format!("{}/", path);
                    let mut subtree = serde_json::Map::new();
                    for (key, (value, expires)) in tree.range(prefix.clone()..) {
                        if !key.starts_with(&prefix) {
                            break;
                        }
                        // Expiring properties come back as objects so
                        // importers can rebuild their deadlines
                        let entry = match expires {
                            Some(expires) => serde_json::json!({
                                "value": value,
                                "expires": expires.to_rfc3339(),
                            }),
                            None => serde_json::Value::String(value.clone()),
                        };
                        subtree.insert(key[prefix.len()..].to_string(), entry);
                    }
                    if subtree.is_empty() {
                        return CfgResponse {
                            version: CFG_VERSION,
                            code: CfgCode::NoProp,
                            value: None,
                        };
                    }
                    last_value = Some(serde_json::Value::Object(subtree).to_string());
                }
            }
            CfgOp::Set { path, value, expires } | CfgOp::Create { path, value, expires } => {
                // The store enforces value hygiene even for writers
                // that bypass the client helpers
                if crate::validation::sanitize_property_value(&value).is_err() {
                    return CfgResponse { version: CFG_VERSION, code: CfgCode::BadOp, value: None };
                }
                tree.insert(path.clone(), (value.clone(), expires));
                notifications.push(EventConfig {
                    timestamp: Utc::now(),
                    sender: request.sender.clone(),
                    change: ConfigChange::Change,
                    property: path,
                    new_value: Some(value),
                    expires,
                });
            }
            CfgOp::Delete { path } => {
                let prefix = format!("{}/", path);
                let had_leaf = tree.remove(&path).is_some();
                let keys: Vec<String> =
                    tree.range(prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&prefix))
                        .map(|(k, _)| k.clone())
                        .collect();
                if !had_leaf && keys.is_empty() {
                    return CfgResponse { version: CFG_VERSION, code: CfgCode::NoProp, value: None };
                }
                for key in keys {
                    tree.remove(&key);
                }
                notifications.push(EventConfig {
                    timestamp: Utc::now(),
                    sender: request.sender.clone(),
                    change: ConfigChange::Delete,
                    property: path,
                    new_value: None,
                    expires: None,
                });
            }
            CfgOp::AddValidation { .. } => {
                // The in-memory store accepts and ignores validations
            }
        }
    }
    drop(tree);

    if let Some(bus) = bus {
        for event in notifications {
            if let Err(e) = bus.publish(topics::CONFIG, &event) {
                warn!("Failed to publish config event: {}", e);
            }
        }
    }

    CfgResponse { version: CFG_VERSION, code: CfgCode::Ok, value: last_value }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_and_client() -> (CfgClient, tokio::task::JoinHandle<()>) {
        let store = MemStore::bind("127.0.0.1:0").await.unwrap();
        let addr = store.local_addr().unwrap().to_string();
        let handle = tokio::spawn(store.run());
        (CfgClient::new(&addr, "test"), handle)
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (client, _store) = store_and_client().await;

        client.set("@/siteid", "7410", None).await.unwrap();
        assert_eq!(client.get("@/siteid").await.unwrap(), Some("7410".to_string()));

        client.delete("@/siteid").await.unwrap();
        assert_eq!(client.get("@/siteid").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_subtree_get() {
        let (client, _store) = store_and_client().await;

        let mac = "aa:bb:cc:00:00:01";
        client.set(&paths::client_prop(mac, "ipv4"), "10.0.1.15", None).await.unwrap();
        client.set(&paths::client_prop(mac, "ring"), "standard", None).await.unwrap();

        let subtree = client.get_subtree(&paths::client_root(mac)).await.unwrap().unwrap();
        assert_eq!(subtree["ipv4"], "10.0.1.15");
        assert_eq!(subtree["ring"], "standard");
    }

    #[tokio::test]
    async fn test_unsanitary_value_rejected() {
        let (client, _store) = store_and_client().await;

        // The client helper refuses before touching the wire
        let result = client.set("@/siteid", "74\n10", None).await;
        assert!(matches!(result, Err(GwctlError::InvalidParameter(_))));

        // A raw op that skips the helper is rejected by the store
        let result = client
            .execute(vec![CfgOp::Create {
                path: "@/siteid".to_string(),
                value: "74\n10".to_string(),
                expires: None,
            }])
            .await;
        assert!(matches!(result, Err(GwctlError::InvalidParameter(_))));
        assert_eq!(client.get("@/siteid").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_batch_is_atomic_under_serialization() {
        let (client, _store) = store_and_client().await;

        let value = client
            .execute(vec![
                CfgOp::Create { path: "@/a".to_string(), value: "1".to_string(), expires: None },
                CfgOp::Create { path: "@/b".to_string(), value: "2".to_string(), expires: None },
                CfgOp::Get { path: "@/b".to_string() },
            ])
            .await
            .unwrap();
        assert_eq!(value, Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_cancellation() {
        // Dial a listener that never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let client = CfgClient::new(&addr, "test").with_deadline(Duration::from_secs(30));
        let (cancel_tx, cancel_rx) = oneshot::channel();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = cancel_tx.send(());
        });

        let result = client
            .execute_cancellable(vec![CfgOp::Get { path: "@/x".to_string() }], cancel_rx)
            .await;
        assert!(matches!(result, Err(GwctlError::Cancelled)));
    }

    #[tokio::test]
    async fn test_timeout_is_distinct() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let client = CfgClient::new(&addr, "test").with_deadline(Duration::from_millis(100));
        let result = client.get("@/x").await;
        assert!(matches!(result, Err(GwctlError::Timeout(_))));
    }
}
