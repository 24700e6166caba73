//! CTL wire protocol
//!
//! Request/reply between the CLI tool and MCP, and between satellite
//! MCPs and the gateway MCP. Frames are length-delimited bincode, one
//! exchange per connection. Every request carries the protocol
//! version; a mismatch is answered with BadVersion and nothing else.

use crate::error::{GwctlError, GwctlResult};
use crate::mcp::daemon::{DaemonState, DaemonStatus};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

/// CTL protocol version
pub const CTL_VERSION: u32 = 2;

/// Target naming every daemon at once
pub const TARGET_ALL: &str = "all";

/// Per-exchange deadline on the client side
const CTL_DEADLINE: Duration = Duration::from_secs(10);

const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Lifecycle commands accepted by DO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonCommand {
    Start,
    Stop,
    /// SIGABRT for diagnostics, then stop, then start again
    Crash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum McpOp {
    /// Liveness
    Ping,
    /// State list for one daemon or all
    Get { target: String, include_remote: bool },
    /// A daemon reporting its own state; sender must equal target
    Set { target: String, state: DaemonState },
    /// Drive one daemon or all toward a new goal
    Do { target: String, command: DaemonCommand },
    /// A peer pushing its local state list
    Update {
        node: String,
        daemons: Vec<DaemonStatus>,
        lifetime_secs: u64,
    },
    /// Reboot the host; sender is recorded in the log
    Reboot,
    /// The known gateway address
    Gateway,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRequest {
    pub version: u32,
    pub sender: String,
    pub op: McpOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum McpCode {
    Ok,
    Invalid,
    NoDaemon,
    BadVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResponse {
    pub version: u32,
    pub sender: String,
    pub code: McpCode,
    #[serde(default)]
    pub daemons: Vec<DaemonStatus>,
    #[serde(default)]
    pub gateway: Option<String>,
}

impl McpResponse {
    pub fn new(sender: &str, code: McpCode) -> Self {
        Self {
            version: CTL_VERSION,
            sender: sender.to_string(),
            code,
            daemons: Vec::new(),
            gateway: None,
        }
    }
}

pub async fn write_request(stream: &mut TcpStream, request: &McpRequest) -> GwctlResult<()> {
    let body = bincode::serialize(request)?;
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    Ok(())
}

pub async fn read_request(stream: &mut TcpStream) -> GwctlResult<McpRequest> {
    Ok(bincode::deserialize(&read_body(stream).await?)?)
}

pub async fn write_response(stream: &mut TcpStream, response: &McpResponse) -> GwctlResult<()> {
    let body = bincode::serialize(response)?;
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    Ok(())
}

pub async fn read_response(stream: &mut TcpStream) -> GwctlResult<McpResponse> {
    Ok(bincode::deserialize(&read_body(stream).await?)?)
}

async fn read_body(stream: &mut TcpStream) -> GwctlResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(GwctlError::ParseError(format!("CTL frame length {} exceeds limit", len)));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// CTL client: one connection per exchange
#[derive(Clone)]
pub struct CtlClient {
    addr: String,
    sender_name: String,
}

impl CtlClient {
    pub fn new(addr: &str, sender_name: &str) -> Self {
        Self { addr: addr.to_string(), sender_name: sender_name.to_string() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn request(&self, op: McpOp) -> GwctlResult<McpResponse> {
        let request = McpRequest {
            version: CTL_VERSION,
            sender: self.sender_name.clone(),
            op,
        };

        let exchange = async {
            let mut stream = TcpStream::connect(&self.addr).await.map_err(|e| {
                GwctlError::ConnectionFailed { reason: format!("mcp at {}: {}", self.addr, e) }
            })?;
            write_request(&mut stream, &request).await?;
            read_response(&mut stream).await
        };

        let response = timeout(CTL_DEADLINE, exchange)
            .await
            .map_err(|_| GwctlError::Timeout(format!("mcp request to {}", self.addr)))??;

        match response.code {
            McpCode::BadVersion => {
                Err(GwctlError::BadVersion { got: response.version, want: CTL_VERSION })
            }
            _ => Ok(response),
        }
    }

    pub async fn ping(&self) -> GwctlResult<()> {
        let response = self.request(McpOp::Ping).await?;
        match response.code {
            McpCode::Ok => Ok(()),
            code => Err(GwctlError::ServiceError(format!("Ping returned {:?}", code))),
        }
    }

    pub async fn get(&self, target: &str, include_remote: bool) -> GwctlResult<Vec<DaemonStatus>> {
        let response = self
            .request(McpOp::Get { target: target.to_string(), include_remote })
            .await?;
        match response.code {
            McpCode::Ok => Ok(response.daemons),
            McpCode::NoDaemon => Err(GwctlError::NoDaemon(target.to_string())),
            code => Err(GwctlError::ServiceError(format!("Get returned {:?}", code))),
        }
    }

    /// Report this daemon's own state; sender and target must match
    pub async fn set_state(&self, state: DaemonState) -> GwctlResult<()> {
        let response = self
            .request(McpOp::Set { target: self.sender_name.clone(), state })
            .await?;
        match response.code {
            McpCode::Ok => Ok(()),
            McpCode::NoDaemon => Err(GwctlError::NoDaemon(self.sender_name.clone())),
            code => Err(GwctlError::ServiceError(format!("Set returned {:?}", code))),
        }
    }

    pub async fn do_command(&self, target: &str, command: DaemonCommand) -> GwctlResult<()> {
        let response = self
            .request(McpOp::Do { target: target.to_string(), command })
            .await?;
        match response.code {
            McpCode::Ok => Ok(()),
            McpCode::NoDaemon => Err(GwctlError::NoDaemon(target.to_string())),
            code => Err(GwctlError::ServiceError(format!("Do returned {:?}", code))),
        }
    }

    /// Push this node's state list; the reply carries the gateway's own
    pub async fn update(
        &self,
        node: &str,
        daemons: Vec<DaemonStatus>,
        lifetime_secs: u64,
    ) -> GwctlResult<Vec<DaemonStatus>> {
        let response = self
            .request(McpOp::Update { node: node.to_string(), daemons, lifetime_secs })
            .await?;
        match response.code {
            McpCode::Ok => Ok(response.daemons),
            code => Err(GwctlError::ServiceError(format!("Update returned {:?}", code))),
        }
    }

    pub async fn gateway(&self) -> GwctlResult<Option<String>> {
        let response = self.request(McpOp::Gateway).await?;
        match response.code {
            McpCode::Ok => Ok(response.gateway),
            code => Err(GwctlError::ServiceError(format!("Gateway returned {:?}", code))),
        }
    }

    pub async fn reboot(&self) -> GwctlResult<()> {
        let response = self.request(McpOp::Reboot).await?;
        match response.code {
            McpCode::Ok => Ok(()),
            code => Err(GwctlError::ServiceError(format!("Reboot returned {:?}", code))),
        }
    }
}
