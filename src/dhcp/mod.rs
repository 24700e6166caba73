//! DHCPv4 leasing core
//!
//! Multi-ring DHCPv4 service: a wire codec, per-ring lease tables, and
//! the serving loop that classifies clients into rings by interface of
//! arrival.

pub mod packet;
pub mod ring;
pub mod server;

pub use packet::{DhcpPacket, MessageType};
pub use ring::{Lease, RingHandler};
pub use server::{DhcpConfig, DhcpServer, RingDef};
