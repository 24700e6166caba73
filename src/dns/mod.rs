//! DNS core
//!
//! Authoritative answers for the site domain, recursive proxying for
//! everything else, and policy interception of blocklisted names.

pub mod blocklist;
pub mod hostmap;
pub mod server;

pub use blocklist::Blocklist;
pub use hostmap::{DnsRecord, HostMap, RecType};
pub use server::DnsServer;
