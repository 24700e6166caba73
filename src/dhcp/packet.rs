//! DHCPv4 wire codec
//!
//! RFC 2131 fixed header plus RFC 2132 option TLVs. Only the options
//! the leasing core honours are given typed accessors; everything else
//! passes through opaquely.

use crate::error::{GwctlError, GwctlResult};
use std::net::Ipv4Addr;

/// BOOTP op codes
pub const OP_REQUEST: u8 = 1;
pub const OP_REPLY: u8 = 2;

/// DHCP magic cookie, network order
pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

/// Fixed header length up to and including the cookie
const HEADER_LEN: usize = 240;

/// Option codes
pub const OPT_PAD: u8 = 0;
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DNS_SERVER: u8 = 6;
pub const OPT_HOSTNAME: u8 = 12;
pub const OPT_REQUESTED_IP: u8 = 50;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MESSAGE_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_PARAM_REQUEST: u8 = 55;
pub const OPT_END: u8 = 255;

/// DHCP message types (option 53)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Discover),
            2 => Some(MessageType::Offer),
            3 => Some(MessageType::Request),
            4 => Some(MessageType::Decline),
            5 => Some(MessageType::Ack),
            6 => Some(MessageType::Nak),
            7 => Some(MessageType::Release),
            8 => Some(MessageType::Inform),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::Discover => 1,
            MessageType::Offer => 2,
            MessageType::Request => 3,
            MessageType::Decline => 4,
            MessageType::Ack => 5,
            MessageType::Nak => 6,
            MessageType::Release => 7,
            MessageType::Inform => 8,
        }
    }
}

/// One raw option TLV
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpOption {
    pub code: u8,
    pub data: Vec<u8>,
}

/// A parsed DHCPv4 packet
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub options: Vec<DhcpOption>,
}

fn read_ip(buf: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3])
}

impl DhcpPacket {
    /// Parse a raw UDP payload; anything malformed is a protocol error
    pub fn parse(buf: &[u8]) -> GwctlResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(GwctlError::ParseError(format!(
                "DHCP packet too short: {} bytes", buf.len()
            )));
        }
        if buf[236..240] != MAGIC_COOKIE {
            return Err(GwctlError::ParseError("Missing DHCP magic cookie".to_string()));
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&buf[28..44]);

        let mut packet = DhcpPacket {
            op: buf[0],
            htype: buf[1],
            hlen: buf[2],
            hops: buf[3],
            xid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            secs: u16::from_be_bytes([buf[8], buf[9]]),
            flags: u16::from_be_bytes([buf[10], buf[11]]),
            ciaddr: read_ip(buf, 12),
            yiaddr: read_ip(buf, 16),
            siaddr: read_ip(buf, 20),
            giaddr: read_ip(buf, 24),
            chaddr,
            options: Vec::new(),
        };

        let mut pos = HEADER_LEN;
        while pos < buf.len() {
            let code = buf[pos];
            pos += 1;
            match code {
                OPT_PAD => continue,
                OPT_END => break,
                _ => {
                    if pos >= buf.len() {
                        return Err(GwctlError::ParseError("Truncated DHCP option".to_string()));
                    }
                    let len = buf[pos] as usize;
                    pos += 1;
                    if pos + len > buf.len() {
                        return Err(GwctlError::ParseError(format!(
                            "DHCP option {} overruns packet", code
                        )));
                    }
                    packet.options.push(DhcpOption {
                        code,
                        data: buf[pos..pos + len].to_vec(),
                    });
                    pos += len;
                }
            }
        }

        Ok(packet)
    }

    /// Serialize; the BOOTP legacy sname/file fields are always zero
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 64);
        buf.push(self.op);
        buf.push(self.htype);
        buf.push(self.hlen);
        buf.push(self.hops);
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.secs.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.ciaddr.octets());
        buf.extend_from_slice(&self.yiaddr.octets());
        buf.extend_from_slice(&self.siaddr.octets());
        buf.extend_from_slice(&self.giaddr.octets());
        buf.extend_from_slice(&self.chaddr);
        buf.extend_from_slice(&[0u8; 192]);
        buf.extend_from_slice(&MAGIC_COOKIE);

        for option in &self.options {
            buf.push(option.code);
            buf.push(option.data.len() as u8);
            buf.extend_from_slice(&option.data);
        }
        buf.push(OPT_END);

        // BOOTP minimum frame padding
        while buf.len() < 300 {
            buf.push(OPT_PAD);
        }
        buf
    }

    fn option(&self, code: u8) -> Option<&[u8]> {
        self.options.iter().find(|o| o.code == code).map(|o| o.data.as_slice())
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.option(OPT_MESSAGE_TYPE)
            .and_then(|d| d.first().copied())
            .and_then(MessageType::from_u8)
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.option(OPT_REQUESTED_IP).and_then(bytes_to_ip)
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.option(OPT_SERVER_ID).and_then(bytes_to_ip)
    }

    pub fn hostname(&self) -> Option<String> {
        self.option(OPT_HOSTNAME)
            .map(|d| String::from_utf8_lossy(d).trim_end_matches('\0').to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn param_request_list(&self) -> Vec<u8> {
        self.option(OPT_PARAM_REQUEST).map(|d| d.to_vec()).unwrap_or_default()
    }

    /// Client MAC in canonical colon-separated lowercase
    pub fn mac_string(&self) -> String {
        let m = &self.chaddr[..6];
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }

    /// Whether the client asked for a broadcast reply
    pub fn broadcast(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    /// Skeleton reply mirroring this request's transaction fields
    pub fn reply_skeleton(&self) -> DhcpPacket {
        DhcpPacket {
            op: OP_REPLY,
            htype: self.htype,
            hlen: self.hlen,
            hops: 0,
            xid: self.xid,
            secs: 0,
            flags: self.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: self.giaddr,
            chaddr: self.chaddr,
            options: Vec::new(),
        }
    }
}

fn bytes_to_ip(data: &[u8]) -> Option<Ipv4Addr> {
    if data.len() == 4 {
        Some(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
    } else {
        None
    }
}

/// Option constructors

pub fn opt_msg_type(t: MessageType) -> DhcpOption {
    DhcpOption { code: OPT_MESSAGE_TYPE, data: vec![t.as_u8()] }
}

pub fn opt_ip(code: u8, ip: Ipv4Addr) -> DhcpOption {
    DhcpOption { code, data: ip.octets().to_vec() }
}

pub fn opt_ips(code: u8, ips: &[Ipv4Addr]) -> DhcpOption {
    let mut data = Vec::with_capacity(ips.len() * 4);
    for ip in ips {
        data.extend_from_slice(&ip.octets());
    }
    DhcpOption { code, data }
}

pub fn opt_u32(code: u8, value: u32) -> DhcpOption {
    DhcpOption { code, data: value.to_be_bytes().to_vec() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discover_packet(mac: [u8; 6]) -> DhcpPacket {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac);
        DhcpPacket {
            op: OP_REQUEST,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: 0x1234_5678,
            secs: 0,
            flags: 0x8000,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: vec![
                opt_msg_type(MessageType::Discover),
                DhcpOption { code: OPT_HOSTNAME, data: b"laptop".to_vec() },
            ],
        }
    }

    #[test]
    fn test_round_trip() {
        let packet = discover_packet([0xaa, 0xbb, 0xcc, 0, 0, 1]);
        let bytes = packet.encode();
        assert!(bytes.len() >= 300);

        let parsed = DhcpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.op, OP_REQUEST);
        assert_eq!(parsed.xid, 0x1234_5678);
        assert_eq!(parsed.message_type(), Some(MessageType::Discover));
        assert_eq!(parsed.hostname().as_deref(), Some("laptop"));
        assert_eq!(parsed.mac_string(), "aa:bb:cc:00:00:01");
        assert!(parsed.broadcast());
    }

    #[test]
    fn test_requested_ip_option() {
        let mut packet = discover_packet([0xaa, 0xbb, 0xcc, 0, 0, 1]);
        packet.options.push(opt_ip(OPT_REQUESTED_IP, Ipv4Addr::new(10, 0, 1, 15)));
        let parsed = DhcpPacket::parse(&packet.encode()).unwrap();
        assert_eq!(parsed.requested_ip(), Some(Ipv4Addr::new(10, 0, 1, 15)));
    }

    #[test]
    fn test_short_packet_rejected() {
        assert!(DhcpPacket::parse(&[0u8; 100]).is_err());
    }

    #[test]
    fn test_bad_cookie_rejected() {
        let mut bytes = discover_packet([0, 1, 2, 3, 4, 5]).encode();
        bytes[236] = 0;
        assert!(DhcpPacket::parse(&bytes).is_err());
    }

    #[test]
    fn test_truncated_option_rejected() {
        let mut bytes = discover_packet([0, 1, 2, 3, 4, 5]).encode();
        bytes.truncate(HEADER_LEN + 1);
        // code byte present, length byte missing
        bytes[HEADER_LEN] = OPT_HOSTNAME;
        assert!(DhcpPacket::parse(&bytes).is_err());
    }

    #[test]
    fn test_reply_skeleton_mirrors_request() {
        let request = discover_packet([0xaa, 0xbb, 0xcc, 0, 0, 1]);
        let reply = request.reply_skeleton();
        assert_eq!(reply.op, OP_REPLY);
        assert_eq!(reply.xid, request.xid);
        assert_eq!(reply.chaddr, request.chaddr);
    }
}
