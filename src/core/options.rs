//! DHCP option codes, the message-type enum and the option value
//! encoders used when synthesizing replies.
//!
//! Options travel as a TLV stream after the magic cookie. The codec
//! keeps every received option verbatim in a map keyed by code; this
//! module gives names to the codes the server actually interprets and
//! provides the RFC 2132 / RFC 1035 / RFC 3442 value encoders for the
//! outgoing side.

use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Option codes interpreted or emitted by the server. Anything not
/// listed here is still carried in the raw option map.
pub mod codes {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const TIME_OFFSET: u8 = 2;
    pub const ROUTER: u8 = 3;
    pub const DNS_SERVER: u8 = 6;
    pub const HOST_NAME: u8 = 12;
    pub const DOMAIN_NAME: u8 = 15;
    pub const INTERFACE_MTU: u8 = 26;
    pub const BROADCAST_ADDR: u8 = 28;
    pub const NTP_SERVERS: u8 = 42;
    pub const WINS_SERVERS: u8 = 44;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAM_REQUEST_LIST: u8 = 55;
    pub const MAX_MESSAGE_SIZE: u8 = 57;
    pub const RENEWAL_TIME: u8 = 58;
    pub const REBINDING_TIME: u8 = 59;
    pub const VENDOR_CLASS_ID: u8 = 60;
    pub const CLIENT_ID: u8 = 61;
    pub const TFTP_SERVER_NAME: u8 = 66;
    pub const BOOT_FILE_NAME: u8 = 67;
    pub const CLIENT_FQDN: u8 = 81;
    pub const PXE_CLIENT_ARCH: u8 = 93;
    pub const POSIX_TIMEZONE: u8 = 100;
    pub const DOMAIN_SEARCH: u8 = 119;
    pub const CLASSLESS_ROUTES: u8 = 121;
    pub const END: u8 = 255;
}

/// The closed set of message types from option 53.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
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
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Discover),
            2 => Some(Self::Offer),
            3 => Some(Self::Request),
            4 => Some(Self::Decline),
            5 => Some(Self::Ack),
            6 => Some(Self::Nak),
            7 => Some(Self::Release),
            8 => Some(Self::Inform),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Discover => 1,
            Self::Offer => 2,
            Self::Request => 3,
            Self::Decline => 4,
            Self::Ack => 5,
            Self::Nak => 6,
            Self::Release => 7,
            Self::Inform => 8,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        };
        write!(f, "{}", name)
    }
}

/// Raw option map as decoded off the wire. Code 0 and 255 never land
/// in the map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DhcpOptions {
    map: HashMap<u8, Vec<u8>>,
}

impl DhcpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: u8, value: Vec<u8>) {
        self.map.insert(code, value);
    }

    pub fn get(&self, code: u8) -> Option<&[u8]> {
        self.map.get(&code).map(|v| v.as_slice())
    }

    pub fn contains(&self, code: u8) -> bool {
        self.map.contains_key(&code)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.get(codes::MESSAGE_TYPE)
            .and_then(|v| v.first().copied())
            .and_then(MessageType::from_code)
    }

    pub fn requested_address(&self) -> Option<Ipv4Addr> {
        self.get(codes::REQUESTED_IP).and_then(read_addr)
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.get(codes::SERVER_ID).and_then(read_addr)
    }

    pub fn lease_time(&self) -> Option<u32> {
        self.get(codes::LEASE_TIME).and_then(read_u32)
    }

    pub fn max_message_size(&self) -> Option<u16> {
        self.get(codes::MAX_MESSAGE_SIZE).and_then(read_u16)
    }

    /// Option 12, lossily decoded; trailing NULs some clients append
    /// are stripped.
    pub fn hostname(&self) -> Option<String> {
        self.get(codes::HOST_NAME).map(|v| {
            String::from_utf8_lossy(v)
                .trim_end_matches('\0')
                .to_string()
        })
    }

    pub fn vendor_class(&self) -> Option<String> {
        self.get(codes::VENDOR_CLASS_ID)
            .map(|v| String::from_utf8_lossy(v).to_string())
    }

    /// Option 61, kept opaque.
    pub fn client_identifier(&self) -> Option<&[u8]> {
        self.get(codes::CLIENT_ID)
    }

    /// Option 81 FQDN field, flags byte skipped.
    pub fn client_fqdn(&self) -> Option<String> {
        self.get(codes::CLIENT_FQDN).and_then(|v| {
            if v.len() > 3 {
                Some(String::from_utf8_lossy(&v[3..]).to_string())
            } else {
                None
            }
        })
    }

    /// Option 55, retained verbatim.
    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.get(codes::PARAM_REQUEST_LIST)
    }

    /// Option 93, two bytes big-endian.
    pub fn pxe_client_arch(&self) -> Option<u16> {
        self.get(codes::PXE_CLIENT_ARCH).and_then(read_u16)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.map.iter().map(|(k, v)| (*k, v.as_slice()))
    }
}

fn read_addr(v: &[u8]) -> Option<Ipv4Addr> {
    if v.len() >= 4 {
        Some(Ipv4Addr::new(v[0], v[1], v[2], v[3]))
    } else {
        None
    }
}

fn read_u32(v: &[u8]) -> Option<u32> {
    v.get(..4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u16(v: &[u8]) -> Option<u16> {
    v.get(..2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Concatenated 4-byte addresses, for options 6 / 42 / 44 and friends.
pub fn encode_addr_list(addrs: &[Ipv4Addr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(addrs.len() * 4);
    for a in addrs {
        out.extend_from_slice(&a.octets());
    }
    out
}

/// RFC 1035 §4.1.4 wire encoding of a domain-name list for option 119.
/// No compression pointers; every name is a plain label sequence.
pub fn encode_domain_search(names: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for name in names {
        for label in name.trim_end_matches('.').split('.') {
            if label.is_empty() {
                continue;
            }
            let label = &label.as_bytes()[..label.len().min(63)];
            out.push(label.len() as u8);
            out.extend_from_slice(label);
        }
        out.push(0);
    }
    out
}

/// RFC 3442 classless static route encoding for option 121: prefix
/// length, then only the significant octets of the destination, then
/// the router.
pub fn encode_classless_routes(routes: &[(Ipv4Addr, u8, Ipv4Addr)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (dest, prefix_len, router) in routes {
        let prefix_len = (*prefix_len).min(32);
        out.push(prefix_len);
        let significant = (prefix_len as usize + 7) / 8;
        out.extend_from_slice(&dest.octets()[..significant]);
        out.extend_from_slice(&router.octets());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_codes_round() {
        for code in 1..=8u8 {
            let mt = MessageType::from_code(code).unwrap();
            assert_eq!(mt.code(), code);
        }
        assert!(MessageType::from_code(0).is_none());
        assert!(MessageType::from_code(9).is_none());
    }

    #[test]
    fn typed_accessors() {
        let mut opts = DhcpOptions::new();
        opts.insert(codes::MESSAGE_TYPE, vec![3]);
        opts.insert(codes::REQUESTED_IP, vec![10, 0, 0, 100]);
        opts.insert(codes::LEASE_TIME, vec![0, 0, 0x0e, 0x10]);
        opts.insert(codes::HOST_NAME, b"alice\0".to_vec());
        opts.insert(codes::PXE_CLIENT_ARCH, vec![0, 7]);

        assert_eq!(opts.message_type(), Some(MessageType::Request));
        assert_eq!(
            opts.requested_address(),
            Some(Ipv4Addr::new(10, 0, 0, 100))
        );
        assert_eq!(opts.lease_time(), Some(3600));
        assert_eq!(opts.hostname().as_deref(), Some("alice"));
        assert_eq!(opts.pxe_client_arch(), Some(0x0007));
    }

    #[test]
    fn domain_search_wire_format() {
        let encoded = encode_domain_search(&[String::from("lab.example.")]);
        assert_eq!(encoded, b"\x03lab\x07example\x00");
    }

    #[test]
    fn classless_routes_drop_insignificant_octets() {
        let routes = [(
            Ipv4Addr::new(10, 229, 0, 0),
            16,
            Ipv4Addr::new(10, 0, 0, 1),
        )];
        let encoded = encode_classless_routes(&routes);
        assert_eq!(encoded, vec![16, 10, 229, 10, 0, 0, 1]);
    }

    #[test]
    fn addr_list_concatenates() {
        let encoded = encode_addr_list(&[
            Ipv4Addr::new(8, 8, 8, 8),
            Ipv4Addr::new(1, 1, 1, 1),
        ]);
        assert_eq!(encoded, vec![8, 8, 8, 8, 1, 1, 1, 1]);
    }
}
