//! RFC 2136 UPDATE message construction and response
//! interpretation.
//!
//! Messages are rendered straight to wire bytes: a 12-byte header
//! with Opcode 5, one Zone record, no prerequisites, the update
//! records, and optionally one TSIG additional appended by the
//! signer. No compression pointers are ever emitted, which keeps the
//! format trivially parseable for MAC verification.

use std::net::Ipv4Addr;

pub const TYPE_A: u16 = 1;
pub const TYPE_SOA: u16 = 6;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_TSIG: u16 = 250;

pub const CLASS_IN: u16 = 1;
pub const CLASS_NONE: u16 = 254;
pub const CLASS_ANY: u16 = 255;

pub const OPCODE_UPDATE: u8 = 5;

/// Response codes the server can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImpl,
    Refused,
    YxDomain,
    YxRrSet,
    NxRrSet,
    NotAuth,
    NotZone,
    Other(u8),
}

impl Rcode {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::NoError,
            1 => Self::FormErr,
            2 => Self::ServFail,
            3 => Self::NxDomain,
            4 => Self::NotImpl,
            5 => Self::Refused,
            6 => Self::YxDomain,
            7 => Self::YxRrSet,
            8 => Self::NxRrSet,
            9 => Self::NotAuth,
            10 => Self::NotZone,
            other => Self::Other(other),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::NoError)
    }
}

impl std::fmt::Display for Rcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoError => write!(f, "NoError"),
            Self::FormErr => write!(f, "FormErr"),
            Self::ServFail => write!(f, "ServFail"),
            Self::NxDomain => write!(f, "NXDomain"),
            Self::NotImpl => write!(f, "NotImpl"),
            Self::Refused => write!(f, "Refused"),
            Self::YxDomain => write!(f, "YXDomain"),
            Self::YxRrSet => write!(f, "YXRRSet"),
            Self::NxRrSet => write!(f, "NXRRSet"),
            Self::NotAuth => write!(f, "NotAuth"),
            Self::NotZone => write!(f, "NotZone"),
            Self::Other(code) => write!(f, "Rcode({})", code),
        }
    }
}

/// RFC 1035 label encoding; the trailing dot is implied and labels
/// are clamped at 63 bytes.
pub fn encode_name(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() {
            continue;
        }
        let label = &label.as_bytes()[..label.len().min(63)];
        out.push(label.len() as u8);
        out.extend_from_slice(label);
    }
    out.push(0);
    out
}

/// An UPDATE message under construction.
pub struct UpdateMessage {
    id: u16,
    zone: String,
    updates: Vec<u8>,
    update_count: u16,
    additional: Vec<u8>,
    additional_count: u16,
}

impl UpdateMessage {
    pub fn new(id: u16, zone: &str) -> Self {
        Self {
            id,
            zone: zone.to_string(),
            updates: Vec::new(),
            update_count: 0,
            additional: Vec::new(),
            additional_count: 0,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Add an A record.
    pub fn add_a(&mut self, fqdn: &str, ttl: u32, addr: Ipv4Addr) {
        self.push_update(fqdn, TYPE_A, CLASS_IN, ttl, &addr.octets());
    }

    /// Delete one specific A record (class NONE, TTL 0).
    pub fn delete_a(&mut self, fqdn: &str, addr: Ipv4Addr) {
        self.push_update(fqdn, TYPE_A, CLASS_NONE, 0, &addr.octets());
    }

    /// Add a PTR record whose RDATA is the DNS-encoded target name.
    pub fn add_ptr(&mut self, name: &str, ttl: u32, target: &str) {
        let rdata = encode_name(target);
        self.push_update(name, TYPE_PTR, CLASS_IN, ttl, &rdata);
    }

    /// Delete every PTR at the name (class ANY, no RDATA).
    pub fn delete_ptr_any(&mut self, name: &str) {
        self.push_update(name, TYPE_PTR, CLASS_ANY, 0, &[]);
    }

    /// Appends a raw record to the additional section; used by the
    /// TSIG signer, which must come last.
    pub fn push_additional(&mut self, record: &[u8]) {
        self.additional.extend_from_slice(record);
        self.additional_count += 1;
    }

    fn push_update(&mut self, name: &str, rtype: u16, class: u16, ttl: u32, rdata: &[u8]) {
        self.updates.extend_from_slice(&encode_name(name));
        self.updates.extend_from_slice(&rtype.to_be_bytes());
        self.updates.extend_from_slice(&class.to_be_bytes());
        self.updates.extend_from_slice(&ttl.to_be_bytes());
        self.updates
            .extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        self.updates.extend_from_slice(rdata);
        self.update_count += 1;
    }

    /// Renders the full message. Layout: header, one Zone entry
    /// (`zone SOA IN`), zero prerequisites, the updates, then the
    /// additional section.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            12 + self.zone.len() + 6 + self.updates.len() + self.additional.len(),
        );
        out.extend_from_slice(&self.id.to_be_bytes());
        out.push(OPCODE_UPDATE << 3);
        out.push(0);
        out.extend_from_slice(&1u16.to_be_bytes()); // ZOCOUNT
        out.extend_from_slice(&0u16.to_be_bytes()); // PRCOUNT
        out.extend_from_slice(&self.update_count.to_be_bytes());
        out.extend_from_slice(&self.additional_count.to_be_bytes());

        out.extend_from_slice(&encode_name(&self.zone));
        out.extend_from_slice(&TYPE_SOA.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());

        out.extend_from_slice(&self.updates);
        out.extend_from_slice(&self.additional);
        out
    }
}

/// Lower nibble of byte 3 of any DNS response.
pub fn response_rcode(buf: &[u8]) -> Option<Rcode> {
    buf.get(3).map(|b| Rcode::from_code(b & 0x0F))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_encode_as_label_sequences() {
        assert_eq!(encode_name("lab.example."), b"\x03lab\x07example\x00");
        assert_eq!(encode_name("lab.example"), b"\x03lab\x07example\x00");
        assert_eq!(encode_name("."), b"\x00");
    }

    #[test]
    fn header_carries_the_update_opcode() {
        let msg = UpdateMessage::new(0x1234, "lab.example.");
        let bytes = msg.to_bytes();
        assert_eq!(&bytes[..2], &[0x12, 0x34]);
        assert_eq!(bytes[2], 0x28);
        assert_eq!(bytes[3], 0x00);
        // One zone, no prerequisites, no updates yet.
        assert_eq!(&bytes[4..12], &[0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn add_a_renders_an_in_record() {
        let mut msg = UpdateMessage::new(1, "lab.example.");
        msg.add_a("alice.lab.example.", 300, "10.0.0.100".parse().unwrap());
        let bytes = msg.to_bytes();
        // UPCOUNT incremented.
        assert_eq!(&bytes[8..10], &[0, 1]);
        // The record sits after the zone entry and ends with the
        // 4-byte RDATA.
        assert_eq!(&bytes[bytes.len() - 4..], &[10, 0, 0, 100]);
    }

    #[test]
    fn delete_ptr_any_has_no_rdata() {
        let mut msg = UpdateMessage::new(1, "0.0.10.in-addr.arpa.");
        msg.delete_ptr_any("100.0.0.10.in-addr.arpa.");
        let bytes = msg.to_bytes();
        // class ANY, TTL 0, RDLENGTH 0 terminate the record.
        assert_eq!(&bytes[bytes.len() - 8..], &[0, 255, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn rcode_comes_from_the_low_nibble() {
        assert_eq!(response_rcode(&[0, 0, 0x80, 0x05]), Some(Rcode::Refused));
        assert_eq!(response_rcode(&[0, 0, 0x80, 0xF0]), Some(Rcode::NoError));
        assert_eq!(response_rcode(&[0, 0]), None);
    }
}
