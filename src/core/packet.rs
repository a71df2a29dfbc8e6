//! Wire codec for the fixed BOOTP header, the magic cookie and the
//! TLV option stream (RFC 2131 / RFC 2132).
//!
//! Decoding only ever accepts BOOTREQUEST frames; everything else is
//! rejected with a [`DecodeError`] and silently dropped upstream.
//! Encoding writes into a caller-supplied buffer because reply buffers
//! come from a pool and are not zero-initialized; the `sname` and
//! `file` fields are therefore explicitly zeroed before use.

use std::net::Ipv4Addr;

use super::errors::DecodeError;
use super::options::{codes, DhcpOptions, MessageType};

pub const BOOTP_HEADER_LEN: usize = 236;
pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
pub const FLAG_BROADCAST: u16 = 0x8000;

const OP_BOOTREQUEST: u8 = 1;
const OP_BOOTREPLY: u8 = 2;
const HTYPE_ETHERNET: u8 = 1;

/// A six-byte Ethernet address. Canonical form is uppercase
/// colon-separated hex; equality is byte-wise.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Extracts the address from the 16-byte `chaddr` field; only the
    /// first `hlen` bytes are meaningful, padded with zeros if fewer
    /// than six.
    pub fn from_chaddr(chaddr: &[u8; 16], hlen: u8) -> Self {
        let take = (hlen as usize).min(6);
        let mut bytes = [0u8; 6];
        bytes[..take].copy_from_slice(&chaddr[..take]);
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Parses the canonical `AA:BB:CC:DD:EE:FF` text form,
    /// case-insensitive.
    pub fn parse(text: &str) -> Option<Self> {
        let mut bytes = [0u8; 6];
        let mut parts = text.split(':');
        for slot in bytes.iter_mut() {
            *slot = u8::from_str_radix(parts.next()?, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self(bytes))
    }
}

impl std::fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl std::fmt::Debug for HardwareAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// A decoded BOOTREQUEST.
#[derive(Debug, Clone, PartialEq)]
pub struct DhcpV4Packet {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    /// Opaque transaction id, echoed unchanged in replies.
    pub xid: [u8; 4],
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: DhcpOptions,
    /// Set when the option stream ended mid-TLV; the packet is still
    /// usable with whatever parsed before the cut.
    pub options_truncated: bool,
}

impl DhcpV4Packet {
    /// Decodes a raw UDP payload. The checks run in a fixed order so
    /// that a frame that is both malformed and not a request reports
    /// the earlier failure.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.len() < BOOTP_HEADER_LEN {
            return Err(DecodeError::ShortFrame(raw.len()));
        }
        if raw.len() < BOOTP_HEADER_LEN + 4 || raw[236..240] != MAGIC_COOKIE {
            return Err(DecodeError::BadMagic);
        }
        if raw[0] != OP_BOOTREQUEST {
            return Err(DecodeError::NotRequest(raw[0]));
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&raw[28..44]);
        let mut sname = [0u8; 64];
        sname.copy_from_slice(&raw[44..108]);
        let mut file = [0u8; 128];
        file.copy_from_slice(&raw[108..236]);

        let (options, options_truncated) = parse_options(&raw[240..]);

        Ok(Self {
            op: raw[0],
            htype: raw[1],
            hlen: raw[2],
            hops: raw[3],
            xid: [raw[4], raw[5], raw[6], raw[7]],
            secs: u16::from_be_bytes([raw[8], raw[9]]),
            flags: u16::from_be_bytes([raw[10], raw[11]]),
            ciaddr: addr_at(raw, 12),
            yiaddr: addr_at(raw, 16),
            siaddr: addr_at(raw, 20),
            giaddr: addr_at(raw, 24),
            chaddr,
            sname,
            file,
            options,
            options_truncated,
        })
    }

    pub fn hardware_address(&self) -> HardwareAddress {
        HardwareAddress::from_chaddr(&self.chaddr, self.hlen)
    }

    pub fn broadcast(&self) -> bool {
        self.flags & FLAG_BROADCAST != 0
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.options.message_type()
    }

    /// A request carrying no option 53 is a legacy BOOTP request.
    pub fn is_bootp(&self) -> bool {
        self.options.message_type().is_none()
    }
}

fn addr_at(raw: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3])
}

/// TLV walk. Code 0 is a bare pad, 255 terminates. A truncated option
/// ends the walk without error but reports the cut.
fn parse_options(mut data: &[u8]) -> (DhcpOptions, bool) {
    let mut options = DhcpOptions::new();
    let mut truncated = false;
    loop {
        let Some((&code, rest)) = data.split_first() else {
            break;
        };
        data = rest;
        match code {
            codes::PAD => continue,
            codes::END => break,
            _ => {}
        }
        let Some((&len, rest)) = data.split_first() else {
            truncated = true;
            break;
        };
        data = rest;
        if data.len() < len as usize {
            truncated = true;
            break;
        }
        let (value, rest) = data.split_at(len as usize);
        options.insert(code, value.to_vec());
        data = rest;
    }
    (options, truncated)
}

/// A reply under construction. Options keep their push order; the
/// encoder appends the cookie and the END marker itself.
#[derive(Debug, Clone)]
pub struct ReplyPacket {
    pub xid: [u8; 4],
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: Option<String>,
    pub file: Option<String>,
    pub options: Vec<(u8, Vec<u8>)>,
}

impl ReplyPacket {
    /// Seeds a reply from the request: xid, flags, ciaddr, giaddr and
    /// the full 16-byte chaddr are echoed.
    pub fn for_request(req: &DhcpV4Packet) -> Self {
        Self {
            xid: req.xid,
            flags: req.flags,
            ciaddr: req.ciaddr,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: req.giaddr,
            chaddr: req.chaddr,
            sname: None,
            file: None,
            options: Vec::new(),
        }
    }

    pub fn push_option(&mut self, code: u8, value: Vec<u8>) {
        self.options.push((code, value));
    }

    /// Bytes the encoded frame will occupy.
    pub fn encoded_len(&self) -> usize {
        let opts: usize = self.options.iter().map(|(_, v)| 2 + v.len()).sum();
        BOOTP_HEADER_LEN + 4 + opts + 1
    }

    /// Writes the BOOTREPLY into `buf` and returns the frame length.
    /// The buffer may hold stale bytes from a previous use: the
    /// fixed-size text fields are zeroed in full before writing.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, DecodeError> {
        let needed = self.encoded_len();
        if buf.len() < needed {
            return Err(DecodeError::ShortFrame(buf.len()));
        }

        buf[0] = OP_BOOTREPLY;
        buf[1] = HTYPE_ETHERNET;
        buf[2] = 6;
        buf[3] = 0;
        buf[4..8].copy_from_slice(&self.xid);
        buf[8..10].copy_from_slice(&0u16.to_be_bytes());
        buf[10..12].copy_from_slice(&self.flags.to_be_bytes());
        buf[12..16].copy_from_slice(&self.ciaddr.octets());
        buf[16..20].copy_from_slice(&self.yiaddr.octets());
        buf[20..24].copy_from_slice(&self.siaddr.octets());
        buf[24..28].copy_from_slice(&self.giaddr.octets());
        buf[28..44].copy_from_slice(&self.chaddr);

        buf[44..108].fill(0);
        if let Some(sname) = &self.sname {
            let bytes = sname.as_bytes();
            let take = bytes.len().min(63);
            buf[44..44 + take].copy_from_slice(&bytes[..take]);
        }
        buf[108..236].fill(0);
        if let Some(file) = &self.file {
            let bytes = file.as_bytes();
            let take = bytes.len().min(127);
            buf[108..108 + take].copy_from_slice(&bytes[..take]);
        }

        buf[236..240].copy_from_slice(&MAGIC_COOKIE);
        let mut at = 240;
        for (code, value) in &self.options {
            buf[at] = *code;
            buf[at + 1] = value.len() as u8;
            buf[at + 2..at + 2 + value.len()].copy_from_slice(value);
            at += 2 + value.len();
        }
        buf[at] = codes::END;
        Ok(at + 1)
    }
}

/// Reads the message type back out of an encoded reply; a pure
/// function of the byte stream, used for reply metrics.
pub fn classify_reply(bytes: &[u8]) -> Option<MessageType> {
    if bytes.len() < BOOTP_HEADER_LEN + 4 || bytes[236..240] != MAGIC_COOKIE {
        return None;
    }
    let (options, _) = parse_options(&bytes[240..]);
    options.message_type()
}

/// Builds a request frame; test support shared across the crate.
#[cfg(test)]
pub(crate) fn build_request(
    xid: [u8; 4],
    hw: HardwareAddress,
    options: &[(u8, Vec<u8>)],
) -> Vec<u8> {
    let mut raw = vec![0u8; 240];
    raw[0] = OP_BOOTREQUEST;
    raw[1] = HTYPE_ETHERNET;
    raw[2] = 6;
    raw[4..8].copy_from_slice(&xid);
    raw[28..34].copy_from_slice(&hw.bytes());
    raw[236..240].copy_from_slice(&MAGIC_COOKIE);
    for (code, value) in options {
        raw.push(*code);
        raw.push(value.len() as u8);
        raw.extend_from_slice(value);
    }
    raw.push(codes::END);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_short_frames() {
        assert_eq!(
            DhcpV4Packet::decode(&[0u8; 100]),
            Err(DecodeError::ShortFrame(100))
        );
    }

    #[test]
    fn rejects_bad_cookie_before_op() {
        // op is BOOTREPLY *and* the cookie is wrong; the cookie wins.
        let mut raw = vec![0u8; 240];
        raw[0] = OP_BOOTREPLY;
        assert_eq!(DhcpV4Packet::decode(&raw), Err(DecodeError::BadMagic));
    }

    #[test]
    fn rejects_replies() {
        let hw = HardwareAddress::new([0xAA, 0xBB, 0xCC, 0, 0, 1]);
        let mut raw = build_request([0x12, 0x34, 0x56, 0x78], hw, &[]);
        raw[0] = OP_BOOTREPLY;
        assert_eq!(
            DhcpV4Packet::decode(&raw),
            Err(DecodeError::NotRequest(2))
        );
    }

    #[test]
    fn decodes_header_fields() {
        let hw = HardwareAddress::new([0xAA, 0xBB, 0xCC, 0, 0, 1]);
        let raw = build_request(
            [0x12, 0x34, 0x56, 0x78],
            hw,
            &[(codes::MESSAGE_TYPE, vec![1])],
        );
        let packet = DhcpV4Packet::decode(&raw).unwrap();
        assert_eq!(packet.xid, [0x12, 0x34, 0x56, 0x78]);
        assert_eq!(packet.hardware_address(), hw);
        assert_eq!(packet.message_type(), Some(MessageType::Discover));
        assert!(!packet.is_bootp());
        assert!(!packet.options_truncated);
    }

    #[test]
    fn truncated_option_flags_but_parses() {
        let hw = HardwareAddress::new([0xAA, 0xBB, 0xCC, 0, 0, 2]);
        let mut raw = build_request(
            [0, 0, 0, 1],
            hw,
            &[(codes::MESSAGE_TYPE, vec![1])],
        );
        // Replace END with a TLV that claims more bytes than remain.
        let end = raw.len() - 1;
        raw[end] = codes::HOST_NAME;
        raw.push(40);
        raw.extend_from_slice(b"cut");
        let packet = DhcpV4Packet::decode(&raw).unwrap();
        assert!(packet.options_truncated);
        assert_eq!(packet.message_type(), Some(MessageType::Discover));
    }

    #[test]
    fn hardware_address_display_is_canonical() {
        let hw = HardwareAddress::new([0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01]);
        assert_eq!(hw.to_string(), "AA:BB:CC:00:00:01");
        assert_eq!(HardwareAddress::parse("aa:bb:cc:00:00:01"), Some(hw));
        assert!(HardwareAddress::parse("aa:bb:cc").is_none());
    }

    #[test]
    fn encode_zeroes_pooled_buffer_fields() {
        let hw = HardwareAddress::new([0xAA, 0xBB, 0xCC, 0, 0, 1]);
        let raw = build_request([1, 2, 3, 4], hw, &[(codes::MESSAGE_TYPE, vec![1])]);
        let req = DhcpV4Packet::decode(&raw).unwrap();
        let mut reply = ReplyPacket::for_request(&req);
        reply.sname = Some(String::from("tftp.lab"));
        reply.file = Some(String::from("pxelinux.0"));
        reply.push_option(codes::MESSAGE_TYPE, vec![MessageType::Offer.code()]);

        // Pool buffers are handed back dirty.
        let mut buf = [0xFFu8; 1024];
        reply.encode_into(&mut buf).unwrap();
        assert_eq!(buf[107], 0, "sname must be NUL-terminated in-field");
        assert_eq!(buf[235], 0, "file must be NUL-terminated in-field");
        assert_eq!(&buf[44..52], b"tftp.lab");
    }

    #[test]
    fn classify_reads_the_reply_type_back() {
        let hw = HardwareAddress::new([0xAA, 0xBB, 0xCC, 0, 0, 1]);
        let raw = build_request([1, 2, 3, 4], hw, &[(codes::MESSAGE_TYPE, vec![1])]);
        let req = DhcpV4Packet::decode(&raw).unwrap();
        let mut reply = ReplyPacket::for_request(&req);
        reply.push_option(codes::SERVER_ID, vec![10, 0, 0, 1]);
        reply.push_option(codes::MESSAGE_TYPE, vec![MessageType::Nak.code()]);
        let mut buf = [0u8; 1024];
        let len = reply.encode_into(&mut buf).unwrap();
        assert_eq!(classify_reply(&buf[..len]), Some(MessageType::Nak));
    }

    proptest! {
        /// decode ∘ encode is the identity on the semantic fields.
        #[test]
        fn codec_round_trip(
            xid in proptest::array::uniform4(any::<u8>()),
            hw in proptest::array::uniform6(any::<u8>()),
            secs in any::<u16>(),
            flags in any::<u16>(),
            ciaddr in any::<u32>(),
            giaddr in any::<u32>(),
            requested in any::<u32>(),
            lease in any::<u32>(),
            hostname in "[a-z][a-z0-9-]{0,14}",
        ) {
            let mut raw = vec![0u8; 240];
            raw[0] = OP_BOOTREQUEST;
            raw[1] = HTYPE_ETHERNET;
            raw[2] = 6;
            raw[4..8].copy_from_slice(&xid);
            raw[8..10].copy_from_slice(&secs.to_be_bytes());
            raw[10..12].copy_from_slice(&flags.to_be_bytes());
            raw[12..16].copy_from_slice(&ciaddr.to_be_bytes());
            raw[24..28].copy_from_slice(&giaddr.to_be_bytes());
            raw[28..34].copy_from_slice(&hw);
            raw[236..240].copy_from_slice(&MAGIC_COOKIE);
            for (code, value) in [
                (codes::MESSAGE_TYPE, vec![3u8]),
                (codes::REQUESTED_IP, requested.to_be_bytes().to_vec()),
                (codes::LEASE_TIME, lease.to_be_bytes().to_vec()),
                (codes::HOST_NAME, hostname.as_bytes().to_vec()),
            ] {
                raw.push(code);
                raw.push(value.len() as u8);
                raw.extend_from_slice(&value);
            }
            raw.push(codes::END);

            let packet = DhcpV4Packet::decode(&raw).unwrap();
            prop_assert_eq!(packet.op, OP_BOOTREQUEST);
            prop_assert_eq!(packet.htype, HTYPE_ETHERNET);
            prop_assert_eq!(packet.xid, xid);
            prop_assert_eq!(packet.secs, secs);
            prop_assert_eq!(packet.flags, flags);
            prop_assert_eq!(packet.ciaddr, Ipv4Addr::from(ciaddr));
            prop_assert_eq!(packet.giaddr, Ipv4Addr::from(giaddr));
            prop_assert_eq!(packet.hardware_address().bytes(), hw);
            prop_assert_eq!(
                packet.options.requested_address(),
                Some(Ipv4Addr::from(requested))
            );
            prop_assert_eq!(packet.options.lease_time(), Some(lease));
            let decoded_hostname = packet.options.hostname();
            prop_assert_eq!(decoded_hostname.as_deref(), Some(hostname.as_str()));
        }
    }
}
