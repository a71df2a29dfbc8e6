//! TSIG transaction signatures (RFC 2845).
//!
//! The signature is one additional record of type 250 appended after
//! everything else. The MAC covers the rendered message as it stood
//! before the TSIG record, followed by the key name, class ANY, TTL
//! 0 and the timer variables.

use base64::Engine;

use crate::core::errors::DdnsError;

use super::hmac;
use super::message::{encode_name, UpdateMessage, CLASS_ANY, TYPE_TSIG};

/// Fudge window in seconds, the RFC 2845 recommended value.
pub const FUDGE_SECS: u16 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsigAlgorithm {
    HmacMd5,
    HmacSha1,
    HmacSha256,
    HmacSha512,
}

impl TsigAlgorithm {
    /// Accepts both the short config spelling and the full wire name.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        match name.as_str() {
            "hmac-md5" | "md5" | "hmac-md5.sig-alg.reg.int" => Some(Self::HmacMd5),
            "hmac-sha1" | "sha1" => Some(Self::HmacSha1),
            "hmac-sha256" | "sha256" => Some(Self::HmacSha256),
            "hmac-sha512" | "sha512" => Some(Self::HmacSha512),
            _ => None,
        }
    }

    /// The algorithm's domain name as it travels in the RDATA.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::HmacMd5 => "hmac-md5.sig-alg.reg.int",
            Self::HmacSha1 => "hmac-sha1",
            Self::HmacSha256 => "hmac-sha256",
            Self::HmacSha512 => "hmac-sha512",
        }
    }

    pub fn mac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            Self::HmacMd5 => hmac::hmac_md5(key, data),
            Self::HmacSha1 => hmac::hmac_sha1(key, data),
            Self::HmacSha256 => hmac::hmac_sha256(key, data),
            Self::HmacSha512 => hmac::hmac_sha512(key, data),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TsigKey {
    pub name: String,
    pub secret: Vec<u8>,
    pub algorithm: TsigAlgorithm,
}

impl TsigKey {
    /// Builds a key from the configuration columns: key name, base64
    /// secret and algorithm spelling.
    pub fn from_config(name: &str, secret_b64: &str, algorithm: &str) -> Result<Self, DdnsError> {
        let algorithm = TsigAlgorithm::parse(algorithm)
            .ok_or_else(|| DdnsError::BadAlgorithm(algorithm.to_string()))?;
        let secret = base64::engine::general_purpose::STANDARD
            .decode(secret_b64.trim())
            .map_err(|_| DdnsError::BadSecret)?;
        Ok(Self {
            name: name.trim_end_matches('.').to_string(),
            secret,
            algorithm,
        })
    }
}

fn time48(time_signed: u64) -> [u8; 6] {
    let b = time_signed.to_be_bytes();
    [b[2], b[3], b[4], b[5], b[6], b[7]]
}

/// Signs the message in place: computes the MAC over the rendered
/// pre-TSIG bytes plus the timer variables, then appends the TSIG
/// record. Original-id echoes the message id; error and other-len
/// are zero.
pub fn sign(message: &mut UpdateMessage, key: &TsigKey, time_signed: u64) {
    let mut digest = message.to_bytes();
    digest.extend_from_slice(&encode_name(&key.name));
    digest.extend_from_slice(&CLASS_ANY.to_be_bytes());
    digest.extend_from_slice(&0u32.to_be_bytes());
    digest.extend_from_slice(&encode_name(key.algorithm.wire_name()));
    digest.extend_from_slice(&time48(time_signed));
    digest.extend_from_slice(&FUDGE_SECS.to_be_bytes());
    digest.extend_from_slice(&0u16.to_be_bytes()); // error
    digest.extend_from_slice(&0u16.to_be_bytes()); // other-len
    let mac = key.algorithm.mac(&key.secret, &digest);

    let mut rdata = encode_name(key.algorithm.wire_name());
    rdata.extend_from_slice(&time48(time_signed));
    rdata.extend_from_slice(&FUDGE_SECS.to_be_bytes());
    rdata.extend_from_slice(&(mac.len() as u16).to_be_bytes());
    rdata.extend_from_slice(&mac);
    rdata.extend_from_slice(&message.id().to_be_bytes());
    rdata.extend_from_slice(&0u16.to_be_bytes());
    rdata.extend_from_slice(&0u16.to_be_bytes());

    let mut record = encode_name(&key.name);
    record.extend_from_slice(&TYPE_TSIG.to_be_bytes());
    record.extend_from_slice(&CLASS_ANY.to_be_bytes());
    record.extend_from_slice(&0u32.to_be_bytes());
    record.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    record.extend_from_slice(&rdata);
    message.push_additional(&record);
}

fn skip_name(buf: &[u8], mut at: usize) -> Option<usize> {
    loop {
        let len = *buf.get(at)? as usize;
        at += 1;
        if len == 0 {
            return Some(at);
        }
        at += len;
    }
}

fn skip_record(buf: &[u8], at: usize) -> Option<usize> {
    let at = skip_name(buf, at)?;
    let rdlen = u16::from_be_bytes([*buf.get(at + 8)?, *buf.get(at + 9)?]) as usize;
    Some(at + 10 + rdlen)
}

/// Verifies a signed message produced by [`sign`]: locates the TSIG
/// record, reconstructs the unsigned message (original id, ARCOUNT
/// minus one) and recomputes the MAC. Used by the test suite and by
/// peers validating our updates.
pub fn verify(bytes: &[u8], key: &TsigKey) -> bool {
    let Some(result) = verify_inner(bytes, key) else {
        return false;
    };
    result
}

fn verify_inner(bytes: &[u8], key: &TsigKey) -> Option<bool> {
    if bytes.len() < 12 {
        return Some(false);
    }
    let upcount = u16::from_be_bytes([bytes[8], bytes[9]]) as usize;
    let adcount = u16::from_be_bytes([bytes[10], bytes[11]]) as usize;
    if adcount == 0 {
        return Some(false);
    }

    // One zone entry, zero prerequisites, then the updates and all
    // additionals but the last; the TSIG record closes the message.
    let mut at = skip_name(bytes, 12)? + 4;
    for _ in 0..upcount + adcount - 1 {
        at = skip_record(bytes, at)?;
    }
    let tsig_start = at;

    let at = skip_name(bytes, tsig_start)?;
    let rtype = u16::from_be_bytes([*bytes.get(at)?, *bytes.get(at + 1)?]);
    if rtype != TYPE_TSIG {
        return Some(false);
    }
    let rdata_at = at + 10;
    let alg_end = skip_name(bytes, rdata_at)?;
    let time = bytes.get(alg_end..alg_end + 6)?;
    let fudge = bytes.get(alg_end + 6..alg_end + 8)?;
    let mac_len =
        u16::from_be_bytes([*bytes.get(alg_end + 8)?, *bytes.get(alg_end + 9)?]) as usize;
    let mac = bytes.get(alg_end + 10..alg_end + 10 + mac_len)?;
    let orig_id = bytes.get(alg_end + 10 + mac_len..alg_end + 12 + mac_len)?;

    let mut base = bytes[..tsig_start].to_vec();
    base[0] = orig_id[0];
    base[1] = orig_id[1];
    let unsigned_adcount = (adcount as u16) - 1;
    base[10..12].copy_from_slice(&unsigned_adcount.to_be_bytes());

    let mut digest = base;
    digest.extend_from_slice(&encode_name(&key.name));
    digest.extend_from_slice(&CLASS_ANY.to_be_bytes());
    digest.extend_from_slice(&0u32.to_be_bytes());
    digest.extend_from_slice(&encode_name(key.algorithm.wire_name()));
    digest.extend_from_slice(time);
    digest.extend_from_slice(fudge);
    digest.extend_from_slice(&0u16.to_be_bytes());
    digest.extend_from_slice(&0u16.to_be_bytes());

    Some(key.algorithm.mac(&key.secret, &digest) == mac)
}
