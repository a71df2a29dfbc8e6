//! HMAC (RFC 2104) over the digest set TSIG supports.

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

/// HMAC-MD5 → 16-byte MAC. MD5 is long deprecated but still the
/// default TSIG algorithm of many DNS servers.
pub fn hmac_md5(key: &[u8], data: &[u8]) -> Vec<u8> {
    const BLOCK: usize = 64;
    let mut k = [0u8; BLOCK];
    if key.len() > BLOCK {
        k[..16].copy_from_slice(&md5::compute(key).0);
    } else {
        k[..key.len()].copy_from_slice(key);
    }

    let mut ipad = [0x36u8; BLOCK];
    let mut opad = [0x5cu8; BLOCK];
    for i in 0..BLOCK {
        ipad[i] ^= k[i];
        opad[i] ^= k[i];
    }

    let mut inner = Vec::with_capacity(BLOCK + data.len());
    inner.extend_from_slice(&ipad);
    inner.extend_from_slice(data);
    let inner_hash = md5::compute(&inner);

    let mut outer = Vec::with_capacity(BLOCK + 16);
    outer.extend_from_slice(&opad);
    outer.extend_from_slice(&inner_hash.0);
    md5::compute(&outer).0.to_vec()
}

fn hmac_digest<D: Digest>(block: usize, key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut k = vec![0u8; block];
    if key.len() > block {
        let h = D::digest(key);
        k[..h.len()].copy_from_slice(&h);
    } else {
        k[..key.len()].copy_from_slice(key);
    }

    let mut ipad = vec![0x36u8; block];
    let mut opad = vec![0x5cu8; block];
    for i in 0..block {
        ipad[i] ^= k[i];
        opad[i] ^= k[i];
    }

    let mut hasher = D::new();
    hasher.update(&ipad);
    hasher.update(data);
    let inner = hasher.finalize();

    let mut hasher = D::new();
    hasher.update(&opad);
    hasher.update(&inner);
    hasher.finalize().to_vec()
}

/// HMAC-SHA-1 → 20-byte MAC.
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    hmac_digest::<Sha1>(64, key, data)
}

/// HMAC-SHA-256 → 32-byte MAC.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    hmac_digest::<Sha256>(64, key, data)
}

/// HMAC-SHA-512 → 64-byte MAC. Note the 128-byte block.
pub fn hmac_sha512(key: &[u8], data: &[u8]) -> Vec<u8> {
    hmac_digest::<Sha512>(128, key, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    // RFC 2202 test case 2.
    #[test]
    fn rfc2202_md5() {
        let mac = hmac_md5(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(hex(&mac), "750c783e6ab0b503eaa86e310a5db738");
    }

    #[test]
    fn rfc2202_sha1() {
        let mac = hmac_sha1(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(hex(&mac), "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");
    }

    // RFC 4231 test case 2.
    #[test]
    fn rfc4231_sha256() {
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex(&mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn rfc4231_sha512() {
        let mac = hmac_sha512(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex(&mac),
            "164b7a7bfcf819e2e395fbe73b56e0a387bd64222e831fd610270cd7ea250554\
             9758bf75c05a994a6d034f65f8f0e6fdcaeab1a34d4a6b4b636e070a38bce737"
        );
    }

    #[test]
    fn long_keys_are_hashed_first() {
        let key = [0xAAu8; 131];
        let short = hmac_sha256(&sha2::Sha256::digest(key).to_vec(), b"x");
        let long = hmac_sha256(&key, b"x");
        assert_eq!(short, long);
    }
}
