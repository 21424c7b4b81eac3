//! TLS 1.2 pseudo-random function (RFC 5246 section 5) over HMAC-SHA256.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn hmac(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    for part in parts {
        mac.update(part);
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&mac.finalize().into_bytes());
    digest
}

/// Fill `out` with `PRF(secret, label, seed)`.
///
/// `P_SHA256(secret, label || seed)`: A(0) = label || seed,
/// A(i) = HMAC(secret, A(i-1)), output = HMAC(secret, A(1) || label || seed) || ...
pub fn prf(out: &mut [u8], secret: &[u8], label: &[u8], seed: &[u8]) {
    let mut a = hmac(secret, &[label, seed]);
    let mut written = 0;

    while written < out.len() {
        let block = hmac(secret, &[&a, label, seed]);
        let take = (out.len() - written).min(block.len());
        out[written..written + take].copy_from_slice(&block[..take]);
        written += take;
        a = hmac(secret, &[&a]);
    }
}
