//! Artifact integrity: SHA-256 checksums and HMAC-SHA256 signatures.
//!
//! Verification is pure; key distribution is the deployment's problem.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Pure signature verification capability.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, bytes: &[u8], signature: &str, key: &str) -> bool;
}

/// HMAC-SHA256 over the artifact bytes, signature base64-encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct HmacSha256Verifier;

impl SignatureVerifier for HmacSha256Verifier {
    fn verify(&self, bytes: &[u8], signature: &str, key: &str) -> bool {
        let Ok(expected) = BASE64.decode(signature) else {
            return false;
        };
        // HMAC keys of any length are accepted; new_from_slice only fails
        // for the unsized variant.
        let Ok(mut mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
            return false;
        };
        mac.update(bytes);
        mac.verify_slice(&expected).is_ok()
    }
}

/// Hex-encoded SHA-256 of `bytes`; the checksum format used by descriptors
/// and the on-disk artifact cache.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Produce a signature in the format `HmacSha256Verifier` accepts. Used by
/// the in-memory catalog and the test suites; the real catalog signs
/// upstream.
pub fn sign(bytes: &[u8], key: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(bytes);
    BASE64.encode(mac.finalize().into_bytes())
}
