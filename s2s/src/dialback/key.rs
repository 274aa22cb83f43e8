//! Server Dialback key derivation (RFC 3920 §8, unchanged by this spec).
//!
//! `key = HMAC-SHA1( SHA1_hex(secret), from + " " + to + " " + stream_id )`

use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use zeroize::Zeroize;

type HmacSha1 = Hmac<Sha1>;

/// Process-wide dialback secret, held for the lifetime of the process and
/// zeroized on drop since it is the sole shared credential every peer
/// verification on this server transitively trusts.
pub struct Secret(String);

impl Secret {
    pub fn new(raw: String) -> Self {
        Secret(raw)
    }

    /// Generate a random 40-character secret when the operator hasn't
    /// configured `local.secret`.
    pub fn generate() -> Self {
        use rand::Rng;
        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::thread_rng();
        let s: String = (0..40)
            .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
            .collect();
        Secret(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Compute the dialback key for a (from, to, stream_id) triple under `secret`.
///
/// Returns the key as a lowercase hex string, matching the wire format used
/// inside `<db:result>`/`<db:verify>` element bodies.
pub fn dialback_key(secret: &Secret, from: &str, to: &str, stream_id: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(secret.as_str().as_bytes());
    let secret_hash_hex = hex::encode(hasher.finalize());

    let mut mac = HmacSha1::new_from_slice(secret_hash_hex.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(from.as_bytes());
    mac.update(b" ");
    mac.update(to.as_bytes());
    mac.update(b" ");
    mac.update(stream_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Minimal hex encoder so we don't need to pull in the full `hex` crate just
/// for this one call site; matches the lowercase format dialback expects.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(bytes.as_ref().len() * 2);
        for b in bytes.as_ref() {
            write!(out, "{:02x}", b).unwrap();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_inputs() {
        let secret = Secret::new("s3cr3t".to_string());
        let k1 = dialback_key(&secret, "a.example", "b.example", "stream-1");
        let k2 = dialback_key(&secret, "a.example", "b.example", "stream-1");
        assert_eq!(k1, k2);
    }

    #[test]
    fn differs_when_any_input_differs() {
        let secret = Secret::new("s3cr3t".to_string());
        let base = dialback_key(&secret, "a.example", "b.example", "stream-1");
        assert_ne!(base, dialback_key(&secret, "c.example", "b.example", "stream-1"));
        assert_ne!(base, dialback_key(&secret, "a.example", "c.example", "stream-1"));
        assert_ne!(base, dialback_key(&secret, "a.example", "b.example", "stream-2"));
        let other_secret = Secret::new("different".to_string());
        assert_ne!(base, dialback_key(&other_secret, "a.example", "b.example", "stream-1"));
    }

    #[test]
    fn generated_secret_is_forty_chars() {
        let secret = Secret::generate();
        assert_eq!(secret.as_str().len(), 40);
    }
}
