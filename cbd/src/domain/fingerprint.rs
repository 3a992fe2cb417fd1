//! Abuse fingerprinting
//!
//! A submission is fingerprinted from its origin address, agent string,
//! and normalized contact. The digest is stored on the request so the
//! admission throttle can count recent submissions from the same origin
//! across daemon restarts.

use sha2::{Digest, Sha256};

/// Field separator inside the digest input; keeps "a"+"bc" distinct from "ab"+"c"
const SEP: &[u8] = b"\x1f";

/// Compute the abuse fingerprint for a submission
pub fn fingerprint(remote_addr: &str, agent: &str, contact: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(remote_addr.as_bytes());
    hasher.update(SEP);
    hasher.update(agent.as_bytes());
    hasher.update(SEP);
    hasher.update(contact.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = fingerprint("203.0.113.9", "Mozilla/5.0", "+13217047403");
        let b = fingerprint("203.0.113.9", "Mozilla/5.0", "+13217047403");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_varies_by_component() {
        let base = fingerprint("203.0.113.9", "Mozilla/5.0", "+13217047403");
        assert_ne!(base, fingerprint("203.0.113.10", "Mozilla/5.0", "+13217047403"));
        assert_ne!(base, fingerprint("203.0.113.9", "curl/8.0", "+13217047403"));
        assert_ne!(base, fingerprint("203.0.113.9", "Mozilla/5.0", "+13217047404"));
    }

    #[test]
    fn test_fingerprint_field_boundaries() {
        // Concatenation must not collide across field boundaries
        assert_ne!(fingerprint("ab", "c", "+1"), fingerprint("a", "bc", "+1"));
    }
}
