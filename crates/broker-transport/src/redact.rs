//! Hashes secrets and tokens before they reach a `tracing` field.

use sha2::{Digest, Sha256};

/// First 16 hex characters of the value's SHA-256 digest — enough to
/// correlate repeated occurrences in a log stream without leaking the
/// value itself.
pub fn hash_for_log(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_hashes_the_same() {
        assert_eq!(hash_for_log("s3cret"), hash_for_log("s3cret"));
    }

    #[test]
    fn different_input_hashes_differently() {
        assert_ne!(hash_for_log("s3cret"), hash_for_log("other"));
    }

    #[test]
    fn does_not_leak_the_original_value() {
        assert!(!hash_for_log("s3cret").contains("s3cret"));
    }
}
