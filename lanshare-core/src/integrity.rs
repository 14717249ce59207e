//! Integrity: per-chunk digest (SHA-256, optionally truncated), verify on receive.

use sha2::{Digest, Sha256};

use crate::protocol::ChecksumAlgo;

/// Hash a chunk payload with the given algorithm.
pub fn hash_chunk(algo: ChecksumAlgo, payload: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    let digest = hasher.finalize();
    digest[..algo.digest_len()].to_vec()
}

/// Verify a payload against a checksum. The algorithm is implied by the checksum length;
/// an unsupported length never verifies.
pub fn verify_chunk(payload: &[u8], checksum: &[u8]) -> bool {
    match ChecksumAlgo::from_digest_len(checksum.len()) {
        Some(algo) => hash_chunk(algo, payload) == checksum,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_verify_roundtrip() {
        let payload = b"hello chunk";
        let hash = hash_chunk(ChecksumAlgo::Sha256, payload);
        assert_eq!(hash.len(), 32);
        assert!(verify_chunk(payload, &hash));
    }

    #[test]
    fn truncated_digest_is_prefix_of_full() {
        let payload = b"hello chunk";
        let full = hash_chunk(ChecksumAlgo::Sha256, payload);
        let short = hash_chunk(ChecksumAlgo::Sha256Trunc128, payload);
        assert_eq!(short.len(), 16);
        assert_eq!(&full[..16], &short[..]);
        assert!(verify_chunk(payload, &short));
    }

    #[test]
    fn verify_rejects_tampered() {
        let hash = hash_chunk(ChecksumAlgo::Sha256, b"hello chunk");
        assert!(!verify_chunk(b"tampered", &hash));
    }

    #[test]
    fn verify_rejects_odd_length() {
        let hash = hash_chunk(ChecksumAlgo::Sha256, b"x");
        assert!(!verify_chunk(b"x", &hash[..20]));
    }
}
