//! Content digests for serialized nodes.

use crate::types::Word256;

const DOMAIN_NODE: &[u8] = b"statekv:node:v1";

/// Digest of a node's serialized limbs: BLAKE3 over the domain tag and
/// the limbs in little-endian byte order, read back as four LE limbs.
/// Store key == digest of stored content.
pub fn node_digest(content: &[u64]) -> Word256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(DOMAIN_NODE);
    for limb in content {
        hasher.update(&limb.to_le_bytes());
    }
    let digest = hasher.finalize();
    let bytes = digest.as_bytes();
    let mut out = [0u64; 4];
    for i in 0..4 {
        let mut limb = [0u8; 8];
        limb.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
        out[i] = u64::from_le_bytes(limb);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable_and_content_sensitive() {
        let a = node_digest(&[1, 2, 3]);
        assert_eq!(a, node_digest(&[1, 2, 3]));
        assert_ne!(a, node_digest(&[1, 2, 4]));
        assert_ne!(a, node_digest(&[1, 2]));
    }
}
