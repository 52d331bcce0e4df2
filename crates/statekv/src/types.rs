//! Core value types shared by the tree, the stores and the flush pipeline.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::readlog::ReadLog;

/// A 256-bit value as four little-endian 64-bit limbs.
///
/// Used for tree keys (already hashed by the caller), roots, node
/// digests, proof siblings and leaf scalars. Equality is limb-wise.
pub type Word256 = [u64; 4];

/// The all-zero word: empty tree root, empty subtree pointer, absent value.
pub const ZERO: Word256 = [0u64; 4];

pub fn is_zero(w: &Word256) -> bool {
    w.iter().all(|limb| *limb == 0)
}

/// Bit `i` of the word viewed as a little-endian 256-bit integer.
pub fn bit(w: &Word256, i: usize) -> u64 {
    (w[i / 64] >> (i % 64)) & 1
}

pub fn flip_bit(mut w: Word256, i: usize) -> Word256 {
    w[i / 64] ^= 1 << (i % 64);
    w
}

/// Logical shift right; shifts of 256 or more yield zero.
pub fn shr(w: &Word256, n: usize) -> Word256 {
    if n >= 256 {
        return ZERO;
    }
    let limbs = n / 64;
    let off = n % 64;
    let mut out = ZERO;
    for i in 0..4 - limbs {
        let mut v = w[i + limbs] >> off;
        if off > 0 && i + limbs + 1 < 4 {
            v |= w[i + limbs + 1] << (64 - off);
        }
        out[i] = v;
    }
    out
}

/// Logical shift left; shifts of 256 or more yield zero.
pub fn shl(w: &Word256, n: usize) -> Word256 {
    if n >= 256 {
        return ZERO;
    }
    let limbs = n / 64;
    let off = n % 64;
    let mut out = ZERO;
    for i in limbs..4 {
        let mut v = w[i - limbs] << off;
        if off > 0 && i > limbs {
            v |= w[i - limbs - 1] >> (64 - off);
        }
        out[i] = v;
    }
    out
}

/// The lowest `n` bits of the word.
pub fn low_bits(w: &Word256, n: usize) -> Word256 {
    if n >= 256 {
        return *w;
    }
    let mut out = ZERO;
    let limbs = n / 64;
    let rem = n % 64;
    out[..limbs].copy_from_slice(&w[..limbs]);
    if rem > 0 {
        out[limbs] = w[limbs] & ((1u64 << rem) - 1);
    }
    out
}

pub fn or(a: &Word256, b: &Word256) -> Word256 {
    [a[0] | b[0], a[1] | b[1], a[2] | b[2], a[3] | b[3]]
}

/// Big-endian byte view, the canonical order for hex strings.
pub fn to_bytes_be(w: &Word256) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..4 {
        out[i * 8..(i + 1) * 8].copy_from_slice(&w[3 - i].to_be_bytes());
    }
    out
}

pub fn from_bytes_be(bytes: &[u8; 32]) -> Word256 {
    let mut out = ZERO;
    for i in 0..4 {
        let mut limb = [0u8; 8];
        limb.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
        out[3 - i] = u64::from_be_bytes(limb);
    }
    out
}

/// 64-character lowercase hex, big-endian.
pub fn to_hex(w: &Word256) -> String {
    hex::encode(to_bytes_be(w))
}

/// Parse big-endian hex, optionally `0x`-prefixed, up to 64 digits.
pub fn from_hex(s: &str) -> Option<Word256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() || s.len() > 64 {
        return None;
    }
    let padded = format!("{s:0>64}");
    let bytes = hex::decode(padded).ok()?;
    let mut fixed = [0u8; 32];
    fixed.copy_from_slice(&bytes);
    Some(from_bytes_be(&fixed))
}

pub fn to_decimal(w: &Word256) -> String {
    BigUint::from_bytes_be(&to_bytes_be(w)).to_string()
}

/// Parse a decimal scalar; values that do not fit in 256 bits are rejected.
pub fn from_decimal(s: &str) -> Option<Word256> {
    let n: BigUint = s.parse().ok()?;
    if n.bits() > 256 {
        return None;
    }
    let bytes = n.to_bytes_be();
    let mut fixed = [0u8; 32];
    fixed[32 - bytes.len()..].copy_from_slice(&bytes);
    Some(from_bytes_be(&fixed))
}

/// How a `Set` changed the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetMode {
    Insert,
    Update,
    Delete,
    NoOp,
}

impl SetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetMode::Insert => "insert",
            SetMode::Update => "update",
            SetMode::Delete => "delete",
            SetMode::NoOp => "noop",
        }
    }
}

impl std::fmt::Display for SetMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a read with proof.
///
/// `siblings[h]` pairs with path bit `h`, root level first. `ins_key` and
/// `ins_value` describe the leaf found at the terminal slot: the queried
/// key itself on a hit, a colliding leaf on a near-miss, zeros when the
/// slot is empty. `is_old0` is true iff the slot is empty.
/// `proof_hash_counter` is the number of digest evaluations a verifier
/// needs to replay the proof.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetResult {
    pub root: Word256,
    pub key: Word256,
    pub value: Word256,
    pub siblings: Vec<Word256>,
    pub ins_key: Word256,
    pub ins_value: Word256,
    pub is_old0: bool,
    pub proof_hash_counter: u64,
    #[serde(skip)]
    pub read_log: Option<ReadLog>,
}

/// Result of a mutation.
///
/// `siblings` describe the key's path in the tree rooted at `new_root`,
/// so the proof replays against the new root. `is_old0` reports whether
/// the terminal slot was empty before the mutation; `old_value` is the
/// pre-mutation value (zero if absent) and `new_value` the value written
/// (zero on delete). `proof_hash_counter` counts node digests computed
/// while building the new path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetResult {
    pub old_root: Word256,
    pub new_root: Word256,
    pub key: Word256,
    pub siblings: Vec<Word256>,
    pub ins_key: Word256,
    pub ins_value: Word256,
    pub is_old0: bool,
    pub old_value: Word256,
    pub new_value: Word256,
    pub mode: SetMode,
    pub proof_hash_counter: u64,
    #[serde(skip)]
    pub read_log: Option<ReadLog>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_roundtrip() {
        let w: Word256 = [0x0123456789abcdef, 0xfedcba9876543210, 0xaaaa5555aaaa5555, 0x1];
        for n in [0, 1, 7, 63, 64, 65, 130, 255] {
            let back = shl(&shr(&w, n), n);
            // shr drops exactly what low_bits keeps
            assert_eq!(or(&back, &low_bits(&w, n)), w);
            assert_eq!(low_bits(&back, n), ZERO);
        }
        assert_eq!(shr(&w, 256), ZERO);
        assert_eq!(shl(&w, 256), ZERO);
    }

    #[test]
    fn test_bit_indexing() {
        let mut w = ZERO;
        w[2] = 1 << 5; // bit 133
        assert_eq!(bit(&w, 133), 1);
        assert_eq!(bit(&w, 132), 0);
        assert_eq!(flip_bit(w, 133), ZERO);
    }

    #[test]
    fn test_hex_roundtrip() {
        let w: Word256 = [1, 2, 3, 4];
        let s = to_hex(&w);
        assert_eq!(s.len(), 64);
        assert_eq!(from_hex(&s), Some(w));
        assert_eq!(from_hex(&format!("0x{s}")), Some(w));
        assert_eq!(from_hex("1"), Some([1, 0, 0, 0]));
        assert!(from_hex("zz").is_none());
        assert!(from_hex("").is_none());
    }

    #[test]
    fn test_decimal_roundtrip() {
        assert_eq!(from_decimal("0"), Some(ZERO));
        assert_eq!(from_decimal("5"), Some([5, 0, 0, 0]));
        assert_eq!(to_decimal(&[5, 0, 0, 0]), "5");
        let max = to_decimal(&[u64::MAX; 4]);
        assert_eq!(from_decimal(&max), Some([u64::MAX; 4]));
        // 2^256 does not fit
        assert!(from_decimal(
            "115792089237316195423570985008687907853269984665640564039457584007913129639936"
        )
        .is_none());
        assert!(from_decimal("12a").is_none());
    }
}
