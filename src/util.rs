use sha2::{Digest, Sha256};

/// A 32-byte digest. Rendered as 64 lowercase hex characters in text.
pub type Hash = [u8; 32];

/// The all-zero hash, reserved as the root-context sentinel: it is the
/// parent hash-sum of the file level in the tag index and must never be
/// produced as a real digest.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Fixed constant folded into the hash-sum combinator. The tag index format
/// depends on this exact byte sequence; changing it makes existing tagbases
/// unreadable.
const HASH_SUM_CONSTANT: Hash = [
    0x60, 0xeb, 0xdf, 0x09, 0xe0, 0x93, 0x2a, 0x53, 0xb0, 0xa2, 0x1c, 0x4f, 0x84, 0xa0, 0x93,
    0x66, 0xad, 0x4c, 0x78, 0x1a, 0xef, 0xd3, 0x07, 0x19, 0xa1, 0x07, 0x28, 0xe5, 0x30, 0x8c,
    0x48, 0x80,
];

/// SHA-256 of a byte slice as a fixed array.
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();

    let mut hash = [0u8; 32];
    hash.copy_from_slice(result.as_slice());
    hash
}

/// SHA-256 of two concatenated 32-byte digests, used for interior Merkle
/// nodes. Order matters: `sha256_pair(a, b) != sha256_pair(b, a)`.
pub fn sha256_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let result = hasher.finalize();

    let mut hash = [0u8; 32];
    hash.copy_from_slice(result.as_slice());
    hash
}

fn xor256(out: &mut Hash, other: &Hash) {
    for i in 0..32 {
        out[i] ^= other[i];
    }
}

/// 256-bit big-endian addition; the carry propagates from byte 31 upward
/// and overflow past byte 0 is discarded.
fn add256(out: &mut Hash, other: &Hash) {
    let mut carry = 0u8;
    for i in (0..32).rev() {
        let (sum, c1) = out[i].overflowing_add(other[i]);
        let (sum, c2) = sum.overflowing_add(carry);
        carry = u8::from(c1 || c2);
        out[i] = sum;
    }
}

/// Combines a parent hash-sum with a child hash into the child's position
/// identifier: XOR the constant into the parent twice, then add the child
/// as a 256-bit big-endian integer.
///
/// The double XOR cancels itself out; it is kept because existing tag
/// indexes depend on the combinator's exact output bit-for-bit. Not
/// cryptographically secure; it only has to be deterministic and cheap.
pub fn hash_sum(parent: &Hash, child: &Hash) -> Hash {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = parent[i] ^ HASH_SUM_CONSTANT[i];
    }
    xor256(&mut out, &HASH_SUM_CONSTANT);
    add256(&mut out, child);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash_sum_deterministic() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        assert_eq!(hash_sum(&a, &b), hash_sum(&a, &b));
    }

    #[test]
    fn test_hash_sum_distinguishes_paths_by_parent() {
        // Position identifiers differ whenever the parent context differs.
        let file_a = sha256(b"file a");
        let file_b = sha256(b"file b");
        let tag = sha256(b"team");
        assert_ne!(hash_sum(&file_a, &tag), hash_sum(&file_b, &tag));
        assert_ne!(hash_sum(&ZERO_HASH, &tag), hash_sum(&file_a, &tag));
    }

    #[test]
    fn test_hash_sum_chains_depend_on_every_level() {
        let file = sha256(b"file");
        let outer = sha256(b"outer");
        let inner = sha256(b"inner");
        let depth_two = hash_sum(&hash_sum(&file, &outer), &inner);
        assert_ne!(depth_two, hash_sum(&file, &inner));
        assert_ne!(depth_two, hash_sum(&file, &outer));
    }

    #[test]
    fn test_hash_sum_xor_step_cancels() {
        // With a zero child the combinator reduces to the parent itself,
        // which is what the double XOR of the constant amounts to.
        let p = sha256(b"parent");
        assert_eq!(hash_sum(&p, &ZERO_HASH), p);
    }

    #[test]
    fn test_add256_carry_chain() {
        let mut out = [0u8; 32];
        out[31] = 0xff;
        out[30] = 0xff;
        let mut one = [0u8; 32];
        one[31] = 0x01;
        add256(&mut out, &one);
        assert_eq!(out[31], 0x00);
        assert_eq!(out[30], 0x00);
        assert_eq!(out[29], 0x01);
        assert_eq!(out[28], 0x00);
    }
}
