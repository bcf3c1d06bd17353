use super::parity::{MAX_DIVISOR, MIN_DIVISOR, ParityFile};
use super::*;
use crate::util::{sha256, sha256_pair};

fn tree_from_bytes(data: &[u8]) -> MerkleTree {
    let mut tree = MerkleTree::new(true);
    for chunk in data.chunks(BLOCK_SIZE) {
        tree.add_data(chunk).unwrap();
    }
    tree.finalize().unwrap();
    tree
}

#[test]
fn test_empty_tree_hashes_empty_string() {
    let mut tree = MerkleTree::new(true);
    tree.finalize().unwrap();
    assert_eq!(tree.root_hash(), Some(sha256(b"")));
    assert_eq!(tree.total_bytes(), 0);
    assert_eq!(tree.node_count(), 1);
    assert!(tree.self_check());
}

#[test]
fn test_single_short_block() {
    let tree = tree_from_bytes(b"A");
    assert_eq!(tree.root_hash(), Some(sha256(b"A")));
    assert_eq!(tree.total_bytes(), 1);

    // A one-block file serializes as a single level-0 record.
    let bytes = tree.serialize().unwrap();
    assert_eq!(bytes.len(), NODE_RECORD_SIZE);
    assert_eq!(bytes[0], 0);
    assert_eq!(i64::from_le_bytes(bytes[1..9].try_into().unwrap()), 1);
    assert_eq!(&bytes[9..41], &sha256(b"A"));
}

#[test]
fn test_two_full_blocks() {
    let data = vec![0u8; 2 * BLOCK_SIZE];
    let tree = tree_from_bytes(&data);

    let leaf_hash = sha256(&data[..BLOCK_SIZE]);
    let root_hash = sha256_pair(&leaf_hash, &leaf_hash);
    assert_eq!(tree.root_hash(), Some(root_hash));
    assert_eq!(tree.total_bytes(), 2 * BLOCK_SIZE as u64);

    // Root at level 1 directly above the two leaves.
    let bytes = tree.serialize().unwrap();
    assert_eq!(bytes.len(), 3 * NODE_RECORD_SIZE);
    assert_eq!(bytes[0], 1);
    assert_eq!(bytes[NODE_RECORD_SIZE], 0);
    assert_eq!(bytes[2 * NODE_RECORD_SIZE], 0);
    assert!(tree.self_check());
}

#[test]
fn test_odd_fan_in_passes_hash_through() {
    // Three blocks: the right level-1 node has a single child, whose hash
    // passes through unhashed.
    let mut data = vec![0x11u8; 2 * BLOCK_SIZE];
    data.extend_from_slice(&[0x22u8; 100]);
    let tree = tree_from_bytes(&data);

    let h0 = sha256(&data[..BLOCK_SIZE]);
    let h1 = sha256(&data[BLOCK_SIZE..2 * BLOCK_SIZE]);
    let h2 = sha256(&data[2 * BLOCK_SIZE..]);
    let expected = sha256_pair(&sha256_pair(&h0, &h1), &h2);
    assert_eq!(tree.root_hash(), Some(expected));
    assert!(tree.self_check());
    assert_eq!(tree.list_block_hashes().unwrap(), vec![h0, h1, h2]);
}

#[test]
fn test_lean_and_serializable_agree() {
    let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

    let serializable = tree_from_bytes(&data);
    let mut lean = MerkleTree::new(false);
    for chunk in data.chunks(BLOCK_SIZE) {
        lean.add_data(chunk).unwrap();
    }
    lean.finalize().unwrap();

    assert_eq!(serializable.root_hash(), lean.root_hash());
    assert_eq!(serializable.total_bytes(), lean.total_bytes());
    assert!(lean.serialize().is_err());
}

#[test]
fn test_round_trip() {
    let data: Vec<u8> = (0..10_240u32).map(|i| (i / 7) as u8).collect();
    let tree = tree_from_bytes(&data);
    let bytes = tree.serialize().unwrap();

    let decoded = MerkleTree::deserialize(&bytes).unwrap();
    assert!(decoded.equals(&tree));
    assert!(tree.equals(&decoded));
    assert_eq!(decoded.root_hash(), tree.root_hash());
    assert_eq!(decoded.total_bytes(), tree.total_bytes());
    assert!(decoded.self_check());
    assert_eq!(decoded.serialized_len(), bytes.len());
}

#[test]
fn test_deserialize_rejects_truncated_header() {
    let tree = tree_from_bytes(&[0xabu8; 3000]);
    let bytes = tree.serialize().unwrap();
    let result = MerkleTree::deserialize(&bytes[..bytes.len() - 5]);
    assert!(matches!(result, Err(FilemassError::TreeFileCorrupted)));
}

#[test]
fn test_deserialize_rejects_level_gap() {
    let tree = tree_from_bytes(&[0xcdu8; 5 * BLOCK_SIZE]);
    let mut bytes = tree.serialize().unwrap();
    // Corrupt the second record's level so it is no longer root level - 1.
    bytes[NODE_RECORD_SIZE] = 1;
    let result = MerkleTree::deserialize(&bytes);
    assert!(matches!(result, Err(FilemassError::TreeFileCorrupted)));
}

#[test]
fn test_self_check_catches_bad_interior_hash() {
    let tree = tree_from_bytes(&[0x55u8; 4 * BLOCK_SIZE]);
    let mut bytes = tree.serialize().unwrap();
    // Flip a byte of the root hash.
    bytes[9] ^= 0xff;
    let decoded = MerkleTree::deserialize(&bytes).unwrap();
    assert!(!decoded.self_check());
}

#[test]
fn test_add_data_validation() {
    let mut tree = MerkleTree::new(true);
    assert!(tree.add_data(&[0u8; BLOCK_SIZE + 1]).is_err());

    tree.add_data(&[0u8; 10]).unwrap();
    // Only the final block may be short.
    assert!(tree.add_data(&[0u8; BLOCK_SIZE]).is_err());

    let mut tree = MerkleTree::new(true);
    tree.add_data(&[0u8; BLOCK_SIZE]).unwrap();
    tree.finalize().unwrap();
    assert!(tree.add_data(&[0u8; BLOCK_SIZE]).is_err());
    assert!(tree.finalize().is_err());
}

#[test]
fn test_root_hash_deterministic() {
    let data: Vec<u8> = (0..3333u32).map(|i| (i % 201) as u8).collect();
    assert_eq!(
        tree_from_bytes(&data).root_hash(),
        tree_from_bytes(&data).root_hash()
    );
}

#[test]
fn test_leaf_records_iterator_matches_tree() {
    let data: Vec<u8> = (0..7000u32).map(|i| (i % 97) as u8).collect();
    let tree = tree_from_bytes(&data);
    let bytes = tree.serialize().unwrap();

    let from_stream: Vec<LeafRecord> = leaf_records(&bytes).map(|r| r.unwrap()).collect();
    assert_eq!(from_stream, tree.leaves().unwrap());
}

#[test]
fn test_parity_format_and_strata() {
    let data = vec![0x0fu8; 3 * BLOCK_SIZE];
    let parity = ParityFile::build(&mut &data[..]).unwrap();

    let bytes = parity.to_bytes();
    let strata: usize = (MIN_DIVISOR..=MAX_DIVISOR).map(|d| d as usize).sum();
    assert_eq!(bytes.len(), 8 + strata * BLOCK_SIZE);
    assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 2);
    assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 11);

    // Divisor 2, residue 0 holds blocks 0 and 2; XOR of identical blocks
    // cancels. Residue 1 holds block 1 alone.
    assert_eq!(parity.block(2, 0), &[0u8; BLOCK_SIZE]);
    assert_eq!(parity.block(2, 1), &[0x0fu8; BLOCK_SIZE]);

    let decoded = ParityFile::from_bytes(&bytes).unwrap();
    assert_eq!(decoded.block(2, 1), parity.block(2, 1));
}

#[test]
fn test_parity_short_final_block_zero_padded() {
    let mut data = vec![0xffu8; BLOCK_SIZE];
    data.extend_from_slice(&[0xffu8; 16]);
    let parity = ParityFile::build(&mut &data[..]).unwrap();

    // Blocks 0 and 1 share residue 0 mod 2; the short block XORs in
    // zero-padded, leaving the padding region untouched.
    let stratum = parity.block(2, 0);
    assert_eq!(&stratum[..16], &[0u8; 16]);
    assert_eq!(&stratum[16..], &[0xffu8; BLOCK_SIZE - 16]);
}

#[test]
fn test_parity_recovers_single_block() {
    let data: Vec<u8> = (0..(4 * BLOCK_SIZE) as u32).map(|i| (i % 253) as u8).collect();
    let parity = ParityFile::build(&mut &data[..]).unwrap();

    // Blocks 0 and 2 share residue 0 mod 2; XOR'ing block 0 back out of the
    // parity stratum must reproduce block 2.
    let mut candidate = parity.block(2, 0).to_owned();
    for i in 0..BLOCK_SIZE {
        candidate[i] ^= data[i];
    }
    assert_eq!(&candidate[..], &data[2 * BLOCK_SIZE..3 * BLOCK_SIZE]);
}

#[test]
fn test_parity_rejects_malformed() {
    assert!(ParityFile::from_bytes(&[1, 2, 3]).is_err());

    let data = vec![0u8; BLOCK_SIZE];
    let mut bytes = ParityFile::build(&mut &data[..]).unwrap().to_bytes();
    bytes.pop();
    assert!(ParityFile::from_bytes(&bytes).is_err());
}
