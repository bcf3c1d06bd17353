//! Single-block repair strategies used by `error_fix`.
//!
//! Both strategies are verified: a candidate block is only accepted when its
//! SHA-256 equals the leaf hash recorded in the stored tree sidecar.

use crate::merkle::parity::ParityFile;
use crate::util::{Hash, sha256};

/// Attempt to repair a damaged block against its known leaf hash by trying
/// single-edit candidates, in order:
///
/// 1. every adjacent byte swap,
/// 2. every single-byte substitution,
/// 3. every single-byte insertion at each position, keeping the block length
///    by dropping the final byte. The inserted byte is tried first as the
///    carry byte (the final byte of the previous block, modelling a dropped
///    byte that shifted subsequent bytes forward) and then as every value.
///
/// Returns the first candidate whose hash matches.
pub fn repair_block_by_hash(
    block: &[u8],
    target: &Hash,
    carry_byte: Option<u8>,
) -> Option<Vec<u8>> {
    let mut work = block.to_vec();

    for i in 0..work.len().saturating_sub(1) {
        work.swap(i, i + 1);
        if sha256(&work) == *target {
            return Some(work);
        }
        work.swap(i, i + 1);
    }

    for i in 0..work.len() {
        let original = work[i];
        for value in 0..=255u8 {
            if value == original {
                continue;
            }
            work[i] = value;
            if sha256(&work) == *target {
                return Some(work);
            }
        }
        work[i] = original;
    }

    for i in 0..block.len() {
        let mut candidate = Vec::with_capacity(block.len());
        candidate.extend_from_slice(&block[..i]);
        candidate.push(0);
        candidate.extend_from_slice(&block[i..block.len() - 1]);
        if let Some(carry) = carry_byte {
            candidate[i] = carry;
            if sha256(&candidate) == *target {
                return Some(candidate);
            }
        }
        for value in 0..=255u8 {
            if Some(value) == carry_byte {
                continue;
            }
            candidate[i] = value;
            if sha256(&candidate) == *target {
                return Some(candidate);
            }
        }
    }

    None
}

/// Attempt to reconstruct the block at `index` from parity: for each divisor
/// from the largest stratum down, XOR the parity block for the index's
/// residue with every other block sharing that residue. Short blocks
/// contribute zero-padded; the candidate is cut back to `expected_len`.
///
/// A wrong candidate (for instance when a residue-mate is itself damaged)
/// fails the hash check and the next divisor is tried.
pub fn repair_block_with_parity(
    parity: &ParityFile,
    blocks: &[Vec<u8>],
    index: usize,
    expected_len: usize,
    target: &Hash,
) -> Option<Vec<u8>> {
    for divisor in (parity.min_divisor()..=parity.max_divisor()).rev() {
        let residue = (index % divisor as usize) as u32;
        let mut candidate = parity.block(divisor, residue).to_vec();

        let mut mate = residue as usize;
        while mate < blocks.len() {
            if mate != index {
                for (i, byte) in blocks[mate].iter().enumerate() {
                    candidate[i] ^= byte;
                }
            }
            mate += divisor as usize;
        }

        candidate.truncate(expected_len);
        if sha256(&candidate) == *target {
            return Some(candidate);
        }
    }
    None
}
