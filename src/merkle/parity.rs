//! XOR parity sidecars (`.fmparity`).
//!
//! The file starts with two little-endian u32s, `min_divisor` and
//! `max_divisor`. For every divisor `d` in that range and every residue `m`
//! in `0..d` it then carries one 1024-byte block: the XOR of all source
//! blocks whose index is congruent to `m` modulo `d`, short final blocks
//! zero-padded. Any single damaged source block can be recovered by XOR'ing
//! its residue-mates back out of the parity block.

use std::io::Read;
use std::path::Path;

use crate::error::{FilemassError, Result};
use crate::merkle::BLOCK_SIZE;

pub const MIN_DIVISOR: u32 = 2;
pub const MAX_DIVISOR: u32 = 11;

pub struct ParityFile {
    min_divisor: u32,
    max_divisor: u32,
    blocks: Vec<[u8; BLOCK_SIZE]>,
}

/// Number of (divisor, residue) parity blocks for a divisor range.
fn block_count(min_divisor: u32, max_divisor: u32) -> usize {
    (min_divisor..=max_divisor).map(|d| d as usize).sum()
}

impl ParityFile {
    /// Stream a source file and accumulate all parity strata in one pass.
    pub fn build<R: Read>(reader: &mut R) -> Result<ParityFile> {
        let mut parity = ParityFile {
            min_divisor: MIN_DIVISOR,
            max_divisor: MAX_DIVISOR,
            blocks: vec![[0u8; BLOCK_SIZE]; block_count(MIN_DIVISOR, MAX_DIVISOR)],
        };

        let mut buf = [0u8; BLOCK_SIZE];
        let mut index: u64 = 0;
        loop {
            let n = read_block(reader, &mut buf)?;
            if n == 0 {
                break;
            }
            // Zero-pad short final blocks for the XOR.
            buf[n..].fill(0);
            parity.absorb(index, &buf);
            if n < BLOCK_SIZE {
                break;
            }
            index += 1;
        }
        Ok(parity)
    }

    pub fn from_path(path: &Path) -> Result<ParityFile> {
        let mut file = std::fs::File::open(path)?;
        Self::build(&mut file)
    }

    fn absorb(&mut self, index: u64, block: &[u8; BLOCK_SIZE]) {
        for divisor in self.min_divisor..=self.max_divisor {
            let residue = (index % u64::from(divisor)) as u32;
            let offset = self.offset(divisor, residue);
            let target = &mut self.blocks[offset];
            for i in 0..BLOCK_SIZE {
                target[i] ^= block[i];
            }
        }
    }

    fn offset(&self, divisor: u32, residue: u32) -> usize {
        let before: usize = (self.min_divisor..divisor).map(|d| d as usize).sum();
        before + residue as usize
    }

    pub fn min_divisor(&self) -> u32 {
        self.min_divisor
    }

    pub fn max_divisor(&self) -> u32 {
        self.max_divisor
    }

    /// The parity block for a (divisor, residue) stratum.
    pub fn block(&self, divisor: u32, residue: u32) -> &[u8; BLOCK_SIZE] {
        &self.blocks[self.offset(divisor, residue)]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.blocks.len() * BLOCK_SIZE);
        out.extend_from_slice(&self.min_divisor.to_le_bytes());
        out.extend_from_slice(&self.max_divisor.to_le_bytes());
        for block in &self.blocks {
            out.extend_from_slice(block);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ParityFile> {
        if bytes.len() < 8 {
            return Err(FilemassError::ParityFileCorrupted);
        }
        let min_divisor = u32::from_le_bytes(
            bytes[0..4]
                .try_into()
                .map_err(|_| FilemassError::ParityFileCorrupted)?,
        );
        let max_divisor = u32::from_le_bytes(
            bytes[4..8]
                .try_into()
                .map_err(|_| FilemassError::ParityFileCorrupted)?,
        );
        if min_divisor == 0 || min_divisor > max_divisor {
            return Err(FilemassError::ParityFileCorrupted);
        }
        let count = block_count(min_divisor, max_divisor);
        if bytes.len() != 8 + count * BLOCK_SIZE {
            return Err(FilemassError::ParityFileCorrupted);
        }
        let mut blocks = Vec::with_capacity(count);
        for i in 0..count {
            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(&bytes[8 + i * BLOCK_SIZE..8 + (i + 1) * BLOCK_SIZE]);
            blocks.push(block);
        }
        Ok(ParityFile {
            min_divisor,
            max_divisor,
            blocks,
        })
    }

    pub fn read_from_path(path: &Path) -> Result<ParityFile> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

/// Read until the buffer is full or the stream ends; returns the byte count.
pub fn read_block<R: Read>(reader: &mut R, buf: &mut [u8; BLOCK_SIZE]) -> Result<usize> {
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
