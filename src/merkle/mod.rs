//! Block-level Merkle trees over repository files.
//!
//! A file is split into 1024-byte blocks (the final block may be shorter);
//! each block becomes a level-0 leaf hashed with SHA-256, and interior nodes
//! combine children left-to-right. The resulting root hash is the file's
//! repository address, and the serialized tree is stored next to the blob as
//! its `.fmtree` sidecar.
pub mod parity;
#[cfg(test)]
pub mod tests;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{FilemassError, Result};
use crate::util::{Hash, sha256, sha256_pair};

/// Size of a full file block in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// On-disk size of one serialized node record: level byte, data size, hash.
pub const NODE_RECORD_SIZE: usize = 1 + 8 + 32;

/// One leaf entry of a serialized tree: the block's hash and payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafRecord {
    pub hash: Hash,
    pub data_size: i64,
}

#[derive(Debug, Clone)]
struct MerkleNode {
    level: u8,
    /// Payload bytes below this node; -1 until computed.
    data_size: i64,
    hash: Option<Hash>,
    parent: Option<usize>,
    child0: Option<usize>,
    child1: Option<usize>,
}

impl MerkleNode {
    fn new(level: u8, parent: Option<usize>) -> Self {
        MerkleNode {
            level,
            data_size: -1,
            hash: None,
            parent,
            child0: None,
            child1: None,
        }
    }
}

/// A left-filled binary hash tree under streaming construction.
///
/// Leaves are appended with [`MerkleTree::add_data`]; [`MerkleTree::finalize`]
/// computes the interior hashes and freezes the tree. A tree built with
/// `serializable = false` seals and drops filled subtrees as it goes and can
/// only report its root hash; a serializable tree retains every node for
/// [`MerkleTree::serialize`].
pub struct MerkleTree {
    nodes: Vec<MerkleNode>,
    root: usize,
    cursor: usize,
    leaf_count: u64,
    total_bytes: u64,
    seen_short_block: bool,
    serializable: bool,
    hash: Option<Hash>,
}

impl MerkleTree {
    pub fn new(serializable: bool) -> Self {
        MerkleTree {
            nodes: vec![MerkleNode::new(0, None)],
            root: 0,
            cursor: 0,
            leaf_count: 0,
            total_bytes: 0,
            seen_short_block: false,
            serializable,
            hash: None,
        }
    }

    /// Root hash, available once the tree is finalized.
    pub fn root_hash(&self) -> Option<Hash> {
        self.hash
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Exact byte length of this tree's serialized form.
    pub fn serialized_len(&self) -> usize {
        self.nodes.len() * NODE_RECORD_SIZE
    }

    fn push_node(&mut self, level: u8, parent: Option<usize>) -> usize {
        self.nodes.push(MerkleNode::new(level, parent));
        self.nodes.len() - 1
    }

    /// Append the next file block as a leaf.
    ///
    /// Every block must be exactly [`BLOCK_SIZE`] bytes except the last,
    /// which may be shorter; a second short block is rejected.
    pub fn add_data(&mut self, block: &[u8]) -> Result<()> {
        if self.hash.is_some() {
            return Err(FilemassError::InvalidInput(
                "cannot add data to a finalized merkle tree".into(),
            ));
        }
        if block.len() > BLOCK_SIZE {
            return Err(FilemassError::InvalidInput(format!(
                "merkle tree blocks must be at most {BLOCK_SIZE} bytes, got {}",
                block.len()
            )));
        }
        if self.seen_short_block {
            return Err(FilemassError::InvalidInput(
                "merkle tree already received a block shorter than 1024 bytes; \
                 only the final block may be short"
                    .into(),
            ));
        }
        if block.len() < BLOCK_SIZE {
            self.seen_short_block = true;
        }

        let leaf = if self.leaf_count == 0 {
            // The initial root doubles as the first leaf.
            self.root
        } else {
            let slot = self.find_vacant_slot();
            self.descend_to_leaf(slot)
        };

        self.nodes[leaf].hash = Some(sha256(block));
        self.nodes[leaf].data_size = block.len() as i64;
        self.cursor = leaf;
        self.leaf_count += 1;
        self.total_bytes += block.len() as u64;
        Ok(())
    }

    /// Ascend from the cursor to the nearest node with a vacant child slot,
    /// raising a new root when the whole tree is full. In memory-lean mode
    /// every full node passed on the way up is sealed.
    fn find_vacant_slot(&mut self) -> usize {
        let mut cur = self.cursor;
        loop {
            if self.nodes[cur].level > 0 && self.nodes[cur].child1.is_none() {
                return cur;
            }
            match self.nodes[cur].parent {
                Some(parent) => {
                    if !self.serializable {
                        self.seal_node(cur);
                    }
                    cur = parent;
                }
                None => {
                    // Root with two filled children: raise the tree a level.
                    if !self.serializable {
                        self.seal_node(cur);
                    }
                    let level = self.nodes[cur].level + 1;
                    let new_root = self.push_node(level, None);
                    self.nodes[new_root].child0 = Some(cur);
                    self.nodes[cur].parent = Some(new_root);
                    self.root = new_root;
                    return new_root;
                }
            }
        }
    }

    /// Build the fresh spine from `from` down to a new level-0 leaf,
    /// filling `child0` before `child1`.
    fn descend_to_leaf(&mut self, from: usize) -> usize {
        let mut cur = from;
        while self.nodes[cur].level > 0 {
            let level = self.nodes[cur].level - 1;
            let child = self.push_node(level, Some(cur));
            if self.nodes[cur].child0.is_none() {
                self.nodes[cur].child0 = Some(child);
            } else {
                self.nodes[cur].child1 = Some(child);
            }
            cur = child;
        }
        cur
    }

    /// Compute a full subtree's hash and size, then drop its children.
    fn seal_node(&mut self, idx: usize) {
        if self.nodes[idx].hash.is_none() {
            let hash = self.compute_hash(idx);
            self.nodes[idx].hash = hash;
        }
        self.compute_data_size(idx);
        self.nodes[idx].child0 = None;
        self.nodes[idx].child1 = None;
    }

    fn compute_hash(&mut self, idx: usize) -> Option<Hash> {
        if let Some(hash) = self.nodes[idx].hash {
            return Some(hash);
        }
        let (child0, child1) = (self.nodes[idx].child0, self.nodes[idx].child1);
        let hash = match (child0, child1) {
            (Some(c0), Some(c1)) => {
                let h0 = self.compute_hash(c0)?;
                let h1 = self.compute_hash(c1)?;
                Some(sha256_pair(&h0, &h1))
            }
            // Interior node with a single child passes the child hash
            // through unhashed; root hashes depend on this.
            (Some(c0), None) => self.compute_hash(c0),
            _ => None,
        };
        self.nodes[idx].hash = hash;
        hash
    }

    fn compute_data_size(&mut self, idx: usize) -> i64 {
        if self.nodes[idx].data_size >= 0 {
            return self.nodes[idx].data_size;
        }
        let (child0, child1) = (self.nodes[idx].child0, self.nodes[idx].child1);
        let size = child0.map_or(0, |c| self.compute_data_size(c))
            + child1.map_or(0, |c| self.compute_data_size(c));
        self.nodes[idx].data_size = size;
        size
    }

    /// Compute every pending interior hash bottom-up and freeze the tree.
    ///
    /// A tree that never received data finalizes as the empty file: a single
    /// level-0 leaf hashing the empty byte string.
    pub fn finalize(&mut self) -> Result<()> {
        if self.hash.is_some() {
            return Err(FilemassError::InvalidInput(
                "finalize() called on an already finalized merkle tree".into(),
            ));
        }
        if self.leaf_count == 0 {
            self.nodes[self.root].hash = Some(sha256(&[]));
            self.nodes[self.root].data_size = 0;
        }
        let root = self.root;
        let hash = self.compute_hash(root).ok_or_else(|| {
            FilemassError::Integrity("merkle tree root hash could not be computed".into())
        })?;
        self.compute_data_size(root);
        self.hash = Some(hash);
        Ok(())
    }

    /// Serialize the tree in depth-first pre-order, 41 bytes per node:
    /// level, payload size (little-endian i64), hash.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if !self.serializable {
            return Err(FilemassError::InvalidInput(
                "serialize called on a memory-lean merkle tree".into(),
            ));
        }
        if self.hash.is_none() {
            return Err(FilemassError::InvalidInput(
                "serialize called on a non-finalized merkle tree".into(),
            ));
        }
        let mut out = Vec::with_capacity(self.serialized_len());
        self.serialize_node(self.root, &mut out)?;
        Ok(out)
    }

    fn serialize_node(&self, idx: usize, out: &mut Vec<u8>) -> Result<()> {
        let node = &self.nodes[idx];
        let hash = node.hash.ok_or_else(|| {
            FilemassError::Integrity("serializing a merkle node without a hash".into())
        })?;
        out.push(node.level);
        out.extend_from_slice(&node.data_size.to_le_bytes());
        out.extend_from_slice(&hash);
        if let Some(c0) = node.child0 {
            self.serialize_node(c0, out)?;
        }
        if let Some(c1) = node.child1 {
            self.serialize_node(c1, out)?;
        }
        Ok(())
    }

    /// Decode a serialized tree. Trailing bytes after the root's subtree are
    /// tolerated here; callers that care compare against
    /// [`MerkleTree::serialized_len`].
    pub fn deserialize(bytes: &[u8]) -> Result<MerkleTree> {
        let mut nodes = Vec::new();
        let mut pos = 0usize;
        let root = Self::parse_node(bytes, &mut pos, &mut nodes, None)?;

        let root_size = nodes[root].data_size;
        if root_size < 0 {
            return Err(FilemassError::TreeFileCorrupted);
        }
        let hash = nodes[root].hash;
        Ok(MerkleTree {
            cursor: root,
            root,
            leaf_count: nodes.iter().filter(|n| n.level == 0).count() as u64,
            total_bytes: root_size as u64,
            seen_short_block: false,
            serializable: true,
            hash,
            nodes,
        })
    }

    fn parse_node(
        bytes: &[u8],
        pos: &mut usize,
        nodes: &mut Vec<MerkleNode>,
        parent: Option<usize>,
    ) -> Result<usize> {
        let header = bytes
            .get(*pos..*pos + NODE_RECORD_SIZE)
            .ok_or(FilemassError::TreeFileCorrupted)?;
        *pos += NODE_RECORD_SIZE;

        let level = header[0];
        let data_size = i64::from_le_bytes(
            header[1..9]
                .try_into()
                .map_err(|_| FilemassError::TreeFileCorrupted)?,
        );
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&header[9..41]);

        let idx = nodes.len();
        nodes.push(MerkleNode {
            level,
            data_size,
            hash: Some(hash),
            parent,
            child0: None,
            child1: None,
        });

        // A child subtree is recognized by the next record's level being
        // strictly below ours; it must then be exactly one level down.
        if let Some(&next) = bytes.get(*pos) {
            if next < level {
                if next + 1 != level {
                    return Err(FilemassError::TreeFileCorrupted);
                }
                let c0 = Self::parse_node(bytes, pos, nodes, Some(idx))?;
                nodes[idx].child0 = Some(c0);
            }
        }
        if let Some(&next) = bytes.get(*pos) {
            if next < level {
                if next + 1 != level {
                    return Err(FilemassError::TreeFileCorrupted);
                }
                let c1 = Self::parse_node(bytes, pos, nodes, Some(idx))?;
                nodes[idx].child1 = Some(c1);
            }
        }
        Ok(idx)
    }

    /// Structural equality: levels, payload sizes, child shape and hashes.
    pub fn equals(&self, other: &MerkleTree) -> bool {
        self.total_bytes == other.total_bytes && self.node_equals(self.root, other, other.root)
    }

    fn node_equals(&self, idx: usize, other: &MerkleTree, other_idx: usize) -> bool {
        let a = &self.nodes[idx];
        let b = &other.nodes[other_idx];
        if a.level != b.level || a.data_size != b.data_size || a.hash != b.hash {
            return false;
        }
        match (a.child0, b.child0) {
            (Some(c0a), Some(c0b)) => {
                if !self.node_equals(c0a, other, c0b) {
                    return false;
                }
            }
            (None, None) => {}
            _ => return false,
        }
        match (a.child1, b.child1) {
            (Some(c1a), Some(c1b)) => self.node_equals(c1a, other, c1b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Verify the tree against its own invariants: interior hashes recompute,
    /// children sit in left-filled slots one level down, only the right-most
    /// leaf may be short, and the root's payload size matches the total.
    pub fn self_check(&self) -> bool {
        let root = &self.nodes[self.root];
        if root.data_size != self.total_bytes as i64 {
            return false;
        }
        if let Some(hash) = self.hash {
            if root.hash != Some(hash) {
                return false;
            }
        }
        self.node_check(self.root, true)
    }

    fn node_check(&self, idx: usize, is_rightmost: bool) -> bool {
        let node = &self.nodes[idx];
        if node.child0.is_none() && node.child1.is_some() {
            return false;
        }
        if (node.child0.is_none() && node.child1.is_none()) != (node.level == 0) {
            return false;
        }
        if let Some(c0) = node.child0 {
            if self.nodes[c0].level != node.level - 1 {
                return false;
            }
            if !self.node_check(c0, is_rightmost && node.child1.is_none()) {
                return false;
            }
        }
        if let Some(c1) = node.child1 {
            if self.nodes[c1].level != node.level - 1 {
                return false;
            }
            if !self.node_check(c1, is_rightmost) {
                return false;
            }
        }
        if node.level > 0 {
            let recomputed = match (node.child0, node.child1) {
                (Some(c0), Some(c1)) => {
                    match (self.nodes[c0].hash, self.nodes[c1].hash) {
                        (Some(h0), Some(h1)) => Some(sha256_pair(&h0, &h1)),
                        _ => None,
                    }
                }
                (Some(c0), None) => self.nodes[c0].hash,
                _ => None,
            };
            if recomputed.is_none() || node.hash != recomputed {
                return false;
            }
        }
        if node.level == 0 && node.data_size != BLOCK_SIZE as i64 && !is_rightmost {
            return false;
        }
        true
    }

    /// Leaf hashes in block order, left to right.
    pub fn list_block_hashes(&self) -> Result<Vec<Hash>> {
        Ok(self.leaves()?.into_iter().map(|leaf| leaf.hash).collect())
    }

    /// Leaf hash and payload length per block, left to right.
    pub fn leaves(&self) -> Result<Vec<LeafRecord>> {
        let mut out = Vec::new();
        self.collect_leaves(self.root, &mut out)?;
        Ok(out)
    }

    fn collect_leaves(&self, idx: usize, out: &mut Vec<LeafRecord>) -> Result<()> {
        let node = &self.nodes[idx];
        if node.level == 0 {
            let hash = node.hash.ok_or_else(|| {
                FilemassError::Integrity("merkle leaf without a hash".into())
            })?;
            out.push(LeafRecord {
                hash,
                data_size: node.data_size,
            });
            return Ok(());
        }
        let c0 = node.child0.ok_or_else(|| {
            FilemassError::Integrity("interior merkle node without a left child".into())
        })?;
        self.collect_leaves(c0, out)?;
        if let Some(c1) = node.child1 {
            self.collect_leaves(c1, out)?;
        }
        Ok(())
    }

    /// Build a serializable tree by streaming a file in 1024-byte blocks.
    ///
    /// With `max_bytes`, only that prefix of the file is consumed; the
    /// repair path uses this to re-hash a blob at its recorded length.
    pub fn from_file(path: &Path, max_bytes: Option<u64>) -> Result<MerkleTree> {
        let file_size = match max_bytes {
            Some(max) => max,
            None => std::fs::metadata(path)?.len(),
        };
        let mut reader = BufReader::new(File::open(path)?);
        let mut tree = MerkleTree::new(true);
        let mut buf = [0u8; BLOCK_SIZE];
        let mut remaining = file_size;
        while remaining > 0 {
            let want = remaining.min(BLOCK_SIZE as u64) as usize;
            reader.read_exact(&mut buf[..want])?;
            tree.add_data(&buf[..want])?;
            remaining -= want as u64;
        }
        tree.finalize()?;
        Ok(tree)
    }
}

/// Iterator over the leaf records of a serialized `.fmtree` byte stream,
/// without materializing the tree. Leaves appear in block order because the
/// serialization is a pre-order walk.
pub struct LeafRecords<'a> {
    bytes: &'a [u8],
    pos: usize,
}

pub fn leaf_records(bytes: &[u8]) -> LeafRecords<'_> {
    LeafRecords { bytes, pos: 0 }
}

impl Iterator for LeafRecords<'_> {
    type Item = Result<LeafRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.pos >= self.bytes.len() {
                return None;
            }
            let record = match self.bytes.get(self.pos..self.pos + NODE_RECORD_SIZE) {
                Some(record) => record,
                None => {
                    self.pos = self.bytes.len();
                    return Some(Err(FilemassError::TreeFileCorrupted));
                }
            };
            self.pos += NODE_RECORD_SIZE;
            if record[0] != 0 {
                continue;
            }
            let data_size = match record[1..9].try_into() {
                Ok(raw) => i64::from_le_bytes(raw),
                Err(_) => return Some(Err(FilemassError::TreeFileCorrupted)),
            };
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&record[9..41]);
            return Some(Ok(LeafRecord { hash, data_size }));
        }
    }
}
