//! The content-addressed blob store.
//!
//! A repository is a directory holding an `fmrepo.conf` config file and, per
//! ingested file, a blob at a hash-sharded path plus two sidecars: the
//! serialized Merkle tree (`.fmtree`) and the XOR parity file (`.fmparity`).
//! Entries are append-only; the only writes after ingest come from
//! [`Repository::error_fix`], which may only restore bytes that agree with
//! the stored tree.
pub mod repair;
#[cfg(test)]
pub mod tests;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{FilemassError, Result};
use crate::merkle::parity::ParityFile;
use crate::merkle::{BLOCK_SIZE, MerkleTree, leaf_records};
use crate::util::{Hash, sha256};

const CONFIG_FILE: &str = "fmrepo.conf";
const TREE_SUFFIX: &str = ".fmtree";
const PARITY_SUFFIX: &str = ".fmparity";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCheckResult {
    AllOk,
    NotFound,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFixResult {
    Fixed,
    WasNotBroken,
    FailedToFix,
    NotFound,
}

/// Repair passes before `error_fix` gives up; the file is re-checked
/// between passes.
const MAX_FIX_ATTEMPTS: u32 = 3;

#[derive(Debug)]
pub struct Repository {
    path: PathBuf,
    config: BTreeMap<String, String>,
}

impl Repository {
    /// Open an existing repository; its config file must be present.
    pub fn open(path: &Path) -> Result<Repository> {
        let config_path = path.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(FilemassError::InvalidInput(format!(
                "no repo config file found at {}",
                config_path.display()
            )));
        }
        if !config_path.is_file() {
            return Err(FilemassError::InvalidInput(format!(
                "repo config file is not a regular file: {}",
                config_path.display()
            )));
        }
        let config = parse_config(&config_path)?;
        Ok(Repository {
            path: path.to_path_buf(),
            config,
        })
    }

    /// Initialize a new repository in an empty (or not yet existing)
    /// directory and open it.
    pub fn init(path: &Path) -> Result<Repository> {
        if !path.exists() {
            std::fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(FilemassError::InvalidInput(format!(
                "cannot init repository at {} because it is not a directory",
                path.display()
            )));
        }
        if std::fs::read_dir(path)?.next().is_some() {
            return Err(FilemassError::InvalidInput(format!(
                "cannot init repository at {} because that directory is not empty",
                path.display()
            )));
        }

        let config_path = path.join(CONFIG_FILE);
        let mut file = File::create(&config_path)?;
        writeln!(file, "uuid={}", uuid::Uuid::new_v4())?;
        file.flush()?;

        tracing::info!("Initialized repository at {}", path.display());
        Self::open(path)
    }

    /// Whether a directory carries a repository config file.
    pub fn is_repository(path: &Path) -> bool {
        path.join(CONFIG_FILE).is_file()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    /// Blob path for a hash: two-nibble shard directories, then the full
    /// 64-character hex name.
    pub fn blob_path(&self, hash: &Hash) -> PathBuf {
        let hex = hex::encode(hash);
        self.path
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(&hex[4..6])
            .join(&hex)
    }

    pub fn tree_path(&self, hash: &Hash) -> PathBuf {
        let mut path = self.blob_path(hash).into_os_string();
        path.push(TREE_SUFFIX);
        PathBuf::from(path)
    }

    pub fn parity_path(&self, hash: &Hash) -> PathBuf {
        let mut path = self.blob_path(hash).into_os_string();
        path.push(PARITY_SUFFIX);
        PathBuf::from(path)
    }

    fn ensure_shard_dirs(&self, hash: &Hash) -> Result<()> {
        let blob = self.blob_path(hash);
        let shard = blob.parent().ok_or_else(|| {
            FilemassError::Integrity("blob path has no parent directory".into())
        })?;
        if shard.exists() && !shard.is_dir() {
            return Err(FilemassError::InvalidInput(format!(
                "not a directory: {}",
                shard.display()
            )));
        }
        std::fs::create_dir_all(shard)?;
        Ok(())
    }

    /// Ingest a source file: hash it through a Merkle tree, copy it to its
    /// sharded blob path and write the tree and parity sidecars if absent.
    ///
    /// Returns the file hash and whether the blob was newly stored. A blob
    /// already present under the same hash but with a different size is a
    /// fatal integrity error.
    pub fn add(&self, source: &Path) -> Result<(Hash, bool)> {
        if !source.exists() {
            return Err(FilemassError::InvalidInput(format!(
                "file does not exist: {}",
                source.display()
            )));
        }
        if !source.is_file() {
            return Err(FilemassError::InvalidInput(format!(
                "file is not a regular file: {}",
                source.display()
            )));
        }

        let tree = MerkleTree::from_file(source, None)?;
        let hash = tree.root_hash().ok_or_else(|| {
            FilemassError::Integrity("merkle tree produced no root hash".into())
        })?;

        self.ensure_shard_dirs(&hash)?;
        let blob = self.blob_path(&hash);

        let was_new = if blob.exists() {
            let existing = std::fs::metadata(&blob)?.len();
            let incoming = std::fs::metadata(source)?.len();
            if existing != incoming {
                return Err(FilemassError::Integrity(format!(
                    "file {} already exists at {} but the sizes differ",
                    source.display(),
                    blob.display()
                )));
            }
            tracing::debug!(
                "File {} already stored at {}",
                source.display(),
                blob.display()
            );
            false
        } else {
            std::fs::copy(source, &blob)?;
            tracing::debug!("Stored {} as {}", source.display(), hex::encode(hash));
            true
        };

        let tree_path = self.tree_path(&hash);
        if !tree_path.exists() {
            std::fs::write(&tree_path, tree.serialize()?)?;
        }

        let parity_path = self.parity_path(&hash);
        if !parity_path.exists() {
            let parity = ParityFile::from_path(&blob)?;
            std::fs::write(&parity_path, parity.to_bytes())?;
        }

        Ok((hash, was_new))
    }

    /// Walk the blob and the tree sidecar's leaf records in lockstep,
    /// hashing every block. Any hash, block-length or total-length mismatch
    /// is an error; a missing blob or sidecar is `NotFound`.
    pub fn error_check(&self, hash: &Hash) -> Result<ErrorCheckResult> {
        let blob_path = self.blob_path(hash);
        let tree_path = self.tree_path(hash);
        if !blob_path.is_file() || !tree_path.is_file() {
            return Ok(ErrorCheckResult::NotFound);
        }

        let tree_bytes = std::fs::read(&tree_path)?;
        let mut leaves = leaf_records(&tree_bytes);
        let mut reader = BufReader::new(File::open(&blob_path)?);
        let mut buf = [0u8; BLOCK_SIZE];
        let mut first = true;

        loop {
            let n = crate::merkle::parity::read_block(&mut reader, &mut buf)?;
            if n == 0 && !first {
                // Blob exhausted on a block boundary; the tree must be too.
                if leaves.next().is_some() {
                    return Ok(ErrorCheckResult::Error);
                }
                return Ok(ErrorCheckResult::AllOk);
            }
            first = false;

            let leaf = match leaves.next() {
                Some(Ok(leaf)) => leaf,
                Some(Err(_)) | None => return Ok(ErrorCheckResult::Error),
            };
            if leaf.data_size != n as i64 {
                return Ok(ErrorCheckResult::Error);
            }
            if leaf.hash != sha256(&buf[..n]) {
                return Ok(ErrorCheckResult::Error);
            }

            if n < BLOCK_SIZE {
                // Short block closes the file; no leaf may follow.
                if leaves.next().is_some() {
                    return Ok(ErrorCheckResult::Error);
                }
                return Ok(ErrorCheckResult::AllOk);
            }
        }
    }

    /// Multi-stage repair of a damaged entry.
    ///
    /// Each pass re-checks the file and then fixes exactly one class of
    /// damage: a wrong or trailing-garbage tree sidecar is rewritten from an
    /// intact blob, an over-long blob is truncated to its recorded length,
    /// and damaged blocks are restored first by hash-guided single-edit
    /// search and then from parity. Blocks are repaired into memory and
    /// flushed only when every damaged block was recovered, so a failed
    /// repair writes nothing.
    pub fn error_fix(&self, hash: &Hash) -> Result<ErrorFixResult> {
        let blob_path = self.blob_path(hash);
        if !blob_path.is_file() {
            return Ok(ErrorFixResult::NotFound);
        }
        let tree_path = self.tree_path(hash);
        let mut repaired_something = false;

        for attempt in 0..MAX_FIX_ATTEMPTS {
            if tree_path.is_file()
                && matches!(self.error_check(hash)?, ErrorCheckResult::AllOk)
            {
                // A missing parity sidecar (crashed ingest) is regenerated
                // once the entry verifies.
                let parity_path = self.parity_path(hash);
                if !parity_path.exists() {
                    let parity = ParityFile::from_path(&blob_path)?;
                    std::fs::write(&parity_path, parity.to_bytes())?;
                    tracing::debug!("Regenerated parity sidecar for {}", hex::encode(hash));
                }
                return Ok(if repaired_something {
                    ErrorFixResult::Fixed
                } else {
                    ErrorFixResult::WasNotBroken
                });
            }

            tracing::debug!(
                "error_fix pass {} for {}",
                attempt + 1,
                hex::encode(hash)
            );

            let new_tree = MerkleTree::from_file(&blob_path, None)?;
            let stored = if tree_path.is_file() {
                Some(MerkleTree::deserialize(&std::fs::read(&tree_path)?))
            } else {
                None
            };

            let sidecar_missing = stored.is_none();
            let stored_tree = match stored {
                Some(Ok(tree)) => tree,
                Some(Err(_)) | None => {
                    // A missing or unreadable sidecar is rewritten when the
                    // blob itself reproduces the requested hash.
                    if new_tree.root_hash() == Some(*hash) {
                        std::fs::write(&tree_path, new_tree.serialize()?)?;
                        tracing::debug!("Rewrote tree sidecar for {}", hex::encode(hash));
                        repaired_something = true;
                        continue;
                    }
                    if sidecar_missing {
                        return Ok(ErrorFixResult::NotFound);
                    }
                    return Err(FilemassError::TreeFileCorrupted);
                }
            };

            if new_tree.root_hash() == Some(*hash) {
                // The blob is intact; the sidecar content disagrees or
                // carries trailing bytes.
                if stored_tree.root_hash() != Some(*hash) || !stored_tree.equals(&new_tree) {
                    std::fs::write(&tree_path, new_tree.serialize()?)?;
                    repaired_something = true;
                    continue;
                }
                let on_disk = std::fs::metadata(&tree_path)?.len();
                if on_disk > stored_tree.serialized_len() as u64 {
                    let file = OpenOptions::new().write(true).open(&tree_path)?;
                    file.set_len(stored_tree.serialized_len() as u64)?;
                    repaired_something = true;
                    continue;
                }
                return Ok(ErrorFixResult::FailedToFix);
            }

            // The blob does not reproduce the requested hash; the stored
            // tree must vouch for itself before it can guide a repair.
            if !stored_tree.self_check() || stored_tree.root_hash() != Some(*hash) {
                // Either a healthy tree labeled with a different hash
                // (catastrophic mislabeling) or tree and blob both damaged.
                return Ok(ErrorFixResult::FailedToFix);
            }

            let blob_len = std::fs::metadata(&blob_path)?.len();
            let total = stored_tree.total_bytes();
            if blob_len > total {
                let prefix_tree = MerkleTree::from_file(&blob_path, Some(total))?;
                if prefix_tree.root_hash() == stored_tree.root_hash()
                    && prefix_tree.equals(&stored_tree)
                {
                    let file = OpenOptions::new().write(true).open(&blob_path)?;
                    file.set_len(total)?;
                    tracing::debug!("Truncated over-long blob {}", hex::encode(hash));
                    repaired_something = true;
                    continue;
                }
                // Repair blocks within the recorded length; a later pass
                // truncates once the prefix matches.
                if self.repair_blocks(&blob_path, hash, &stored_tree, false)? {
                    repaired_something = true;
                    continue;
                }
                return Ok(ErrorFixResult::FailedToFix);
            }
            if blob_len < total {
                // Missing bytes are outside the parity model's reach.
                return Ok(ErrorFixResult::FailedToFix);
            }
            if self.repair_blocks(&blob_path, hash, &stored_tree, true)? {
                repaired_something = true;
                continue;
            }
            return Ok(ErrorFixResult::FailedToFix);
        }

        if repaired_something && matches!(self.error_check(hash)?, ErrorCheckResult::AllOk) {
            return Ok(ErrorFixResult::Fixed);
        }
        Ok(ErrorFixResult::FailedToFix)
    }

    /// Repair every mismatched block of the blob against the stored tree's
    /// leaf hashes. Repairs are staged in memory and written back only when
    /// all damaged blocks were recovered.
    fn repair_blocks(
        &self,
        blob_path: &Path,
        hash: &Hash,
        stored_tree: &MerkleTree,
        use_parity: bool,
    ) -> Result<bool> {
        let leaves = stored_tree.leaves()?;
        let mut file = OpenOptions::new().read(true).write(true).open(blob_path)?;

        let mut blocks: Vec<Vec<u8>> = Vec::with_capacity(leaves.len());
        for (index, leaf) in leaves.iter().enumerate() {
            if leaf.data_size < 0 || leaf.data_size > BLOCK_SIZE as i64 {
                return Err(FilemassError::TreeFileCorrupted);
            }
            let mut block = vec![0u8; leaf.data_size as usize];
            file.seek(SeekFrom::Start((index * BLOCK_SIZE) as u64))?;
            file.read_exact(&mut block)?;
            blocks.push(block);
        }

        let parity = if use_parity {
            let parity_path = self.parity_path(hash);
            if parity_path.is_file() {
                ParityFile::read_from_path(&parity_path).ok()
            } else {
                None
            }
        } else {
            None
        };

        let mut dirty = Vec::new();
        for (index, leaf) in leaves.iter().enumerate() {
            if sha256(&blocks[index]) == leaf.hash {
                continue;
            }
            let carry = if index > 0 {
                blocks[index - 1].last().copied()
            } else {
                None
            };

            let repaired = repair::repair_block_by_hash(&blocks[index], &leaf.hash, carry)
                .or_else(|| {
                    parity.as_ref().and_then(|parity| {
                        repair::repair_block_with_parity(
                            parity,
                            &blocks,
                            index,
                            leaf.data_size as usize,
                            &leaf.hash,
                        )
                    })
                });

            match repaired {
                Some(block) => {
                    tracing::debug!(
                        "Repaired block {} of {}",
                        index,
                        hex::encode(hash)
                    );
                    blocks[index] = block;
                    dirty.push(index);
                }
                None => {
                    tracing::warn!(
                        "Could not repair block {} of {}",
                        index,
                        hex::encode(hash)
                    );
                    return Ok(false);
                }
            }
        }

        if dirty.is_empty() {
            return Ok(false);
        }
        for index in dirty {
            file.seek(SeekFrom::Start((index * BLOCK_SIZE) as u64))?;
            file.write_all(&blocks[index])?;
        }
        file.flush()?;
        Ok(true)
    }
}

/// Parse the line-oriented `key=value` repository config. Blank lines and
/// `#` comments are ignored; keys and values are whitespace-trimmed; a line
/// without `=` is a syntax error reported with its line number.
fn parse_config(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = std::fs::read_to_string(path)?;
    let mut config = BTreeMap::new();
    for (number, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(FilemassError::InvalidInput(format!(
                "syntax error 'no = found' in {} on line {}: {}",
                path.display(),
                number + 1,
                line
            )));
        };
        config.insert(key.trim().to_owned(), value.trim().to_owned());
    }
    Ok(config)
}
