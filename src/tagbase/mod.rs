//! The tagbase: a SQLite-backed edge table encoding per-file tag trees.
//!
//! Every tag occurrence is one row in `edges`, addressed by the hash-sum
//! of its path from the file. `hashed_data` maps
//! name hashes back to names for display. Inserts are insert-or-ignore
//! (idempotent via the `(parent_hash_sum, hash_sum)` uniqueness key) and a
//! whole `add_tags`/`remove_tags` batch commits in a single transaction.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;

use rusqlite::{Connection, params};

use crate::error::{FilemassError, Result};
use crate::tag::Tag;
use crate::tag::query::TagQuery;
use crate::util::{Hash, ZERO_HASH, hash_sum};

/// Tag names at or above this length are not stored for reverse lookup;
/// their positions stay queryable but display as hashes.
const MAX_STORED_NAME_LEN: usize = 65_536;

pub struct TagStore {
    conn: Connection,
}

impl TagStore {
    /// Open an existing tagbase file.
    pub fn open(path: &Path) -> Result<TagStore> {
        if !path.exists() {
            return Err(FilemassError::InvalidInput(format!(
                "cannot open tagbase at {} because that file does not exist",
                path.display()
            )));
        }
        if !path.is_file() {
            return Err(FilemassError::InvalidInput(format!(
                "cannot open tagbase at {} because that file is not a regular file",
                path.display()
            )));
        }
        let conn = Connection::open(path)?;
        Ok(TagStore { conn })
    }

    /// Create a new tagbase file with the full schema; refuses to touch an
    /// existing file.
    pub fn init(path: &Path) -> Result<TagStore> {
        if path.exists() {
            return Err(FilemassError::InvalidInput(format!(
                "cannot init tagbase at {} because that file already exists",
                path.display()
            )));
        }
        let conn = Connection::open(path)?;
        create_schema(&conn)?;
        tracing::info!("Initialized tagbase at {}", path.display());
        Ok(TagStore { conn })
    }

    /// An in-memory tagbase, mainly for tests.
    pub fn in_memory() -> Result<TagStore> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(TagStore { conn })
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Attach each parsed tag tree to each selected file. The whole batch is
    /// one transaction; parent edges are written before their descendants.
    pub fn add_tags(&mut self, file_hashes: &[Hash], tags: &[Tag]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for file_hash in file_hashes {
            for tag in tags {
                add_tag_chain(&tx, tag, file_hash, &ZERO_HASH, file_hash)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Detach each tag tree from each selected file, one transaction for
    /// the batch.
    pub fn remove_tags(&mut self, file_hashes: &[Hash], tags: &[Tag]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for file_hash in file_hashes {
            for tag in tags {
                remove_tag_chain(&tx, tag, file_hash)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Reassemble the full tag tree of a file from its edges, in one pass
    /// over the rows regardless of their order. Returns a synthetic root
    /// whose subtags are the file's top-level tags.
    pub fn tags_of_file(&self, file_hash: &Hash) -> Result<Tag> {
        struct EdgeRow {
            parent_hash_sum: Hash,
            hash_sum: Hash,
            this_hash: Hash,
            name: Option<String>,
        }

        let mut stmt = self.conn.prepare_cached(
            "SELECT e.parent_hash_sum, e.hash_sum, e._this_hash, hd.data \
             FROM edges AS e LEFT JOIN hashed_data AS hd ON e._this_hash=hd.hash \
             WHERE e._file_hash=?1",
        )?;
        let rows: Vec<EdgeRow> = stmt
            .query_map(params![&file_hash[..]], |row| {
                let name: Option<Vec<u8>> = row.get(3)?;
                Ok(EdgeRow {
                    parent_hash_sum: hash_column(row, 0)?,
                    hash_sum: hash_column(row, 1)?,
                    this_hash: hash_column(row, 2)?,
                    name: name.and_then(|bytes| String::from_utf8(bytes).ok()),
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        // Group children by their parent position, then grow the tree from
        // the file root; edges whose parent chain never reaches the file
        // are dropped.
        let mut children: BTreeMap<Hash, Vec<usize>> = BTreeMap::new();
        for (index, row) in rows.iter().enumerate() {
            children.entry(row.parent_hash_sum).or_default().push(index);
        }

        fn build(
            rows: &[EdgeRow],
            children: &BTreeMap<Hash, Vec<usize>>,
            index: usize,
        ) -> Tag {
            let row = &rows[index];
            let mut tag = Tag::from_edge(
                row.parent_hash_sum,
                row.hash_sum,
                row.this_hash,
                row.name.clone(),
            );
            if let Some(child_rows) = children.get(&row.hash_sum) {
                for &child in child_rows {
                    tag.subtags.push(build(rows, children, child));
                }
            }
            tag
        }

        let mut root = Tag::file_root(*file_hash);
        if let Some(top_level) = children.get(file_hash) {
            for &index in top_level {
                root.subtags.push(build(&rows, &children, index));
            }
        }
        Ok(root)
    }

    /// Evaluate a query at file scope and return the matching file hashes.
    pub fn find(&self, query: &TagQuery) -> Result<BTreeSet<Hash>> {
        let mut result = BTreeSet::new();
        query.find_in(self, &ZERO_HASH, &mut result)?;
        Ok(result)
    }
}

/// Insert one tag and its subtags below the given parent position. Names
/// short enough for the reverse-lookup table are recorded; the edge insert
/// is insert-or-ignore so repeated tagging is a no-op.
fn add_tag_chain(
    conn: &Connection,
    tag: &Tag,
    parent_hash_sum: &Hash,
    grandparent_hash_sum: &Hash,
    file_hash: &Hash,
) -> Result<()> {
    if let Some(name) = &tag.name {
        if name.len() < MAX_STORED_NAME_LEN {
            let mut stmt = conn
                .prepare_cached("INSERT OR IGNORE INTO hashed_data (hash, data) VALUES(?1, ?2)")?;
            stmt.execute(params![&tag.this_hash[..], name.as_bytes()])?;
        }
    }

    let position = hash_sum(parent_hash_sum, &tag.this_hash);
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO edges \
         (parent_hash_sum, _this_hash, hash_sum, _file_hash, _grandparent_hash_sum) \
         VALUES(?1, ?2, ?3, ?4, ?5)",
    )?;
    stmt.execute(params![
        &parent_hash_sum[..],
        &tag.this_hash[..],
        &position[..],
        &file_hash[..],
        &grandparent_hash_sum[..],
    ])?;

    for subtag in &tag.subtags {
        add_tag_chain(conn, subtag, &position, parent_hash_sum, file_hash)?;
    }
    Ok(())
}

/// Delete one tag edge below the given parent position, then its subtags
/// below the removed node's position.
fn remove_tag_chain(conn: &Connection, tag: &Tag, parent_hash_sum: &Hash) -> Result<()> {
    let mut stmt =
        conn.prepare_cached("DELETE FROM edges WHERE parent_hash_sum=?1 AND _this_hash=?2")?;
    stmt.execute(params![&parent_hash_sum[..], &tag.this_hash[..]])?;

    let position = hash_sum(parent_hash_sum, &tag.this_hash);
    for subtag in &tag.subtags {
        remove_tag_chain(conn, subtag, &position)?;
    }
    Ok(())
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE edges
         (
             parent_hash_sum BLOB NOT NULL,
             hash_sum BLOB NOT NULL,
             _this_hash BLOB NOT NULL,
             _file_hash BLOB NOT NULL,
             _grandparent_hash_sum BLOB NOT NULL,
             UNIQUE(parent_hash_sum, hash_sum)
         );
         CREATE INDEX edges__index_on__parent_hash_sum__hash_sum__this_hash
             ON edges (parent_hash_sum, hash_sum, _this_hash);
         CREATE INDEX edges__index_on__hash_sum__this_hash
             ON edges (hash_sum, _this_hash);
         CREATE INDEX edges__index_on__this_hash__parent_hash_sum
             ON edges (_this_hash, parent_hash_sum);
         CREATE INDEX edges__index_on__this_hash__file_hash
             ON edges (_this_hash, _file_hash);

         CREATE TABLE hashed_data
         (
             hash BLOB NOT NULL PRIMARY KEY,
             data BLOB NOT NULL
         );

         CREATE TABLE parent_hash_sum_counts
         (
             parent_hash_sum BLOB NOT NULL,
             count INTEGER NOT NULL
         );
         CREATE INDEX parent_hash_sum_counts__index_on__parent_hash_sum
             ON parent_hash_sum_counts (parent_hash_sum);

         CREATE TABLE child_hash_counts
         (
             child_hash BLOB NOT NULL,
             count INTEGER NOT NULL
         );
         CREATE INDEX child_hash_counts__index_on__child_hash
             ON child_hash_counts (child_hash);",
    )?;
    Ok(())
}

/// Read a 32-byte blob column as a [`Hash`]; any other width is a column
/// type error.
pub(crate) fn hash_column(row: &rusqlite::Row, index: usize) -> rusqlite::Result<Hash> {
    let blob: Vec<u8> = row.get(index)?;
    blob.try_into().map_err(|_| {
        rusqlite::Error::InvalidColumnType(
            index,
            "expected 32-byte hash".to_owned(),
            rusqlite::types::Type::Blob,
        )
    })
}
