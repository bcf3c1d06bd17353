//! Tag-query expression trees and their evaluation against a tagbase.
//!
//! A query is a boolean combination of "has-child" and "has-descendant"
//! probes. Three entry points exist: [`TagQuery::matches`] tests a single
//! tag position, [`TagQuery::find_in`] enumerates every position (or file)
//! satisfying the query, and [`TagQuery::quick_count`] produces the cheap
//! cardinality overestimate used to order `And` operands.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::params;

use crate::error::{FilemassError, Result};
use crate::tagbase::{TagStore, hash_column};
use crate::util::{Hash, ZERO_HASH, sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagQuery {
    Or(Vec<TagQuery>),
    And(Vec<TagQuery>),
    Xor(Vec<TagQuery>),
    Not(Box<TagQuery>),
    HasChild {
        name: String,
        hash: Hash,
    },
    HasDescendant {
        name: String,
        hash: Hash,
    },
    HasChildWithQuery {
        name: String,
        hash: Hash,
        query: Box<TagQuery>,
    },
    HasDescendantWithQuery {
        name: String,
        hash: Hash,
        query: Box<TagQuery>,
    },
}

/// Attach the evaluation case name to a failed statement.
fn in_case<T>(case: &'static str, result: rusqlite::Result<T>) -> Result<T> {
    result.map_err(|source| FilemassError::Query { case, source })
}

impl TagQuery {
    pub fn has_child(name: &str) -> TagQuery {
        TagQuery::HasChild {
            name: name.to_owned(),
            hash: sha256(name.as_bytes()),
        }
    }

    pub fn has_descendant(name: &str) -> TagQuery {
        TagQuery::HasDescendant {
            name: name.to_owned(),
            hash: sha256(name.as_bytes()),
        }
    }

    pub fn has_child_with_query(name: &str, query: TagQuery) -> TagQuery {
        TagQuery::HasChildWithQuery {
            name: name.to_owned(),
            hash: sha256(name.as_bytes()),
            query: Box::new(query),
        }
    }

    pub fn has_descendant_with_query(name: &str, query: TagQuery) -> TagQuery {
        TagQuery::HasDescendantWithQuery {
            name: name.to_owned(),
            hash: sha256(name.as_bytes()),
            query: Box::new(query),
        }
    }

    /// Does the tag position identified by `hash_sum` satisfy this query in
    /// its immediate subtree?
    pub fn matches(&self, store: &TagStore, hash_sum: &Hash) -> Result<bool> {
        match self {
            TagQuery::HasChild { hash, .. } => {
                let conn = store.connection();
                let mut stmt = in_case(
                    "matches HasChild",
                    conn.prepare_cached(
                        "SELECT parent_hash_sum FROM edges \
                         WHERE _this_hash=?1 AND parent_hash_sum=?2 LIMIT 1",
                    ),
                )?;
                in_case(
                    "matches HasChild",
                    stmt.exists(params![&hash[..], &hash_sum[..]]),
                )
            }
            TagQuery::HasChildWithQuery { hash, query, .. } => {
                let candidates = {
                    let conn = store.connection();
                    let mut stmt = in_case(
                        "matches HasChildWithQuery",
                        conn.prepare_cached(
                            "SELECT hash_sum FROM edges \
                             WHERE _this_hash=?1 AND parent_hash_sum=?2",
                        ),
                    )?;
                    let rows = in_case(
                        "matches HasChildWithQuery",
                        stmt.query_map(params![&hash[..], &hash_sum[..]], |row| {
                            hash_column(row, 0)
                        })
                        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<Hash>>>()),
                    )?;
                    rows
                };
                for candidate in candidates {
                    if query.matches(store, &candidate)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            TagQuery::HasDescendant { hash, .. } => {
                self.matches_descendant(store, hash_sum, hash)
            }
            TagQuery::Not(sub) => Ok(!sub.matches(store, hash_sum)?),
            TagQuery::And(operands) => {
                for operand in operands {
                    if !operand.matches(store, hash_sum)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            TagQuery::Or(operands) => {
                for operand in operands {
                    if operand.matches(store, hash_sum)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            TagQuery::Xor(operands) => {
                let mut parity = false;
                for operand in operands {
                    if operand.matches(store, hash_sum)? {
                        parity = !parity;
                    }
                }
                Ok(parity)
            }
            TagQuery::HasDescendantWithQuery { .. } => Err(FilemassError::NotImplemented(
                "matching a has-descendant subquery below a tag position",
            )),
        }
    }

    /// Depth-limited descendant probe: direct child, grandchild, and a
    /// two-edge join one level further. Deeper descendants are not searched.
    fn matches_descendant(
        &self,
        store: &TagStore,
        hash_sum: &Hash,
        search: &Hash,
    ) -> Result<bool> {
        let conn = store.connection();
        {
            let mut stmt = in_case(
                "matches HasDescendant depth 1",
                conn.prepare_cached(
                    "SELECT parent_hash_sum FROM edges \
                     WHERE _this_hash=?1 AND parent_hash_sum=?2 LIMIT 1",
                ),
            )?;
            if in_case(
                "matches HasDescendant depth 1",
                stmt.exists(params![&search[..], &hash_sum[..]]),
            )? {
                return Ok(true);
            }
        }
        {
            let mut stmt = in_case(
                "matches HasDescendant depth 2",
                conn.prepare_cached(
                    "SELECT _grandparent_hash_sum FROM edges \
                     WHERE _this_hash=?1 AND _grandparent_hash_sum=?2 LIMIT 1",
                ),
            )?;
            if in_case(
                "matches HasDescendant depth 2",
                stmt.exists(params![&search[..], &hash_sum[..]]),
            )? {
                return Ok(true);
            }
        }
        {
            let mut stmt = in_case(
                "matches HasDescendant depth 3",
                conn.prepare_cached(
                    "SELECT e2.hash_sum FROM edges AS e1 \
                     INNER JOIN edges AS e2 ON e2._grandparent_hash_sum=e1.hash_sum \
                     WHERE e1.parent_hash_sum=?1 AND e2._this_hash=?2 LIMIT 1",
                ),
            )?;
            if in_case(
                "matches HasDescendant depth 3",
                stmt.exists(params![&hash_sum[..], &search[..]]),
            )? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Enumerate every tag position under `parent_hash_sum` satisfying the
    /// query; with [`ZERO_HASH`] as the parent the scope is files and the
    /// result holds file hashes.
    pub fn find_in(
        &self,
        store: &TagStore,
        parent_hash_sum: &Hash,
        result: &mut BTreeSet<Hash>,
    ) -> Result<()> {
        match self {
            TagQuery::HasChild { hash, .. } => {
                let conn = store.connection();
                let mut stmt = in_case(
                    "find_in HasChild",
                    conn.prepare_cached(
                        "SELECT parent_hash_sum FROM edges \
                         WHERE _this_hash=?1 AND _grandparent_hash_sum=?2",
                    ),
                )?;
                let rows = in_case(
                    "find_in HasChild",
                    stmt.query_map(params![&hash[..], &parent_hash_sum[..]], |row| {
                        hash_column(row, 0)
                    })
                    .and_then(|rows| rows.collect::<rusqlite::Result<Vec<Hash>>>()),
                )?;
                result.extend(rows);
                Ok(())
            }
            TagQuery::HasDescendant { hash, .. } => {
                if *parent_hash_sum != ZERO_HASH {
                    return Err(FilemassError::NotImplemented(
                        "enumerating descendant matches below a tag position",
                    ));
                }
                let conn = store.connection();
                let mut stmt = in_case(
                    "find_in HasDescendant",
                    conn.prepare_cached(
                        "SELECT DISTINCT _file_hash FROM edges WHERE _this_hash=?1",
                    ),
                )?;
                let rows = in_case(
                    "find_in HasDescendant",
                    stmt.query_map(params![&hash[..]], |row| hash_column(row, 0))
                        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<Hash>>>()),
                )?;
                result.extend(rows);
                Ok(())
            }
            TagQuery::HasChildWithQuery { hash, query, .. } => {
                let candidates = {
                    let conn = store.connection();
                    let mut stmt = in_case(
                        "find_in HasChildWithQuery",
                        conn.prepare_cached(
                            "SELECT parent_hash_sum, hash_sum FROM edges \
                             WHERE _this_hash=?1 AND _grandparent_hash_sum=?2",
                        ),
                    )?;
                    in_case(
                        "find_in HasChildWithQuery",
                        stmt.query_map(params![&hash[..], &parent_hash_sum[..]], |row| {
                            Ok((hash_column(row, 0)?, hash_column(row, 1)?))
                        })
                        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<(Hash, Hash)>>>()),
                    )?
                };
                for (position, hash_sum) in candidates {
                    if query.matches(store, &hash_sum)? {
                        result.insert(position);
                    }
                }
                Ok(())
            }
            TagQuery::HasDescendantWithQuery { hash, query, .. } => {
                if *parent_hash_sum != ZERO_HASH {
                    return Err(FilemassError::NotImplemented(
                        "enumerating a has-descendant subquery below a tag position",
                    ));
                }
                let candidates = {
                    let conn = store.connection();
                    let mut stmt = in_case(
                        "find_in HasDescendantWithQuery",
                        conn.prepare_cached(
                            "SELECT _file_hash, hash_sum FROM edges WHERE _this_hash=?1",
                        ),
                    )?;
                    in_case(
                        "find_in HasDescendantWithQuery",
                        stmt.query_map(params![&hash[..]], |row| {
                            Ok((hash_column(row, 0)?, hash_column(row, 1)?))
                        })
                        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<(Hash, Hash)>>>()),
                    )?
                };
                for (file, hash_sum) in candidates {
                    if query.matches(store, &hash_sum)? {
                        result.insert(file);
                    }
                }
                Ok(())
            }
            TagQuery::Or(operands) => {
                for operand in operands {
                    operand.find_in(store, parent_hash_sum, result)?;
                }
                Ok(())
            }
            TagQuery::Xor(operands) => {
                let mut accumulated = BTreeSet::new();
                for operand in operands {
                    let mut this_round = BTreeSet::new();
                    operand.find_in(store, parent_hash_sum, &mut this_round)?;
                    for key in this_round {
                        // Symmetric difference: present an even number of
                        // times cancels out.
                        if !accumulated.remove(&key) {
                            accumulated.insert(key);
                        }
                    }
                }
                result.extend(accumulated);
                Ok(())
            }
            TagQuery::And(operands) => self.find_in_and(store, parent_hash_sum, operands, result),
            TagQuery::Not(sub) => self.find_in_not(store, parent_hash_sum, sub, result),
        }
    }

    /// `And` enumerates from the operand with the smallest estimated
    /// cardinality and probes every candidate against the rest.
    fn find_in_and(
        &self,
        store: &TagStore,
        parent_hash_sum: &Hash,
        operands: &[TagQuery],
        result: &mut BTreeSet<Hash>,
    ) -> Result<()> {
        if operands.is_empty() {
            return Ok(());
        }
        let mut counts: Vec<(usize, i64)> = Vec::with_capacity(operands.len());
        for (index, operand) in operands.iter().enumerate() {
            counts.push((index, operand.quick_count(store)?));
        }
        counts.sort_by_key(|&(_, count)| count);
        let seed_index = counts[0].0;
        tracing::trace!(
            seed = seed_index,
            cardinality = counts[0].1,
            "seeding And enumeration from the smallest operand"
        );

        let mut candidates = BTreeSet::new();
        operands[seed_index].find_in(store, parent_hash_sum, &mut candidates)?;

        'candidates: for candidate in candidates {
            for (index, operand) in operands.iter().enumerate() {
                if index == seed_index {
                    continue;
                }
                if !operand.matches(store, &candidate)? {
                    continue 'candidates;
                }
            }
            result.insert(candidate);
        }
        Ok(())
    }

    /// Negation is rewritten before enumeration: De Morgan over `And`/`Or`,
    /// double negation unwrapped, and the has-tag forms turned into
    /// absence queries at file scope.
    fn find_in_not(
        &self,
        store: &TagStore,
        parent_hash_sum: &Hash,
        sub: &TagQuery,
        result: &mut BTreeSet<Hash>,
    ) -> Result<()> {
        match sub {
            TagQuery::And(operands) => {
                // !(a & b)  =>  !a | !b
                for operand in operands {
                    TagQuery::Not(Box::new(operand.clone())).find_in(
                        store,
                        parent_hash_sum,
                        result,
                    )?;
                }
                Ok(())
            }
            TagQuery::Or(operands) => {
                // !(a | b)  =>  !a & !b
                let inverted: Vec<TagQuery> = operands
                    .iter()
                    .map(|operand| TagQuery::Not(Box::new(operand.clone())))
                    .collect();
                TagQuery::And(inverted).find_in(store, parent_hash_sum, result)
            }
            TagQuery::Not(inner) => inner.find_in(store, parent_hash_sum, result),
            _ if *parent_hash_sum != ZERO_HASH => Err(FilemassError::NotImplemented(
                "enumerating negated queries below a tag position",
            )),
            TagQuery::HasDescendant { hash, .. } => {
                let conn = store.connection();
                let mut stmt = in_case(
                    "find_in Not HasDescendant",
                    conn.prepare_cached(
                        "SELECT DISTINCT e._file_hash FROM edges AS e \
                         WHERE NOT EXISTS(\
                             SELECT e2._file_hash FROM edges AS e2 \
                             WHERE e2._file_hash=e._file_hash AND e2._this_hash=?1 LIMIT 1)",
                    ),
                )?;
                let rows = in_case(
                    "find_in Not HasDescendant",
                    stmt.query_map(params![&hash[..]], |row| hash_column(row, 0))
                        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<Hash>>>()),
                )?;
                result.extend(rows);
                Ok(())
            }
            TagQuery::HasChild { hash, .. } => {
                result.extend(files_without_child(store, hash)?);
                Ok(())
            }
            TagQuery::HasChildWithQuery { hash, query, .. } => {
                // Files with no such child at all, plus files whose `name`
                // children all fail the subquery.
                result.extend(files_without_child(store, hash)?);

                let candidates = {
                    let conn = store.connection();
                    let mut stmt = in_case(
                        "find_in Not HasChildWithQuery",
                        conn.prepare_cached(
                            "SELECT parent_hash_sum, hash_sum FROM edges \
                             WHERE _this_hash=?1 AND _grandparent_hash_sum=?2",
                        ),
                    )?;
                    in_case(
                        "find_in Not HasChildWithQuery",
                        stmt.query_map(params![&hash[..], &ZERO_HASH[..]], |row| {
                            Ok((hash_column(row, 0)?, hash_column(row, 1)?))
                        })
                        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<(Hash, Hash)>>>()),
                    )?
                };
                let mut by_file: BTreeMap<Hash, Vec<Hash>> = BTreeMap::new();
                for (file, hash_sum) in candidates {
                    by_file.entry(file).or_default().push(hash_sum);
                }
                'files: for (file, hash_sums) in by_file {
                    for hash_sum in &hash_sums {
                        if query.matches(store, hash_sum)? {
                            continue 'files;
                        }
                    }
                    result.insert(file);
                }
                Ok(())
            }
            _ => Err(FilemassError::NotImplemented(
                "enumerating a negated query of this form at file scope",
            )),
        }
    }

    /// Cheap cardinality overestimate; only its ordering effect matters.
    /// All has-tag variants count by tag name alone, deliberately ignoring
    /// any subquery.
    pub fn quick_count(&self, store: &TagStore) -> Result<i64> {
        match self {
            TagQuery::HasChild { hash, .. }
            | TagQuery::HasDescendant { hash, .. }
            | TagQuery::HasChildWithQuery { hash, .. }
            | TagQuery::HasDescendantWithQuery { hash, .. } => {
                let conn = store.connection();
                let mut stmt = in_case(
                    "quick_count has-tag",
                    conn.prepare_cached("SELECT COUNT(_this_hash) FROM edges WHERE _this_hash=?1"),
                )?;
                in_case(
                    "quick_count has-tag",
                    stmt.query_row(params![&hash[..]], |row| row.get(0)),
                )
            }
            TagQuery::Or(operands) | TagQuery::Xor(operands) => {
                let mut total = 0i64;
                for operand in operands {
                    total += operand.quick_count(store)?;
                }
                Ok(total)
            }
            TagQuery::And(operands) => {
                let mut smallest = i64::MAX;
                for operand in operands {
                    smallest = smallest.min(operand.quick_count(store)?);
                }
                Ok(smallest)
            }
            TagQuery::Not(sub) => {
                let conn = store.connection();
                let total: i64 = {
                    let mut stmt = in_case(
                        "quick_count Not",
                        conn.prepare_cached("SELECT COUNT(_this_hash) FROM edges"),
                    )?;
                    in_case("quick_count Not", stmt.query_row([], |row| row.get(0)))?
                };
                Ok(total - sub.quick_count(store)?)
            }
        }
    }
}

/// Files having no top-level edge with the given tag-name hash.
fn files_without_child(store: &TagStore, hash: &Hash) -> Result<Vec<Hash>> {
    let conn = store.connection();
    let mut stmt = in_case(
        "find_in Not HasChild",
        conn.prepare_cached(
            "SELECT DISTINCT e._file_hash FROM edges AS e \
             WHERE NOT EXISTS(\
                 SELECT e2._file_hash FROM edges AS e2 \
                 WHERE e2.parent_hash_sum=e._file_hash AND e2._this_hash=?1 LIMIT 1)",
        ),
    )?;
    in_case(
        "find_in Not HasChild",
        stmt.query_map(params![&hash[..]], |row| hash_column(row, 0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<Hash>>>()),
    )
}

impl std::fmt::Display for TagQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn join(
            f: &mut std::fmt::Formatter<'_>,
            operands: &[TagQuery],
            separator: &str,
        ) -> std::fmt::Result {
            for (i, operand) in operands.iter().enumerate() {
                if i != 0 {
                    write!(f, " {separator} ")?;
                }
                write!(f, "({operand})")?;
            }
            Ok(())
        }

        match self {
            TagQuery::Or(operands) => join(f, operands, "|"),
            TagQuery::Xor(operands) => join(f, operands, "^"),
            TagQuery::And(operands) => join(f, operands, "&"),
            TagQuery::Not(sub) => write!(f, "! {sub}"),
            TagQuery::HasChild { name, .. } => write!(f, "{name}"),
            TagQuery::HasDescendant { name, .. } => write!(f, "~ {name}"),
            TagQuery::HasChildWithQuery { name, query, .. } => {
                write!(f, "{name}[{query}]")
            }
            TagQuery::HasDescendantWithQuery { name, query, .. } => {
                write!(f, "~ {name}[{query}]")
            }
        }
    }
}
