//! In-memory tag trees.
//!
//! A [`Tag`] is a name with a list of subtags. Parsed tag lists carry only
//! names; tags reassembled from the tagbase also carry the position
//! identifiers their edges were stored under. A tag whose name is unknown
//! (too long for the reverse-lookup table, or missing) is displayed as the
//! hex of its name hash.
pub mod parser;
pub mod query;

use crate::util::{Hash, sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: Option<String>,
    /// SHA-256 of the tag name.
    pub this_hash: Hash,
    /// Position identifier of this occurrence, when known.
    pub hash_sum: Option<Hash>,
    pub parent_hash_sum: Option<Hash>,
    pub subtags: Vec<Tag>,
}

impl Tag {
    pub fn new(name: &str) -> Tag {
        Tag {
            name: Some(name.to_owned()),
            this_hash: sha256(name.as_bytes()),
            hash_sum: None,
            parent_hash_sum: None,
            subtags: Vec::new(),
        }
    }

    /// A tag occurrence loaded from the edge table.
    pub fn from_edge(
        parent_hash_sum: Hash,
        hash_sum: Hash,
        this_hash: Hash,
        name: Option<String>,
    ) -> Tag {
        Tag {
            name,
            this_hash,
            hash_sum: Some(hash_sum),
            parent_hash_sum: Some(parent_hash_sum),
            subtags: Vec::new(),
        }
    }

    /// The synthetic root standing in for a file in a reassembled tag tree.
    pub fn file_root(file_hash: Hash) -> Tag {
        Tag {
            name: None,
            this_hash: file_hash,
            hash_sum: Some(file_hash),
            parent_hash_sum: Some(crate::util::ZERO_HASH),
            subtags: Vec::new(),
        }
    }

    fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => hex::encode(self.this_hash),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        match &self.name {
            Some(name) => {
                map.insert("name".to_owned(), serde_json::Value::from(name.as_str()));
            }
            None => {
                map.insert(
                    "hash".to_owned(),
                    serde_json::Value::from(hex::encode(self.this_hash)),
                );
            }
        }
        if !self.subtags.is_empty() {
            let subtags: Vec<serde_json::Value> =
                self.subtags.iter().map(Tag::to_json).collect();
            map.insert("subtags".to_owned(), serde_json::Value::from(subtags));
        }
        serde_json::Value::Object(map)
    }
}

impl std::fmt::Display for Tag {
    /// Renders the tag in tag-list syntax: `name[sub1,sub2[..]]`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())?;
        if !self.subtags.is_empty() {
            write!(f, "[")?;
            for (i, subtag) in self.subtags.iter().enumerate() {
                if i != 0 {
                    write!(f, ",")?;
                }
                write!(f, "{subtag}")?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}
