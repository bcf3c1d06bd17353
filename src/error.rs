//! Crate-wide error type.
//!
//! Every fallible operation returns [`Result`]; the CLI front-end is the only
//! place errors are turned into exit codes or JSON `error` fields.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FilemassError>;

#[derive(Debug, Error)]
pub enum FilemassError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tagbase error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A tag-query statement failed; names the evaluation case it was
    /// serving so the failure can be traced to a strategy.
    #[error("tag query error in {case}: {source}")]
    Query {
        case: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Bad arguments, missing files, malformed config lines and the like.
    #[error("{0}")]
    InvalidInput(String),

    /// Two blobs with the same hash but different sizes, a mis-labeled
    /// stored tree, and other must-not-overwrite conditions.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The `.fmtree` sidecar could not be decoded.
    #[error("merkle tree file is corrupted")]
    TreeFileCorrupted,

    /// The `.fmparity` sidecar could not be decoded.
    #[error("parity file is corrupted")]
    ParityFileCorrupted,

    /// Syntax error in a tag list or tag query; the message carries a
    /// caret-annotated snippet of the offending input.
    #[error("{0}")]
    Syntax(String),

    /// Features the query engine deliberately does not support, surfaced
    /// distinctly from data errors.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}
