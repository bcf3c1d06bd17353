//! Command-line front-end.
//!
//! Operations compose in a single invocation and run in a fixed order:
//! repository init/open, tagbase init/open, file ingestion and selection,
//! error check/fix, tag edits, and finally the tag query. With `--json` all
//! results are collected into one JSON object printed at the end; errors
//! become an `error` field instead.

use clap::Parser;
use serde_json::{Value, json};
use std::path::PathBuf;

use crate::error::{FilemassError, Result};
use crate::repository::{ErrorCheckResult, ErrorFixResult, Repository};
use crate::tag::Tag;
use crate::tag::parser::{parse_tag_list, parse_tag_query};
use crate::tagbase::TagStore;
use crate::util::Hash;

const DEFAULT_TAGBASE: &str = "./default_tagbase.sqlite3";

#[derive(Parser, Debug)]
#[clap(version, about = "Content-addressed file repository with a tag index")]
pub struct Cli {
    /// Repository directory
    #[clap(long, value_name = "DIR")]
    pub repo: Option<PathBuf>,

    /// Initialize the selected repository
    #[clap(long)]
    pub init_repo: bool,

    /// Tagbase file
    #[clap(long, value_name = "FILE")]
    pub tagbase: Option<PathBuf>,

    /// Initialize the selected tagbase
    #[clap(long)]
    pub init_tagbase: bool,

    /// Select files by hash (64 hex characters, comma separated)
    #[clap(long, value_name = "HASHLIST", value_delimiter = ',')]
    pub files: Vec<String>,

    /// Add a file to the selected repository and select it (repeatable)
    #[clap(long = "add-files", value_name = "PATH")]
    pub add_files: Vec<PathBuf>,

    /// Run error checks on the selected files
    #[clap(long)]
    pub errcheck: bool,

    /// Attempt to repair the selected files
    #[clap(long)]
    pub errfix: bool,

    /// Add tags to the selected files
    #[clap(long = "add-tags", value_name = "TAGLIST")]
    pub add_tags: Option<String>,

    /// Remove tags from the selected files
    #[clap(long = "remove-tags", alias = "untag", value_name = "TAGLIST")]
    pub remove_tags: Option<String>,

    /// Find files matching a tag query
    #[clap(long = "tag", value_name = "TAGQUERY")]
    pub tag: Option<String>,

    /// Format output as JSON
    #[clap(long)]
    pub json: bool,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let mut output = serde_json::Map::new();

        // Repository selection. An explicit --repo must open; the implicit
        // current directory is only opened when it actually is a repository.
        let repo_path = self.repo.clone().unwrap_or_else(|| PathBuf::from("."));

        if self.init_repo {
            Repository::init(&repo_path)?;
            if self.json {
                output.insert(
                    "initialized_repository".to_owned(),
                    json!(repo_path.display().to_string()),
                );
            } else {
                println!(
                    "[--init-repo] Initialized repository at {}",
                    repo_path.display()
                );
            }
        }

        let repository = if self.repo.is_some() || Repository::is_repository(&repo_path) {
            Some(Repository::open(&repo_path)?)
        } else {
            None
        };

        // Tagbase selection.
        let tagbase_path = self
            .tagbase
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TAGBASE));
        let mut tagstore = if self.init_tagbase {
            if self.json {
                output.insert(
                    "initialized_tagbase".to_owned(),
                    json!(tagbase_path.display().to_string()),
                );
            }
            Some(TagStore::init(&tagbase_path)?)
        } else if self.tagbase.is_some() {
            Some(TagStore::open(&tagbase_path)?)
        } else {
            None
        };

        // File ingestion and selection.
        let mut selected_files: Vec<Hash> = Vec::new();

        if !self.add_files.is_empty() {
            let repository = repository.as_ref().ok_or_else(|| {
                FilemassError::InvalidInput(
                    "a repository must be selected to use --add-files".into(),
                )
            })?;
            let mut added = 0u64;
            let mut newly_added = 0u64;
            for path in &self.add_files {
                let (hash, was_new) = repository.add(path)?;
                selected_files.push(hash);
                added += 1;
                if was_new {
                    newly_added += 1;
                }
            }
            if self.json {
                output.insert("filesAdded".to_owned(), json!(added));
                output.insert("newFilesAdded".to_owned(), json!(newly_added));
            } else {
                println!(
                    "Added {added} files to the repository, {newly_added} of which were new."
                );
            }
        }

        for hex_hash in &self.files {
            selected_files.push(parse_hash_argument(hex_hash)?);
        }

        if !self.files.is_empty() {
            if self.json {
                let mut files = Vec::new();
                for hash in &selected_files {
                    let mut entry = serde_json::Map::new();
                    entry.insert("hash".to_owned(), json!(hex::encode(hash)));
                    if let Some(store) = &tagstore {
                        entry.insert("tags".to_owned(), tags_json(store, hash)?);
                    }
                    files.push(Value::Object(entry));
                }
                output.insert("files".to_owned(), Value::Array(files));
            } else if let Some(store) = &tagstore {
                for hash in &selected_files {
                    println!("{}", store.tags_of_file(hash)?);
                }
            }
        }

        if self.errcheck {
            self.run_errcheck(&repository, &selected_files, &mut output)?;
        }
        if self.errfix {
            self.run_errfix(&repository, &selected_files, &mut output)?;
        }

        // Tag edits.
        if let Some(tag_list) = &self.add_tags {
            let store = require_tagstore_mut(&mut tagstore, "--add-tags")?;
            require_selection(&selected_files, "--add-tags")?;
            let tags = parse_tag_list(tag_list)?;
            store.add_tags(&selected_files, &tags)?;
        }

        if let Some(tag_list) = &self.remove_tags {
            let store = require_tagstore_mut(&mut tagstore, "--remove-tags")?;
            require_selection(&selected_files, "--remove-tags")?;
            let tags = parse_tag_list(tag_list)?;
            store.remove_tags(&selected_files, &tags)?;
        }

        // Tag query.
        if let Some(query_text) = &self.tag {
            let store = tagstore.as_ref().ok_or_else(|| {
                FilemassError::InvalidInput("to use --tag, a tagbase must be selected".into())
            })?;
            let query = parse_tag_query(query_text)?;
            tracing::debug!("Tag query: {query}");

            let found = store.find(&query)?;
            if self.json {
                let mut files = Vec::new();
                for hash in &found {
                    files.push(json!({
                        "hash": hex::encode(hash),
                        "tags": tags_json(store, hash)?,
                    }));
                }
                output.insert("files".to_owned(), Value::Array(files));
            } else {
                println!("Found {} files:", found.len());
                for hash in &found {
                    println!("{}", store.tags_of_file(hash)?);
                }
            }
        }

        if self.json {
            println!("{}", Value::Object(output));
        }
        Ok(())
    }

    fn run_errcheck(
        &self,
        repository: &Option<Repository>,
        selected_files: &[Hash],
        output: &mut serde_json::Map<String, Value>,
    ) -> Result<()> {
        let repository = repository.as_ref().ok_or_else(|| {
            FilemassError::InvalidInput("a repository must be selected to use --errcheck".into())
        })?;

        let mut ok = Vec::new();
        let mut not_found = Vec::new();
        let mut broken = Vec::new();
        for hash in selected_files {
            let hex_hash = hex::encode(hash);
            match repository.error_check(hash)? {
                ErrorCheckResult::AllOk => ok.push(hex_hash),
                ErrorCheckResult::NotFound => {
                    if !self.json {
                        println!("[--errcheck] File {hex_hash} was not found!");
                    }
                    not_found.push(hex_hash);
                }
                ErrorCheckResult::Error => {
                    if !self.json {
                        println!("[--errcheck] File {hex_hash} has an error!");
                    }
                    broken.push(hex_hash);
                }
            }
        }

        if self.json {
            output.insert("files_no_error".to_owned(), json!(ok));
            output.insert("files_not_found".to_owned(), json!(not_found));
            output.insert("files_error".to_owned(), json!(broken));
        } else {
            println!(
                "[--errcheck] {} files checked for errors: {} ok, {} with error, {} not found",
                ok.len() + broken.len() + not_found.len(),
                ok.len(),
                broken.len(),
                not_found.len()
            );
        }
        Ok(())
    }

    fn run_errfix(
        &self,
        repository: &Option<Repository>,
        selected_files: &[Hash],
        output: &mut serde_json::Map<String, Value>,
    ) -> Result<()> {
        let repository = repository.as_ref().ok_or_else(|| {
            FilemassError::InvalidInput("a repository must be selected to use --errfix".into())
        })?;

        let mut fixed = Vec::new();
        let mut failed = Vec::new();
        let mut not_broken = Vec::new();
        let mut not_found = Vec::new();
        for hash in selected_files {
            let hex_hash = hex::encode(hash);
            match repository.error_fix(hash)? {
                ErrorFixResult::Fixed => {
                    if !self.json {
                        println!("[--errfix] :) File {hex_hash} has been fixed!");
                    }
                    fixed.push(hex_hash);
                }
                ErrorFixResult::FailedToFix => {
                    if !self.json {
                        println!("[--errfix] :( File {hex_hash} could not be fixed!");
                    }
                    failed.push(hex_hash);
                }
                ErrorFixResult::WasNotBroken => {
                    if !self.json {
                        println!("[--errfix] :) File {hex_hash} was not broken!");
                    }
                    not_broken.push(hex_hash);
                }
                ErrorFixResult::NotFound => {
                    if !self.json {
                        println!("[--errfix] :| File {hex_hash} was not found!");
                    }
                    not_found.push(hex_hash);
                }
            }
        }

        if self.json {
            output.insert("files_fixed".to_owned(), json!(fixed));
            output.insert("files_failed_to_fix".to_owned(), json!(failed));
            output.insert("files_not_found".to_owned(), json!(not_found));
            output.insert("files_were_not_broken".to_owned(), json!(not_broken));
        } else {
            println!(
                "[--errfix] Tried to fix {} files: {} fixed, {} failed to fix, \
                 {} not found, {} were not broken",
                fixed.len() + failed.len() + not_found.len() + not_broken.len(),
                fixed.len(),
                failed.len(),
                not_found.len(),
                not_broken.len()
            );
        }
        Ok(())
    }
}

fn parse_hash_argument(hex_hash: &str) -> Result<Hash> {
    let bytes = hex::decode(hex_hash.trim()).map_err(|_| {
        FilemassError::InvalidInput(format!(
            "arguments to --files must be 64-character hex hashes, got {hex_hash:?}"
        ))
    })?;
    bytes.try_into().map_err(|_| {
        FilemassError::InvalidInput(format!(
            "arguments to --files must be 32-byte hex values, got {hex_hash:?}"
        ))
    })
}

fn require_selection(selected_files: &[Hash], flag: &str) -> Result<()> {
    if selected_files.is_empty() {
        return Err(FilemassError::InvalidInput(format!(
            "to use {flag}, at least one file must be selected (using --add-files or --files)"
        )));
    }
    Ok(())
}

fn require_tagstore_mut<'a>(
    tagstore: &'a mut Option<TagStore>,
    flag: &str,
) -> Result<&'a mut TagStore> {
    tagstore.as_mut().ok_or_else(|| {
        FilemassError::InvalidInput(format!("to use {flag}, a tagbase must be selected"))
    })
}

fn tags_json(store: &TagStore, file_hash: &Hash) -> Result<Value> {
    let root = store.tags_of_file(file_hash)?;
    Ok(Value::Array(root.subtags.iter().map(Tag::to_json).collect()))
}
