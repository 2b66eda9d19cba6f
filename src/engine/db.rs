//! Persistent storage for build results.
//!
//! The engine checkpoints every completed `(key, value)` pair, tagged with
//! the build iteration and the list of dependency keys the producing task
//! recorded, so the next build can validate and reuse results without
//! re-running actions.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::rule::{Key, ValueData};

/// A persisted result for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbResult {
    /// The serialized value the rule's task completed with.
    pub value: ValueData,
    /// The build iteration the value was computed in.
    pub iteration: u64,
    /// The keys the task depended on, in request order (declared inputs,
    /// ordering edges, then discovered dependencies).
    pub dependencies: Vec<Key>,
}

/// The persistence contract the engine assumes.
///
/// `load_results` is called once, when the database is attached; after
/// that the engine only writes through. Durability is the implementation's
/// business; `flush` is called at the end of every build.
pub trait BuildDb {
    /// The iteration recorded by the most recent build, 0 for a fresh db.
    fn current_iteration(&self) -> u64;

    fn set_current_iteration(&mut self, iteration: u64);

    /// All persisted results.
    fn load_results(&mut self) -> Result<Vec<(Key, DbResult)>>;

    /// Record the result for a key, replacing any prior entry.
    fn set_result(&mut self, key: &[u8], result: DbResult) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opening a database can fail if it was created by an incompatible
/// client.
#[derive(Debug, Error)]
pub enum DbError {
    #[error(
        "build database '{path}' was created with schema version {found}, expected {expected}"
    )]
    SchemaVersionMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct DbContents {
    schema_version: u32,
    iteration: u64,
    results: Vec<DbEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DbEntry {
    key: Key,
    #[serde(flatten)]
    result: DbResult,
}

/// A build database stored as a single JSON file.
///
/// Writes accumulate in memory and hit disk on `flush`, which the engine
/// invokes at the end of each build.
#[derive(Debug)]
pub struct FileBuildDb {
    path: PathBuf,
    schema_version: u32,
    iteration: u64,
    results: BTreeMap<Key, DbResult>,
    dirty: bool,
}

impl FileBuildDb {
    /// Open (or create) the database at `path`.
    ///
    /// An existing database carrying a different schema version fails with
    /// a diagnostic; the caller is expected to delete the file or bump its
    /// client version deliberately.
    pub fn open(path: &Path, schema_version: u32) -> Result<Self> {
        if !path.exists() {
            return Ok(FileBuildDb {
                path: path.to_path_buf(),
                schema_version,
                iteration: 0,
                results: BTreeMap::new(),
                dirty: false,
            });
        }

        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read build database: {}", path.display()))?;
        let contents: DbContents = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse build database: {}", path.display()))?;

        if contents.schema_version != schema_version {
            return Err(DbError::SchemaVersionMismatch {
                path: path.to_path_buf(),
                found: contents.schema_version,
                expected: schema_version,
            }
            .into());
        }

        let results = contents
            .results
            .into_iter()
            .map(|entry| (entry.key, entry.result))
            .collect();

        Ok(FileBuildDb {
            path: path.to_path_buf(),
            schema_version,
            iteration: contents.iteration,
            results,
            dirty: false,
        })
    }

    /// The result currently recorded for `key`, if any.
    pub fn get_result(&self, key: &[u8]) -> Option<&DbResult> {
        self.results.get(key)
    }
}

impl BuildDb for FileBuildDb {
    fn current_iteration(&self) -> u64 {
        self.iteration
    }

    fn set_current_iteration(&mut self, iteration: u64) {
        self.iteration = iteration;
        self.dirty = true;
    }

    fn load_results(&mut self) -> Result<Vec<(Key, DbResult)>> {
        Ok(self
            .results
            .iter()
            .map(|(key, result)| (key.clone(), result.clone()))
            .collect())
    }

    fn set_result(&mut self, key: &[u8], result: DbResult) -> Result<()> {
        self.results.insert(key.to_vec(), result);
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let contents = DbContents {
            schema_version: self.schema_version,
            iteration: self.iteration,
            results: self
                .results
                .iter()
                .map(|(key, result)| DbEntry {
                    key: key.clone(),
                    result: result.clone(),
                })
                .collect(),
        };

        let text = serde_json::to_string(&contents)?;
        fs::write(&self.path, text)
            .with_context(|| format!("failed to write build database: {}", self.path.display()))?;
        self.dirty = false;
        Ok(())
    }
}
