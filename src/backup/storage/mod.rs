//! Where archives are written to and read from.
//!
//! All paths handed to a `StorageLocation` are relative to its root. Both
//! archive strategies only ever see this trait, so the same code writes to a
//! plain directory or, through the privileged shell, to one the process
//! cannot open itself.

pub mod path;
pub mod privileged;

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::shell::ShellHandler;
use crate::backup::storage::path::PathStorage;
use crate::backup::storage::privileged::PrivilegedStorage;
use crate::backup::validate::validate_dir_exist_or_created;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use validator::{Validate, ValidationErrors};

/// A file being written. Nothing counts as stored until `commit` succeeds.
pub trait StorageWriter: Write + Send {
    fn commit(self: Box<Self>) -> Result<()>;
}

pub trait StorageLocation: Debug + Send + Sync {
    fn ensure_dir(&self, dir: &Path) -> Result<()>;

    fn exists(&self, path: &Path) -> Result<bool>;

    /// Entry names directly under `dir`, sorted; empty when `dir` does not exist.
    fn list(&self, dir: &Path) -> Result<Vec<String>>;

    /// Creates or truncates `path`, creating missing parent directories.
    fn create_file(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    fn open_file(&self, path: &Path) -> Result<Box<dyn Read + Send>>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Removes a file or a whole directory tree; missing paths are fine.
    fn delete(&self, path: &Path) -> Result<()>;
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum StorageConfig {
    /// Directory the backup process can access directly
    Path { root: PathBuf },
    /// Directory only reachable through the privileged shell
    Privileged { root: PathBuf },
}

impl Validate for StorageConfig {
    fn validate(&self) -> std::result::Result<(), ValidationErrors> {
        match self {
            StorageConfig::Path { root } => {
                validate_dir_exist_or_created(root).map_err(|e| {
                    let mut errors = ValidationErrors::new();
                    errors.add("root", e);
                    errors
                })
            }
            StorageConfig::Privileged { .. } => Ok(()),
        }
    }
}

impl StorageConfig {
    pub fn build(&self, shell: Arc<ShellHandler>) -> Arc<dyn StorageLocation> {
        match self {
            StorageConfig::Path { root } => Arc::new(PathStorage::new(root.clone())),
            StorageConfig::Privileged { root } => {
                Arc::new(PrivilegedStorage::new(root.clone(), shell))
            }
        }
    }
}

/// Joins a relative storage path onto `root`, refusing anything that escapes it.
pub(crate) fn resolve(root: &Path, relative: &Path) -> Result<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::NotFound(format!(
                    "storage path {relative:?} leaves the storage root"
                )))
            }
        }
    }
    Ok(resolved)
}
