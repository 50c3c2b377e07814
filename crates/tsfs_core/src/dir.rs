//! Store directory management.
//!
//! This module handles the file system layout of a tsfs store:
//!
//! ```text
//! <root>/
//! ├─ LOCK              # Advisory lock, one engine per store
//! ├─ fsroots.json      # Optional logical root to physical directory map
//! ├─ index/            # One B-link tree per file kind
//! ├─ txlog/            # Transaction state logs and data journals
//! └─ data/<kind>/      # Hashed data directories
//! ```
//!
//! The LOCK file ensures only one process, server or offline tool, works
//! on the store at a time.

use crate::error::{FsResult, StorageFault};
use crate::types::FileKind;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const FSROOTS_FILE: &str = "fsroots.json";
const INDEX_DIR: &str = "index";
const TXLOG_DIR: &str = "txlog";
const DATA_DIR: &str = "data";

/// Manages the store directory structure and the store lock.
///
/// # Thread Safety
///
/// The `EngineDir` holds an exclusive lock on the store directory.
/// Only one `EngineDir` instance can exist per directory at a time.
#[derive(Debug)]
pub struct EngineDir {
    path: PathBuf,
    _lock_file: File,
}

impl EngineDir {
    /// Opens or creates a store directory and takes the store lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `StoreLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> FsResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StorageFault::invalid_format(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(StorageFault::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageFault::StoreLocked {
                path: path.to_path_buf(),
            });
        }

        for sub in [INDEX_DIR, TXLOG_DIR, DATA_DIR] {
            fs::create_dir_all(path.join(sub))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the store root.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Index file of one kind.
    #[must_use]
    pub fn index_path(&self, kind: FileKind) -> PathBuf {
        self.path
            .join(INDEX_DIR)
            .join(format!("{}.idx", kind.dir_name()))
    }

    /// Transaction log directory.
    #[must_use]
    pub fn txlog_dir(&self) -> PathBuf {
        self.path.join(TXLOG_DIR)
    }

    /// Default data directory of one kind.
    #[must_use]
    pub fn data_dir(&self, kind: FileKind) -> PathBuf {
        data_dir_under(&self.path, kind)
    }

    /// Reads the fs-root map, if present.
    pub fn load_fs_roots(&self) -> FsResult<FsRoots> {
        let path = self.path.join(FSROOTS_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StorageFault::invalid_format(format!("{}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FsRoots::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the fs-root map atomically.
    pub fn save_fs_roots(&self, roots: &FsRoots) -> FsResult<()> {
        let bytes = serde_json::to_vec_pretty(roots)
            .map_err(|e| StorageFault::invalid_format(e.to_string()))?;
        write_atomic(&self.path.join(FSROOTS_FILE), &bytes)
    }
}

/// Data directory of one kind below a physical root.
pub(crate) fn data_dir_under(root: &Path, kind: FileKind) -> PathBuf {
    root.join(DATA_DIR).join(kind.dir_name())
}

/// Maps identifier path prefixes to physical storage roots.
///
/// Identifiers not covered by any prefix live under the store root.
/// The longest matching prefix wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsRoots {
    /// `(prefix, physical root)` pairs.
    #[serde(default)]
    pub roots: Vec<FsRootEntry>,
}

/// One fs-root mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsRootEntry {
    /// Identifier prefix, e.g. `/pa`.
    pub prefix: String,
    /// Directory holding `data/` for matching identifiers.
    pub path: PathBuf,
}

impl FsRoots {
    /// Position of the root serving `id`, if any prefix matches.
    #[must_use]
    pub fn root_for(&self, id: &str) -> Option<usize> {
        self.roots
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                id.strip_prefix(r.prefix.as_str())
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            })
            .max_by_key(|(_, r)| r.prefix.len())
            .map(|(i, _)| i)
    }
}

/// Writes `bytes` to `path` through a synced temporary file and a rename.
///
/// 1. Write to temporary file
/// 2. Sync temporary file to disk
/// 3. Rename temporary file over the target
/// 4. Fsync the directory so the rename is durable
pub fn write_atomic(path: &Path, bytes: &[u8]) -> FsResult<()> {
    let tmp = tmp_path(path);
    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_directory(parent)?;
    }
    Ok(())
}

/// Temporary sibling used by [`write_atomic`].
#[must_use]
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Removes a file, treating absence as success. Returns whether it existed.
pub fn remove_if_exists(path: &Path) -> FsResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Syncs a directory so that entry creation, rename and removal are durable.
///
/// On Windows, directory fsync is not supported in the same way as Unix.
/// NTFS journals metadata, so the explicit fsync is skipped there.
#[cfg(unix)]
pub fn sync_directory(path: &Path) -> FsResult<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

/// Syncs a directory so that entry creation, rename and removal are durable.
#[cfg(not(unix))]
pub fn sync_directory(_path: &Path) -> FsResult<()> {
    Ok(())
}
