//! Directory consistency checker.
//!
//! Compares each data tree with the index: every mapped id must have its
//! data and metadata files at the place the directory hash puts them, and
//! every file in the tree must belong to a mapped id. The checker reports
//! findings and, unless run dry, repairs them.

use crate::dir::remove_if_exists;
use crate::error::FsResult;
use crate::fsid::FsId;
use crate::metadata::StoredMetadata;
use crate::store::{
    parse_file_name, DirectoryHash, FileStore, DATA_EXT, HASH_FILE, KNOWN_EXTENSIONS, META_EXT,
};
use crate::types::FileKind;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One inconsistency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum Problem {
    /// A mapped id has no data file. Repaired by unmapping it.
    MissingDataFile {
        /// Kind of file.
        kind: FileKind,
        /// Identifier.
        id: String,
        /// Mapped file id.
        file_id: u64,
    },
    /// A mapped id has no metadata sidecar. Repaired by unmapping it.
    MissingMetadata {
        /// Kind of file.
        kind: FileKind,
        /// Identifier.
        id: String,
        /// Mapped file id.
        file_id: u64,
    },
    /// The sidecar does not decode or belongs to another kind.
    UnreadableMetadata {
        /// Kind of file.
        kind: FileKind,
        /// Identifier.
        id: String,
        /// Mapped file id.
        file_id: u64,
        /// Decoder message.
        reason: String,
    },
    /// The data file is shorter than its metadata claims. Repaired by
    /// clipping the metadata to the bytes present.
    ShortDataFile {
        /// Kind of file.
        kind: FileKind,
        /// Identifier.
        id: String,
        /// Mapped file id.
        file_id: u64,
        /// Bytes the metadata describes.
        expected: u64,
        /// Bytes on disk.
        actual: u64,
    },
    /// Two ids map to the same file. Repaired by unmapping the later id.
    DuplicateFileId {
        /// Kind of file.
        kind: FileKind,
        /// Id that keeps the file.
        kept: String,
        /// Id that was unmapped.
        dropped: String,
        /// Shared file id.
        file_id: u64,
    },
    /// A file sits in the wrong hash directory. Repaired by moving it.
    MisplacedFile {
        /// Where it is.
        path: PathBuf,
        /// Where the hash puts it.
        expected: PathBuf,
    },
    /// A file no mapped id refers to. Repaired by deleting it.
    OrphanFile {
        /// File path.
        path: PathBuf,
    },
    /// Leftover temporary of an atomic write. Repaired by deleting it.
    StaleTempFile {
        /// File path.
        path: PathBuf,
    },
    /// A file the store never writes. Reported only.
    UnknownFile {
        /// File path.
        path: PathBuf,
    },
    /// The directory-hash descriptor is missing, unreadable or marked bad.
    /// Repaired by rewriting the descriptor.
    BadHashConfig {
        /// Data tree.
        dir: PathBuf,
        /// What is wrong.
        reason: String,
    },
}

/// Result of a check.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CheckReport {
    /// Mapped ids examined.
    pub ids_checked: u64,
    /// Files found in the data trees.
    pub files_scanned: u64,
    /// Findings, in discovery order.
    pub problems: Vec<Problem>,
    /// Whether repairs were applied.
    pub repaired: bool,
}

impl CheckReport {
    /// Returns true if nothing was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Checks every data tree of `store` against its index.
///
/// With `dry_run` nothing is changed.
pub fn check_store(store: &FileStore, dry_run: bool) -> FsResult<CheckReport> {
    let mut report = CheckReport {
        repaired: !dry_run,
        ..CheckReport::default()
    };
    for kind in FileKind::ALL {
        let mut mapped: Vec<(FsId, u64)> = store.iter(kind).collect::<FsResult<_>>()?;
        resolve_duplicates(store, kind, &mut mapped, dry_run, &mut report)?;
        for root in 0..store.roots().len() {
            let ids: Vec<&(FsId, u64)> = mapped
                .iter()
                .filter(|(id, _)| store.root_of(id) == root)
                .collect();
            check_tree(store, kind, root, &ids, dry_run, &mut report)?;
        }
    }
    if !dry_run {
        store.flush_indexes()?;
    }
    for problem in &report.problems {
        warn!(?problem, dry_run, "consistency problem");
    }
    info!(
        ids = report.ids_checked,
        files = report.files_scanned,
        problems = report.problems.len(),
        dry_run,
        "consistency check complete"
    );
    Ok(report)
}

fn resolve_duplicates(
    store: &FileStore,
    kind: FileKind,
    mapped: &mut Vec<(FsId, u64)>,
    dry_run: bool,
    report: &mut CheckReport,
) -> FsResult<()> {
    let mut owners: HashMap<u64, FsId> = HashMap::new();
    let mut keep = Vec::with_capacity(mapped.len());
    for (id, file_id) in mapped.drain(..) {
        if let Some(kept) = owners.get(&file_id) {
            report.problems.push(Problem::DuplicateFileId {
                kind,
                kept: kept.to_string(),
                dropped: id.to_string(),
                file_id,
            });
            if !dry_run {
                store.unmap(kind, &id)?;
            }
            continue;
        }
        owners.insert(file_id, id.clone());
        keep.push((id, file_id));
    }
    *mapped = keep;
    Ok(())
}

fn load_hash(dir: &Path) -> Result<DirectoryHash, String> {
    let bytes = fs::read(dir.join(HASH_FILE)).map_err(|e| e.to_string())?;
    let hash: DirectoryHash = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
    if !hash.ok {
        return Err("descriptor is marked inconsistent".into());
    }
    Ok(hash)
}

fn check_tree(
    store: &FileStore,
    kind: FileKind,
    root: usize,
    ids: &[&(FsId, u64)],
    dry_run: bool,
    report: &mut CheckReport,
) -> FsResult<()> {
    let dir = store.data_root(root, kind)?;
    if !dir.exists() {
        for (id, file_id) in ids.iter().copied() {
            report.ids_checked += 1;
            missing(store, kind, id, *file_id, dry_run, report, true)?;
        }
        return Ok(());
    }

    let hash = match load_hash(&dir) {
        Ok(hash) => hash,
        Err(reason) => {
            report.problems.push(Problem::BadHashConfig {
                dir: dir.clone(),
                reason,
            });
            let hash = store.default_hash().clone();
            if !dry_run {
                store.rewrite_hash(root, kind, &hash)?;
            }
            hash
        }
    };

    // file id -> files found for it
    let mut found: BTreeMap<u64, Vec<PathBuf>> = BTreeMap::new();
    let mut pending = vec![dir.clone()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path);
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                report.problems.push(Problem::UnknownFile { path });
                continue;
            };
            if current == dir && name == HASH_FILE {
                continue;
            }
            report.files_scanned += 1;
            if name.ends_with(".tmp") {
                if !dry_run {
                    remove_if_exists(&path)?;
                }
                report.problems.push(Problem::StaleTempFile { path });
                continue;
            }
            match parse_file_name(&name) {
                Some((file_id, ext)) if KNOWN_EXTENSIONS.contains(&ext) => {
                    found.entry(file_id).or_default().push(path);
                }
                _ => report.problems.push(Problem::UnknownFile { path }),
            }
        }
    }

    for (id, file_id) in ids.iter().copied() {
        report.ids_checked += 1;
        let expected_dir = dir.join(hash.relative_dir(*file_id));
        for path in found.remove(file_id).unwrap_or_default() {
            let Some(name) = path.file_name() else {
                continue;
            };
            let expected = expected_dir.join(name);
            if path != expected {
                if !dry_run {
                    fs::create_dir_all(&expected_dir)?;
                    fs::rename(&path, &expected)?;
                }
                report.problems.push(Problem::MisplacedFile { path, expected });
            }
        }
        check_mapped(store, kind, id, *file_id, &expected_dir, dry_run, report)?;
    }

    for path in found.into_values().flatten() {
        if !dry_run {
            remove_if_exists(&path)?;
        }
        report.problems.push(Problem::OrphanFile { path });
    }
    Ok(())
}

fn check_mapped(
    store: &FileStore,
    kind: FileKind,
    id: &FsId,
    file_id: u64,
    dir: &Path,
    dry_run: bool,
    report: &mut CheckReport,
) -> FsResult<()> {
    let data = dir.join(format!("{file_id}.{DATA_EXT}"));
    let meta_path = dir.join(format!("{file_id}.{META_EXT}"));
    // A dry run leaves misplaced files where they are.
    let misplaced = |path: &PathBuf| {
        report.problems.iter().any(|p| {
            matches!(p, Problem::MisplacedFile { expected, .. } if expected == path)
        })
    };
    if dry_run && (misplaced(&data) || misplaced(&meta_path)) {
        return Ok(());
    }
    if !data.exists() {
        return missing(store, kind, id, file_id, dry_run, report, true);
    }
    let decoded = match fs::read(&meta_path) {
        Ok(bytes) => StoredMetadata::decode(&bytes).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => return Err(e.into()),
    };
    let meta = match decoded {
        Ok(Some(meta)) if meta.kind() == kind => meta,
        Ok(Some(meta)) => {
            report.problems.push(Problem::UnreadableMetadata {
                kind,
                id: id.to_string(),
                file_id,
                reason: format!("sidecar describes a {:?} file", meta.kind()),
            });
            return unmap(store, kind, id, file_id, dry_run);
        }
        Ok(None) => return missing(store, kind, id, file_id, dry_run, report, false),
        Err(e) => {
            report.problems.push(Problem::UnreadableMetadata {
                kind,
                id: id.to_string(),
                file_id,
                reason: e.to_string(),
            });
            return unmap(store, kind, id, file_id, dry_run);
        }
    };
    let expected = meta.expected_data_len();
    let actual = fs::metadata(&data)?.len();
    if actual < expected {
        report.problems.push(Problem::ShortDataFile {
            kind,
            id: id.to_string(),
            file_id,
            expected,
            actual,
        });
        if !dry_run {
            store.write_metadata(kind, id, file_id, &clip_metadata(meta, actual))?;
        }
    }
    Ok(())
}

fn missing(
    store: &FileStore,
    kind: FileKind,
    id: &FsId,
    file_id: u64,
    dry_run: bool,
    report: &mut CheckReport,
    data: bool,
) -> FsResult<()> {
    let id_str = id.to_string();
    report.problems.push(if data {
        Problem::MissingDataFile {
            kind,
            id: id_str,
            file_id,
        }
    } else {
        Problem::MissingMetadata {
            kind,
            id: id_str,
            file_id,
        }
    });
    unmap(store, kind, id, file_id, dry_run)
}

fn unmap(store: &FileStore, kind: FileKind, id: &FsId, file_id: u64, dry_run: bool) -> FsResult<()> {
    if dry_run {
        return Ok(());
    }
    store.unmap(kind, id)?;
    store.delete_files(kind, id, file_id)?;
    store.release_file_id(kind, file_id);
    Ok(())
}

/// Drops whatever the metadata claims past `len` bytes.
fn clip_metadata(meta: StoredMetadata, len: u64) -> StoredMetadata {
    let end = i64::try_from(len).unwrap_or(i64::MAX);
    match meta {
        StoredMetadata::Series(mut series) => {
            series.valid.delete_interval(end, i64::MAX);
            series.origins.delete_interval(end, i64::MAX);
            StoredMetadata::Series(series)
        }
        StoredMetadata::Blob { origin, .. } => StoredMetadata::Blob { origin, len },
        StoredMetadata::Mjd { points } => StoredMetadata::Mjd {
            points: points.min(len / crate::carrier::MJD_POINT_SIZE as u64),
        },
    }
}
