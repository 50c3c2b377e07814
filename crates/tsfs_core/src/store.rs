//! Physical storage of data files.
//!
//! The [`FileStore`] owns one B-link tree per [`FileKind`] mapping each
//! identifier to a file id, a file id allocator per kind, and the hashed
//! directory trees holding the `.dat` and `.meta` files. Which physical
//! root a file lives under is decided by the fs-root map.

use crate::alloc::BlockAllocator;
use crate::blink::{FsIdIndex, TreeIter};
use crate::config::EngineConfig;
use crate::dir::{data_dir_under, remove_if_exists, write_atomic, EngineDir, FsRoots};
use crate::error::{FsResult, StorageFault};
use crate::fsid::FsId;
use crate::metadata::StoredMetadata;
use crate::scheduler::LocationFactory;
use crate::types::FileKind;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tsfs_storage::FileBackend;

pub(crate) const HASH_FILE: &str = "hash.json";
pub(crate) const DATA_EXT: &str = "dat";
pub(crate) const META_EXT: &str = "meta";
const INITIAL_FILE_IDS: u64 = 4096;

/// Directory hashing descriptor, stored as `hash.json` in each data tree.
///
/// File id `f` lives in `levels` nested directories chosen from
/// `f / max_files_per_dir`, `bins` per level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryHash {
    /// Directories per level.
    pub bins: u64,
    /// Nesting depth.
    pub levels: u32,
    /// Most files per leaf directory.
    pub max_files_per_dir: u64,
    /// False while a tree is known to need repair.
    pub ok: bool,
}

impl DirectoryHash {
    /// Smallest hashing that keeps `max_files` ids within the fan-out.
    #[must_use]
    pub fn for_capacity(bins: u64, max_files_per_dir: u64, max_files: u64) -> Self {
        let bins = bins.max(2);
        let per_dir = max_files_per_dir.max(1);
        let mut levels = 1;
        let mut reach = per_dir.saturating_mul(bins);
        while reach < max_files && levels < 4 {
            levels += 1;
            reach = reach.saturating_mul(bins);
        }
        Self {
            bins,
            levels,
            max_files_per_dir: per_dir,
            ok: true,
        }
    }

    /// Directory of `file_id`, relative to the data tree.
    #[must_use]
    pub fn relative_dir(&self, file_id: u64) -> PathBuf {
        let mut bucket = file_id / self.max_files_per_dir;
        let mut parts = Vec::with_capacity(self.levels as usize);
        for _ in 0..self.levels {
            parts.push(format!("{:02x}", bucket % self.bins));
            bucket /= self.bins;
        }
        parts.iter().rev().collect()
    }
}

/// Where a file lives: its physical root and file id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    /// Index into [`FileStore::roots`].
    pub root: usize,
    /// Data file id.
    pub file_id: u64,
}

/// Index, allocators and data directories of one store.
pub struct FileStore {
    roots: Vec<PathBuf>,
    fs_roots: FsRoots,
    indexes: Vec<FsIdIndex>,
    file_ids: Vec<Mutex<BlockAllocator>>,
    max_files: u64,
    default_hash: DirectoryHash,
    hashes: Mutex<HashMap<(usize, FileKind), Arc<DirectoryHash>>>,
    handles: Mutex<LruCache<(FileKind, u64), Arc<FileBackend>>>,
}

impl FileStore {
    /// Opens the indexes and rebuilds the file id allocators from them.
    pub fn open(dir: &EngineDir, config: &EngineConfig) -> FsResult<Self> {
        let fs_roots = dir.load_fs_roots()?;
        let mut roots = vec![dir.path().to_path_buf()];
        roots.extend(fs_roots.roots.iter().map(|r| r.path.clone()));

        let mut indexes = Vec::with_capacity(FileKind::ALL.len());
        let mut file_ids = Vec::with_capacity(FileKind::ALL.len());
        for kind in FileKind::ALL {
            let index = FsIdIndex::open(
                &dir.index_path(kind),
                config.node_size,
                config.node_cache_nodes,
                config.max_index_nodes,
            )?;
            let mut ids = BlockAllocator::new(INITIAL_FILE_IDS.min(config.max_files));
            let mut count = 0u64;
            for entry in index.iter() {
                let (_, file_id) = entry?;
                if file_id >= config.max_files {
                    return Err(StorageFault::corrupted(format!(
                        "{kind} index maps file id {file_id} beyond the limit of {}",
                        config.max_files
                    )));
                }
                while file_id >= ids.capacity() {
                    ids.grow(ids.capacity().saturating_mul(2).max(1).min(config.max_files));
                }
                ids.mark(file_id)?;
                count += 1;
            }
            debug!(%kind, files = count, "index opened");
            indexes.push(index);
            file_ids.push(Mutex::new(ids));
        }

        let cache = NonZeroUsize::new(config.open_file_cache.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            roots,
            fs_roots,
            indexes,
            file_ids,
            max_files: config.max_files,
            default_hash: DirectoryHash::for_capacity(
                config.hash_bins,
                config.max_files_per_dir,
                config.max_files,
            ),
            hashes: Mutex::new(HashMap::new()),
            handles: Mutex::new(LruCache::new(cache)),
        })
    }

    /// Physical roots; index 0 is the store root.
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Index of one kind.
    #[must_use]
    pub fn index(&self, kind: FileKind) -> &FsIdIndex {
        &self.indexes[kind.index()]
    }

    /// File id mapped to `id`, if any.
    pub fn lookup(&self, kind: FileKind, id: &FsId) -> FsResult<Option<u64>> {
        self.index(kind).find(id)
    }

    /// Maps `id` to `file_id`.
    pub fn map(&self, kind: FileKind, id: &FsId, file_id: u64) -> FsResult<()> {
        self.index(kind).insert(id.clone(), file_id)?;
        Ok(())
    }

    /// Removes the mapping of `id`.
    pub fn unmap(&self, kind: FileKind, id: &FsId) -> FsResult<Option<u64>> {
        self.index(kind).delete(id)
    }

    /// Iterates the index of one kind in identifier order.
    pub fn iter(&self, kind: FileKind) -> TreeIter<'_, crate::blink::FsIdCodec> {
        self.index(kind).iter()
    }

    /// Iterates identifiers at or after `from`.
    pub fn iter_from(&self, kind: FileKind, from: FsId) -> TreeIter<'_, crate::blink::FsIdCodec> {
        self.index(kind).iter_from(from)
    }

    /// Reserves a fresh file id.
    pub fn allocate_file_id(&self, kind: FileKind) -> FsResult<u64> {
        let mut ids = self.file_ids[kind.index()].lock();
        if ids.used() >= ids.capacity() && ids.capacity() < self.max_files {
            let grown = ids.capacity().saturating_mul(2).max(1).min(self.max_files);
            ids.grow(grown);
        }
        ids.allocate()
    }

    /// Marks an id handed out before a restart as taken.
    pub fn reserve_file_id(&self, kind: FileKind, file_id: u64) -> FsResult<()> {
        let mut ids = self.file_ids[kind.index()].lock();
        while file_id >= ids.capacity() && ids.capacity() < self.max_files {
            let grown = ids.capacity().saturating_mul(2).max(1).min(self.max_files);
            ids.grow(grown);
        }
        ids.mark(file_id)
    }

    /// Returns a file id to the allocator.
    pub fn release_file_id(&self, kind: FileKind, file_id: u64) {
        self.file_ids[kind.index()].lock().free(file_id);
    }

    /// Returns true if the file id is currently handed out.
    #[must_use]
    pub fn is_file_id_allocated(&self, kind: FileKind, file_id: u64) -> bool {
        self.file_ids[kind.index()].lock().is_allocated(file_id)
    }

    /// Physical root serving `id`.
    #[must_use]
    pub fn root_of(&self, id: &FsId) -> usize {
        self.fs_roots.root_for(id.as_str()).map_or(0, |i| i + 1)
    }

    /// Directory hashing of one data tree, created on first use.
    pub fn hash_for(&self, root: usize, kind: FileKind) -> FsResult<Arc<DirectoryHash>> {
        let mut hashes = self.hashes.lock();
        if let Some(hash) = hashes.get(&(root, kind)) {
            return Ok(Arc::clone(hash));
        }
        let dir = self.data_root(root, kind)?;
        let path = dir.join(HASH_FILE);
        let hash = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageFault::invalid_format(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(&dir)?;
                let hash = self.default_hash.clone();
                write_hash(&path, &hash)?;
                info!(path = %path.display(), levels = hash.levels, "created directory hash");
                hash
            }
            Err(e) => return Err(e.into()),
        };
        let hash = Arc::new(hash);
        hashes.insert((root, kind), Arc::clone(&hash));
        Ok(hash)
    }

    /// Rewrites a data tree's descriptor, marking it healthy.
    pub fn rewrite_hash(&self, root: usize, kind: FileKind, hash: &DirectoryHash) -> FsResult<()> {
        let dir = self.data_root(root, kind)?;
        fs::create_dir_all(&dir)?;
        let mut hash = hash.clone();
        hash.ok = true;
        write_hash(&dir.join(HASH_FILE), &hash)?;
        self.hashes.lock().insert((root, kind), Arc::new(hash));
        Ok(())
    }

    /// Hashing used for data trees created by this store.
    #[must_use]
    pub fn default_hash(&self) -> &DirectoryHash {
        &self.default_hash
    }

    /// Data tree of one kind below one root.
    pub fn data_root(&self, root: usize, kind: FileKind) -> FsResult<PathBuf> {
        let base = self
            .roots
            .get(root)
            .ok_or_else(|| StorageFault::invalid_operation(format!("no storage root {root}")))?;
        Ok(data_dir_under(base, kind))
    }

    fn file_path(&self, kind: FileKind, id: &FsId, file_id: u64, ext: &str) -> FsResult<PathBuf> {
        let root = self.root_of(id);
        let hash = self.hash_for(root, kind)?;
        Ok(self
            .data_root(root, kind)?
            .join(hash.relative_dir(file_id))
            .join(format!("{file_id}.{ext}")))
    }

    /// Path of the data file.
    pub fn data_path(&self, kind: FileKind, id: &FsId, file_id: u64) -> FsResult<PathBuf> {
        self.file_path(kind, id, file_id, DATA_EXT)
    }

    /// Path of the metadata sidecar.
    pub fn meta_path(&self, kind: FileKind, id: &FsId, file_id: u64) -> FsResult<PathBuf> {
        self.file_path(kind, id, file_id, META_EXT)
    }

    /// Opens the data file, creating it and its directories if `create`.
    ///
    /// Returns `None` when the file is absent and `create` is false.
    pub fn open_data(
        &self,
        kind: FileKind,
        id: &FsId,
        file_id: u64,
        create: bool,
    ) -> FsResult<Option<Arc<FileBackend>>> {
        if let Some(handle) = self.handles.lock().get(&(kind, file_id)) {
            return Ok(Some(Arc::clone(handle)));
        }
        let path = self.data_path(kind, id, file_id)?;
        let backend = if create {
            FileBackend::open_with_create_dirs(&path)?
        } else {
            match FileBackend::open_existing(&path) {
                Ok(b) => b,
                Err(tsfs_storage::StorageError::Io(e))
                    if e.kind() == std::io::ErrorKind::NotFound =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e.into()),
            }
        };
        let handle = Arc::new(backend);
        self.handles.lock().put((kind, file_id), Arc::clone(&handle));
        Ok(Some(handle))
    }

    /// Reads the metadata sidecar, `None` if it does not exist.
    pub fn read_metadata(
        &self,
        kind: FileKind,
        id: &FsId,
        file_id: u64,
    ) -> FsResult<Option<StoredMetadata>> {
        let path = self.meta_path(kind, id, file_id)?;
        match fs::read(&path) {
            Ok(bytes) => StoredMetadata::decode(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the metadata sidecar atomically.
    pub fn write_metadata(
        &self,
        kind: FileKind,
        id: &FsId,
        file_id: u64,
        meta: &StoredMetadata,
    ) -> FsResult<()> {
        let path = self.meta_path(kind, id, file_id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, &meta.encode()?)
    }

    /// Removes the data and metadata files. Missing files are ignored.
    pub fn delete_files(&self, kind: FileKind, id: &FsId, file_id: u64) -> FsResult<()> {
        self.handles.lock().pop(&(kind, file_id));
        remove_if_exists(&self.data_path(kind, id, file_id)?)?;
        remove_if_exists(&self.meta_path(kind, id, file_id)?)?;
        Ok(())
    }

    /// Makes the index changes of committed transactions durable.
    pub fn flush_indexes(&self) -> FsResult<()> {
        for index in &self.indexes {
            index.flush()?;
        }
        Ok(())
    }

    /// Drops cached index nodes and open handles.
    pub fn invalidate_caches(&self) {
        for index in &self.indexes {
            index.invalidate_cache();
        }
        self.handles.lock().clear();
    }

    /// Deletes every file and mapping of every kind.
    pub fn wipe(&self) -> FsResult<u64> {
        let mut removed = 0;
        for kind in FileKind::ALL {
            let entries: Vec<(FsId, u64)> = self.iter(kind).collect::<FsResult<_>>()?;
            for (id, file_id) in entries {
                self.delete_files(kind, &id, file_id)?;
                self.unmap(kind, &id)?;
                self.release_file_id(kind, file_id);
                removed += 1;
            }
        }
        self.flush_indexes()?;
        info!(removed, "file store wiped");
        Ok(removed)
    }

    /// Index node cache hits and misses across all kinds.
    #[must_use]
    pub fn cache_counters(&self) -> (u64, u64) {
        use std::sync::atomic::Ordering;
        self.indexes.iter().fold((0, 0), |(h, m), index| {
            let stats = index.cache_stats();
            (
                h + stats.hits.load(Ordering::Relaxed),
                m + stats.misses.load(Ordering::Relaxed),
            )
        })
    }
}

impl LocationFactory for FileStore {
    fn location(&self, kind: FileKind, id: &FsId) -> FsResult<Option<Location>> {
        Ok(self.lookup(kind, id)?.map(|file_id| Location {
            root: self.root_of(id),
            file_id,
        }))
    }
}

fn write_hash(path: &Path, hash: &DirectoryHash) -> FsResult<()> {
    let bytes =
        serde_json::to_vec_pretty(hash).map_err(|e| StorageFault::invalid_format(e.to_string()))?;
    write_atomic(path, &bytes)
}

/// Parses `<file_id>.<ext>` data directory entries.
pub(crate) fn parse_file_name(name: &str) -> Option<(u64, &str)> {
    let (stem, ext) = name.split_once('.')?;
    let file_id = stem.parse().ok()?;
    Some((file_id, ext))
}

/// Extensions of files the store writes.
pub(crate) const KNOWN_EXTENSIONS: [&str; 2] = [DATA_EXT, META_EXT];
