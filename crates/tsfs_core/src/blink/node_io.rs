//! Cached, batched node I/O for one index file.
//!
//! Writers publish nodes into a pending map; [`NodeIo::flush`] makes a
//! batch durable. A flush first writes the whole batch (pages plus the
//! allocator bitmap) to a journal, syncs it, then writes the pages in
//! place. A journal found at open is replayed, so a crash mid-flush never
//! leaves a half-written tree.
//!
//! Nodes are addressed by byte offset. Page 0 holds the file header; block
//! `b` of the allocator lives at `(b + 1) * node_size`.

use super::node::{decode_node, encode_node, Node, NodeCodec};
use crate::alloc::BlockAllocator;
use crate::codec::{compute_crc32, ByteReader};
use crate::dir::write_atomic;
use crate::error::{FsResult, StorageFault};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use tsfs_storage::{FileBackend, InMemoryBackend, StorageBackend};

/// Magic bytes of an index file: "TSIX".
pub const INDEX_MAGIC: [u8; 4] = *b"TSIX";
/// Magic bytes of a node batch journal: "TSNJ".
const JOURNAL_MAGIC: [u8; 4] = *b"TSNJ";
/// Current index format version.
pub const INDEX_VERSION: u16 = 1;
/// Default page size.
pub const DEFAULT_NODE_SIZE: usize = 4096;

const INITIAL_BLOCKS: u64 = 1024;

/// Block holding the root. The root never moves.
pub(crate) const ROOT_BLOCK: u64 = 0;

type SharedNode<C> = Arc<Node<<C as NodeCodec>::Key, <C as NodeCodec>::Value>>;

/// Paths of the files that accompany an on-disk index.
#[derive(Debug, Clone)]
struct Sidecars {
    journal: PathBuf,
    bitmap: PathBuf,
}

/// Cache counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Reads answered from the cache or the pending map.
    pub hits: AtomicU64,
    /// Reads that went to disk.
    pub misses: AtomicU64,
}

pub(crate) struct NodeIo<C: NodeCodec> {
    store: Arc<dyn StorageBackend>,
    sidecars: Option<Sidecars>,
    node_size: usize,
    max_blocks: u64,
    alloc: Mutex<BlockAllocator>,
    alloc_dirty: Mutex<bool>,
    pending: Mutex<HashMap<u64, (u64, SharedNode<C>)>>,
    seq: AtomicU64,
    cache: Mutex<LruCache<u64, SharedNode<C>>>,
    epoch: AtomicU64,
    flush_lock: Mutex<()>,
    stats: CacheStats,
    _codec: PhantomData<C>,
}

impl<C: NodeCodec> NodeIo<C> {
    /// Opens or creates the index file at `path`.
    pub fn open(
        path: &Path,
        node_size: usize,
        cache_nodes: usize,
        max_blocks: u64,
    ) -> FsResult<(Self, bool)> {
        let sidecars = Sidecars {
            journal: sidecar_path(path, "journal"),
            bitmap: sidecar_path(path, "alloc"),
        };
        let backend = FileBackend::open_with_create_dirs(path)?;
        let fresh = backend.size()? == 0;
        let io = Self::with_store(
            Arc::new(backend),
            Some(sidecars),
            node_size,
            cache_nodes,
            max_blocks,
        );
        if fresh {
            io.write_header()?;
        } else {
            io.check_header()?;
            io.replay_journal()?;
            io.load_bitmap()?;
        }
        Ok((io, fresh))
    }

    /// Index held entirely in memory, for scratch trees.
    pub fn in_memory(node_size: usize, cache_nodes: usize) -> FsResult<Self> {
        let io = Self::with_store(
            Arc::new(InMemoryBackend::new()),
            None,
            node_size,
            cache_nodes,
            u64::MAX,
        );
        io.write_header()?;
        Ok(io)
    }

    fn with_store(
        store: Arc<dyn StorageBackend>,
        sidecars: Option<Sidecars>,
        node_size: usize,
        cache_nodes: usize,
        max_blocks: u64,
    ) -> Self {
        let cap = NonZeroUsize::new(cache_nodes.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            sidecars,
            node_size,
            max_blocks,
            alloc: Mutex::new(BlockAllocator::new(INITIAL_BLOCKS.min(max_blocks))),
            alloc_dirty: Mutex::new(false),
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            cache: Mutex::new(LruCache::new(cap)),
            epoch: AtomicU64::new(0),
            flush_lock: Mutex::new(()),
            stats: CacheStats::default(),
            _codec: PhantomData,
        }
    }

    pub fn node_size(&self) -> usize {
        self.node_size
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn address(&self, block: u64) -> u64 {
        (block + 1) * self.node_size as u64
    }

    pub fn root_address(&self) -> u64 {
        self.address(ROOT_BLOCK)
    }

    fn block_of(&self, addr: u64) -> u64 {
        addr / self.node_size as u64 - 1
    }

    fn write_header(&self) -> FsResult<()> {
        let mut page = Vec::with_capacity(self.node_size);
        page.extend_from_slice(&INDEX_MAGIC);
        page.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        page.extend_from_slice(&(self.node_size as u32).to_le_bytes());
        page.extend_from_slice(&self.address(ROOT_BLOCK).to_le_bytes());
        let crc = compute_crc32(&page);
        page.extend_from_slice(&crc.to_le_bytes());
        page.resize(self.node_size, 0);
        self.store.write_at(0, &page)?;
        self.store.sync()?;
        Ok(())
    }

    fn check_header(&self) -> FsResult<()> {
        let page = self.store.read_at(0, 22)?;
        let mut r = ByteReader::new(&page, "index header");
        let magic: [u8; 4] = r.array()?;
        if magic != INDEX_MAGIC {
            return Err(StorageFault::invalid_format("invalid index file magic"));
        }
        let version = r.u16()?;
        if version != INDEX_VERSION {
            return Err(StorageFault::invalid_format(format!(
                "unsupported index version: {version}"
            )));
        }
        let node_size = r.u32()? as usize;
        let root = r.u64()?;
        let expected = r.u32()?;
        let actual = compute_crc32(&page[..18]);
        if expected != actual {
            return Err(StorageFault::ChecksumMismatch { expected, actual });
        }
        if node_size != self.node_size {
            return Err(StorageFault::invalid_format(format!(
                "index written with {node_size} byte nodes, configured for {}",
                self.node_size
            )));
        }
        if root != self.root_address() {
            return Err(StorageFault::invalid_format(format!(
                "unexpected root address {root}"
            )));
        }
        Ok(())
    }

    fn load_bitmap(&self) -> FsResult<()> {
        let Some(sidecars) = &self.sidecars else {
            return Ok(());
        };
        let restored = match fs::read(&sidecars.bitmap) {
            Ok(bytes) => BlockAllocator::from_bytes(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // nodes are never freed, so every page present is allocated
                let pages = self.store.size()? / self.node_size as u64;
                let blocks = pages.saturating_sub(1);
                warn!(path = %sidecars.bitmap.display(), blocks, "allocator bitmap missing, rebuilding");
                let mut a = BlockAllocator::new(blocks.max(INITIAL_BLOCKS).min(self.max_blocks));
                for b in 0..blocks {
                    a.mark(b)?;
                }
                *self.alloc_dirty.lock() = true;
                a
            }
            Err(e) => return Err(e.into()),
        };
        *self.alloc.lock() = restored;
        Ok(())
    }

    fn replay_journal(&self) -> FsResult<()> {
        let Some(sidecars) = &self.sidecars else {
            return Ok(());
        };
        let bytes = match fs::read(&sidecars.journal) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match self.decode_journal(&bytes) {
            Ok((bitmap, pages)) => {
                debug!(pages = pages.len(), "replaying node journal");
                for (addr, page) in &pages {
                    self.store.write_at(*addr, page)?;
                }
                self.store.sync()?;
                write_atomic(&sidecars.bitmap, bitmap)?;
            }
            Err(e) => {
                // the journal is synced before any page is touched, so a
                // torn journal means the index file is still intact
                warn!(error = %e, "discarding torn node journal");
            }
        }
        fs::remove_file(&sidecars.journal)?;
        Ok(())
    }

    fn encode_journal(&self, bitmap: &[u8], pages: &[(u64, Vec<u8>)]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + bitmap.len() + pages.len() * (8 + self.node_size));
        buf.extend_from_slice(&JOURNAL_MAGIC);
        buf.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        buf.extend_from_slice(&(pages.len() as u32).to_le_bytes());
        crate::codec::put_blob(&mut buf, bitmap);
        for (addr, page) in pages {
            buf.extend_from_slice(&addr.to_le_bytes());
            buf.extend_from_slice(page);
        }
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode_journal<'a>(&self, bytes: &'a [u8]) -> FsResult<(&'a [u8], Vec<(u64, &'a [u8])>)> {
        if bytes.len() < 4 {
            return Err(StorageFault::corrupted("node journal too short"));
        }
        let (body, crc) = bytes.split_at(bytes.len() - 4);
        let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        let actual = compute_crc32(body);
        if expected != actual {
            return Err(StorageFault::ChecksumMismatch { expected, actual });
        }
        let mut r = ByteReader::new(body, "node journal");
        if r.array::<4>()? != JOURNAL_MAGIC {
            return Err(StorageFault::invalid_format("invalid node journal magic"));
        }
        let _version = r.u16()?;
        let count = r.u32()? as usize;
        let bitmap = r.blob()?;
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            let addr = r.u64()?;
            pages.push((addr, r.bytes(self.node_size)?));
        }
        r.finish()?;
        Ok((bitmap, pages))
    }

    /// Allocates a block for a new node and returns its address.
    pub fn allocate(&self) -> FsResult<u64> {
        let mut alloc = self.alloc.lock();
        if alloc.used() >= alloc.capacity() && alloc.capacity() < self.max_blocks {
            let grown = alloc.capacity().saturating_mul(2).min(self.max_blocks);
            alloc.grow(grown);
        }
        let block = alloc.allocate()?;
        *self.alloc_dirty.lock() = true;
        Ok(self.address(block))
    }

    /// Claims the root block of a fresh index.
    pub fn claim_root(&self) -> FsResult<()> {
        self.alloc.lock().mark(ROOT_BLOCK)?;
        *self.alloc_dirty.lock() = true;
        Ok(())
    }

    /// Latest version of the node at `addr`.
    pub fn read(&self, addr: u64) -> FsResult<SharedNode<C>> {
        let epoch = self.epoch.load(Ordering::Acquire);
        if let Some((_, node)) = self.pending.lock().get(&addr) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(node));
        }
        if let Some(node) = self.cache.lock().get(&addr) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(node));
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        if addr < self.node_size as u64 || addr % self.node_size as u64 != 0 {
            return Err(StorageFault::corrupted(format!("bad node address {addr}")));
        }
        let page = self.store.read_at(addr, self.node_size)?;
        let node = Arc::new(decode_node::<C>(&page)?);
        let mut cache = self.cache.lock();
        // a flush that finished meanwhile may have made this page stale
        if self.epoch.load(Ordering::Acquire) == epoch {
            cache.put(addr, Arc::clone(&node));
        }
        Ok(node)
    }

    /// Publishes a new version of the node at `addr`.
    pub fn write(&self, addr: u64, node: Node<C::Key, C::Value>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(addr, (seq, Arc::new(node)));
    }

    /// Number of nodes waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Makes every published node durable.
    pub fn flush(&self) -> FsResult<()> {
        let _guard = self.flush_lock.lock();
        let batch: Vec<(u64, u64, SharedNode<C>)> = self
            .pending
            .lock()
            .iter()
            .map(|(addr, (seq, node))| (*addr, *seq, Arc::clone(node)))
            .collect();
        let alloc_dirty = std::mem::replace(&mut *self.alloc_dirty.lock(), false);
        if batch.is_empty() && !alloc_dirty {
            return Ok(());
        }

        let mut pages = Vec::with_capacity(batch.len());
        for (addr, _, node) in &batch {
            pages.push((*addr, encode_node::<C>(node, self.node_size)?));
        }
        pages.sort_by_key(|(addr, _)| *addr);
        let bitmap = self.alloc.lock().to_bytes();

        let result = self.write_batch(&bitmap, &pages);
        if let Err(e) = result {
            *self.alloc_dirty.lock() = true;
            return Err(e);
        }

        self.epoch.fetch_add(1, Ordering::AcqRel);
        let mut pending = self.pending.lock();
        let mut cache = self.cache.lock();
        for (addr, seq, node) in batch {
            if pending.get(&addr).is_some_and(|(s, _)| *s == seq) {
                pending.remove(&addr);
                cache.put(addr, node);
            }
        }
        drop(cache);
        drop(pending);

        if let Some(sidecars) = &self.sidecars {
            fs::remove_file(&sidecars.journal)?;
        }
        debug!(pages = pages.len(), "flushed index nodes");
        Ok(())
    }

    fn write_batch(&self, bitmap: &[u8], pages: &[(u64, Vec<u8>)]) -> FsResult<()> {
        if let Some(sidecars) = &self.sidecars {
            let journal = self.encode_journal(bitmap, pages);
            let mut file = fs::File::create(&sidecars.journal)?;
            file.write_all(&journal)?;
            file.sync_all()?;
        }
        for (addr, page) in pages {
            self.store.write_at(*addr, page)?;
        }
        self.store.sync()?;
        if let Some(sidecars) = &self.sidecars {
            write_atomic(&sidecars.bitmap, bitmap)?;
        }
        Ok(())
    }

    /// Drops every cached node. Pending nodes are kept.
    pub fn invalidate_cache(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.cache.lock().clear();
    }

    /// Number of allocated node blocks.
    pub fn allocated_blocks(&self) -> u64 {
        self.alloc.lock().used()
    }

    /// Returns true if `addr` names an allocated node.
    pub fn is_allocated(&self, addr: u64) -> bool {
        addr >= self.node_size as u64 && self.alloc.lock().is_allocated(self.block_of(addr))
    }
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
