//! Concurrent B-link tree.
//!
//! Readers take no locks: they descend immutable node snapshots and follow
//! right links whenever the search key is at or above a node's high key,
//! which is how a reader recovers after landing on a node that a concurrent
//! split has already halved. Writers latch one node at a time while
//! modifying it, plus the parent while installing a separator after a
//! split. Latches are taken bottom-up and left-to-right, so writers never
//! wait on each other in a cycle.
//!
//! The root lives at a fixed address. A root split moves both halves to new
//! nodes and rewrites the root in place as their parent one level higher.

use super::node::{Capacity, Node, NodeCodec};
use super::node_io::{CacheStats, NodeIo};
use crate::error::{FsResult, StorageFault};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Disk-backed B-link tree.
pub struct BLinkTree<C: NodeCodec> {
    io: NodeIo<C>,
    capacity: Capacity,
    latches: Latches,
}

type KeyOf<C> = <C as NodeCodec>::Key;
type ValueOf<C> = <C as NodeCodec>::Value;
type SharedNode<C> = Arc<Node<KeyOf<C>, ValueOf<C>>>;

impl<C: NodeCodec> BLinkTree<C> {
    /// Opens or creates the tree stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the file was written with another node
    /// size or is not an index file, and I/O errors otherwise.
    pub fn open(path: &Path, node_size: usize, cache_nodes: usize, max_nodes: u64) -> FsResult<Self> {
        let capacity = Capacity::for_node_size::<C>(node_size)?;
        let (io, _fresh) = NodeIo::open(path, node_size, cache_nodes, max_nodes)?;
        let tree = Self {
            io,
            capacity,
            latches: Latches::default(),
        };
        tree.ensure_root()?;
        Ok(tree)
    }

    /// Creates a tree held in memory.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if `node_size` cannot hold three entries.
    pub fn in_memory(node_size: usize, cache_nodes: usize) -> FsResult<Self> {
        let capacity = Capacity::for_node_size::<C>(node_size)?;
        let tree = Self {
            io: NodeIo::in_memory(node_size, cache_nodes)?,
            capacity,
            latches: Latches::default(),
        };
        tree.ensure_root()?;
        Ok(tree)
    }

    fn ensure_root(&self) -> FsResult<()> {
        let root = self.io.root_address();
        if !self.io.is_allocated(root) {
            self.io.claim_root()?;
            self.io.write(root, Node::empty_leaf());
            self.io.flush()?;
        }
        Ok(())
    }

    /// Looks up `key`.
    pub fn find(&self, key: &KeyOf<C>) -> FsResult<Option<ValueOf<C>>> {
        let mut addr = self.io.root_address();
        loop {
            let node = self.io.read(addr)?;
            if node.must_move_right(key) {
                addr = right_of(&node, addr)?;
                continue;
            }
            if node.is_leaf() {
                return Ok(node.leaf_get(key).cloned());
            }
            addr = child_of(&node, key, addr)?;
        }
    }

    /// Inserts or overwrites `key`, returning the previous value.
    pub fn insert(&self, key: KeyOf<C>, value: ValueOf<C>) -> FsResult<Option<ValueOf<C>>> {
        self.put(key, value, true)
    }

    /// Inserts `key` only if absent. Returns the existing value otherwise.
    pub fn insert_if_absent(
        &self,
        key: KeyOf<C>,
        value: ValueOf<C>,
    ) -> FsResult<Option<ValueOf<C>>> {
        self.put(key, value, false)
    }

    /// Removes `key` from its leaf. Leaves are never merged or freed.
    pub fn delete(&self, key: &KeyOf<C>) -> FsResult<Option<ValueOf<C>>> {
        let (_stack, addr) = self.descend(key)?;
        let (_guard, addr, node) = self.latch_leaf(key, addr)?.ok_or_else(restart_limit)?;
        let mut leaf = (*node).clone();
        let removed = leaf.leaf_remove(key);
        if removed.is_some() {
            self.io.write(addr, leaf);
        }
        Ok(removed)
    }

    /// Number of keys. Walks every leaf.
    pub fn len(&self) -> FsResult<u64> {
        let mut n = 0;
        for entry in self.iter() {
            entry?;
            n += 1;
        }
        Ok(n)
    }

    /// Returns true if the tree holds no keys.
    pub fn is_empty(&self) -> FsResult<bool> {
        Ok(self.iter().next().transpose()?.is_none())
    }

    /// Iterates every entry in key order.
    pub fn iter(&self) -> TreeIter<'_, C> {
        TreeIter {
            tree: self,
            state: IterState::Start(None),
        }
    }

    /// Iterates entries with keys at or above `from`, in key order.
    pub fn iter_from(&self, from: KeyOf<C>) -> TreeIter<'_, C> {
        TreeIter {
            tree: self,
            state: IterState::Start(Some(from)),
        }
    }

    /// Writes every modified node to disk.
    pub fn flush(&self) -> FsResult<()> {
        self.io.flush()
    }

    /// Drops cached nodes; they are re-read from disk on demand.
    pub fn invalidate_cache(&self) {
        debug!("invalidating index node cache");
        self.io.invalidate_cache();
    }

    /// Node cache counters.
    pub fn cache_stats(&self) -> &CacheStats {
        self.io.stats()
    }

    /// Number of nodes allocated in the file.
    pub fn node_count(&self) -> u64 {
        self.io.allocated_blocks()
    }

    /// Page size of the tree.
    pub fn node_size(&self) -> usize {
        self.io.node_size()
    }

    /// Number of levels, counting the leaf level.
    pub fn height(&self) -> FsResult<u32> {
        Ok(self.io.read(self.io.root_address())?.level + 1)
    }

    /// Lock-free descent to the leaf level, recording internal nodes passed.
    fn descend(&self, key: &KeyOf<C>) -> FsResult<(Vec<u64>, u64)> {
        let mut stack = Vec::new();
        let mut addr = self.io.root_address();
        loop {
            let node = self.io.read(addr)?;
            if node.must_move_right(key) {
                addr = right_of(&node, addr)?;
                continue;
            }
            if node.is_leaf() {
                return Ok((stack, addr));
            }
            stack.push(addr);
            addr = child_of(&node, key, addr)?;
        }
    }

    /// Unlatched descent to the node of `level` covering `key`.
    fn find_level(&self, key: &KeyOf<C>, level: u32) -> FsResult<u64> {
        let mut addr = self.io.root_address();
        loop {
            let node = self.io.read(addr)?;
            if node.level < level {
                return Err(StorageFault::corrupted(format!(
                    "no level {level} above node {addr}"
                )));
            }
            if node.must_move_right(key) {
                addr = right_of(&node, addr)?;
                continue;
            }
            if node.level == level {
                return Ok(addr);
            }
            addr = child_of(&node, key, addr)?;
        }
    }

    /// Latches the node of `level` covering `key`, starting at `addr` and
    /// moving right with latch coupling. Returns `None` if the start node
    /// is at the wrong level, which happens when the root split in place
    /// after it was read.
    fn latch_at_level(
        &self,
        key: &KeyOf<C>,
        mut addr: u64,
        level: u32,
    ) -> FsResult<Option<(LatchGuard<'_>, u64, SharedNode<C>)>> {
        let mut guard = self.latches.lock(addr);
        loop {
            let node = self.io.read(addr)?;
            if node.level != level {
                return Ok(None);
            }
            if !node.must_move_right(key) {
                return Ok(Some((guard, addr, node)));
            }
            let next = right_of(&node, addr)?;
            let next_guard = self.latches.lock(next);
            drop(guard);
            guard = next_guard;
            addr = next;
        }
    }

    fn latch_leaf(
        &self,
        key: &KeyOf<C>,
        start: u64,
    ) -> FsResult<Option<(LatchGuard<'_>, u64, SharedNode<C>)>> {
        if let Some(found) = self.latch_at_level(key, start, 0)? {
            return Ok(Some(found));
        }
        for _ in 0..MAX_RESTARTS {
            let (_stack, addr) = self.descend(key)?;
            if let Some(found) = self.latch_at_level(key, addr, 0)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn put(
        &self,
        key: KeyOf<C>,
        value: ValueOf<C>,
        overwrite: bool,
    ) -> FsResult<Option<ValueOf<C>>> {
        let (mut stack, start) = self.descend(&key)?;
        let (guard, addr, node) = self.latch_leaf(&key, start)?.ok_or_else(restart_limit)?;

        let mut leaf = (*node).clone();
        if !overwrite {
            if let Some(existing) = leaf.leaf_get(&key) {
                return Ok(Some(existing.clone()));
            }
        }
        let previous = leaf.leaf_put(key, value);
        if !self.capacity.overflows(&leaf) {
            self.io.write(addr, leaf);
            return Ok(previous);
        }

        let Some((mut separator, mut right_addr)) = self.split_node(addr, leaf)? else {
            return Ok(previous);
        };

        // install separators bottom-up until a parent absorbs one
        let mut child_guard = guard;
        let mut level = 1;
        loop {
            let start = match stack.pop() {
                Some(a) => a,
                None => self.find_level(&separator, level)?,
            };
            let located = match self.latch_at_level(&separator, start, level)? {
                Some(found) => Some(found),
                None => {
                    let again = self.find_level(&separator, level)?;
                    self.latch_at_level(&separator, again, level)?
                }
            };
            let (parent_guard, parent_addr, parent) = located.ok_or_else(restart_limit)?;
            drop(child_guard);

            let mut updated = (*parent).clone();
            updated.internal_insert(separator, right_addr);
            if !self.capacity.overflows(&updated) {
                self.io.write(parent_addr, updated);
                return Ok(previous);
            }
            match self.split_node(parent_addr, updated)? {
                Some((sep, new_right)) => {
                    separator = sep;
                    right_addr = new_right;
                    child_guard = parent_guard;
                    level += 1;
                }
                None => return Ok(previous),
            }
        }
    }

    /// Splits an overflowing node that the caller holds latched.
    ///
    /// Returns the separator and new sibling to install in the parent, or
    /// `None` when the node was the root and has been split in place.
    fn split_node(
        &self,
        addr: u64,
        mut node: Node<KeyOf<C>, ValueOf<C>>,
    ) -> FsResult<Option<(KeyOf<C>, u64)>> {
        let Some(split) = node.split() else {
            return Err(StorageFault::corrupted(format!(
                "node {addr} overflowed with {} entries",
                node.len()
            )));
        };
        if addr == self.io.root_address() {
            let left_addr = self.io.allocate()?;
            let right_addr = self.io.allocate()?;
            node.right = Some(right_addr);
            let level = node.level;
            self.io.write(right_addr, split.right);
            self.io.write(left_addr, node);
            self.io.write(
                addr,
                Node::new_root(level + 1, split.separator, left_addr, right_addr),
            );
            debug!(level = level + 1, "index root split");
            return Ok(None);
        }
        let right_addr = self.io.allocate()?;
        node.right = Some(right_addr);
        // the new sibling must exist before anything links to it
        self.io.write(right_addr, split.right);
        self.io.write(addr, node);
        Ok(Some((split.separator, right_addr)))
    }

    fn leftmost_leaf(&self) -> FsResult<u64> {
        let mut addr = self.io.root_address();
        loop {
            let node = self.io.read(addr)?;
            match node.first_child() {
                Some(child) => addr = child,
                None => return Ok(addr),
            }
        }
    }
}

const MAX_RESTARTS: usize = 64;

fn restart_limit() -> StorageFault {
    StorageFault::corrupted("index descent kept landing on the wrong level")
}

fn right_of<K: Ord + Clone, V: Clone>(node: &Node<K, V>, addr: u64) -> FsResult<u64> {
    node.right
        .ok_or_else(|| StorageFault::corrupted(format!("node {addr} has a high key but no right link")))
}

fn child_of<K: Ord + Clone, V: Clone>(node: &Node<K, V>, key: &K, addr: u64) -> FsResult<u64> {
    node.child_for(key)
        .ok_or_else(|| StorageFault::corrupted(format!("internal node {addr} has no children")))
}

enum IterState<K, V> {
    Start(Option<K>),
    Leaf {
        node: Arc<Node<K, V>>,
        pos: usize,
        last: Option<K>,
    },
    Done,
}

/// Ordered iterator over tree entries.
///
/// Walks leaves along their right links. Entries inserted concurrently may
/// or may not be observed; no key is yielded twice.
pub struct TreeIter<'a, C: NodeCodec> {
    tree: &'a BLinkTree<C>,
    state: IterState<KeyOf<C>, ValueOf<C>>,
}

impl<C: NodeCodec> TreeIter<'_, C> {
    fn start(&mut self, from: Option<KeyOf<C>>) -> FsResult<()> {
        let io = &self.tree.io;
        let addr = match &from {
            Some(key) => self.tree.descend(key)?.1,
            None => self.tree.leftmost_leaf()?,
        };
        let node = io.read(addr)?;
        let pos = match (&from, &node.body) {
            (Some(key), super::node::NodeBody::Leaf { keys, .. }) => {
                keys.partition_point(|k| k < key)
            }
            _ => 0,
        };
        self.state = IterState::Leaf {
            node,
            pos,
            last: None,
        };
        Ok(())
    }

    fn advance(&mut self) -> FsResult<Option<(KeyOf<C>, ValueOf<C>)>> {
        loop {
            match std::mem::replace(&mut self.state, IterState::Done) {
                IterState::Done => return Ok(None),
                IterState::Start(from) => self.start(from)?,
                IterState::Leaf { node, pos, last } => {
                    if let super::node::NodeBody::Leaf { keys, values } = &node.body {
                        let mut i = pos;
                        while i < keys.len() {
                            let key = &keys[i];
                            if last.as_ref().is_some_and(|l| key <= l) {
                                i += 1;
                                continue;
                            }
                            let item = (key.clone(), values[i].clone());
                            self.state = IterState::Leaf {
                                node: Arc::clone(&node),
                                pos: i + 1,
                                last: Some(item.0.clone()),
                            };
                            return Ok(Some(item));
                        }
                    }
                    match node.right {
                        Some(next) => {
                            let next_node = self.tree.io.read(next)?;
                            self.state = IterState::Leaf {
                                node: next_node,
                                pos: 0,
                                last,
                            };
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }
}

impl<C: NodeCodec> Iterator for TreeIter<'_, C> {
    type Item = FsResult<(KeyOf<C>, ValueOf<C>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => {
                self.state = IterState::Done;
                Some(Err(e))
            }
        }
    }
}

/// Per-node write latches.
#[derive(Default)]
struct Latches {
    held: Mutex<HashSet<u64>>,
    released: Condvar,
}

impl Latches {
    fn lock(&self, addr: u64) -> LatchGuard<'_> {
        let mut held = self.held.lock();
        while held.contains(&addr) {
            self.released.wait(&mut held);
        }
        held.insert(addr);
        LatchGuard {
            latches: self,
            addr,
        }
    }
}

struct LatchGuard<'a> {
    latches: &'a Latches,
    addr: u64,
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.latches.held.lock().remove(&self.addr);
        self.latches.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::super::node::{FsIdCodec, U64Codec};
    use super::*;
    use crate::fsid::FsId;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn small_tree() -> BLinkTree<U64Codec> {
        BLinkTree::in_memory(128, 16).unwrap()
    }

    #[test]
    fn insert_find_delete() {
        let tree = small_tree();
        assert_eq!(tree.find(&1).unwrap(), None);
        assert_eq!(tree.insert(1, 10).unwrap(), None);
        assert_eq!(tree.insert(1, 11).unwrap(), Some(10));
        assert_eq!(tree.find(&1).unwrap(), Some(11));
        assert_eq!(tree.insert_if_absent(1, 99).unwrap(), Some(11));
        assert_eq!(tree.find(&1).unwrap(), Some(11));
        assert_eq!(tree.delete(&1).unwrap(), Some(11));
        assert_eq!(tree.delete(&1).unwrap(), None);
        assert!(tree.is_empty().unwrap());
    }

    #[test]
    fn splits_keep_every_key_reachable() {
        let tree = small_tree();
        for k in (0..2000u64).rev() {
            tree.insert(k, k * 2).unwrap();
        }
        assert!(tree.height().unwrap() >= 3);
        for k in 0..2000u64 {
            assert_eq!(tree.find(&k).unwrap(), Some(k * 2), "key {k}");
        }
        let keys: Vec<u64> = tree.iter().map(|e| e.unwrap().0).collect();
        assert_eq!(keys, (0..2000).collect::<Vec<_>>());
    }

    #[test]
    fn deleting_everything_leaves_empty_leaves() {
        let tree = small_tree();
        for k in 0..100u64 {
            tree.insert(k, k).unwrap();
        }
        let nodes = tree.node_count();
        for k in 0..100u64 {
            assert_eq!(tree.delete(&k).unwrap(), Some(k));
        }
        assert_eq!(tree.len().unwrap(), 0);
        assert_eq!(tree.node_count(), nodes);
        tree.insert(50, 1).unwrap();
        assert_eq!(tree.find(&50).unwrap(), Some(1));
    }

    #[test]
    fn iter_from_starts_at_key() {
        let tree = small_tree();
        for k in (0..300u64).step_by(3) {
            tree.insert(k, k).unwrap();
        }
        let keys: Vec<u64> = tree.iter_from(100).take(3).map(|e| e.unwrap().0).collect();
        assert_eq!(keys, [102, 105, 108]);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.idx");
        {
            let tree: BLinkTree<FsIdCodec> = BLinkTree::open(&path, 4096, 64, 1 << 16).unwrap();
            for i in 0..500u64 {
                tree.insert(FsId::new(&format!("/pa/flux/{i:04}")).unwrap(), i)
                    .unwrap();
            }
            tree.flush().unwrap();
            // unflushed changes are lost on reopen
            tree.insert(FsId::new("/lost").unwrap(), 1).unwrap();
        }
        let tree: BLinkTree<FsIdCodec> = BLinkTree::open(&path, 4096, 64, 1 << 16).unwrap();
        assert_eq!(tree.len().unwrap(), 500);
        assert_eq!(
            tree.find(&FsId::new("/pa/flux/0250").unwrap()).unwrap(),
            Some(250)
        );
        assert_eq!(tree.find(&FsId::new("/lost").unwrap()).unwrap(), None);
    }

    #[test]
    fn concurrent_inserts_match_reference() {
        let tree = Arc::new(small_tree());
        let threads: Vec<_> = (0..8u64)
            .map(|t| {
                let tree = Arc::clone(&tree);
                std::thread::spawn(move || {
                    for i in 0..400u64 {
                        let k = i * 8 + t;
                        tree.insert(k, k + 1).unwrap();
                        assert_eq!(tree.find(&k).unwrap(), Some(k + 1));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let entries: Vec<(u64, u64)> = tree.iter().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 3200);
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(entries.iter().all(|(k, v)| *v == k + 1));
    }

    #[test]
    fn readers_run_during_splits() {
        let tree = Arc::new(small_tree());
        for k in 0..64u64 {
            tree.insert(k * 1000, k).unwrap();
        }
        let writer = {
            let tree = Arc::clone(&tree);
            std::thread::spawn(move || {
                for k in 0..3000u64 {
                    tree.insert(k * 7 + 1, k).unwrap();
                }
            })
        };
        for _ in 0..50 {
            for k in 0..64u64 {
                assert_eq!(tree.find(&(k * 1000)).unwrap(), Some(k));
            }
        }
        writer.join().unwrap();
    }

    proptest! {
        #[test]
        fn matches_btreemap(ops in proptest::collection::vec((0u64..500, any::<bool>()), 1..400)) {
            let tree = small_tree();
            let mut model = BTreeMap::new();
            for (k, delete) in ops {
                if delete {
                    prop_assert_eq!(tree.delete(&k).unwrap(), model.remove(&k));
                } else {
                    prop_assert_eq!(tree.insert(k, k ^ 0xFF).unwrap(), model.insert(k, k ^ 0xFF));
                }
            }
            let entries: Vec<(u64, u64)> = tree.iter().map(|e| e.unwrap()).collect();
            let expected: Vec<(u64, u64)> = model.into_iter().collect();
            prop_assert_eq!(entries, expected);
        }
    }
}
