//! B-link tree nodes and their page encoding.
//!
//! ## Page format
//!
//! ```text
//! kind:u8 | level:u32 | count:u16 | has_high:u8 | high_key | right:u64
//! | entries... | zero padding | crc32:u32
//! ```
//!
//! Leaf entries are `key value`; internal nodes store `count` separator
//! keys followed by `count + 1` child addresses. `right` is `u64::MAX` for
//! the rightmost node of a level. The checksum covers everything before it.

use crate::codec::{compute_crc32, ByteReader};
use crate::error::{FsResult, StorageFault};
use crate::fsid::{FsId, MAX_FSID_LEN};
use std::fmt::Debug;

const KIND_LEAF: u8 = 0;
const KIND_INTERNAL: u8 = 1;
const NO_RIGHT: u64 = u64::MAX;
const FIXED_HEADER: usize = 1 + 4 + 2 + 1 + 8;
const CRC_LEN: usize = 4;

/// Serialized form of keys and values for one tree.
///
/// Widths are upper bounds; they fix the fan-out for a given node size.
pub trait NodeCodec: Send + Sync + 'static {
    /// Key type. Tree order is `Ord` order.
    type Key: Ord + Clone + Debug + Send + Sync;
    /// Value type.
    type Value: Clone + Debug + PartialEq + Send + Sync;

    /// Largest encoded key, in bytes.
    const MAX_KEY_WIDTH: usize;
    /// Encoded value size, in bytes.
    const VALUE_WIDTH: usize;

    /// Appends the encoded key.
    fn encode_key(key: &Self::Key, buf: &mut Vec<u8>);
    /// Reads a key.
    fn decode_key(r: &mut ByteReader<'_>) -> FsResult<Self::Key>;
    /// Appends the encoded value.
    fn encode_value(value: &Self::Value, buf: &mut Vec<u8>);
    /// Reads a value.
    fn decode_value(r: &mut ByteReader<'_>) -> FsResult<Self::Value>;
}

/// Identifier to file id, the index of the file store.
#[derive(Debug, Clone, Copy)]
pub struct FsIdCodec;

impl NodeCodec for FsIdCodec {
    type Key = FsId;
    type Value = u64;

    const MAX_KEY_WIDTH: usize = 2 + MAX_FSID_LEN;
    const VALUE_WIDTH: usize = 8;

    fn encode_key(key: &FsId, buf: &mut Vec<u8>) {
        let bytes = key.as_str().as_bytes();
        buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(bytes);
    }

    fn decode_key(r: &mut ByteReader<'_>) -> FsResult<FsId> {
        let len = r.u16()? as usize;
        let text = std::str::from_utf8(r.bytes(len)?)
            .map_err(|_| StorageFault::corrupted("index key is not utf-8"))?;
        FsId::new(text)
    }

    fn encode_value(value: &u64, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&value.to_le_bytes());
    }

    fn decode_value(r: &mut ByteReader<'_>) -> FsResult<u64> {
        r.u64()
    }
}

/// Fixed width integer keys and values.
#[derive(Debug, Clone, Copy)]
pub struct U64Codec;

impl NodeCodec for U64Codec {
    type Key = u64;
    type Value = u64;

    const MAX_KEY_WIDTH: usize = 8;
    const VALUE_WIDTH: usize = 8;

    fn encode_key(key: &u64, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&key.to_le_bytes());
    }

    fn decode_key(r: &mut ByteReader<'_>) -> FsResult<u64> {
        r.u64()
    }

    fn encode_value(value: &u64, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&value.to_le_bytes());
    }

    fn decode_value(r: &mut ByteReader<'_>) -> FsResult<u64> {
        r.u64()
    }
}

/// Entries of a node.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeBody<K, V> {
    Leaf { keys: Vec<K>, values: Vec<V> },
    Internal { keys: Vec<K>, children: Vec<u64> },
}

/// One tree node. Immutable once published; writers clone and replace.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Node<K, V> {
    /// 0 for leaves.
    pub level: u32,
    /// Every key in this node is below the high key. `None` is +infinity.
    pub high_key: Option<K>,
    pub right: Option<u64>,
    pub body: NodeBody<K, V>,
}

/// Result of splitting a node: the separator and the new right half.
pub(crate) struct Split<K, V> {
    pub separator: K,
    pub right: Node<K, V>,
}

impl<K: Ord + Clone, V: Clone> Node<K, V> {
    pub fn empty_leaf() -> Self {
        Self {
            level: 0,
            high_key: None,
            right: None,
            body: NodeBody::Leaf {
                keys: Vec::new(),
                values: Vec::new(),
            },
        }
    }

    pub fn new_root(level: u32, separator: K, left: u64, right: u64) -> Self {
        Self {
            level,
            high_key: None,
            right: None,
            body: NodeBody::Internal {
                keys: vec![separator],
                children: vec![left, right],
            },
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.body, NodeBody::Leaf { .. })
    }

    pub fn len(&self) -> usize {
        match &self.body {
            NodeBody::Leaf { keys, .. } | NodeBody::Internal { keys, .. } => keys.len(),
        }
    }

    /// True if `key` belongs to a node further right on this level.
    pub fn must_move_right(&self, key: &K) -> bool {
        self.high_key.as_ref().is_some_and(|high| key >= high)
    }

    /// Child covering `key`. Internal nodes only.
    pub fn child_for(&self, key: &K) -> Option<u64> {
        match &self.body {
            NodeBody::Internal { keys, children } => {
                let idx = keys.partition_point(|k| k <= key);
                children.get(idx).copied()
            }
            NodeBody::Leaf { .. } => None,
        }
    }

    pub fn first_child(&self) -> Option<u64> {
        match &self.body {
            NodeBody::Internal { children, .. } => children.first().copied(),
            NodeBody::Leaf { .. } => None,
        }
    }

    pub fn leaf_get(&self, key: &K) -> Option<&V> {
        match &self.body {
            NodeBody::Leaf { keys, values } => {
                keys.binary_search(key).ok().and_then(|i| values.get(i))
            }
            NodeBody::Internal { .. } => None,
        }
    }

    /// Inserts or replaces; returns the previous value.
    pub fn leaf_put(&mut self, key: K, value: V) -> Option<V> {
        match &mut self.body {
            NodeBody::Leaf { keys, values } => match keys.binary_search(&key) {
                Ok(i) => Some(std::mem::replace(&mut values[i], value)),
                Err(i) => {
                    keys.insert(i, key);
                    values.insert(i, value);
                    None
                }
            },
            NodeBody::Internal { .. } => None,
        }
    }

    pub fn leaf_remove(&mut self, key: &K) -> Option<V> {
        match &mut self.body {
            NodeBody::Leaf { keys, values } => {
                let i = keys.binary_search(key).ok()?;
                keys.remove(i);
                Some(values.remove(i))
            }
            NodeBody::Internal { .. } => None,
        }
    }

    /// Adds the link produced by splitting the child left of `right_child`.
    pub fn internal_insert(&mut self, separator: K, right_child: u64) {
        if let NodeBody::Internal { keys, children } = &mut self.body {
            let idx = keys.partition_point(|k| k <= &separator);
            keys.insert(idx, separator);
            children.insert(idx + 1, right_child);
        }
    }

    /// Moves the upper half into a new node. The caller links the halves.
    pub fn split(&mut self) -> Option<Split<K, V>> {
        let (separator, body) = match &mut self.body {
            NodeBody::Leaf { keys, values } => {
                if keys.len() < 2 {
                    return None;
                }
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid);
                let right_values = values.split_off(mid);
                (
                    right_keys[0].clone(),
                    NodeBody::Leaf {
                        keys: right_keys,
                        values: right_values,
                    },
                )
            }
            NodeBody::Internal { keys, children } => {
                if keys.len() < 3 {
                    return None;
                }
                let mid = keys.len() / 2;
                let mut right_keys = keys.split_off(mid);
                let separator = right_keys.remove(0);
                let right_children = children.split_off(mid + 1);
                (
                    separator,
                    NodeBody::Internal {
                        keys: right_keys,
                        children: right_children,
                    },
                )
            }
        };
        let right = Node {
            level: self.level,
            high_key: self.high_key.replace(separator.clone()),
            right: self.right,
            body,
        };
        Some(Split { separator, right })
    }
}

/// Fan-out limits for one node size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Capacity {
    pub leaf: usize,
    pub internal: usize,
}

impl Capacity {
    pub fn for_node_size<C: NodeCodec>(node_size: usize) -> FsResult<Self> {
        let overhead = FIXED_HEADER + C::MAX_KEY_WIDTH + CRC_LEN;
        let body = node_size.saturating_sub(overhead);
        let leaf = body / (C::MAX_KEY_WIDTH + C::VALUE_WIDTH);
        let internal = body.saturating_sub(8) / (C::MAX_KEY_WIDTH + 8);
        if leaf < 3 || internal < 3 {
            return Err(StorageFault::invalid_format(format!(
                "node size {node_size} too small for keys of {} bytes",
                C::MAX_KEY_WIDTH
            )));
        }
        Ok(Self { leaf, internal })
    }

    pub fn overflows<K: Ord + Clone, V: Clone>(&self, node: &Node<K, V>) -> bool {
        let limit = if node.is_leaf() {
            self.leaf
        } else {
            self.internal
        };
        node.len() > limit
    }
}

/// Encodes a node into a page of exactly `node_size` bytes.
pub(crate) fn encode_node<C: NodeCodec>(
    node: &Node<C::Key, C::Value>,
    node_size: usize,
) -> FsResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(node_size);
    let (kind, count) = match &node.body {
        NodeBody::Leaf { keys, .. } => (KIND_LEAF, keys.len()),
        NodeBody::Internal { keys, .. } => (KIND_INTERNAL, keys.len()),
    };
    buf.push(kind);
    buf.extend_from_slice(&node.level.to_le_bytes());
    buf.extend_from_slice(&(count as u16).to_le_bytes());
    match &node.high_key {
        Some(high) => {
            buf.push(1);
            C::encode_key(high, &mut buf);
        }
        None => buf.push(0),
    }
    buf.extend_from_slice(&node.right.unwrap_or(NO_RIGHT).to_le_bytes());
    match &node.body {
        NodeBody::Leaf { keys, values } => {
            for (k, v) in keys.iter().zip(values) {
                C::encode_key(k, &mut buf);
                C::encode_value(v, &mut buf);
            }
        }
        NodeBody::Internal { keys, children } => {
            for k in keys {
                C::encode_key(k, &mut buf);
            }
            for c in children {
                buf.extend_from_slice(&c.to_le_bytes());
            }
        }
    }
    if buf.len() + CRC_LEN > node_size {
        return Err(StorageFault::corrupted(format!(
            "node of {count} entries does not fit a {node_size} byte page"
        )));
    }
    buf.resize(node_size - CRC_LEN, 0);
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Decodes and verifies a page written by [`encode_node`].
pub(crate) fn decode_node<C: NodeCodec>(page: &[u8]) -> FsResult<Node<C::Key, C::Value>> {
    if page.len() < FIXED_HEADER + CRC_LEN {
        return Err(StorageFault::corrupted("node page too short"));
    }
    let (body_bytes, crc_bytes) = page.split_at(page.len() - CRC_LEN);
    let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let actual = compute_crc32(body_bytes);
    if expected != actual {
        return Err(StorageFault::ChecksumMismatch { expected, actual });
    }

    let mut r = ByteReader::new(body_bytes, "node page");
    let kind = r.u8()?;
    let level = r.u32()?;
    let count = r.u16()? as usize;
    let high_key = match r.u8()? {
        0 => None,
        _ => Some(C::decode_key(&mut r)?),
    };
    let right = match r.u64()? {
        NO_RIGHT => None,
        addr => Some(addr),
    };
    let body = match kind {
        KIND_LEAF => {
            let mut keys = Vec::with_capacity(count);
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                keys.push(C::decode_key(&mut r)?);
                values.push(C::decode_value(&mut r)?);
            }
            NodeBody::Leaf { keys, values }
        }
        KIND_INTERNAL => {
            let mut keys = Vec::with_capacity(count);
            for _ in 0..count {
                keys.push(C::decode_key(&mut r)?);
            }
            let mut children = Vec::with_capacity(count + 1);
            for _ in 0..=count {
                children.push(r.u64()?);
            }
            NodeBody::Internal { keys, children }
        }
        other => {
            return Err(StorageFault::corrupted(format!("unknown node kind {other}")));
        }
    };
    if (kind == KIND_LEAF) != (level == 0) {
        return Err(StorageFault::corrupted(format!(
            "node kind {kind} at level {level}"
        )));
    }
    Ok(Node {
        level,
        high_key,
        right,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    type N = Node<u64, u64>;

    fn leaf(keys: &[u64]) -> N {
        let mut n = N::empty_leaf();
        for &k in keys {
            n.leaf_put(k, k * 10);
        }
        n
    }

    #[test]
    fn leaf_put_get_remove() {
        let mut n = leaf(&[5, 1, 3]);
        assert_eq!(n.leaf_get(&3), Some(&30));
        assert_eq!(n.leaf_put(3, 99), Some(30));
        assert_eq!(n.leaf_remove(&1), Some(10));
        assert_eq!(n.leaf_remove(&1), None);
        assert_eq!(n.len(), 2);
    }

    #[test]
    fn leaf_split_links_halves() {
        let mut left = leaf(&[1, 2, 3, 4, 5]);
        left.right = Some(777);
        let split = left.split().unwrap();
        assert_eq!(split.separator, 3);
        assert_eq!(left.len(), 2);
        assert_eq!(left.high_key, Some(3));
        assert_eq!(split.right.len(), 3);
        assert_eq!(split.right.right, Some(777));
        assert_eq!(split.right.high_key, None);
        assert!(left.must_move_right(&3));
        assert!(!left.must_move_right(&2));
    }

    #[test]
    fn internal_split_promotes_middle_key() {
        let mut n = N::new_root(1, 10, 100, 200);
        n.internal_insert(20, 300);
        n.internal_insert(30, 400);
        n.internal_insert(40, 500);
        assert_eq!(n.child_for(&5), Some(100));
        assert_eq!(n.child_for(&10), Some(200));
        assert_eq!(n.child_for(&35), Some(400));
        let split = n.split().unwrap();
        assert_eq!(split.separator, 30);
        assert_eq!(
            n.body,
            NodeBody::Internal {
                keys: vec![10, 20],
                children: vec![100, 200, 300]
            }
        );
        assert_eq!(
            split.right.body,
            NodeBody::Internal {
                keys: vec![40],
                children: vec![400, 500]
            }
        );
    }

    #[test]
    fn page_round_trip_and_checksum() {
        let mut n = leaf(&[1, 2, 3]);
        n.high_key = Some(9);
        n.right = Some(4096);
        let page = encode_node::<U64Codec>(&n, 128).unwrap();
        assert_eq!(page.len(), 128);
        assert_eq!(decode_node::<U64Codec>(&page).unwrap(), n);

        let mut bad = page.clone();
        bad[20] ^= 0xFF;
        assert!(matches!(
            decode_node::<U64Codec>(&bad),
            Err(StorageFault::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn fsid_keys_encode() {
        let mut n: Node<FsId, u64> = Node::empty_leaf();
        n.leaf_put(FsId::new("/a/b").unwrap(), 7);
        n.leaf_put(FsId::new("/a/c").unwrap(), 8);
        let page = encode_node::<FsIdCodec>(&n, 4096).unwrap();
        assert_eq!(decode_node::<FsIdCodec>(&page).unwrap(), n);
    }

    #[test]
    fn capacity_from_node_size() {
        let cap = Capacity::for_node_size::<U64Codec>(128).unwrap();
        assert_eq!(cap, Capacity { leaf: 6, internal: 5 });
        assert!(Capacity::for_node_size::<FsIdCodec>(512).is_err());
        let cap = Capacity::for_node_size::<FsIdCodec>(4096).unwrap();
        assert!(cap.leaf >= 3 && cap.internal >= 3);
        // a full node always fits its page
        let full = leaf(&(0..6).collect::<Vec<_>>());
        assert!(encode_node::<U64Codec>(&full, 128).is_ok());
    }
}
