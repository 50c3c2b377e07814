//! Disk-backed B-link tree index.
//!
//! - [`node`]: node layout, splitting and the page codec
//! - `node_io`: cached and journaled page I/O
//! - `tree`: the concurrent tree itself

pub mod node;
mod node_io;
mod tree;

pub use node::{FsIdCodec, NodeCodec, U64Codec};
pub use node_io::{CacheStats, DEFAULT_NODE_SIZE, INDEX_MAGIC, INDEX_VERSION};
pub use tree::{BLinkTree, TreeIter};

/// Index from identifiers to data file ids.
pub type FsIdIndex = BLinkTree<FsIdCodec>;
