//! # tsfs storage
//!
//! Byte-store backends for the tsfs engine.
//!
//! Backends are **opaque byte stores**: they know nothing about index pages,
//! journals or interval metadata. The engine owns every file format; a
//! backend only reads and writes bytes at offsets.
//!
//! ## Design Principles
//!
//! - Positioned reads and writes (`read_at`, `write_at`) plus `append`
//! - All operations take `&self`; implementations lock internally
//! - Must be `Send + Sync` so one handle can serve many worker threads
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use tsfs_storage::{StorageBackend, InMemoryBackend};
//!
//! let backend = InMemoryBackend::new();
//! backend.write_at(4, b"data").unwrap();
//! assert_eq!(backend.size().unwrap(), 8);
//! assert_eq!(backend.read_at(4, 4).unwrap(), b"data");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
