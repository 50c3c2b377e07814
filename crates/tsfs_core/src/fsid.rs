//! Hierarchical identifiers.
//!
//! An [`FsId`] looks like `/pa/target/flux/42`: a leading slash followed by
//! one or more non-empty components. Ordering is plain byte order of the
//! full string, which is also the B-link tree key order.

use crate::error::{FsResult, StorageFault};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Longest identifier accepted, in bytes.
pub const MAX_FSID_LEN: usize = 255;

/// Immutable identifier of one stored item.
///
/// Cloning is a reference count bump.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FsId(Arc<str>);

impl FsId {
    /// Parses and validates an identifier.
    ///
    /// # Errors
    ///
    /// Returns `InvalidId` if the string does not start with `/`, contains
    /// an empty component, or is longer than [`MAX_FSID_LEN`].
    pub fn new(value: &str) -> FsResult<Self> {
        validate(value)?;
        Ok(Self(Arc::from(value)))
    }

    /// Returns the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parent path: everything before the last component, or `/`.
    #[must_use]
    pub fn path(&self) -> &str {
        match self.0.rfind('/') {
            Some(0) | None => "/",
            Some(i) => &self.0[..i],
        }
    }

    /// Last path component.
    #[must_use]
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(i) => &self.0[i + 1..],
            None => &self.0,
        }
    }

    /// Iterates over the path components.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split('/')
    }
}

fn validate(value: &str) -> FsResult<()> {
    let reject = |reason: &str| {
        Err(StorageFault::InvalidId {
            value: value.to_string(),
            reason: reason.to_string(),
        })
    };
    if !value.starts_with('/') {
        return reject("must start with '/'");
    }
    if value.len() > MAX_FSID_LEN {
        return reject("too long");
    }
    if value[1..].split('/').any(str::is_empty) {
        return reject("empty path component");
    }
    Ok(())
}

impl fmt::Display for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FsId({})", &self.0)
    }
}

impl AsRef<str> for FsId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for FsId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for FsId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        FsId::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Shares one allocation between equal identifiers.
///
/// Lives in the engine context; identifiers decoded from index pages and
/// client requests are routed through it so that hot ids are stored once.
#[derive(Debug, Default)]
pub struct FsIdInterner {
    ids: Mutex<HashSet<Arc<str>>>,
}

impl FsIdInterner {
    /// Creates an empty interner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `value` and returns the shared identifier for it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidId` for malformed identifiers.
    pub fn intern(&self, value: &str) -> FsResult<FsId> {
        let mut ids = self.ids.lock();
        if let Some(existing) = ids.get(value) {
            return Ok(FsId(Arc::clone(existing)));
        }
        validate(value)?;
        let arc: Arc<str> = Arc::from(value);
        ids.insert(Arc::clone(&arc));
        Ok(FsId(arc))
    }

    /// Number of interned identifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    /// Returns true if nothing is interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }

    /// Drops identifiers no longer referenced outside the interner.
    pub fn purge(&self) -> usize {
        let mut ids = self.ids.lock();
        let before = ids.len();
        ids.retain(|id| Arc::strong_count(id) > 1);
        before - ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_ids() {
        let id = FsId::new("/pa/flux/42").unwrap();
        assert_eq!(id.path(), "/pa/flux");
        assert_eq!(id.name(), "42");
        assert_eq!(id.components().collect::<Vec<_>>(), ["pa", "flux", "42"]);

        let top = FsId::new("/x").unwrap();
        assert_eq!(top.path(), "/");
        assert_eq!(top.name(), "x");
    }

    #[test]
    fn rejects_malformed_ids() {
        for bad in ["", "a/b", "/", "/a//b", "/a/"] {
            assert!(
                matches!(FsId::new(bad), Err(StorageFault::InvalidId { .. })),
                "{bad:?} accepted"
            );
        }
        let long = format!("/{}", "x".repeat(MAX_FSID_LEN));
        assert!(FsId::new(&long).is_err());
    }

    #[test]
    fn ordering_is_byte_order() {
        let mut ids: Vec<FsId> = ["/b", "/a/z", "/a", "/a/b"]
            .iter()
            .map(|s| FsId::new(s).unwrap())
            .collect();
        ids.sort();
        let sorted: Vec<&str> = ids.iter().map(FsId::as_str).collect();
        assert_eq!(sorted, ["/a", "/a/b", "/a/z", "/b"]);
    }

    #[test]
    fn interner_shares_allocation() {
        let interner = FsIdInterner::new();
        let a = interner.intern("/a/b").unwrap();
        let b = interner.intern("/a/b").unwrap();
        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(interner.len(), 1);
        assert!(interner.intern("bad").is_err());
    }

    #[test]
    fn interner_purges_unreferenced() {
        let interner = FsIdInterner::new();
        let kept = interner.intern("/keep").unwrap();
        drop(interner.intern("/drop").unwrap());
        assert_eq!(interner.purge(), 1);
        assert_eq!(interner.len(), 1);
        assert_eq!(kept.as_str(), "/keep");
    }

    #[test]
    fn serde_validates() {
        let id: FsId = serde_json::from_str("\"/a/b\"").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"/a/b\"");
        assert!(serde_json::from_str::<FsId>("\"nope\"").is_err());
    }
}
