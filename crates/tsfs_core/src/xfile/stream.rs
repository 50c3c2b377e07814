//! Stream files: one opaque blob per identifier.

use super::{FileContext, FileIo};
use crate::carrier::BlobCarrier;
use crate::error::{try_alloc_buffer, FsResult, StorageFault};
use crate::metadata::StoredMetadata;

impl FileContext {
    /// Reads the whole blob, `None` if it does not exist.
    pub(crate) fn read_blob(&self, io: &FileIo<'_>) -> FsResult<Option<BlobCarrier>> {
        let (origin, len) = match &self.meta {
            None => return Ok(None),
            Some(StoredMetadata::Blob { origin, len }) => (*origin, *len),
            Some(other) => {
                return Err(StorageFault::corrupted(format!(
                    "{} holds {} metadata, expected a blob",
                    self.id,
                    other.kind()
                )))
            }
        };
        let len = usize::try_from(len).map_err(|_| StorageFault::OutOfMemory {
            requested: usize::MAX,
        })?;
        let mut data = try_alloc_buffer(len, 0)?;
        self.read_bytes(io, 0, &mut data)?;
        Ok(Some(BlobCarrier {
            id: self.id.clone(),
            origin,
            data,
            exists: true,
        }))
    }

    /// Replaces the blob content.
    pub(crate) fn write_blob(&mut self, io: &FileIo<'_>, origin: u64, data: &[u8]) -> FsResult<()> {
        if let Some(meta) = &self.meta {
            if !matches!(meta, StoredMetadata::Blob { .. }) {
                return Err(StorageFault::corrupted(format!(
                    "{} holds {} metadata, expected a blob",
                    self.id,
                    meta.kind()
                )));
            }
        }
        self.ensure_file_id(io.store)?;
        self.begin_rewrite();
        self.journal_write(io, 0, data)?;
        self.meta = Some(StoredMetadata::Blob {
            origin,
            len: data.len() as u64,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;
    use crate::fsid::FsId;
    use crate::types::FileKind;

    fn ctx(fx: &Fixture) -> FileContext {
        FileContext::open(&fx.store, FileKind::Blob, FsId::new("/blob").unwrap()).unwrap()
    }

    #[test]
    fn rewrite_replaces_longer_content() {
        let mut fx = Fixture::new();
        let io = fx.io(4096);
        let mut c = ctx(&fx);
        assert!(c.read_blob(&io).unwrap().is_none());
        c.write_blob(&io, 3, b"a much longer first version").unwrap();
        fx.commit(c);

        fx.fresh_slot("b2.journal");
        let io = fx.io(4096);
        let mut c = ctx(&fx);
        assert_eq!(c.read_blob(&io).unwrap().unwrap().origin, 3);
        c.write_blob(&io, 4, b"short").unwrap();
        let in_txn = c.read_blob(&io).unwrap().unwrap();
        assert_eq!(in_txn.data, b"short");
        fx.commit(c);

        let read = ctx(&fx).read_blob(&io).unwrap().unwrap();
        assert_eq!((read.origin, read.data.as_slice()), (4, &b"short"[..]));
    }

    #[test]
    fn empty_blob() {
        let fx = Fixture::new();
        let io = fx.io(4096);
        let mut c = ctx(&fx);
        c.write_blob(&io, 1, b"").unwrap();
        assert!(c.read_blob(&io).unwrap().unwrap().data.is_empty());
        assert!(c.plan().is_some());
    }
}
