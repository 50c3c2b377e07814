//! Little-endian byte helpers shared by the index pages and the journals.

use crate::error::{FsResult, StorageFault};

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // IEEE polynomial, table built at compile time
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

/// Cursor over an encoded payload. Every read is bounds checked and a
/// short buffer is reported as corruption of `what`.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> ByteReader<'a> {
    /// Starts reading `buf`; `what` names the structure in error messages.
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Takes the next `len` bytes.
    pub fn bytes(&mut self, len: usize) -> FsResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(StorageFault::corrupted(format!(
                "unexpected end of {} at byte {}",
                self.what, self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Takes the next `N` bytes as an array.
    pub fn array<const N: usize>(&mut self) -> FsResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// Reads a byte.
    pub fn u8(&mut self) -> FsResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    /// Reads a little-endian u16.
    pub fn u16(&mut self) -> FsResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    /// Reads a little-endian u32.
    pub fn u32(&mut self) -> FsResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// Reads a little-endian u64.
    pub fn u64(&mut self) -> FsResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// Reads a little-endian i64.
    pub fn i64(&mut self) -> FsResult<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    /// Length-prefixed (u32) byte string.
    pub fn blob(&mut self) -> FsResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }

    /// Fails if any bytes are left unread.
    pub fn finish(&self) -> FsResult<()> {
        if self.remaining() != 0 {
            return Err(StorageFault::corrupted(format!(
                "trailing bytes in {}: expected {} bytes, got {}",
                self.what,
                self.pos,
                self.buf.len()
            )));
        }
        Ok(())
    }
}

/// Appends a length-prefixed (u32) byte string.
pub fn put_blob(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_value() {
        // "123456789" is the standard check vector
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn reader_walks_fields() {
        let mut buf = Vec::new();
        buf.push(7u8);
        buf.extend_from_slice(&513u16.to_le_bytes());
        buf.extend_from_slice(&(-9i64).to_le_bytes());
        put_blob(&mut buf, b"abc");

        let mut r = ByteReader::new(&buf, "test");
        assert_eq!(r.u8().unwrap(), 7);
        assert_eq!(r.u16().unwrap(), 513);
        assert_eq!(r.i64().unwrap(), -9);
        assert_eq!(r.blob().unwrap(), b"abc");
        r.finish().unwrap();
    }

    #[test]
    fn reader_rejects_short_input() {
        let mut r = ByteReader::new(&[1, 2], "page");
        assert!(r.u32().is_err());
        let r = ByteReader::new(&[1], "page");
        assert!(r.finish().is_err());
    }
}
