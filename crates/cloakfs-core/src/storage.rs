//! Byte-addressable storage consumed by the container engine.
//!
//! The engine needs positioned reads and writes for random access, plus a
//! sequential path so it can also sit on top of forward-only streams. A
//! non-seekable implementation reports `is_seekable() == false` and the
//! container degrades gracefully (approximate size reporting, no seeking).

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};

/// The storage capability the container engine is built against.
///
/// Positioned and sequential I/O may share a cursor; the engine only mixes
/// them in ways that are safe for both (header and padding are written
/// sequentially before any positioned chunk I/O happens).
pub trait Storage {
    /// Read into `buf` starting at `offset`. Returns the number of bytes
    /// read, which is short only at end of data.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf` starting at `offset`, extending the object if needed.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize>;

    /// Sequential read at the current position.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Sequential write at the current position.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn flush(&mut self) -> Result<()>;

    /// Reposition the sequential cursor. Fails with [`Error::NotSupported`]
    /// on non-seekable storage.
    fn seek(&mut self, offset: u64) -> Result<()>;

    /// Total size of the stored object in bytes.
    fn len(&mut self) -> Result<u64>;

    fn is_seekable(&self) -> bool;
}

/// Storage over anything that is `Read + Write + Seek` (files, cursors).
#[derive(Debug)]
pub struct SeekStorage<T> {
    inner: T,
}

impl<T: Read + Write + Seek> SeekStorage<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn read_fully(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.inner.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }
}

impl<T: Read + Write + Seek> Storage for SeekStorage<T> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.read_fully(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_fully(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        let pos = self.inner.stream_position()?;
        let end = self.inner.seek(SeekFrom::End(0))?;
        self.inner.seek(SeekFrom::Start(pos))?;
        Ok(end)
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

/// Forward-only storage over a `Read + Write` pair.
///
/// Positioned I/O is honored only when the requested offset equals the
/// current cursor, which is exactly the append-only discipline the container
/// follows on fresh streams. The total size cannot be discovered from the
/// stream itself and must be supplied up front (0 for a fresh stream).
#[derive(Debug)]
pub struct StreamStorage<T> {
    inner: T,
    pos: u64,
    size: u64,
}

impl<T: Read + Write> StreamStorage<T> {
    pub fn new(inner: T, size: u64) -> Self {
        Self { inner, pos: 0, size }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read + Write> Storage for StreamStorage<T> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset != self.pos {
            return Err(Error::not_supported(
                "positioned read on a non-seekable stream",
            ));
        }
        self.read(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        if offset != self.pos {
            return Err(Error::not_supported(
                "positioned write on a non-seekable stream",
            ));
        }
        self.write(buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.inner.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        self.pos += total as u64;
        Ok(total)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write_all(buf)?;
        self.pos += buf.len() as u64;
        self.size = self.size.max(self.pos);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    fn seek(&mut self, _offset: u64) -> Result<()> {
        Err(Error::not_supported("seek on a non-seekable stream"))
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.size)
    }

    fn is_seekable(&self) -> bool {
        false
    }
}

/// In-memory storage, mostly for tests and embedders that already hold the
/// whole object in a buffer.
#[derive(Debug, Default, Clone)]
pub struct MemStorage {
    data: Vec<u8>,
    pos: usize,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl Storage for MemStorage {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let start = (offset as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos = start + n;
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        self.pos = end;
        Ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_at(self.pos as u64, buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.write_at(self.pos as u64, buf)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.pos = offset as usize;
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn mem_storage_positioned_io() {
        let mut s = MemStorage::new();
        s.write_at(0, b"hello world").unwrap();
        s.write_at(6, b"cloak").unwrap();

        let mut buf = [0u8; 11];
        let n = s.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello cloak");
    }

    #[test]
    fn mem_storage_write_past_end_zero_fills() {
        let mut s = MemStorage::new();
        s.write_at(4, b"xy").unwrap();
        assert_eq!(s.as_slice(), &[0, 0, 0, 0, b'x', b'y']);
    }

    #[test]
    fn seek_storage_over_cursor() {
        let mut s = SeekStorage::new(Cursor::new(Vec::new()));
        s.write(b"abcdef").unwrap();
        assert_eq!(s.len().unwrap(), 6);

        let mut buf = [0u8; 3];
        s.read_at(2, &mut buf).unwrap();
        assert_eq!(&buf, b"cde");
    }

    #[test]
    fn seek_storage_over_file() {
        let file = tempfile::tempfile().unwrap();
        let mut s = SeekStorage::new(file);
        s.write(b"0123456789").unwrap();
        s.write_at(4, b"XX").unwrap();

        let mut buf = [0u8; 10];
        let n = s.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf, b"0123XX6789");
    }

    #[test]
    fn stream_storage_rejects_seeking() {
        let mut s = StreamStorage::new(Cursor::new(Vec::new()), 0);
        assert!(!s.is_seekable());
        assert!(matches!(s.seek(0), Err(Error::NotSupported(_))));
        // Positioned write at the cursor is fine, elsewhere is not.
        s.write_at(0, b"ab").unwrap();
        assert!(s.write_at(7, b"cd").is_err());
    }
}
