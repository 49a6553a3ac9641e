//! Backing stores for transferred blobs.
//!
//! The transfer machinery reads outbound blobs and writes inbound ones
//! through the [`BlobStore`] boundary; in-memory and file-backed
//! implementations are provided.

use crate::error::StoreError;
use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

/// Random-access storage for one blob of known total size.
pub trait BlobStore {
    /// Declared total size of the blob.
    fn total_size(&self) -> u64;

    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError>;

    /// Write `data` starting at `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StoreError>;

    /// Called once when reassembly reaches the total size (flush point).
    fn complete(&mut self) -> Result<(), StoreError>;
}

fn check_bounds(offset: u64, len: usize, total: u64) -> Result<(), StoreError> {
    if offset + len as u64 > total {
        return Err(StoreError::OutOfBounds { offset, len, total });
    }
    Ok(())
}

/// Blob held in memory, shared with the application through an `Rc` so the
/// receiving side can observe the reassembled bytes after completion.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    data: Rc<RefCell<Vec<u8>>>,
    total: u64,
}

impl MemoryStore {
    /// Store wrapping an existing blob (sending side).
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        let total = data.len() as u64;
        Self {
            data: Rc::new(RefCell::new(data)),
            total,
        }
    }

    /// Zero-filled store of `total` bytes (receiving side).
    #[must_use]
    pub fn with_capacity(total: u64) -> Self {
        Self {
            data: Rc::new(RefCell::new(vec![0u8; total as usize])),
            total,
        }
    }

    /// Shared handle to the underlying bytes.
    #[must_use]
    pub fn contents(&self) -> Rc<RefCell<Vec<u8>>> {
        Rc::clone(&self.data)
    }
}

impl BlobStore for MemoryStore {
    fn total_size(&self) -> u64 {
        self.total
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        check_bounds(offset, buf.len(), self.total)?;
        let data = self.data.borrow();
        buf.copy_from_slice(&data[offset as usize..offset as usize + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        check_bounds(offset, data.len(), self.total)?;
        self.data.borrow_mut()[offset as usize..offset as usize + data.len()]
            .copy_from_slice(data);
        Ok(())
    }

    fn complete(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Blob backed by a file on disk.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    total: u64,
}

impl FileStore {
    /// Open an existing file for sending.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = File::open(path)?;
        let total = file.metadata()?.len();
        Ok(Self { file, total })
    }

    /// Create (or truncate) the destination file for receiving `total`
    /// bytes.
    pub fn create(path: &Path, total: u64) -> Result<Self, StoreError> {
        let file = File::create(path)?;
        Ok(Self { file, total })
    }
}

impl BlobStore for FileStore {
    fn total_size(&self) -> u64 {
        self.total
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        check_bounds(offset, buf.len(), self.total)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        check_bounds(offset, data.len(), self.total)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn complete(&mut self) -> Result<(), StoreError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_read_write() {
        let mut store = MemoryStore::with_capacity(16);
        store.write_at(4, b"abcd").unwrap();
        let mut buf = [0u8; 4];
        store.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        assert_eq!(store.total_size(), 16);
    }

    #[test]
    fn memory_rejects_out_of_bounds() {
        let mut store = MemoryStore::with_capacity(8);
        assert!(matches!(
            store.write_at(6, b"abcd"),
            Err(StoreError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn memory_contents_shared() {
        let mut store = MemoryStore::with_capacity(4);
        let handle = store.contents();
        store.write_at(0, b"wxyz").unwrap();
        assert_eq!(&*handle.borrow(), b"wxyz");
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");

        let mut tx = FileStore::create(&path, 12).unwrap();
        tx.write_at(0, b"hello ").unwrap();
        tx.write_at(6, b"world!").unwrap();
        tx.complete().unwrap();
        drop(tx);

        let mut rx = FileStore::open(&path).unwrap();
        assert_eq!(rx.total_size(), 12);
        let mut buf = [0u8; 12];
        rx.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello world!");
    }
}
