//! Circular byte storage underneath the ring queue.
//!
//! Positions handed to [`RingStorage`] always lie in `[0, length)`. Reads and
//! writes that run past the end of the file continue at [`HEADER_LEN`], so the
//! header region at the start of the file is never overwritten by element data.

use std::path::{Path, PathBuf};

use fs_err::{File, OpenOptions};
use memmap2::{MmapMut, MmapOptions};

use crate::constants::HEADER_LEN;
use crate::error::{Result, TapeError};
use crate::lock::FileLock;

/// Flat, resizable byte region that [`RingStorage`] wraps positions over.
pub trait Backing: Send {
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
    /// Changes the size of the region, zero-filling on growth.
    fn set_len(&mut self, len: u64) -> Result<()>;
    /// Makes previous writes durable.
    fn flush(&mut self) -> Result<()>;
    fn path(&self) -> Option<&Path> {
        None
    }
}

/// Heap backed region, used for tests and throwaway queues.
#[derive(Debug, Default)]
pub struct MemoryBacking {
    bytes: Vec<u8>,
}

impl MemoryBacking {
    #[must_use]
    pub fn new(len: u64) -> Self {
        Self {
            bytes: vec![0u8; len as usize],
        }
    }
}

impl Backing for MemoryBacking {
    fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.bytes.resize(len as usize, 0);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Memory-mapped file region holding an exclusive advisory lock on the file.
pub struct MappedBacking {
    path: PathBuf,
    file: File,
    map: Option<MmapMut>,
    _lock: FileLock,
}

impl MappedBacking {
    /// Opens (or creates) `path`, sizing an empty file to `initial_len` before mapping it.
    pub fn open(path: &Path, initial_len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let lock = FileLock::try_exclusive(file.file(), path)?;
        if file.metadata()?.len() == 0 {
            file.set_len(initial_len)?;
        }
        let map = map_file(&file)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map: Some(map),
            _lock: lock,
        })
    }
}

fn map_file(file: &File) -> Result<MmapMut> {
    // SAFETY: the file is exclusively locked for the lifetime of the mapping and only
    // this process mutates it, through this mapping.
    let map = unsafe { MmapOptions::new().map_mut(file.file())? };
    Ok(map)
}

impl Backing for MappedBacking {
    fn as_slice(&self) -> &[u8] {
        self.map.as_deref().unwrap_or_default()
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        self.map.as_deref_mut().unwrap_or_default()
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if let Some(map) = self.map.take() {
            map.flush()?;
        }
        self.file.set_len(len)?;
        self.map = Some(map_file(&self.file)?);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Private copy-on-write mapping of a file, for looking at a queue without touching it.
///
/// Writes land in process memory only and the file is never locked, resized or
/// flushed. Shrinking narrows the view; growing past the file size fails.
pub struct SnapshotBacking {
    path: PathBuf,
    map: MmapMut,
    len: usize,
}

impl SnapshotBacking {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() < HEADER_LEN {
            return Err(TapeError::corrupt("file is shorter than the queue header"));
        }
        // SAFETY: the mapping is private, so nothing written through it reaches the file.
        // A concurrent writer can still make the view inconsistent; header and descriptor
        // checks report that as corruption.
        let map = unsafe { MmapOptions::new().map_copy(file.file())? };
        Ok(Self {
            path: path.to_path_buf(),
            len: map.len(),
            map,
        })
    }
}

impl Backing for SnapshotBacking {
    fn as_slice(&self) -> &[u8] {
        &self.map[..self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map[..self.len]
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        match usize::try_from(len) {
            Ok(len) if len <= self.map.len() => {
                self.len = len;
                Ok(())
            }
            _ => Err(TapeError::InvalidResize {
                requested: len,
                minimum: 0,
                maximum: self.map.len() as u64,
            }),
        }
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Fixed-capacity circular byte storage with bounded growth.
pub struct RingStorage {
    backing: Option<Box<dyn Backing>>,
    minimum_length: u64,
    maximum_length: u64,
}

impl RingStorage {
    pub fn new(backing: Box<dyn Backing>, minimum_length: u64, maximum_length: u64) -> Self {
        Self {
            backing: Some(backing),
            minimum_length,
            maximum_length: maximum_length.max(minimum_length),
        }
    }

    /// In-memory storage starting at `minimum_length` bytes.
    #[must_use]
    pub fn memory(minimum_length: u64, maximum_length: u64) -> Self {
        Self::new(
            Box::new(MemoryBacking::new(minimum_length)),
            minimum_length,
            maximum_length,
        )
    }

    /// File-backed storage; an empty or missing file starts at `minimum_length` bytes.
    pub fn open_file(path: &Path, minimum_length: u64, maximum_length: u64) -> Result<Self> {
        let backing = MappedBacking::open(path, minimum_length).map_err(|e| e.with_path(path))?;
        Ok(Self::new(Box::new(backing), minimum_length, maximum_length))
    }

    /// Read-only view of an existing file; see [`SnapshotBacking`].
    pub fn snapshot(path: &Path, minimum_length: u64) -> Result<Self> {
        let backing = SnapshotBacking::open(path).map_err(|e| e.with_path(path))?;
        let length = backing.as_slice().len() as u64;
        Ok(Self::new(Box::new(backing), minimum_length, length))
    }

    fn backing(&self) -> Result<&dyn Backing> {
        self.backing.as_deref().ok_or(TapeError::Closed)
    }

    fn backing_mut(&mut self) -> Result<&mut (dyn Backing + 'static)> {
        self.backing.as_deref_mut().ok_or(TapeError::Closed)
    }

    /// Current size of the storage in bytes; zero once closed.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.backing
            .as_ref()
            .map_or(0, |backing| backing.as_slice().len() as u64)
    }

    #[must_use]
    pub fn minimum_length(&self) -> u64 {
        self.minimum_length
    }

    #[must_use]
    pub fn maximum_length(&self) -> u64 {
        self.maximum_length
    }

    /// Changes the growth ceiling. An already larger file keeps its size until it shrinks.
    pub fn set_maximum_length(&mut self, maximum_length: u64) {
        self.maximum_length = maximum_length.max(self.minimum_length);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.backing.is_none()
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.backing.as_ref().and_then(|backing| backing.path())
    }

    /// Maps a position that may run past the end of the file back into the ring.
    #[must_use]
    pub fn wrap(&self, position: u64) -> u64 {
        let length = self.length();
        if position < length {
            position
        } else {
            HEADER_LEN + (position - length)
        }
    }

    fn check_bounds(position: u64, count: u64, length: u64) -> Result<()> {
        let fits_flat = position
            .checked_add(count)
            .is_some_and(|end| end <= length);
        let fits_wrapped = position >= HEADER_LEN
            && position < length
            && count <= length.saturating_sub(HEADER_LEN);
        if fits_flat || fits_wrapped {
            Ok(())
        } else {
            Err(TapeError::OutOfBounds {
                position,
                count,
                length,
            })
        }
    }

    /// Reads `buf.len()` bytes starting at `position`, wrapping past the end of the file.
    pub fn read(&self, position: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.backing()?.as_slice();
        let length = data.len() as u64;
        Self::check_bounds(position, buf.len() as u64, length)?;
        let start = position as usize;
        let end = start + buf.len();
        if end <= data.len() {
            buf.copy_from_slice(&data[start..end]);
        } else {
            let head = data.len() - start;
            let header = HEADER_LEN as usize;
            buf[..head].copy_from_slice(&data[start..]);
            let rest = buf.len() - head;
            buf[head..].copy_from_slice(&data[header..header + rest]);
        }
        Ok(())
    }

    /// Writes `buf` starting at `position`, wrapping past the end of the file.
    pub fn write(&mut self, position: u64, buf: &[u8]) -> Result<()> {
        let data = self.backing_mut()?.as_mut_slice();
        let length = data.len() as u64;
        Self::check_bounds(position, buf.len() as u64, length)?;
        let start = position as usize;
        let end = start + buf.len();
        if end <= data.len() {
            data[start..end].copy_from_slice(buf);
        } else {
            let head = data.len() - start;
            let header = HEADER_LEN as usize;
            data[start..].copy_from_slice(&buf[..head]);
            let rest = buf.len() - head;
            data[header..header + rest].copy_from_slice(&buf[head..]);
        }
        Ok(())
    }

    /// Copies `count` bytes from `source` to `destination`; both ranges may wrap.
    pub fn move_bytes(&mut self, source: u64, destination: u64, count: u64) -> Result<()> {
        let length = self.length();
        if self.is_closed() {
            return Err(TapeError::Closed);
        }
        Self::check_bounds(source, count, length)?;
        Self::check_bounds(destination, count, length)?;
        if source + count <= length && destination + count <= length {
            let data = self.backing_mut()?.as_mut_slice();
            let (src, dst) = (source as usize, destination as usize);
            data.copy_within(src..src + count as usize, dst);
            return Ok(());
        }
        let mut scratch = vec![0u8; count as usize];
        self.read(source, &mut scratch)?;
        self.write(destination, &scratch)
    }

    /// Grows or shrinks the storage, keeping it within `[minimum, maximum]`.
    pub fn resize(&mut self, new_length: u64) -> Result<()> {
        if new_length < self.minimum_length || new_length > self.maximum_length {
            return Err(TapeError::InvalidResize {
                requested: new_length,
                minimum: self.minimum_length,
                maximum: self.maximum_length,
            });
        }
        let backing = self.backing_mut()?;
        backing.flush()?;
        backing.set_len(new_length)?;
        tracing::debug!(length = new_length, "resized ring storage");
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.backing_mut()?.flush()
    }

    /// Flushes and releases the backing region. Later operations fail with `Closed`.
    pub fn close(&mut self) -> Result<()> {
        match self.backing.take() {
            Some(mut backing) => backing.flush(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for RingStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingStorage")
            .field("length", &self.length())
            .field("minimum_length", &self.minimum_length)
            .field("maximum_length", &self.maximum_length)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> RingStorage {
        RingStorage::memory(64, 256)
    }

    #[test]
    fn write_read_contiguous() -> Result<()> {
        let mut storage = storage();
        storage.write(40, b"hello")?;
        let mut buf = [0u8; 5];
        storage.read(40, &mut buf)?;
        assert_eq!(&buf, b"hello");
        Ok(())
    }

    #[test]
    fn write_wraps_after_header() -> Result<()> {
        let mut storage = storage();
        storage.write(60, b"abcdefgh")?;
        let mut tail = [0u8; 4];
        storage.read(60, &mut tail)?;
        assert_eq!(&tail, b"abcd");
        let mut wrapped = [0u8; 4];
        storage.read(HEADER_LEN, &mut wrapped)?;
        assert_eq!(&wrapped, b"efgh");

        let mut all = [0u8; 8];
        storage.read(60, &mut all)?;
        assert_eq!(&all, b"abcdefgh");
        Ok(())
    }

    #[test]
    fn move_across_boundary() -> Result<()> {
        let mut storage = storage();
        storage.write(HEADER_LEN, b"0123456789")?;
        storage.move_bytes(HEADER_LEN, 58, 10)?;
        let mut buf = [0u8; 10];
        storage.read(58, &mut buf)?;
        assert_eq!(&buf, b"0123456789");
        Ok(())
    }

    #[test]
    fn rejects_out_of_bounds() {
        let storage = storage();
        let mut buf = [0u8; 8];
        let err = storage.read(64, &mut buf).expect_err("position past end");
        assert!(matches!(err, TapeError::OutOfBounds { .. }));

        let mut huge = vec![0u8; 64];
        let err = storage.read(40, &mut huge).expect_err("count larger than ring");
        assert!(matches!(err, TapeError::OutOfBounds { .. }));
    }

    #[test]
    fn header_reads_do_not_wrap() {
        let storage = storage();
        let mut buf = [0u8; 8];
        let err = storage.read(30, &mut buf);
        assert!(err.is_ok(), "flat read inside the file is allowed");
        let err = storage.read(10, &mut vec![0u8; 60]).expect_err("header wrap");
        assert!(matches!(err, TapeError::OutOfBounds { .. }));
    }

    #[test]
    fn resize_respects_limits() -> Result<()> {
        let mut storage = storage();
        storage.resize(128)?;
        assert_eq!(storage.length(), 128);
        let err = storage.resize(512).expect_err("above maximum");
        assert!(matches!(err, TapeError::InvalidResize { .. }));
        let err = storage.resize(32).expect_err("below minimum");
        assert!(matches!(err, TapeError::InvalidResize { .. }));
        Ok(())
    }

    #[test]
    fn operations_fail_after_close() -> Result<()> {
        let mut storage = storage();
        storage.close()?;
        assert!(storage.is_closed());
        let err = storage.write(40, b"x").expect_err("closed");
        assert!(matches!(err, TapeError::Closed));
        let err = storage.resize(128).expect_err("closed");
        assert!(matches!(err, TapeError::Closed));
        Ok(())
    }

    #[test]
    fn mapped_file_persists_and_grows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ring.tape");
        {
            let mut storage = RingStorage::open_file(&path, 64, 256)?;
            storage.write(40, b"persist")?;
            storage.resize(128)?;
            storage.write(120, b"end")?;
            storage.close()?;
        }
        let storage = RingStorage::open_file(&path, 64, 256)?;
        assert_eq!(storage.length(), 128);
        let mut buf = [0u8; 7];
        storage.read(40, &mut buf)?;
        assert_eq!(&buf, b"persist");
        Ok(())
    }

    #[test]
    fn snapshot_changes_never_reach_the_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ring.tape");
        {
            let mut storage = RingStorage::open_file(&path, 64, 256)?;
            storage.write(40, b"original")?;
            storage.resize(128)?;
            storage.close()?;
        }
        let before = std::fs::read(&path)?;

        let mut snapshot = RingStorage::snapshot(&path, 64)?;
        snapshot.write(40, b"scribble")?;
        snapshot.resize(64)?;
        assert_eq!(snapshot.length(), 64);
        let err = snapshot.resize(256).expect_err("cannot grow past the file");
        assert!(matches!(err, TapeError::InvalidResize { .. }));
        snapshot.close()?;

        assert_eq!(std::fs::read(&path)?, before);
        Ok(())
    }
}
