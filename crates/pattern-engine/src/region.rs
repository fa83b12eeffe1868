//! Shared-memory region the hot tier lives in.
//!
//! The region is an opaque flat address space that other processes may write
//! into directly. The engine reaches it only through [`SharedRegion`]; raw
//! header bytes are produced and consumed by [`crate::codec`].
//!
//! Layout:
//!
//! ```text
//! [ control block: 64 bytes ][ slot 0 .. slot N-1: 64 bytes each ][ payload arena ]
//! ```
//!
//! Control block words (little-endian u64): region magic @0, arena cursor @8,
//! slot count @16, arena size @24.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;

use crate::types::{PatternError, PatternResult, HEADER_SIZE};

/// Magic stored in the control block: "PATREGN1".
pub const REGION_MAGIC: u64 = u64::from_le_bytes(*b"PATREGN1");

pub const CONTROL_BLOCK_SIZE: usize = 64;
pub const OFF_REGION_MAGIC: usize = 0;
pub const OFF_ARENA_CURSOR: usize = 8;
pub const OFF_SLOT_COUNT: usize = 16;
pub const OFF_ARENA_SIZE: usize = 24;

/// Flat address space shared with external producers.
///
/// `add` and `load` are atomic with respect to every other call on the same
/// region.
pub trait SharedRegion: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, offset: usize, len: usize) -> PatternResult<Vec<u8>>;

    fn write(&self, offset: usize, bytes: &[u8]) -> PatternResult<()>;

    /// Atomically add `delta` to the u64 at `offset`, returning the new value.
    fn add(&self, offset: usize, delta: i64) -> PatternResult<u64>;

    /// Atomically load the u64 at `offset`.
    fn load(&self, offset: usize) -> PatternResult<u64>;
}

fn check_bounds(offset: usize, len: usize, region_len: usize) -> PatternResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= region_len => Ok(()),
        _ => Err(PatternError::Region {
            offset,
            len,
            region_len,
        }),
    }
}

fn add_in_place(buf: &mut [u8], offset: usize, delta: i64) -> PatternResult<u64> {
    check_bounds(offset, 8, buf.len())?;
    let slot = &mut buf[offset..offset + 8];
    let value = LittleEndian::read_u64(slot).wrapping_add_signed(delta);
    LittleEndian::write_u64(slot, value);
    Ok(value)
}

/// In-process region backed by a heap buffer.
pub struct HeapRegion {
    bytes: RwLock<Vec<u8>>,
}

impl HeapRegion {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0; len]),
        }
    }
}

impl SharedRegion for HeapRegion {
    fn len(&self) -> usize {
        self.bytes.read().len()
    }

    fn read(&self, offset: usize, len: usize) -> PatternResult<Vec<u8>> {
        let bytes = self.bytes.read();
        check_bounds(offset, len, bytes.len())?;
        Ok(bytes[offset..offset + len].to_vec())
    }

    fn write(&self, offset: usize, data: &[u8]) -> PatternResult<()> {
        let mut bytes = self.bytes.write();
        check_bounds(offset, data.len(), bytes.len())?;
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn add(&self, offset: usize, delta: i64) -> PatternResult<u64> {
        add_in_place(&mut self.bytes.write(), offset, delta)
    }

    fn load(&self, offset: usize) -> PatternResult<u64> {
        let bytes = self.bytes.read();
        check_bounds(offset, 8, bytes.len())?;
        Ok(LittleEndian::read_u64(&bytes[offset..offset + 8]))
    }
}

/// File-backed region that other processes can map concurrently.
pub struct MmapRegion {
    path: PathBuf,
    map: RwLock<MmapMut>,
}

impl MmapRegion {
    /// Open (or create) a region file of exactly `len` bytes.
    pub fn open(path: &Path, len: usize) -> PatternResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < len as u64 {
            file.set_len(len as u64)?;
        }
        // SAFETY: the file stays open for the lifetime of the map and is sized
        // above; concurrent external writers are part of the region contract.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file) }?;
        Ok(Self {
            path: path.to_path_buf(),
            map: RwLock::new(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> PatternResult<()> {
        self.map.read().flush()?;
        Ok(())
    }
}

impl SharedRegion for MmapRegion {
    fn len(&self) -> usize {
        self.map.read().len()
    }

    fn read(&self, offset: usize, len: usize) -> PatternResult<Vec<u8>> {
        let map = self.map.read();
        check_bounds(offset, len, map.len())?;
        Ok(map[offset..offset + len].to_vec())
    }

    fn write(&self, offset: usize, data: &[u8]) -> PatternResult<()> {
        let mut map = self.map.write();
        check_bounds(offset, data.len(), map.len())?;
        map[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn add(&self, offset: usize, delta: i64) -> PatternResult<u64> {
        add_in_place(&mut self.map.write(), offset, delta)
    }

    fn load(&self, offset: usize) -> PatternResult<u64> {
        let map = self.map.read();
        check_bounds(offset, 8, map.len())?;
        Ok(LittleEndian::read_u64(&map[offset..offset + 8]))
    }
}

/// Offsets of the hot-tier structures inside a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub slot_count: usize,
    pub arena_size: usize,
}

impl RegionLayout {
    pub fn new(slot_count: usize, arena_size: usize) -> Self {
        Self {
            slot_count,
            arena_size,
        }
    }

    pub fn slot_offset(&self, slot: usize) -> usize {
        CONTROL_BLOCK_SIZE + slot * HEADER_SIZE
    }

    pub fn arena_offset(&self) -> usize {
        CONTROL_BLOCK_SIZE + self.slot_count * HEADER_SIZE
    }

    /// Bytes a region needs to hold this layout.
    pub fn required_len(&self) -> usize {
        self.arena_offset() + self.arena_size
    }

    /// Write the control block unless the region already carries one with the
    /// same geometry. Returns true if the region was freshly formatted.
    pub fn initialize(&self, region: &dyn SharedRegion) -> PatternResult<bool> {
        if region.len() < self.required_len() {
            return Err(PatternError::CapacityExceeded(format!(
                "region of {} bytes cannot hold layout needing {}",
                region.len(),
                self.required_len()
            )));
        }
        if region.load(OFF_REGION_MAGIC)? == REGION_MAGIC
            && region.load(OFF_SLOT_COUNT)? == self.slot_count as u64
            && region.load(OFF_ARENA_SIZE)? == self.arena_size as u64
        {
            return Ok(false);
        }
        let mut block = [0u8; CONTROL_BLOCK_SIZE];
        LittleEndian::write_u64(&mut block[OFF_REGION_MAGIC..], REGION_MAGIC);
        LittleEndian::write_u64(&mut block[OFF_ARENA_CURSOR..], 0);
        LittleEndian::write_u64(&mut block[OFF_SLOT_COUNT..], self.slot_count as u64);
        LittleEndian::write_u64(&mut block[OFF_ARENA_SIZE..], self.arena_size as u64);
        region.write(0, &block)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_read_write() {
        let region = HeapRegion::new(128);
        region.write(10, &[1, 2, 3]).unwrap();
        assert_eq!(region.read(10, 3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_out_of_bounds() {
        let region = HeapRegion::new(16);
        assert!(matches!(
            region.write(15, &[1, 2]),
            Err(PatternError::Region { .. })
        ));
        assert!(region.read(usize::MAX, 2).is_err());
        assert!(region.load(9).is_err());
    }

    #[test]
    fn test_atomic_add_and_rollback() {
        let region = HeapRegion::new(64);
        assert_eq!(region.add(8, 100).unwrap(), 100);
        assert_eq!(region.add(8, 28).unwrap(), 128);
        assert_eq!(region.add(8, -28).unwrap(), 100);
        assert_eq!(region.load(8).unwrap(), 100);
    }

    #[test]
    fn test_layout_offsets() {
        let layout = RegionLayout::new(4, 256);
        assert_eq!(layout.slot_offset(0), 64);
        assert_eq!(layout.slot_offset(3), 64 + 3 * 64);
        assert_eq!(layout.arena_offset(), 64 + 4 * 64);
        assert_eq!(layout.required_len(), 64 + 4 * 64 + 256);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let layout = RegionLayout::new(4, 256);
        let region = HeapRegion::new(layout.required_len());
        assert!(layout.initialize(&region).unwrap());
        region.add(OFF_ARENA_CURSOR, 40).unwrap();
        assert!(!layout.initialize(&region).unwrap());
        assert_eq!(region.load(OFF_ARENA_CURSOR).unwrap(), 40);
    }

    #[test]
    fn test_initialize_rejects_small_region() {
        let layout = RegionLayout::new(4, 256);
        let region = HeapRegion::new(100);
        assert!(layout.initialize(&region).is_err());
    }

    #[test]
    fn test_mmap_region_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hot.region");
        {
            let region = MmapRegion::open(&path, 4096).unwrap();
            region.write(100, b"shared").unwrap();
            region.add(8, 5).unwrap();
            region.flush().unwrap();
        }
        let region = MmapRegion::open(&path, 4096).unwrap();
        assert_eq!(region.read(100, 6).unwrap(), b"shared".to_vec());
        assert_eq!(region.load(8).unwrap(), 5);
    }
}
