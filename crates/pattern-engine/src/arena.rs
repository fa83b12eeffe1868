//! Bump allocator for hot-tier payloads.
//!
//! The cursor lives in the region's control block so every process mapping
//! the region allocates from the same segment. Allocation is a single atomic
//! add; on overflow the add is compensated by an atomic subtract. The
//! rollback is not linearizable against concurrent allocators: a racing
//! allocation can observe the transient overshoot and fail spuriously.

use std::sync::Arc;

use crate::region::{RegionLayout, SharedRegion, OFF_ARENA_CURSOR};
use crate::types::{PatternError, PatternResult};

pub struct Arena {
    region: Arc<dyn SharedRegion>,
    base: usize,
    size: usize,
}

impl Arena {
    pub fn new(region: Arc<dyn SharedRegion>, layout: &RegionLayout) -> Self {
        Self {
            region,
            base: layout.arena_offset(),
            size: layout.arena_size,
        }
    }

    /// Reserve `len` bytes, returning the arena-relative offset.
    pub fn allocate(&self, len: usize) -> PatternResult<u32> {
        if len == 0 {
            return Ok(self.used()?.min(self.size as u64) as u32);
        }
        let end = self.region.add(OFF_ARENA_CURSOR, len as i64)?;
        if end > self.size as u64 {
            self.region.add(OFF_ARENA_CURSOR, -(len as i64))?;
            return Err(PatternError::CapacityExceeded(format!(
                "arena exhausted: {len} bytes requested, {} of {} used",
                end - len as u64,
                self.size
            )));
        }
        Ok((end - len as u64) as u32)
    }

    fn check(&self, offset: u32, len: usize) -> PatternResult<usize> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.size => Ok(self.base + start),
            _ => Err(PatternError::Region {
                offset: start,
                len,
                region_len: self.size,
            }),
        }
    }

    pub fn write(&self, offset: u32, bytes: &[u8]) -> PatternResult<()> {
        let at = self.check(offset, bytes.len())?;
        self.region.write(at, bytes)
    }

    pub fn read(&self, offset: u32, len: usize) -> PatternResult<Vec<u8>> {
        let at = self.check(offset, len)?;
        self.region.read(at, len)
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> PatternResult<u64> {
        self.region.load(OFF_ARENA_CURSOR)
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Rewind the cursor to zero. Only safe once no slot references the arena.
    pub fn reset(&self) -> PatternResult<()> {
        self.region.write(OFF_ARENA_CURSOR, &0u64.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    fn arena(size: usize) -> Arena {
        let layout = RegionLayout::new(2, size);
        let region = Arc::new(HeapRegion::new(layout.required_len()));
        layout.initialize(region.as_ref()).unwrap();
        Arena::new(region, &layout)
    }

    #[test]
    fn test_bump_allocation() {
        let arena = arena(100);
        assert_eq!(arena.allocate(10).unwrap(), 0);
        assert_eq!(arena.allocate(20).unwrap(), 10);
        assert_eq!(arena.used().unwrap(), 30);
    }

    #[test]
    fn test_overflow_rolls_back() {
        let arena = arena(100);
        arena.allocate(90).unwrap();
        let err = arena.allocate(20).unwrap_err();
        assert!(matches!(err, PatternError::CapacityExceeded(_)));
        assert_eq!(arena.used().unwrap(), 90);
        assert_eq!(arena.allocate(10).unwrap(), 90);
    }

    #[test]
    fn test_write_read() {
        let arena = arena(64);
        let off = arena.allocate(5).unwrap();
        arena.write(off, b"hello").unwrap();
        assert_eq!(arena.read(off, 5).unwrap(), b"hello".to_vec());
    }

    #[test]
    fn test_read_outside_arena_fails() {
        let arena = arena(64);
        assert!(arena.read(60, 10).is_err());
        assert!(arena.read(u32::MAX, 1).is_err());
    }

    #[test]
    fn test_reset() {
        let arena = arena(64);
        arena.allocate(64).unwrap();
        assert!(arena.allocate(1).is_err());
        arena.reset().unwrap();
        assert_eq!(arena.allocate(1).unwrap(), 0);
    }
}
