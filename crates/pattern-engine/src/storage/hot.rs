//! Tier 1: fixed header slots in the shared region plus a bump-allocated
//! payload arena.
//!
//! ## LRU eviction
//!
//! When every slot is taken, the least-recently-accessed entry is dropped
//! before the new one is admitted. Dropped entries are not demoted.

use std::collections::HashMap;
use std::sync::Arc;

use lru::LruCache;

use crate::arena::Arena;
use crate::codec::{decode_header, encode_header, peek_magic};
use crate::region::{RegionLayout, SharedRegion};
use crate::types::{
    Pattern, PatternBody, PatternError, PatternLinks, PatternMetadata, PatternResult,
    PayloadEncoding, HEADER_SIZE, PATTERN_MAGIC, RESERVED_ID,
};

/// Body fields that do not fit in the region. Externally written entries have
/// none and read back with empty metadata.
#[derive(Debug, Clone, Default)]
struct Sidecar {
    encoding: PayloadEncoding,
    metadata: PatternMetadata,
    links: PatternLinks,
}

pub struct HotTier {
    region: Arc<dyn SharedRegion>,
    layout: RegionLayout,
    arena: Arena,
    /// Access map and recency order: ID -> slot.
    slots: LruCache<u64, usize>,
    /// Reverse map: slot -> ID.
    owners: Vec<Option<u64>>,
    free: Vec<usize>,
    sidecars: HashMap<u64, Sidecar>,
}

impl HotTier {
    pub fn new(region: Arc<dyn SharedRegion>, layout: RegionLayout) -> PatternResult<Self> {
        let formatted = layout.initialize(region.as_ref())?;
        tracing::debug!(
            "hot tier attached: {} slots, {} arena bytes, freshly formatted={formatted}",
            layout.slot_count,
            layout.arena_size
        );
        let arena = Arena::new(Arc::clone(&region), &layout);
        Ok(Self {
            region,
            layout,
            arena,
            slots: LruCache::unbounded(),
            owners: vec![None; layout.slot_count],
            free: (0..layout.slot_count).rev().collect(),
            sidecars: HashMap::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.layout.slot_count
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.slots.contains(&id)
    }

    pub fn arena_used(&self) -> u64 {
        self.arena.used().unwrap_or(0)
    }

    pub fn arena_capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// IDs from least to most recently used.
    pub fn lru_order(&self) -> Vec<u64> {
        self.slots.iter().rev().map(|(id, _)| *id).collect()
    }

    fn read_slot(&self, slot: usize) -> PatternResult<Vec<u8>> {
        self.region.read(self.layout.slot_offset(slot), HEADER_SIZE)
    }

    fn clear_slot(&self, slot: usize) -> PatternResult<()> {
        self.region
            .write(self.layout.slot_offset(slot), &[0u8; HEADER_SIZE])
    }

    fn assemble(&self, slot: usize, id: u64) -> PatternResult<Option<Pattern>> {
        let raw = self.read_slot(slot)?;
        let header = match decode_header(&raw) {
            Some(h) if h.id == id => h,
            _ => return Ok(None),
        };
        let payload = self
            .arena
            .read(header.data_pointer, header.payload_size as usize)?;
        let sidecar = self.sidecars.get(&id).cloned().unwrap_or_default();
        Ok(Some(Pattern {
            header,
            body: PatternBody {
                encoding: sidecar.encoding,
                payload,
                metadata: sidecar.metadata,
                links: sidecar.links,
            },
        }))
    }

    /// Look up an entry and mark it most recently used.
    pub fn get(&mut self, id: u64) -> PatternResult<Option<Pattern>> {
        let slot = match self.slots.get(&id) {
            Some(&slot) => slot,
            None => return Ok(None),
        };
        match self.assemble(slot, id)? {
            Some(p) => Ok(Some(p)),
            None => {
                // Overwritten or cleared by an external producer.
                tracing::debug!("hot slot {slot} no longer holds pattern {id}");
                self.forget(id, slot);
                self.free.push(slot);
                Ok(None)
            }
        }
    }

    /// Look up an entry without touching recency or releasing stale slots.
    pub fn peek(&self, id: u64) -> PatternResult<Option<Pattern>> {
        match self.slots.peek(&id) {
            Some(&slot) => self.assemble(slot, id),
            None => Ok(None),
        }
    }

    fn forget(&mut self, id: u64, slot: usize) {
        self.slots.pop(&id);
        self.sidecars.remove(&id);
        if self.owners[slot] == Some(id) {
            self.owners[slot] = None;
        }
    }

    /// Drop the least-recently-used entry. Returns its ID.
    pub fn evict_lru(&mut self) -> PatternResult<Option<u64>> {
        let Some((id, slot)) = self.slots.pop_lru() else {
            return Ok(None);
        };
        self.sidecars.remove(&id);
        self.owners[slot] = None;
        self.clear_slot(slot)?;
        self.free.push(slot);
        tracing::debug!("evicted pattern {id} from hot slot {slot}");
        Ok(Some(id))
    }

    pub fn remove(&mut self, id: u64) -> PatternResult<bool> {
        let Some(slot) = self.slots.pop(&id) else {
            return Ok(false);
        };
        self.sidecars.remove(&id);
        self.owners[slot] = None;
        self.clear_slot(slot)?;
        self.free.push(slot);
        Ok(true)
    }

    /// Take a free slot that no external producer has claimed.
    fn claim_free_slot(&mut self) -> PatternResult<Option<usize>> {
        while let Some(slot) = self.free.pop() {
            let raw = self.read_slot(slot)?;
            if peek_magic(&raw) == Some(PATTERN_MAGIC) {
                // Left for the next sync to import.
                continue;
            }
            return Ok(Some(slot));
        }
        Ok(None)
    }

    /// Store a pattern. A new ID arriving at full capacity first evicts the
    /// LRU entry; its ID is returned.
    pub fn put(&mut self, pattern: &Pattern) -> PatternResult<Option<u64>> {
        let id = pattern.header.id;
        let payload = &pattern.body.payload;
        let mut evicted = None;

        let existing = self.slots.peek(&id).copied();
        let slot = match existing {
            Some(slot) => slot,
            None => {
                if self.slots.len() >= self.capacity() {
                    evicted = self.evict_lru()?;
                }
                match self.claim_free_slot()? {
                    Some(slot) => slot,
                    None => {
                        return Err(PatternError::CapacityExceeded(format!(
                            "no free hot slot out of {}",
                            self.capacity()
                        )))
                    }
                }
            }
        };

        // Reuse the old payload location when the new payload fits in it.
        let reuse = match existing {
            Some(slot) => decode_header(&self.read_slot(slot)?)
                .filter(|h| h.id == id && h.payload_size as usize >= payload.len())
                .map(|h| h.data_pointer),
            None => None,
        };
        let data_pointer = match reuse {
            Some(ptr) => ptr,
            None => match self.arena.allocate(payload.len()) {
                Ok(ptr) => ptr,
                Err(e) => {
                    if existing.is_none() {
                        self.free.push(slot);
                    }
                    return Err(e);
                }
            },
        };
        self.arena.write(data_pointer, payload)?;

        let mut header = pattern.header.clone();
        header.payload_size = payload.len() as u16;
        header.data_pointer = data_pointer;
        self.region
            .write(self.layout.slot_offset(slot), &encode_header(&header))?;

        self.slots.put(id, slot);
        self.owners[slot] = Some(id);
        self.sidecars.insert(
            id,
            Sidecar {
                encoding: pattern.body.encoding,
                metadata: pattern.body.metadata.clone(),
                links: pattern.body.links.clone(),
            },
        );
        Ok(evicted)
    }

    /// Re-pack the payloads of every live slot from the start of the arena.
    ///
    /// A slot is live if it holds a decodable header, whether we own it or an
    /// external producer wrote it and it is still waiting for a sync. Returns
    /// the number of arena bytes reclaimed.
    pub fn compact(&mut self) -> PatternResult<u64> {
        let before = self.arena.used()?;
        let mut live = Vec::with_capacity(self.layout.slot_count);
        for slot in 0..self.layout.slot_count {
            let raw = self.read_slot(slot)?;
            let Some(header) = decode_header(&raw).filter(|h| h.id != 0) else {
                continue;
            };
            match self
                .arena
                .read(header.data_pointer, header.payload_size as usize)
            {
                Ok(payload) => live.push((slot, header, payload)),
                Err(e) => tracing::warn!("compaction skipping slot {slot}: {e}"),
            }
        }
        self.arena.reset()?;
        for (slot, mut header, payload) in live {
            let ptr = self.arena.allocate(payload.len())?;
            self.arena.write(ptr, &payload)?;
            header.data_pointer = ptr;
            self.region
                .write(self.layout.slot_offset(slot), &encode_header(&header))?;
        }
        let after = self.arena.used()?;
        tracing::debug!("hot arena compacted: {before} -> {after} bytes");
        Ok(before.saturating_sub(after))
    }

    /// Rescan every slot and import entries written by external producers.
    ///
    /// Slots we believed we owned but that now hold a different (or no)
    /// header are released first. Returns the newly imported patterns.
    pub fn sync(&mut self) -> PatternResult<Vec<Pattern>> {
        let mut imported = Vec::new();
        for slot in 0..self.layout.slot_count {
            let raw = self.read_slot(slot)?;
            let header = decode_header(&raw).filter(|h| h.id != 0 && h.id != RESERVED_ID);

            if let Some(owner) = self.owners[slot] {
                if header.as_ref().map(|h| h.id) == Some(owner) {
                    continue;
                }
                self.forget(owner, slot);
                if header.is_none() {
                    self.free.push(slot);
                    continue;
                }
            }

            let Some(header) = header else { continue };
            if self.slots.contains(&header.id) {
                // Duplicate of an entry we hold elsewhere; ours wins.
                continue;
            }
            let payload = match self
                .arena
                .read(header.data_pointer, header.payload_size as usize)
            {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("skipping external header in slot {slot}: {e}");
                    continue;
                }
            };
            self.free.retain(|&s| s != slot);
            self.owners[slot] = Some(header.id);
            self.slots.put(header.id, slot);
            imported.push(Pattern {
                header,
                body: PatternBody {
                    payload,
                    ..PatternBody::default()
                },
            });
        }
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;
    use crate::types::PatternType;

    fn tier(slots: usize, arena: usize) -> (Arc<HeapRegion>, RegionLayout, HotTier) {
        let layout = RegionLayout::new(slots, arena);
        let region = Arc::new(HeapRegion::new(layout.required_len()));
        let tier = HotTier::new(region.clone(), layout).unwrap();
        (region, layout, tier)
    }

    fn pattern(id: u64, payload: &[u8]) -> Pattern {
        let mut p = Pattern::new(PatternType::Atomic, payload.to_vec())
            .with_confidence(75)
            .with_tag("hot");
        p.header.id = id;
        p
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_, _, mut tier) = tier(4, 1024);
        let p = pattern(1, b"payload");
        tier.put(&p).unwrap();
        let got = tier.get(1).unwrap().unwrap();
        assert_eq!(got.body.payload, b"payload".to_vec());
        assert_eq!(got.body.metadata.tags, vec!["hot".to_string()]);
        assert_eq!(got.header.confidence, 75);
    }

    #[test]
    fn test_capacity_evicts_exactly_one_lru() {
        let (_, _, mut tier) = tier(3, 1024);
        for id in 1..=3 {
            tier.put(&pattern(id, b"x")).unwrap();
        }
        tier.get(1).unwrap();
        let evicted = tier.put(&pattern(4, b"y")).unwrap();
        assert_eq!(evicted, Some(2));
        assert_eq!(tier.len(), 3);
        assert!(tier.get(2).unwrap().is_none());
        assert!(tier.get(1).unwrap().is_some());
    }

    #[test]
    fn test_overwrite_reuses_slot_and_payload() {
        let (_, _, mut tier) = tier(2, 64);
        tier.put(&pattern(1, b"abcdef")).unwrap();
        let used = tier.arena_used();
        tier.put(&pattern(1, b"abc")).unwrap();
        assert_eq!(tier.arena_used(), used);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.get(1).unwrap().unwrap().body.payload, b"abc".to_vec());
    }

    #[test]
    fn test_arena_exhaustion_and_compaction() {
        let (_, _, mut tier) = tier(4, 16);
        tier.put(&pattern(1, &[1; 8])).unwrap();
        tier.put(&pattern(2, &[2; 8])).unwrap();
        assert!(matches!(
            tier.put(&pattern(3, &[3; 8])),
            Err(PatternError::CapacityExceeded(_))
        ));
        tier.evict_lru().unwrap();
        assert_eq!(tier.compact().unwrap(), 8);
        tier.put(&pattern(3, &[3; 8])).unwrap();
        assert_eq!(tier.get(2).unwrap().unwrap().body.payload, vec![2; 8]);
        assert_eq!(tier.get(3).unwrap().unwrap().body.payload, vec![3; 8]);
    }

    #[test]
    fn test_sync_imports_external_header() {
        let (region, layout, mut tier) = tier(4, 256);
        tier.put(&pattern(1, b"own")).unwrap();

        // An external producer writes payload + header directly.
        let used = region.add(crate::region::OFF_ARENA_CURSOR, 5).unwrap();
        let ptr = (used - 5) as u32;
        region
            .write(layout.arena_offset() + ptr as usize, b"ext!!")
            .unwrap();
        let mut header = pattern(77, b"").header;
        header.payload_size = 5;
        header.data_pointer = ptr;
        region
            .write(layout.slot_offset(3), &encode_header(&header))
            .unwrap();

        let imported = tier.sync().unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].header.id, 77);
        assert_eq!(tier.get(77).unwrap().unwrap().body.payload, b"ext!!".to_vec());
        assert!(tier.sync().unwrap().is_empty());
    }

    #[test]
    fn test_compaction_keeps_unsynced_external_payload() {
        let (region, layout, mut tier) = tier(4, 16);

        let used = region.add(crate::region::OFF_ARENA_CURSOR, 5).unwrap();
        let ptr = (used - 5) as u32;
        region
            .write(layout.arena_offset() + ptr as usize, b"ext!!")
            .unwrap();
        let mut header = pattern(900, b"").header;
        header.payload_size = 5;
        header.data_pointer = ptr;
        region
            .write(layout.slot_offset(3), &encode_header(&header))
            .unwrap();

        tier.put(&pattern(1, &[8; 8])).unwrap();
        assert!(tier.put(&pattern(2, &[8; 8])).is_err());
        tier.evict_lru().unwrap();
        assert_eq!(tier.compact().unwrap(), 8);
        assert_eq!(tier.arena_used(), 5);
        tier.put(&pattern(2, &[8; 8])).unwrap();

        let imported = tier.sync().unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].body.payload, b"ext!!".to_vec());
        assert_eq!(tier.get(900).unwrap().unwrap().body.payload, b"ext!!".to_vec());
        assert_eq!(tier.get(2).unwrap().unwrap().body.payload, vec![8; 8]);
    }

    #[test]
    fn test_peek_leaves_recency_alone() {
        let (_, _, mut tier) = tier(2, 64);
        tier.put(&pattern(1, b"a")).unwrap();
        tier.put(&pattern(2, b"b")).unwrap();
        assert!(tier.peek(1).unwrap().is_some());
        assert_eq!(tier.lru_order(), vec![1, 2]);
        assert!(tier.peek(3).unwrap().is_none());
    }

    #[test]
    fn test_sync_ignores_reserved_id() {
        let (region, layout, mut tier) = tier(2, 64);
        let mut header = pattern(RESERVED_ID, b"").header;
        header.payload_size = 0;
        region
            .write(layout.slot_offset(1), &encode_header(&header))
            .unwrap();
        assert!(tier.sync().unwrap().is_empty());
        assert!(!tier.contains(RESERVED_ID));
    }

    #[test]
    fn test_externally_cleared_slot_is_released() {
        let (region, layout, mut tier) = tier(2, 64);
        tier.put(&pattern(1, b"a")).unwrap();
        region
            .write(layout.slot_offset(0), &[0u8; HEADER_SIZE])
            .unwrap();
        assert!(tier.sync().unwrap().is_empty());
        assert!(!tier.contains(1));
        tier.put(&pattern(2, b"b")).unwrap();
        tier.put(&pattern(3, b"c")).unwrap();
        assert_eq!(tier.len(), 2);
    }
}
