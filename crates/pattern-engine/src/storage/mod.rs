//! Tiered storage manager.
//!
//! Four tiers, fastest first:
//!
//! 1. **Hot**: header slots in the shared region + payload arena, LRU.
//! 2. **Warm**: bounded in-process map, rejects writes past capacity.
//! 3. **Cold**: unbounded durable JSON store, persisted on every write.
//! 4. **Ephemeral**: small LRU for transient entries, fed by
//!    [`StorageManager::put_ephemeral`] only.
//!
//! Writes go to the hot tier and cascade down on failure. Reads are gated by
//! the Bloom filter and promote by copying one tier up; the lower copy stays
//! as backing. Each tier has its own lock, so promotion is not atomic with a
//! concurrent eviction or sync. Queries look candidates up without promoting.
//!
//! Whole-record writes and [`StorageManager::update`] are serialized by one
//! update lock, so a read-modify-write never loses a concurrent change.

pub mod cold;
pub mod ephemeral;
pub mod hot;
pub mod warm;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::bloom::BloomFilter;
use crate::config::StorageConfig;
use crate::index::PatternIndex;
use crate::query::{CandidateSource, PatternQuery};
use crate::region::{HeapRegion, RegionLayout, SharedRegion};
use crate::types::{Pattern, PatternError, PatternResult, MAX_PAYLOAD_SIZE};

pub use cold::ColdTier;
pub use ephemeral::EphemeralTier;
pub use hot::HotTier;
pub use warm::WarmTier;

/// Attempts at a hot-tier write before cascading to warm.
const HOT_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
    Ephemeral,
}

/// What a write did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub id: u64,
    pub tier: Tier,
    /// False if the Bloom filter had (possibly falsely) seen the ID before.
    pub is_new: bool,
    /// Hot-tier entries dropped to admit this write.
    pub evicted: Vec<u64>,
}

#[derive(Default)]
struct Counters {
    hot_hits: AtomicU64,
    warm_hits: AtomicU64,
    cold_hits: AtomicU64,
    ephemeral_hits: AtomicU64,
    misses: AtomicU64,
    bloom_negatives: AtomicU64,
    bloom_false_positives: AtomicU64,
    stale_reads: AtomicU64,
    evictions: AtomicU64,
    promotions: AtomicU64,
    cascades: AtomicU64,
    sync_imports: AtomicU64,
    total_patterns: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time storage statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub hot_entries: usize,
    pub hot_capacity: usize,
    pub warm_entries: usize,
    pub cold_entries: usize,
    pub ephemeral_entries: usize,
    pub arena_used: u64,
    pub arena_capacity: usize,
    pub hot_hits: u64,
    pub warm_hits: u64,
    pub cold_hits: u64,
    pub ephemeral_hits: u64,
    pub misses: u64,
    pub bloom_negatives: u64,
    /// Bloom-positive lookups of IDs this manager never stored.
    pub bloom_false_positives: u64,
    /// Lookups of IDs that were stored but every tier has since dropped.
    pub stale_reads: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub cascades: u64,
    pub sync_imports: u64,
    pub total_patterns: u64,
    pub bloom_fill_ratio: f64,
}

impl StorageStats {
    pub fn hits(&self) -> u64 {
        self.hot_hits + self.warm_hits + self.cold_hits + self.ephemeral_hits
    }

    /// Hits over all lookups; 1.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses;
        if total == 0 {
            1.0
        } else {
            self.hits() as f64 / total as f64
        }
    }

    /// Share of Bloom-positive lookups for IDs that were never stored.
    /// Stale reads of evicted IDs count as positives, not as false ones.
    pub fn bloom_false_positive_rate(&self) -> f64 {
        let positives = self.hits() + self.stale_reads + self.bloom_false_positives;
        if positives == 0 {
            0.0
        } else {
            self.bloom_false_positives as f64 / positives as f64
        }
    }
}

pub struct StorageManager {
    hot: RwLock<HotTier>,
    warm: RwLock<WarmTier>,
    cold: RwLock<ColdTier>,
    ephemeral: RwLock<EphemeralTier>,
    bloom: RwLock<BloomFilter>,
    index: RwLock<PatternIndex>,
    /// Every ID ever stored, to tell stale reads from Bloom false positives.
    stored: RwLock<HashSet<u64>>,
    update_lock: Mutex<()>,
    next_id: AtomicU64,
    counters: Counters,
}

impl StorageManager {
    /// Open storage over a private in-process region.
    pub fn open(config: &StorageConfig) -> PatternResult<Self> {
        let layout = config.layout();
        let region: Arc<dyn SharedRegion> = Arc::new(HeapRegion::new(layout.required_len()));
        Self::with_region(config, region)
    }

    /// Open storage over a region other processes may also write into.
    pub fn with_region(
        config: &StorageConfig,
        region: Arc<dyn SharedRegion>,
    ) -> PatternResult<Self> {
        let layout: RegionLayout = config.layout();
        let hot = HotTier::new(region, layout)?;
        let cold = ColdTier::open(config.cold_path.as_deref())?;

        // Durable entries stay reachable across restarts; indices do not.
        let mut bloom = BloomFilter::new(config.bloom_bits);
        for id in cold.ids() {
            bloom.add(id);
        }
        let stored: HashSet<u64> = cold.ids().collect();
        let counters = Counters::default();
        counters
            .total_patterns
            .store(cold.len() as u64, Ordering::Relaxed);
        let next_id = AtomicU64::new(cold.max_id().saturating_add(1));

        tracing::info!(
            "storage opened: hot={} slots, warm={} entries, cold={} durable patterns",
            layout.slot_count,
            config.warm_capacity,
            cold.len()
        );

        Ok(Self {
            hot: RwLock::new(hot),
            warm: RwLock::new(WarmTier::new(config.warm_capacity)),
            cold: RwLock::new(cold),
            ephemeral: RwLock::new(EphemeralTier::new(config.ephemeral_capacity)),
            bloom: RwLock::new(bloom),
            index: RwLock::new(PatternIndex::new()),
            stored: RwLock::new(stored),
            update_lock: Mutex::new(()),
            next_id,
            counters,
        })
    }

    fn assign_id(&self, pattern: &mut Pattern) -> u64 {
        if pattern.header.id == 0 {
            pattern.header.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        } else {
            self.next_id
                .fetch_max(pattern.header.id.saturating_add(1), Ordering::SeqCst);
        }
        pattern.header.id
    }

    /// Test-then-add against the Bloom filter. True if the ID looks new.
    fn admit_to_bloom(&self, id: u64) -> bool {
        self.stored.write().insert(id);
        let mut bloom = self.bloom.write();
        let seen = bloom.contains(id);
        bloom.add(id);
        !seen
    }

    fn write_hot(&self, pattern: &Pattern, evicted: &mut Vec<u64>) -> PatternResult<()> {
        let mut hot = self.hot.write();
        let mut last_err = None;
        for attempt in 0..HOT_WRITE_ATTEMPTS {
            match hot.put(pattern) {
                Ok(dropped) => {
                    evicted.extend(dropped);
                    return Ok(());
                }
                Err(PatternError::CapacityExceeded(reason)) => {
                    tracing::debug!(
                        "hot write attempt {} for pattern {} failed: {reason}",
                        attempt + 1,
                        pattern.header.id
                    );
                    if let Some(id) = hot.evict_lru()? {
                        evicted.push(id);
                    }
                    hot.compact()?;
                    last_err = Some(PatternError::CapacityExceeded(reason));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| PatternError::CapacityExceeded("hot tier".into())))
    }

    /// Store a pattern, assigning an ID if it has none.
    ///
    /// Tries the hot tier (evicting LRU entries), then warm, then cold. A
    /// cold-tier failure is surfaced. Lower-tier copies of the same ID are
    /// refreshed so a later eviction does not resurface stale data.
    pub fn write(&self, pattern: Pattern) -> PatternResult<WriteReceipt> {
        let _guard = self.update_lock.lock();
        self.write_locked(pattern)
    }

    /// Read `id`, let `f` modify it, and write the result back, with no
    /// other write or update of any pattern in between. If `f` fails nothing
    /// is written.
    pub fn update<T, F>(&self, id: u64, f: F) -> PatternResult<(T, WriteReceipt)>
    where
        F: FnOnce(&mut Pattern) -> PatternResult<T>,
    {
        let _guard = self.update_lock.lock();
        let mut pattern = self.read(id)?;
        let out = f(&mut pattern)?;
        pattern.header.id = id;
        let receipt = self.write_locked(pattern)?;
        Ok((out, receipt))
    }

    fn write_locked(&self, mut pattern: Pattern) -> PatternResult<WriteReceipt> {
        pattern.check_invariants()?;
        let id = self.assign_id(&mut pattern);
        pattern.header.payload_size = pattern.body.payload.len().min(MAX_PAYLOAD_SIZE) as u16;
        let is_new = self.admit_to_bloom(id);

        let mut evicted = Vec::new();
        let tier = match self.write_hot(&pattern, &mut evicted) {
            Ok(()) => Tier::Hot,
            Err(e) => {
                bump(&self.counters.cascades);
                tracing::warn!("hot tier rejected pattern {id}, cascading to warm: {e}");
                match self.warm.write().put(pattern.clone()) {
                    Ok(()) => Tier::Warm,
                    Err(e) => {
                        tracing::warn!("warm tier rejected pattern {id}, cascading to cold: {e}");
                        self.cold.write().put(pattern.clone())?;
                        Tier::Cold
                    }
                }
            }
        };

        if tier != Tier::Warm {
            let mut warm = self.warm.write();
            if warm.contains(id) {
                warm.put(pattern.clone())?;
            }
        }
        if tier != Tier::Cold && self.cold.read().contains(id) {
            self.cold.write().put(pattern.clone())?;
        }

        self.index.write().insert(&pattern);
        if is_new {
            bump(&self.counters.total_patterns);
        }
        self.counters
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);

        tracing::debug!("wrote pattern {id} to {tier:?} (new={is_new})");
        Ok(WriteReceipt {
            id,
            tier,
            is_new,
            evicted,
        })
    }

    /// Write straight to the durable tier (bypassing hot and warm).
    pub fn persist(&self, mut pattern: Pattern) -> PatternResult<u64> {
        pattern.check_invariants()?;
        let id = self.assign_id(&mut pattern);
        if self.admit_to_bloom(id) {
            bump(&self.counters.total_patterns);
        }
        self.index.write().insert(&pattern);
        self.cold.write().put(pattern)?;
        Ok(id)
    }

    /// Look a pattern up by ID, promoting one tier on lower-tier hits.
    pub fn read(&self, id: u64) -> PatternResult<Pattern> {
        if !self.bloom.read().contains(id) {
            bump(&self.counters.bloom_negatives);
            bump(&self.counters.misses);
            return Err(PatternError::NotFound(id));
        }

        if let Some(p) = self.hot.write().get(id)? {
            bump(&self.counters.hot_hits);
            return Ok(p);
        }

        let warm_hit = self.warm.read().get(id).cloned();
        if let Some(p) = warm_hit {
            bump(&self.counters.warm_hits);
            let mut evicted = Vec::new();
            match self.write_hot(&p, &mut evicted) {
                Ok(()) => {
                    bump(&self.counters.promotions);
                    tracing::debug!("promoted pattern {id} warm -> hot");
                }
                Err(e) => tracing::debug!("promotion of pattern {id} to hot skipped: {e}"),
            }
            self.counters
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            return Ok(p);
        }

        let cold_hit = self.cold.read().get(id).cloned();
        if let Some(p) = cold_hit {
            bump(&self.counters.cold_hits);
            match self.warm.write().put(p.clone()) {
                Ok(()) => {
                    bump(&self.counters.promotions);
                    tracing::debug!("promoted pattern {id} cold -> warm");
                }
                Err(e) => tracing::debug!("promotion of pattern {id} to warm skipped: {e}"),
            }
            return Ok(p);
        }

        if let Some(p) = self.ephemeral.write().get(id) {
            bump(&self.counters.ephemeral_hits);
            return Ok(p);
        }

        if self.stored.read().contains(&id) {
            bump(&self.counters.stale_reads);
        } else {
            bump(&self.counters.bloom_false_positives);
        }
        bump(&self.counters.misses);
        Err(PatternError::NotFound(id))
    }

    /// Look `id` up in the indexed tiers without promoting, reordering or
    /// counting. Ephemeral entries are not indexed and are not consulted.
    pub fn peek(&self, id: u64) -> PatternResult<Option<Pattern>> {
        if let Some(p) = self.hot.read().peek(id)? {
            return Ok(Some(p));
        }
        if let Some(p) = self.warm.read().get(id) {
            return Ok(Some(p.clone()));
        }
        Ok(self.cold.read().get(id).cloned())
    }

    /// Drop `id` from the hot and warm tiers. The durable copy, if any, stays
    /// and remains readable. Returns true if either tier held it.
    pub fn evict(&self, id: u64) -> PatternResult<bool> {
        let from_hot = self.hot.write().remove(id)?;
        let from_warm = self.warm.write().remove(id).is_some();
        if from_hot || from_warm {
            bump(&self.counters.evictions);
        }
        Ok(from_hot || from_warm)
    }

    /// Store a transient entry in the ephemeral tier only. Not indexed.
    pub fn put_ephemeral(&self, mut pattern: Pattern) -> PatternResult<u64> {
        pattern.check_invariants()?;
        let id = self.assign_id(&mut pattern);
        self.admit_to_bloom(id);
        self.ephemeral.write().put(pattern);
        Ok(id)
    }

    pub fn remove_ephemeral(&self, id: u64) -> Option<Pattern> {
        self.ephemeral.write().remove(id)
    }

    pub fn clear_ephemeral(&self) {
        self.ephemeral.write().clear();
    }

    /// Import headers that external producers wrote straight into the hot
    /// region. Returns how many were new to this engine.
    pub fn sync_from_shared_region(&self) -> PatternResult<usize> {
        let imported = self.hot.write().sync()?;
        let count = imported.len();
        for pattern in &imported {
            let id = pattern.header.id;
            self.next_id.fetch_max(id.saturating_add(1), Ordering::SeqCst);
            if self.admit_to_bloom(id) {
                bump(&self.counters.total_patterns);
            }
            self.index.write().insert(pattern);
        }
        if count > 0 {
            self.counters
                .sync_imports
                .fetch_add(count as u64, Ordering::Relaxed);
            tracing::info!("imported {count} externally written pattern(s) from shared region");
        }
        Ok(count)
    }

    fn candidates(&self, query: &PatternQuery) -> Vec<u64> {
        let index = self.index.read();
        let raw: Vec<u64> = match query.candidate_source() {
            CandidateSource::Tags => query
                .tags
                .iter()
                .flat_map(|t| index.by_tag(t).iter().copied())
                .collect(),
            CandidateSource::Types => query
                .types
                .iter()
                .flat_map(|t| index.by_type(*t).iter().copied())
                .collect(),
            CandidateSource::Confidence => {
                index.with_min_confidence(query.min_confidence.unwrap_or(0))
            }
            CandidateSource::Sources => query
                .sources
                .iter()
                .flat_map(|s| index.by_source(*s).iter().copied())
                .collect(),
            CandidateSource::All => index.all_ids(),
        };
        let mut seen = HashSet::with_capacity(raw.len());
        raw.into_iter().filter(|id| seen.insert(*id)).collect()
    }

    /// Run a query. Indexed IDs that no tier still holds are skipped.
    ///
    /// Candidates are peeked, not read, so a query never promotes or evicts
    /// and repeating it against unchanged storage gives the same result.
    pub fn query(&self, query: &PatternQuery) -> PatternResult<Vec<Pattern>> {
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut results = Vec::new();
        for id in self.candidates(query) {
            if results.len() >= limit {
                break;
            }
            let Some(pattern) = self.peek(id)? else {
                continue;
            };
            if let Some(range) = &query.time_range {
                if !range.contains(pattern.header.timestamp) {
                    continue;
                }
            }
            results.push(pattern);
        }
        Ok(results)
    }

    /// Which tier currently answers for `id`, without promoting.
    pub fn locate(&self, id: u64) -> Option<Tier> {
        if self.hot.read().contains(id) {
            Some(Tier::Hot)
        } else if self.warm.read().contains(id) {
            Some(Tier::Warm)
        } else if self.cold.read().contains(id) {
            Some(Tier::Cold)
        } else {
            None
        }
    }

    /// Hot-tier IDs from least to most recently used.
    pub fn hot_lru_order(&self) -> Vec<u64> {
        self.hot.read().lru_order()
    }

    pub fn stats(&self) -> StorageStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        let hot = self.hot.read();
        StorageStats {
            hot_entries: hot.len(),
            hot_capacity: hot.capacity(),
            warm_entries: self.warm.read().len(),
            cold_entries: self.cold.read().len(),
            ephemeral_entries: self.ephemeral.read().len(),
            arena_used: hot.arena_used(),
            arena_capacity: hot.arena_capacity(),
            hot_hits: load(&c.hot_hits),
            warm_hits: load(&c.warm_hits),
            cold_hits: load(&c.cold_hits),
            ephemeral_hits: load(&c.ephemeral_hits),
            misses: load(&c.misses),
            bloom_negatives: load(&c.bloom_negatives),
            bloom_false_positives: load(&c.bloom_false_positives),
            stale_reads: load(&c.stale_reads),
            evictions: load(&c.evictions),
            promotions: load(&c.promotions),
            cascades: load(&c.cascades),
            sync_imports: load(&c.sync_imports),
            total_patterns: load(&c.total_patterns),
            bloom_fill_ratio: self.bloom.read().fill_ratio(),
        }
    }
}
