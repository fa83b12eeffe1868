//! Multi-dimensional secondary indices over pattern IDs.
//!
//! Indices are derived and non-authoritative: they are only fed by live
//! writes and may reference IDs that every tier has since evicted. Callers
//! treat a failed read of an indexed ID as expected.

use std::collections::{HashMap, HashSet};

use crate::types::{Pattern, PatternType, MAX_COMPLEXITY};

/// Buckets per numeric dimension (width 10 over 0..=100, so 100 gets its own).
pub const BUCKET_COUNT: usize = 11;

/// Insertion-ordered ID list with constant-time duplicate checks.
#[derive(Debug, Default)]
struct IdList {
    ids: Vec<u64>,
    seen: HashSet<u64>,
}

impl IdList {
    fn push(&mut self, id: u64) {
        if self.seen.insert(id) {
            self.ids.push(id);
        }
    }

    fn as_slice(&self) -> &[u64] {
        &self.ids
    }
}

#[derive(Debug, Default)]
pub struct PatternIndex {
    by_type: HashMap<PatternType, IdList>,
    by_confidence: [IdList; BUCKET_COUNT],
    by_success: [IdList; BUCKET_COUNT],
    by_complexity: [IdList; BUCKET_COUNT],
    by_source: HashMap<u32, IdList>,
    by_tag: HashMap<String, IdList>,
}

/// Bucket for a 0..=100 percentage (clamped).
pub fn percent_bucket(value: u32) -> usize {
    ((value / 10) as usize).min(BUCKET_COUNT - 1)
}

fn rate_bucket(rate: f32) -> usize {
    let pct = (rate.clamp(0.0, 1.0) * 100.0).round() as u32;
    percent_bucket(pct)
}

impl PatternIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a written pattern in every dimension.
    pub fn insert(&mut self, pattern: &Pattern) {
        let h = &pattern.header;
        let id = h.id;

        self.by_type.entry(h.pattern_type).or_default().push(id);
        self.by_confidence[percent_bucket(h.confidence as u32)].push(id);
        self.by_success[rate_bucket(h.success_rate)].push(id);
        let complexity = h.complexity.min(MAX_COMPLEXITY) as usize;
        self.by_complexity[complexity].push(id);
        self.by_source.entry(h.source_hash).or_default().push(id);
        for tag in &pattern.body.metadata.tags {
            self.by_tag.entry(tag.clone()).or_default().push(id);
        }
    }

    pub fn by_type(&self, pattern_type: PatternType) -> &[u64] {
        self.by_type
            .get(&pattern_type)
            .map(IdList::as_slice)
            .unwrap_or(&[])
    }

    pub fn by_tag(&self, tag: &str) -> &[u64] {
        self.by_tag.get(tag).map(IdList::as_slice).unwrap_or(&[])
    }

    pub fn by_source(&self, source_hash: u32) -> &[u64] {
        self.by_source
            .get(&source_hash)
            .map(IdList::as_slice)
            .unwrap_or(&[])
    }

    /// IDs in every confidence bucket at or above the bucket of `min`.
    pub fn with_min_confidence(&self, min: u8) -> Vec<u64> {
        self.by_confidence[percent_bucket(min as u32)..]
            .iter()
            .flat_map(|list| list.ids.iter().copied())
            .collect()
    }

    /// IDs in every success-rate bucket at or above the bucket of `min`.
    pub fn with_min_success_rate(&self, min: f32) -> Vec<u64> {
        self.by_success[rate_bucket(min)..]
            .iter()
            .flat_map(|list| list.ids.iter().copied())
            .collect()
    }

    pub fn by_complexity(&self, complexity: u8) -> &[u64] {
        self.by_complexity[(complexity.min(MAX_COMPLEXITY)) as usize].as_slice()
    }

    /// Every indexed ID, in type order.
    pub fn all_ids(&self) -> Vec<u64> {
        let mut ids = IdList::default();
        for t in PatternType::ALL {
            for &id in self.by_type(t) {
                ids.push(id);
            }
        }
        ids.ids
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
