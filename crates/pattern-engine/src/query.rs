//! Builder-style pattern filter.
//!
//! Candidate selection uses the first non-empty filter category, in the order
//! tags, types, minimum confidence, sources. Categories after the first one
//! supplied are not intersected; only the time range and limit are applied
//! on top. With no category at all, every indexed pattern is a candidate.

use serde::{Deserialize, Serialize};

use crate::types::PatternType;

/// Inclusive range over header timestamps (seconds since the epoch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: u64,
    pub end: u64,
}

impl TimeRange {
    /// True if `ts` lies within the range, both ends included.
    pub fn contains(&self, ts: u64) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// A filter over stored patterns. Build with the chained setters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternQuery {
    pub types: Vec<PatternType>,
    /// Matched at bucket granularity (tens).
    pub min_confidence: Option<u8>,
    pub tags: Vec<String>,
    pub sources: Vec<u32>,
    pub time_range: Option<TimeRange>,
    pub limit: Option<usize>,
}

/// Which index dimension a query draws its candidates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Tags,
    Types,
    Confidence,
    Sources,
    All,
}

impl PatternQuery {
    /// An empty query: every indexed pattern matches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pattern type to match.
    pub fn with_type(mut self, pattern_type: PatternType) -> Self {
        self.types.push(pattern_type);
        self
    }

    /// Require at least this confidence.
    pub fn min_confidence(mut self, confidence: u8) -> Self {
        self.min_confidence = Some(confidence);
        self
    }

    /// Add a tag to match.
    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    /// Add a producer source hash to match.
    pub fn with_source(mut self, source_hash: u32) -> Self {
        self.sources.push(source_hash);
        self
    }

    /// Keep only patterns whose timestamp lies in `start..=end`.
    pub fn between(mut self, start: u64, end: u64) -> Self {
        self.time_range = Some(TimeRange { start, end });
        self
    }

    /// Stop after this many results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn candidate_source(&self) -> CandidateSource {
        if !self.tags.is_empty() {
            CandidateSource::Tags
        } else if !self.types.is_empty() {
            CandidateSource::Types
        } else if self.min_confidence.is_some() {
            CandidateSource::Confidence
        } else if !self.sources.is_empty() {
            CandidateSource::Sources
        } else {
            CandidateSource::All
        }
    }
}
