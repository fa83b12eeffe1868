//! Engine-wide analytics: counters, moving averages, a bounded snapshot
//! history and advisory anomaly flags.
//!
//! Cache and false-positive figures are read from [`StorageStats`] at
//! snapshot time; everything else is recorded by the engine as it runs.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::storage::StorageStats;
use crate::types::now_secs;

const HISTORY_CAPACITY: usize = 100;
const EMA_ALPHA: f64 = 0.1;

const MIN_CACHE_HIT_RATE: f64 = 0.8;
const MIN_SUCCESS_RATE: f64 = 0.7;
const MAX_FALSE_POSITIVE_RATE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    LowCacheHitRate,
    LowSuccessRate,
    HighFalsePositiveRate,
}

/// Advisory only; nothing acts on these automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsAnomaly {
    pub kind: AnomalyKind,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub taken_at: u64,
    pub patterns_detected: u64,
    pub patterns_applied: u64,
    pub application_rejections: u64,
    pub patterns_evolved: u64,
    pub generations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub false_positives: u64,
    pub total_patterns: u64,
    pub cache_hit_rate: f64,
    pub false_positive_rate: f64,
    /// Moving average of reported outcomes; `None` before any feedback.
    pub success_rate: Option<f64>,
    pub avg_improvement: Option<f64>,
}

/// Change between two consecutive snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDelta {
    pub elapsed_secs: u64,
    pub patterns_detected: u64,
    pub patterns_applied: u64,
    pub patterns_evolved: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub snapshot: AnalyticsSnapshot,
    pub delta: Option<SnapshotDelta>,
    pub anomalies: Vec<AnalyticsAnomaly>,
}

#[derive(Default)]
pub struct AnalyticsCollector {
    detected: u64,
    applied: u64,
    rejected: u64,
    evolved: u64,
    generations: u64,
    success_ema: Option<f64>,
    improvement_ema: Option<f64>,
    history: VecDeque<AnalyticsSnapshot>,
}

fn ema(current: Option<f64>, sample: f64) -> f64 {
    match current {
        Some(v) => v + EMA_ALPHA * (sample - v),
        None => sample,
    }
}

impl AnalyticsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_detected(&mut self, count: usize) {
        self.detected += count as u64;
    }

    pub fn record_application(&mut self, applied: bool) {
        if applied {
            self.applied += 1;
        } else {
            self.rejected += 1;
        }
    }

    pub fn record_generation(&mut self, evolved: usize) {
        self.generations += 1;
        self.evolved += evolved as u64;
    }

    pub fn record_outcome(&mut self, success: bool, improvement: f64) {
        self.success_ema = Some(ema(self.success_ema, if success { 1.0 } else { 0.0 }));
        self.improvement_ema = Some(ema(self.improvement_ema, improvement));
    }

    pub fn history(&self) -> impl Iterator<Item = &AnalyticsSnapshot> {
        self.history.iter()
    }

    pub fn snapshot(&mut self, storage: &StorageStats) -> AnalyticsReport {
        self.snapshot_at(storage, now_secs())
    }

    /// Record a snapshot, compare it to the previous one and flag anomalies.
    pub fn snapshot_at(&mut self, storage: &StorageStats, now: u64) -> AnalyticsReport {
        let snapshot = AnalyticsSnapshot {
            taken_at: now,
            patterns_detected: self.detected,
            patterns_applied: self.applied,
            application_rejections: self.rejected,
            patterns_evolved: self.evolved,
            generations: self.generations,
            cache_hits: storage.hits(),
            cache_misses: storage.misses,
            false_positives: storage.bloom_false_positives,
            total_patterns: storage.total_patterns,
            cache_hit_rate: storage.hit_rate(),
            false_positive_rate: storage.bloom_false_positive_rate(),
            success_rate: self.success_ema,
            avg_improvement: self.improvement_ema,
        };

        let delta = self.history.back().map(|prev| {
            let hits = snapshot.cache_hits.saturating_sub(prev.cache_hits);
            let misses = snapshot.cache_misses.saturating_sub(prev.cache_misses);
            SnapshotDelta {
                elapsed_secs: now.saturating_sub(prev.taken_at),
                patterns_detected: snapshot.patterns_detected.saturating_sub(prev.patterns_detected),
                patterns_applied: snapshot.patterns_applied.saturating_sub(prev.patterns_applied),
                patterns_evolved: snapshot.patterns_evolved.saturating_sub(prev.patterns_evolved),
                cache_hits: hits,
                cache_misses: misses,
                cache_hit_rate: if hits + misses == 0 {
                    1.0
                } else {
                    hits as f64 / (hits + misses) as f64
                },
            }
        });

        let anomalies = detect_anomalies(&snapshot);
        for a in &anomalies {
            tracing::warn!(
                "analytics anomaly {:?}: {:.3} (threshold {:.2})",
                a.kind,
                a.value,
                a.threshold
            );
        }

        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(snapshot.clone());

        AnalyticsReport {
            snapshot,
            delta,
            anomalies,
        }
    }
}

fn detect_anomalies(s: &AnalyticsSnapshot) -> Vec<AnalyticsAnomaly> {
    let mut out = Vec::new();
    if s.cache_hits + s.cache_misses > 0 && s.cache_hit_rate < MIN_CACHE_HIT_RATE {
        out.push(AnalyticsAnomaly {
            kind: AnomalyKind::LowCacheHitRate,
            value: s.cache_hit_rate,
            threshold: MIN_CACHE_HIT_RATE,
        });
    }
    if let Some(rate) = s.success_rate.filter(|r| *r < MIN_SUCCESS_RATE) {
        out.push(AnalyticsAnomaly {
            kind: AnomalyKind::LowSuccessRate,
            value: rate,
            threshold: MIN_SUCCESS_RATE,
        });
    }
    if s.false_positive_rate > MAX_FALSE_POSITIVE_RATE {
        out.push(AnalyticsAnomaly {
            kind: AnomalyKind::HighFalsePositiveRate,
            value: s.false_positive_rate,
            threshold: MAX_FALSE_POSITIVE_RATE,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(hits: u64, misses: u64, false_positives: u64) -> StorageStats {
        StorageStats {
            hot_hits: hits,
            misses,
            bloom_false_positives: false_positives,
            ..StorageStats::default()
        }
    }

    #[test]
    fn test_quiet_engine_has_no_anomalies() {
        let mut a = AnalyticsCollector::new();
        let report = a.snapshot_at(&storage(0, 0, 0), 100);
        assert!(report.anomalies.is_empty());
        assert!(report.delta.is_none());
        assert_eq!(report.snapshot.success_rate, None);
    }

    #[test]
    fn test_anomaly_flags() {
        let mut a = AnalyticsCollector::new();
        for _ in 0..5 {
            a.record_outcome(false, 0.0);
        }
        let report = a.snapshot_at(&storage(7, 3, 2), 100);
        let kinds: Vec<AnomalyKind> = report.anomalies.iter().map(|x| x.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AnomalyKind::LowCacheHitRate,
                AnomalyKind::LowSuccessRate,
                AnomalyKind::HighFalsePositiveRate
            ]
        );
    }

    #[test]
    fn test_moving_average() {
        let mut a = AnalyticsCollector::new();
        a.record_outcome(true, 0.5);
        a.record_outcome(false, 0.0);
        let s = a.snapshot_at(&storage(0, 0, 0), 1).snapshot;
        assert!((s.success_rate.unwrap() - 0.9).abs() < 1e-9);
        assert!((s.avg_improvement.unwrap() - 0.45).abs() < 1e-9);
    }

    #[test]
    fn test_deltas_and_bounded_history() {
        let mut a = AnalyticsCollector::new();
        a.snapshot_at(&storage(10, 0, 0), 100);
        a.record_detected(3);
        a.record_application(true);
        a.record_generation(2);
        let report = a.snapshot_at(&storage(18, 2, 0), 160);
        let delta = report.delta.unwrap();
        assert_eq!(delta.elapsed_secs, 60);
        assert_eq!(delta.patterns_detected, 3);
        assert_eq!(delta.patterns_applied, 1);
        assert_eq!(delta.patterns_evolved, 2);
        assert_eq!(delta.cache_hits, 8);
        assert!((delta.cache_hit_rate - 0.8).abs() < 1e-9);

        for t in 0..150 {
            a.snapshot_at(&storage(0, 0, 0), 200 + t);
        }
        assert_eq!(a.history().count(), HISTORY_CAPACITY);
    }
}
