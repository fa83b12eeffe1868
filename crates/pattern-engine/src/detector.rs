//! Pattern detection over sliding observation windows.
//!
//! Three algorithms run independently over the same window snapshot, and
//! every one of them produces the same [`Candidate`] shape:
//!
//! - **Statistical**: overall success rate; one Atomic candidate at >= 70%.
//! - **Temporal**: hour-of-day buckets with a strongly skewed success rate.
//! - **Sequential**: repeated runs of three consecutive actions.
//!
//! Candidates then pass through the correlator (candidate -> full pattern),
//! the validator (magic, minimum confidence, maximum age) and the publisher
//! (write into storage).

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::source_hash;
use crate::config::DetectorConfig;
use crate::storage::StorageManager;
use crate::types::{
    now_secs, Pattern, PatternError, PatternFlags, PatternHeader, PatternMetrics, PatternResult,
    PatternType, PayloadEncoding, MAX_PAYLOAD_SIZE,
};

/// Success rate at or above which the statistical detector fires.
const STATISTICAL_THRESHOLD: f64 = 0.7;
/// Samples an hour bucket needs before it is considered.
const TEMPORAL_MIN_BUCKET: usize = 5;
const TEMPORAL_HIGH: f64 = 0.8;
const TEMPORAL_LOW: f64 = 0.2;
const SEQUENCE_LEN: usize = 3;
const SEQUENCE_MIN_REPEATS: usize = 3;

/// One observed outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Seconds since the epoch.
    pub timestamp: u64,
    pub success: bool,
    pub latency_ms: f64,
    pub cost: f64,
    pub improvement: f64,
    /// Free-form attributes; the sequential detector reads `"action"`.
    pub fields: HashMap<String, String>,
}

impl Observation {
    pub fn new(success: bool) -> Self {
        Self {
            timestamp: now_secs(),
            success,
            latency_ms: 0.0,
            cost: 0.0,
            improvement: 0.0,
            fields: HashMap::new(),
        }
    }

    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn improvement(mut self, improvement: f64) -> Self {
        self.improvement = improvement;
        self
    }

    pub fn action(self, action: &str) -> Self {
        self.field("action", action)
    }

    pub fn field(mut self, key: &str, value: &str) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }
}

/// Detection strategies, dispatched by `match`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionAlgorithm {
    Statistical,
    Temporal,
    Sequential,
}

impl DetectionAlgorithm {
    pub const ALL: [DetectionAlgorithm; 3] = [
        DetectionAlgorithm::Statistical,
        DetectionAlgorithm::Temporal,
        DetectionAlgorithm::Sequential,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Statistical => "statistical",
            Self::Temporal => "temporal",
            Self::Sequential => "sequential",
        }
    }

    pub fn detect(self, window: &[Observation], now: u64) -> Vec<Candidate> {
        match self {
            Self::Statistical => detect_statistical(window, now).into_iter().collect(),
            Self::Temporal => detect_temporal(window, now),
            Self::Sequential => detect_sequential(window, now),
        }
    }
}

/// A raw detection result, before correlation into a full pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub algorithm: DetectionAlgorithm,
    pub pattern_type: PatternType,
    /// 0..=100
    pub confidence: u8,
    pub success_rate: f32,
    pub samples: usize,
    pub detected_at: u64,
    pub payload: serde_json::Value,
}

fn success_rate(window: &[Observation]) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    window.iter().filter(|o| o.success).count() as f64 / window.len() as f64
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

fn to_percent(rate: f64) -> u8 {
    (rate.clamp(0.0, 1.0) * 100.0).round() as u8
}

fn detect_statistical(window: &[Observation], now: u64) -> Option<Candidate> {
    let rate = success_rate(window);
    if rate < STATISTICAL_THRESHOLD {
        return None;
    }
    Some(Candidate {
        algorithm: DetectionAlgorithm::Statistical,
        pattern_type: PatternType::Atomic,
        confidence: to_percent(rate),
        success_rate: rate as f32,
        samples: window.len(),
        detected_at: now,
        payload: serde_json::json!({
            "success_rate": rate,
            "avg_latency_ms": mean(window.iter().map(|o| o.latency_ms)),
            "avg_cost": mean(window.iter().map(|o| o.cost)),
        }),
    })
}

fn hour_of_day(ts: u64) -> Option<u32> {
    DateTime::<Utc>::from_timestamp(ts as i64, 0).map(|d| d.hour())
}

/// Confidence of a skewed bucket: distance from a coin flip, scaled to 0..=100.
fn skew_confidence(rate: f64) -> u8 {
    to_percent((rate - 0.5).abs() * 2.0)
}

fn detect_temporal(window: &[Observation], now: u64) -> Vec<Candidate> {
    let mut buckets: BTreeMap<u32, (usize, usize)> = BTreeMap::new();
    for obs in window {
        if let Some(hour) = hour_of_day(obs.timestamp) {
            let entry = buckets.entry(hour).or_default();
            entry.0 += 1;
            if obs.success {
                entry.1 += 1;
            }
        }
    }

    buckets
        .into_iter()
        .filter(|(_, (total, _))| *total >= TEMPORAL_MIN_BUCKET)
        .filter_map(|(hour, (total, successes))| {
            let rate = successes as f64 / total as f64;
            if rate <= TEMPORAL_HIGH && rate >= TEMPORAL_LOW {
                return None;
            }
            Some(Candidate {
                algorithm: DetectionAlgorithm::Temporal,
                pattern_type: PatternType::Temporal,
                confidence: skew_confidence(rate),
                success_rate: rate as f32,
                samples: total,
                detected_at: now,
                payload: serde_json::json!({
                    "hour": hour,
                    "success_rate": rate,
                    "favorable": rate > TEMPORAL_HIGH,
                }),
            })
        })
        .collect()
}

fn detect_sequential(window: &[Observation], now: u64) -> Vec<Candidate> {
    let actions: Vec<&str> = window
        .iter()
        .filter_map(|o| o.fields.get("action").map(String::as_str))
        .collect();
    if actions.len() < SEQUENCE_LEN {
        return Vec::new();
    }

    let mut counts: BTreeMap<Vec<&str>, usize> = BTreeMap::new();
    for seq in actions.windows(SEQUENCE_LEN) {
        *counts.entry(seq.to_vec()).or_default() += 1;
    }

    counts
        .into_iter()
        .filter(|(_, freq)| *freq >= SEQUENCE_MIN_REPEATS)
        .map(|(sequence, freq)| Candidate {
            algorithm: DetectionAlgorithm::Sequential,
            pattern_type: PatternType::Sequential,
            confidence: (freq * 10).min(100) as u8,
            success_rate: success_rate(window) as f32,
            samples: freq,
            detected_at: now,
            payload: serde_json::json!({
                "sequence": sequence,
                "frequency": freq,
            }),
        })
        .collect()
}

/// Why a candidate was not published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub algorithm: DetectionAlgorithm,
    pub confidence: u8,
    pub reason: String,
}

/// Result of a detect-and-publish pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub published: Vec<u64>,
    pub rejected: Vec<Rejection>,
}

pub struct PatternDetector {
    config: DetectorConfig,
    source_hash: u32,
    windows: HashMap<String, VecDeque<Observation>>,
}

impl PatternDetector {
    pub fn new(config: DetectorConfig, source: &str) -> Self {
        Self {
            config,
            source_hash: source_hash(source),
            windows: HashMap::new(),
        }
    }

    /// Append to the window for `key`, dropping the oldest sample at capacity.
    pub fn observe(&mut self, key: &str, observation: Observation) {
        let cap = self.config.window_capacity.max(1);
        let window = self.windows.entry(key.to_string()).or_default();
        window.push_back(observation);
        while window.len() > cap {
            window.pop_front();
        }
    }

    pub fn window_len(&self, key: &str) -> usize {
        self.windows.get(key).map(VecDeque::len).unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.windows.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Run every algorithm over the current window. Windows below the minimum
    /// sample count yield nothing.
    pub fn detect(&self, key: &str) -> Vec<Candidate> {
        let Some(window) = self.windows.get(key) else {
            return Vec::new();
        };
        if window.len() < self.config.min_samples {
            return Vec::new();
        }
        let snapshot: Vec<Observation> = window.iter().cloned().collect();
        let now = now_secs();
        DetectionAlgorithm::ALL
            .iter()
            .flat_map(|algo| algo.detect(&snapshot, now))
            .collect()
    }

    /// Promote a candidate into a full pattern record. Fails if the encoded
    /// payload does not fit in a pattern body.
    pub fn correlate(&self, key: &str, candidate: &Candidate) -> PatternResult<Pattern> {
        let mut header = PatternHeader::new(candidate.pattern_type);
        header.confidence = candidate.confidence.min(100);
        header.success_rate = candidate.success_rate.clamp(0.0, 1.0);
        header.weight = 1.0;
        header.source_hash = self.source_hash;
        header.timestamp = candidate.detected_at;
        header.complexity = match candidate.algorithm {
            DetectionAlgorithm::Statistical => 1,
            DetectionAlgorithm::Temporal => 2,
            DetectionAlgorithm::Sequential => SEQUENCE_LEN as u8,
        };
        header.flags = PatternFlags(PatternFlags::ACTIVE);
        if candidate.pattern_type == PatternType::Temporal {
            header.flags.insert(PatternFlags::TEMPORAL);
        }

        let payload = serde_json::to_vec(&candidate.payload)
            .map_err(|e| PatternError::SerializationFailed(e.to_string()))?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PatternError::InvalidPattern(format!(
                "encoded payload of {} bytes exceeds {MAX_PAYLOAD_SIZE}",
                payload.len()
            )));
        }
        header.payload_size = payload.len() as u16;

        let mut pattern = Pattern {
            header,
            body: Default::default(),
        };
        pattern.body.encoding = PayloadEncoding::Json;
        pattern.body.payload = payload;
        pattern.body.metadata.tags = vec![key.to_string(), candidate.algorithm.as_str().to_string()];
        pattern.body.metadata.metrics.applications = candidate.samples as u64;
        Ok(pattern)
    }

    /// Check a correlated pattern before publication.
    pub fn validate(&self, pattern: &Pattern, now: u64) -> Result<(), String> {
        let h = &pattern.header;
        if !h.has_valid_magic() {
            return Err("magic mismatch".to_string());
        }
        if h.confidence < self.config.min_confidence {
            return Err(format!(
                "confidence {} below minimum {}",
                h.confidence, self.config.min_confidence
            ));
        }
        let age = now.saturating_sub(h.timestamp);
        if age > self.config.max_age_secs {
            return Err(format!(
                "candidate is {age}s old, maximum {}s",
                self.config.max_age_secs
            ));
        }
        Ok(())
    }

    /// Detect on `key`, then correlate, validate and publish into storage.
    pub fn detect_and_publish(
        &self,
        key: &str,
        storage: &StorageManager,
    ) -> PatternResult<DetectionReport> {
        let now = now_secs();
        let mut report = DetectionReport::default();
        for candidate in self.detect(key) {
            let checked = self
                .correlate(key, &candidate)
                .map_err(|e| e.to_string())
                .and_then(|p| self.validate(&p, now).map(|()| p));
            let pattern = match checked {
                Ok(p) => p,
                Err(reason) => {
                    tracing::debug!(
                        "{} candidate for {key} rejected: {reason}",
                        candidate.algorithm.as_str()
                    );
                    report.rejected.push(Rejection {
                        algorithm: candidate.algorithm,
                        confidence: candidate.confidence,
                        reason,
                    });
                    continue;
                }
            };
            let receipt = storage.write(pattern)?;
            report.published.push(receipt.id);
        }
        if !report.published.is_empty() {
            tracing::info!(
                "published {} pattern(s) for {key}, rejected {}",
                report.published.len(),
                report.rejected.len()
            );
        }
        Ok(report)
    }

    /// Aggregate a batch of observations directly into one Atomic pattern.
    pub fn create_pattern_from_observations(
        &self,
        observations: &[Observation],
    ) -> PatternResult<Pattern> {
        if observations.is_empty() {
            return Err(PatternError::InvalidPattern(
                "cannot build a pattern from zero observations".to_string(),
            ));
        }
        let n = observations.len();
        let successes = observations.iter().filter(|o| o.success).count();
        let rate = successes as f64 / n as f64;
        let avg_latency = mean(observations.iter().map(|o| o.latency_ms));
        let avg_cost = mean(observations.iter().map(|o| o.cost));
        let avg_improvement = mean(observations.iter().map(|o| o.improvement));

        let mut pattern = Pattern::new(PatternType::Atomic, Vec::new())
            .with_confidence(to_percent(rate))
            .with_success_rate(rate as f32)
            .with_source(self.source_hash)
            .with_encoding(PayloadEncoding::Json);
        pattern.body.payload = serde_json::to_vec(&serde_json::json!({
            "samples": n,
            "avg_cost": avg_cost,
        }))
        .map_err(|e| PatternError::SerializationFailed(e.to_string()))?;
        pattern.header.payload_size = pattern.body.payload.len() as u16;
        pattern.body.metadata.metrics = PatternMetrics {
            applications: n as u64,
            successes: successes as u64,
            failures: (n - successes) as u64,
            avg_improvement,
            avg_latency_ms: avg_latency,
            cost_savings: 0.0,
            last_applied: observations.iter().map(|o| o.timestamp).max(),
        };
        Ok(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    /// 2024-01-01T00:00:00Z
    const MIDNIGHT: u64 = 1_704_067_200;

    fn detector() -> PatternDetector {
        PatternDetector::new(DetectorConfig::default(), "test")
    }

    fn feed(d: &mut PatternDetector, key: &str, outcomes: &[bool], start: u64) {
        for (i, &ok) in outcomes.iter().enumerate() {
            d.observe(key, Observation::new(ok).at(start + i as u64));
        }
    }

    #[test]
    fn test_below_minimum_samples_yields_nothing() {
        let mut d = detector();
        feed(&mut d, "k", &[true, true], MIDNIGHT);
        assert!(d.detect("k").is_empty());
        assert!(d.detect("missing").is_empty());
    }

    #[test]
    fn test_statistical_threshold() {
        let mut d = detector();
        let mut outcomes = vec![true; 7];
        outcomes.extend([false; 3]);
        feed(&mut d, "k", &outcomes, MIDNIGHT);
        let stats: Vec<_> = d
            .detect("k")
            .into_iter()
            .filter(|c| c.algorithm == DetectionAlgorithm::Statistical)
            .collect();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].confidence, 70);
        assert_eq!(stats[0].pattern_type, PatternType::Atomic);

        let mut d = detector();
        let mut outcomes = vec![true; 6];
        outcomes.extend([false; 4]);
        feed(&mut d, "k", &outcomes, MIDNIGHT);
        assert!(d
            .detect("k")
            .iter()
            .all(|c| c.algorithm != DetectionAlgorithm::Statistical));
    }

    #[test]
    fn test_temporal_buckets() {
        let mut d = detector();
        // 03:00 all failures, 14:00 mixed.
        feed(&mut d, "k", &[false; 6], MIDNIGHT + 3 * 3600);
        feed(&mut d, "k", &[true, false, true, false, true, false], MIDNIGHT + 14 * 3600);
        let temporal: Vec<_> = d
            .detect("k")
            .into_iter()
            .filter(|c| c.algorithm == DetectionAlgorithm::Temporal)
            .collect();
        assert_eq!(temporal.len(), 1);
        assert_eq!(temporal[0].payload["hour"], 3);
        assert_eq!(temporal[0].payload["favorable"], false);
        assert_eq!(temporal[0].confidence, 100);
    }

    #[test]
    fn test_sequential_repeats() {
        let mut d = detector();
        for i in 0..4 {
            for (j, a) in ["open", "read", "close"].iter().enumerate() {
                d.observe("k", Observation::new(true).at(MIDNIGHT + i * 3 + j as u64).action(a));
            }
        }
        let seqs: Vec<_> = d
            .detect("k")
            .into_iter()
            .filter(|c| c.algorithm == DetectionAlgorithm::Sequential)
            .collect();
        // open-read-close x4, read-close-open x3, close-open-read x3
        assert_eq!(seqs.len(), 3);
        let top = seqs
            .iter()
            .find(|c| c.payload["sequence"] == serde_json::json!(["open", "read", "close"]))
            .unwrap();
        assert_eq!(top.payload["frequency"], 4);
        assert_eq!(top.confidence, 40);
    }

    #[test]
    fn test_window_is_capped() {
        let cfg = DetectorConfig {
            window_capacity: 5,
            ..DetectorConfig::default()
        };
        let mut d = PatternDetector::new(cfg, "test");
        feed(&mut d, "k", &[true; 12], MIDNIGHT);
        assert_eq!(d.window_len("k"), 5);
    }

    #[test]
    fn test_correlate_and_validate() {
        let d = detector();
        let now = now_secs();
        let candidate = Candidate {
            algorithm: DetectionAlgorithm::Temporal,
            pattern_type: PatternType::Temporal,
            confidence: 90,
            success_rate: 0.95,
            samples: 20,
            detected_at: now,
            payload: serde_json::json!({ "hour": 5 }),
        };
        let p = d.correlate("jobs", &candidate).unwrap();
        assert!(p.header.has_valid_magic());
        assert_eq!(p.header.weight, 1.0);
        assert!(p.header.flags.is_active());
        assert!(p.header.flags.contains(PatternFlags::TEMPORAL));
        assert_eq!(p.body.metadata.tags, vec!["jobs", "temporal"]);
        assert!(d.validate(&p, now).is_ok());

        let weak = d
            .correlate("jobs", &Candidate { confidence: 69, ..candidate.clone() })
            .unwrap();
        assert!(d.validate(&weak, now).is_err());

        let stale = d
            .correlate(
                "jobs",
                &Candidate {
                    detected_at: now - 25 * 3600,
                    ..candidate
                },
            )
            .unwrap();
        assert!(d.validate(&stale, now).unwrap_err().contains("old"));
    }

    #[test]
    fn test_oversized_payload_is_rejected_not_cut() {
        let storage = StorageManager::open(&StorageConfig::default()).unwrap();
        let mut d = detector();
        let now = now_secs();
        let long: Vec<String> = ["a", "b", "c"].iter().map(|c| c.repeat(600)).collect();
        for i in 0..12 {
            d.observe(
                "long",
                Observation::new(true).at(now - 12 + i as u64).action(&long[i % 3]),
            );
        }

        let report = d.detect_and_publish("long", &storage).unwrap();
        assert!(!report.published.is_empty());
        let sequential: Vec<&Rejection> = report
            .rejected
            .iter()
            .filter(|r| r.algorithm == DetectionAlgorithm::Sequential)
            .collect();
        assert_eq!(sequential.len(), 3);
        assert!(sequential.iter().all(|r| r.reason.contains("exceeds")));

        for id in report.published {
            let p = storage.read(id).unwrap();
            assert!(serde_json::from_slice::<serde_json::Value>(&p.body.payload).is_ok());
        }
    }

    #[test]
    fn test_detect_and_publish() {
        let storage = StorageManager::open(&StorageConfig::default()).unwrap();
        let mut d = detector();
        let now = now_secs();
        feed(&mut d, "deploys", &[true; 10], now - 10);
        let report = d.detect_and_publish("deploys", &storage).unwrap();
        assert!(!report.published.is_empty());
        let stored = storage.read(report.published[0]).unwrap();
        assert!(stored.body.metadata.tags.contains(&"deploys".to_string()));
    }

    #[test]
    fn test_create_pattern_from_observations() {
        let d = detector();
        let obs = vec![
            Observation::new(true).latency(10.0).cost(1.0),
            Observation::new(false).latency(20.0).cost(2.0),
        ];
        let p = d.create_pattern_from_observations(&obs).unwrap();
        assert_eq!(p.header.confidence, 50);
        assert_eq!(p.header.success_rate, 0.5);
        assert_eq!(p.body.metadata.metrics.avg_latency_ms, 15.0);
        assert_eq!(p.body.metadata.metrics.successes, 1);
        assert_eq!(p.body.metadata.metrics.failures, 1);
        let payload: serde_json::Value = serde_json::from_slice(&p.body.payload).unwrap();
        assert_eq!(payload["avg_cost"], 1.5);
        assert!(d.create_pattern_from_observations(&[]).is_err());
    }
}
