//! Request-level security gate.

use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::forest::{is_finite, IsolationForest};
use super::{threat_score, Threat, ThreatKind};
use crate::config::SecurityConfig;

/// One request to be screened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityRequest {
    pub source: String,
    pub payload: Option<serde_json::Value>,
    /// Feature vector for anomaly scoring; empty skips scoring.
    pub features: Vec<f64>,
}

impl SecurityRequest {
    pub fn new(source: &str, payload: serde_json::Value) -> Self {
        Self {
            source: source.to_string(),
            payload: Some(payload),
            features: Vec::new(),
        }
    }

    pub fn with_features(mut self, features: Vec<f64>) -> Self {
        self.features = features;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityDecision {
    pub allowed: bool,
    pub threats: Vec<Threat>,
    pub threat_score: f64,
    /// Isolation-forest score, when a model is trained and features given.
    pub anomaly_score: Option<f64>,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct SecurityEngine {
    config: SecurityConfig,
    /// Bounded by `rate_limit_max_sources`, least recently seen dropped.
    buckets: LruCache<String, TokenBucket>,
    forest: Option<IsolationForest>,
    rng: StdRng,
}

impl SecurityEngine {
    pub fn new(config: SecurityConfig) -> Self {
        let rng = match config.forest_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let max_sources =
            NonZeroUsize::new(config.rate_limit_max_sources).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            buckets: LruCache::new(max_sources),
            forest: None,
            rng,
        }
    }

    /// Take one token for `source`, refilling by elapsed time first.
    pub fn try_acquire(&mut self, source: &str) -> bool {
        self.try_acquire_at(source, Instant::now())
    }

    pub fn try_acquire_at(&mut self, source: &str, now: Instant) -> bool {
        let capacity = self.config.rate_limit_capacity;
        let refill = self.config.rate_limit_refill_per_sec;
        let bucket = self
            .buckets
            .get_or_insert_mut(source.to_string(), || TokenBucket {
                tokens: capacity,
                last_refill: now,
            });
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill).min(capacity);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Sources currently holding a token bucket.
    pub fn tracked_sources(&self) -> usize {
        self.buckets.len()
    }

    /// Fit the anomaly model. Non-finite vectors are dropped. Returns false
    /// if there were too few usable samples.
    pub fn train_anomaly_model(&mut self, samples: &[Vec<f64>]) -> bool {
        let rejected = samples.iter().filter(|s| !is_finite(s)).count();
        if rejected > 0 {
            tracing::warn!("anomaly training ignores {rejected} non-finite sample(s)");
        }
        self.forest = IsolationForest::fit(
            samples,
            self.config.forest_trees,
            self.config.forest_sample_size,
            &mut self.rng,
        );
        match &self.forest {
            Some(f) => {
                tracing::info!(
                    "anomaly model trained: {} trees over {} samples",
                    f.tree_count(),
                    samples.len() - rejected
                );
                true
            }
            None => {
                tracing::warn!("anomaly model not trained: {} sample(s)", samples.len());
                false
            }
        }
    }

    pub fn has_anomaly_model(&self) -> bool {
        self.forest.is_some()
    }

    /// `None` without a model, for empty features, or for non-finite ones.
    pub fn anomaly_score(&self, features: &[f64]) -> Option<f64> {
        if features.is_empty() || !is_finite(features) {
            return None;
        }
        self.forest.as_ref().map(|f| f.score(features))
    }

    pub fn check_request(&mut self, request: &SecurityRequest) -> SecurityDecision {
        self.check_request_at(request, Instant::now())
    }

    pub fn check_request_at(&mut self, request: &SecurityRequest, now: Instant) -> SecurityDecision {
        let mut threats = Vec::new();

        if request.source.is_empty() {
            threats.push(Threat::new(ThreatKind::MalformedInput, 0.5, "empty source"));
        }
        if request.payload.as_ref().map_or(true, serde_json::Value::is_null) {
            threats.push(Threat::new(ThreatKind::MalformedInput, 0.5, "null payload"));
        }
        if !is_finite(&request.features) {
            threats.push(Threat::new(
                ThreatKind::MalformedInput,
                0.5,
                "non-finite feature value",
            ));
        }
        if !self.try_acquire_at(&request.source, now) {
            threats.push(Threat::new(
                ThreatKind::RateLimitExceeded,
                0.7,
                format!("rate limit exceeded for {}", request.source),
            ));
        }

        let anomaly_score = self.anomaly_score(&request.features);
        if let Some(score) = anomaly_score {
            if score > self.config.anomaly_threshold {
                threats.push(Threat::new(
                    ThreatKind::Anomaly,
                    score,
                    format!("anomaly score {score:.3}"),
                ));
            }
        }

        let score = threat_score(&threats);
        if !threats.is_empty() {
            tracing::warn!(
                "request from {:?} denied: {} threat(s), score {score:.2}",
                request.source,
                threats.len()
            );
        }
        SecurityDecision {
            allowed: threats.is_empty(),
            threats,
            threat_score: score,
            anomaly_score,
        }
    }
}
