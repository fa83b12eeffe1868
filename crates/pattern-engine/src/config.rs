//! Configuration loading and resolution.
//!
//! Layering: [`EngineConfig::default`] -> optional JSON file
//! ([`EngineConfig::load`]) -> `PATTERN_ENGINE_*` environment overrides
//! ([`EngineConfig::apply_env`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bloom::DEFAULT_NUM_BITS;
use crate::region::RegionLayout;
use crate::types::{PatternError, PatternResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub hot_capacity: usize,
    pub arena_bytes: usize,
    pub warm_capacity: usize,
    pub ephemeral_capacity: usize,
    /// Durable store file. `None` keeps the cold tier in memory.
    pub cold_path: Option<PathBuf>,
    pub bloom_bits: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            hot_capacity: 1024,
            arena_bytes: 4 * 1024 * 1024,
            warm_capacity: 10_000,
            ephemeral_capacity: 256,
            cold_path: None,
            bloom_bits: DEFAULT_NUM_BITS,
        }
    }
}

impl StorageConfig {
    pub fn layout(&self) -> RegionLayout {
        RegionLayout::new(self.hot_capacity, self.arena_bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub window_capacity: usize,
    pub min_samples: usize,
    /// Candidates below this confidence are not published.
    pub min_confidence: u8,
    /// Candidates older than this are not published.
    pub max_age_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_capacity: 1000,
            min_samples: 10,
            min_confidence: 70,
            max_age_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub top_k: usize,
    pub mutation_rate: f64,
    /// Fixed seed for reproducible runs.
    pub seed: Option<u64>,
    pub interval_secs: u64,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            mutation_rate: 0.1,
            seed: None,
            interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Source names trusted from the start (hashed with
    /// [`crate::codec::source_hash`]).
    pub trusted_sources: Vec<String>,
    /// Patterns expiring sooner than this are treated as logic bombs.
    pub suspicious_expiry_secs: u64,
    pub rate_limit_capacity: f64,
    pub rate_limit_refill_per_sec: f64,
    /// Most sources with a live token bucket; the least recently seen is
    /// dropped past this and starts over with a full bucket.
    pub rate_limit_max_sources: usize,
    pub anomaly_threshold: f64,
    pub forest_trees: usize,
    pub forest_sample_size: usize,
    /// Fixed seed for the anomaly forest.
    pub forest_seed: Option<u64>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            trusted_sources: Vec::new(),
            suspicious_expiry_secs: 15 * 60,
            rate_limit_capacity: 100.0,
            rate_limit_refill_per_sec: 10.0,
            rate_limit_max_sources: 10_000,
            anomaly_threshold: 0.65,
            forest_trees: 100,
            forest_sample_size: 256,
            forest_seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name this engine publishes its own patterns under. Always trusted.
    pub source: String,
    pub storage: StorageConfig,
    pub detector: DetectorConfig,
    pub evolution: EvolutionConfig,
    pub security: SecurityConfig,
    pub subscription_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source: "pattern-engine".to_string(),
            storage: StorageConfig::default(),
            detector: DetectorConfig::default(),
            evolution: EvolutionConfig::default(),
            security: SecurityConfig::default(),
            subscription_tick_ms: 100,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> PatternResult<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| PatternError::SerializationFailed(format!("{}: {e}", path.display())))
    }

    /// Apply `PATTERN_ENGINE_*` environment overrides.
    pub fn apply_env(mut self) -> Self {
        let s = &mut self.storage;
        s.hot_capacity = read_env_usize("PATTERN_ENGINE_HOT_CAPACITY", s.hot_capacity).max(1);
        s.arena_bytes = read_env_usize("PATTERN_ENGINE_ARENA_BYTES", s.arena_bytes);
        s.warm_capacity = read_env_usize("PATTERN_ENGINE_WARM_CAPACITY", s.warm_capacity);
        s.ephemeral_capacity =
            read_env_usize("PATTERN_ENGINE_EPHEMERAL_CAPACITY", s.ephemeral_capacity).max(1);
        s.bloom_bits = read_env_usize("PATTERN_ENGINE_BLOOM_BITS", s.bloom_bits);
        if let Some(path) = read_env_string("PATTERN_ENGINE_STORE").filter(|p| !p.is_empty()) {
            s.cold_path = Some(PathBuf::from(path));
        }

        let e = &mut self.evolution;
        e.top_k = read_env_usize("PATTERN_ENGINE_EVOLUTION_TOP_K", e.top_k).max(1);
        e.mutation_rate = read_env_f64("PATTERN_ENGINE_MUTATION_RATE", e.mutation_rate).clamp(0.0, 1.0);
        e.interval_secs = read_env_u64("PATTERN_ENGINE_EVOLUTION_SECS", e.interval_secs).max(1);
        if let Some(seed) = read_env_string("PATTERN_ENGINE_SEED").and_then(|v| v.parse().ok()) {
            e.seed = Some(seed);
        }

        let sec = &mut self.security;
        sec.rate_limit_capacity =
            read_env_f64("PATTERN_ENGINE_RATE_LIMIT_CAPACITY", sec.rate_limit_capacity);
        sec.rate_limit_refill_per_sec =
            read_env_f64("PATTERN_ENGINE_RATE_LIMIT_REFILL", sec.rate_limit_refill_per_sec);
        if let Some(list) = read_env_string("PATTERN_ENGINE_TRUSTED_SOURCES") {
            sec.trusted_sources.extend(
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from),
            );
        }

        self.subscription_tick_ms =
            read_env_u64("PATTERN_ENGINE_SUBSCRIPTION_TICK_MS", self.subscription_tick_ms).max(1);
        if let Some(source) = read_env_string("PATTERN_ENGINE_SOURCE").filter(|s| !s.is_empty()) {
            self.source = source;
        }
        self
    }

    pub fn subscription_tick(&self) -> Duration {
        Duration::from_millis(self.subscription_tick_ms)
    }

    pub fn evolution_interval(&self) -> Duration {
        Duration::from_secs(self.evolution.interval_secs)
    }
}

/// Resolve the durable store path.
///
/// Explicit path, then `PATTERN_ENGINE_STORE`, then `./.patterns/cold.json`
/// if it exists, then `~/.pattern-engine/cold.json`.
pub fn resolve_store_path(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    if let Some(env_path) = read_env_string("PATTERN_ENGINE_STORE").filter(|p| !p.is_empty()) {
        return PathBuf::from(env_path);
    }

    let cwd_store = PathBuf::from(".patterns/cold.json");
    if cwd_store.exists() {
        return cwd_store;
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pattern-engine")
        .join("cold.json")
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_usize(name: &str, default_value: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default_value)
}

fn read_env_f64(name: &str, default_value: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default_value)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string())
}
