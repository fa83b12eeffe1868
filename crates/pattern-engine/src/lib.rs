//! Pattern engine: a learned-pattern cache with tiered storage, detection,
//! genetic evolution and security gating.

pub mod analytics;
pub mod application;
pub mod arena;
pub mod bloom;
pub mod codec;
pub mod config;
pub mod detector;
pub mod engine;
pub mod evolution;
pub mod index;
pub mod query;
pub mod region;
pub mod security;
pub mod storage;
pub mod subscription;
pub mod types;

pub use analytics::{AnalyticsCollector, AnalyticsReport, AnalyticsSnapshot, AnomalyKind};
pub use application::{apply_pattern, ApplicationContext, ApplicationOutcome};
pub use bloom::BloomFilter;
pub use codec::{decode_header, encode_header, source_hash};
pub use config::{resolve_store_path, EngineConfig};
pub use detector::{Candidate, DetectionAlgorithm, DetectionReport, Observation, PatternDetector};
pub use engine::{run_evolution_loop, run_subscription_loop, spawn_background, PatternEngine};
pub use evolution::{EvolutionEngine, Feedback, Generation, MutationOperator};
pub use index::PatternIndex;
pub use query::{PatternQuery, TimeRange};
pub use region::{HeapRegion, MmapRegion, RegionLayout, SharedRegion};
pub use security::{
    SecurityDecision, SecurityEngine, SecurityRequest, SecurityValidator, Threat, ThreatKind,
    ValidationReport,
};
pub use storage::{StorageManager, StorageStats, Tier, WriteReceipt};
pub use subscription::{SubscriptionCallback, SubscriptionManager};
pub use types::*;
