//! The engine facade. Owns every component; each sits behind its own lock.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::analytics::{AnalyticsCollector, AnalyticsReport};
use crate::application::{apply_pattern, ApplicationContext, ApplicationOutcome};
use crate::codec::source_hash;
use crate::config::EngineConfig;
use crate::detector::{Candidate, DetectionReport, Observation, PatternDetector};
use crate::evolution::{EvolutionEngine, Feedback, Generation};
use crate::query::PatternQuery;
use crate::region::SharedRegion;
use crate::security::{
    SecurityDecision, SecurityEngine, SecurityRequest, SecurityValidator, ValidationReport,
};
use crate::storage::{StorageManager, StorageStats, WriteReceipt};
use crate::subscription::{self, SubscriptionCallback, SubscriptionManager, SubscriptionStats};
use crate::types::{now_secs, Pattern, PatternError, PatternFlags, PatternResult};

pub struct PatternEngine {
    config: EngineConfig,
    source_hash: u32,
    storage: StorageManager,
    detector: RwLock<PatternDetector>,
    evolution: RwLock<EvolutionEngine>,
    validator: RwLock<SecurityValidator>,
    security: RwLock<SecurityEngine>,
    subscriptions: RwLock<SubscriptionManager>,
    analytics: RwLock<AnalyticsCollector>,
}

impl PatternEngine {
    pub fn open(config: EngineConfig) -> PatternResult<Self> {
        let storage = StorageManager::open(&config.storage)?;
        Ok(Self::assemble(config, storage))
    }

    /// Open over a hot-tier region shared with external producers.
    pub fn with_region(config: EngineConfig, region: Arc<dyn SharedRegion>) -> PatternResult<Self> {
        let storage = StorageManager::with_region(&config.storage, region)?;
        Ok(Self::assemble(config, storage))
    }

    fn assemble(config: EngineConfig, storage: StorageManager) -> Self {
        let own_source = source_hash(&config.source);
        let mut validator = SecurityValidator::new(&config.security);
        validator.trust_source(own_source);
        tracing::info!(
            "pattern engine ready: source={} (0x{own_source:08X}), {} trusted source(s)",
            config.source,
            validator.trusted_count()
        );
        Self {
            source_hash: own_source,
            storage,
            detector: RwLock::new(PatternDetector::new(config.detector.clone(), &config.source)),
            evolution: RwLock::new(EvolutionEngine::new(config.evolution.clone())),
            validator: RwLock::new(validator),
            security: RwLock::new(SecurityEngine::new(config.security.clone())),
            subscriptions: RwLock::new(SubscriptionManager::new()),
            analytics: RwLock::new(AnalyticsCollector::new()),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Hash this engine's own patterns carry.
    pub fn source_hash(&self) -> u32 {
        self.source_hash
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    // -- security ---------------------------------------------------------

    pub fn trust_source(&self, hash: u32) {
        self.validator.write().trust_source(hash);
    }

    pub fn revoke_source(&self, hash: u32) -> bool {
        self.validator.write().revoke_source(hash)
    }

    pub fn is_trusted(&self, hash: u32) -> bool {
        self.validator.read().is_trusted(hash)
    }

    pub fn validate_pattern(&self, pattern: &Pattern) -> ValidationReport {
        self.validator.read().validate_pattern(pattern)
    }

    pub fn check_request(&self, request: &SecurityRequest) -> SecurityDecision {
        self.security.write().check_request(request)
    }

    pub fn train_anomaly_model(&self, samples: &[Vec<f64>]) -> bool {
        self.security.write().train_anomaly_model(samples)
    }

    // -- storage ----------------------------------------------------------

    /// Validate an externally produced pattern and store it as trusted.
    pub fn submit_pattern(&self, mut pattern: Pattern) -> PatternResult<WriteReceipt> {
        self.validate_pattern(&pattern).into_result()?;
        pattern
            .header
            .flags
            .insert(PatternFlags::TRUSTED | PatternFlags::VALIDATED);
        self.storage.write(pattern)
    }

    pub fn read(&self, id: u64) -> PatternResult<Pattern> {
        self.storage.read(id)
    }

    pub fn query(&self, query: &PatternQuery) -> PatternResult<Vec<Pattern>> {
        self.storage.query(query)
    }

    pub fn sync_from_shared_region(&self) -> PatternResult<usize> {
        self.storage.sync_from_shared_region()
    }

    pub fn stats(&self) -> StorageStats {
        self.storage.stats()
    }

    // -- detection --------------------------------------------------------

    pub fn observe(&self, key: &str, observation: Observation) {
        self.detector.write().observe(key, observation);
    }

    pub fn detect(&self, key: &str) -> Vec<Candidate> {
        self.detector.read().detect(key)
    }

    pub fn detect_and_publish(&self, key: &str) -> PatternResult<DetectionReport> {
        let report = self.detector.read().detect_and_publish(key, &self.storage)?;
        self.analytics.write().record_detected(report.published.len());
        Ok(report)
    }

    pub fn create_pattern_from_observations(
        &self,
        observations: &[Observation],
    ) -> PatternResult<Pattern> {
        self.detector
            .read()
            .create_pattern_from_observations(observations)
    }

    // -- evolution --------------------------------------------------------

    pub fn record_feedback(&self, feedback: Feedback) {
        self.analytics
            .write()
            .record_outcome(feedback.success, feedback.improvement);
        self.evolution.write().record_feedback(feedback);
    }

    pub fn evolve(&self) -> PatternResult<Generation> {
        let generation = self.evolution.write().evolve(&self.storage)?;
        self.analytics
            .write()
            .record_generation(generation.evolved.len());
        Ok(generation)
    }

    pub fn generation(&self) -> u64 {
        self.evolution.read().generation()
    }

    pub fn evolution_history(&self) -> Vec<Generation> {
        self.evolution.read().history().to_vec()
    }

    // -- application ------------------------------------------------------

    /// Interpret a stored pattern against `context` and persist the access
    /// side effects.
    pub fn apply_pattern(
        &self,
        id: u64,
        context: &ApplicationContext,
    ) -> PatternResult<ApplicationOutcome> {
        let now = now_secs();
        let (outcome, _) = self
            .storage
            .update(id, |pattern| Ok(apply_pattern(pattern, context, now)))?;
        self.analytics.write().record_application(outcome.applied);
        if let Some(reason) = &outcome.reason {
            tracing::debug!("pattern {id} not applied: {reason}");
        }
        Ok(outcome)
    }

    // -- subscriptions ----------------------------------------------------

    pub fn subscribe(&self, query: PatternQuery, callback: SubscriptionCallback) -> u64 {
        self.subscriptions.write().subscribe(query, callback)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subscriptions.write().unsubscribe(id)
    }

    pub fn subscription_stats(&self, id: u64) -> Option<SubscriptionStats> {
        self.subscriptions.read().stats(id)
    }

    pub fn deliver_subscriptions(&self) -> PatternResult<u64> {
        subscription::deliver(&self.subscriptions, &self.storage)
    }

    // -- analytics --------------------------------------------------------

    pub fn snapshot_analytics(&self) -> AnalyticsReport {
        let stats = self.storage.stats();
        self.analytics.write().snapshot(&stats)
    }
}

/// Evolve every `every` until cancelled. Returns completed generations.
pub async fn run_evolution_loop(
    engine: Arc<PatternEngine>,
    every: Duration,
    cancel: CancellationToken,
) -> u64 {
    tracing::info!("evolution loop started: every {}s", every.as_secs_f64());
    let mut ticker = tokio::time::interval(every);
    let mut completed = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("evolution loop stopping after {completed} generation(s)");
                break;
            }
            _ = ticker.tick() => {
                match engine.evolve() {
                    Ok(_) => completed += 1,
                    Err(PatternError::NoFeedback) => {
                        tracing::debug!("evolution tick skipped: no feedback");
                    }
                    Err(e) => tracing::warn!("evolution cycle failed: {e}"),
                }
            }
        }
    }
    completed
}

/// Deliver subscriptions every `every` until cancelled. Returns callback
/// invocations.
pub async fn run_subscription_loop(
    engine: Arc<PatternEngine>,
    every: Duration,
    cancel: CancellationToken,
) -> u64 {
    tracing::info!(
        "subscription loop started: tick={}ms",
        every.as_millis()
    );
    let mut ticker = tokio::time::interval(every);
    let mut delivered = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("subscription loop stopping after {delivered} deliveries");
                break;
            }
            _ = ticker.tick() => {
                match engine.deliver_subscriptions() {
                    Ok(n) => delivered += n,
                    Err(e) => tracing::warn!("subscription delivery failed: {e}"),
                }
            }
        }
    }
    delivered
}

/// Spawn both background loops on the current runtime using the configured
/// intervals.
pub fn spawn_background(
    engine: &Arc<PatternEngine>,
    cancel: &CancellationToken,
) -> (tokio::task::JoinHandle<u64>, tokio::task::JoinHandle<u64>) {
    let evolution = tokio::spawn(run_evolution_loop(
        Arc::clone(engine),
        engine.config().evolution_interval(),
        cancel.clone(),
    ));
    let subscriptions = tokio::spawn(run_subscription_loop(
        Arc::clone(engine),
        engine.config().subscription_tick(),
        cancel.clone(),
    ));
    (evolution, subscriptions)
}
