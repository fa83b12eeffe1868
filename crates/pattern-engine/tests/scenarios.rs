//! End-to-end behavior of the engine: storage, detection, validation,
//! querying and evolution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pattern_engine::config::{DetectorConfig, StorageConfig};
use pattern_engine::{
    BloomFilter, EngineConfig, Feedback, MutationOperator, Observation, Pattern, PatternDetector,
    PatternEngine, PatternError, PatternFlags, PatternQuery, PatternType, SecurityValidator,
    StorageManager, ThreatKind, Tier,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;

// ─────────────────────── helpers ───────────────────────

fn engine_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.evolution.seed = Some(2024);
    config.security.forest_seed = Some(2024);
    config
}

fn atomic(tag: &str, confidence: u8) -> Pattern {
    Pattern::new(PatternType::Atomic, format!("payload:{tag}").into_bytes())
        .with_confidence(confidence)
        .with_tag(tag)
}

/// Header comparison ignoring the arena offset, which is a storage detail.
fn same_record(a: &Pattern, b: &Pattern) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.header.data_pointer = 0;
    b.header.data_pointer = 0;
    a == b
}

// ─────────────────────── scenarios ───────────────────────

#[test]
fn scenario_a_lru_eviction_past_capacity() {
    let config = StorageConfig {
        hot_capacity: 1024,
        ..StorageConfig::default()
    };
    let storage = StorageManager::open(&config).unwrap();

    let mut ids = Vec::new();
    for i in 0..1025 {
        let receipt = storage.write(atomic(&format!("p{i}"), 60)).unwrap();
        assert_eq!(receipt.tier, Tier::Hot);
        ids.push(receipt.id);
    }

    let first = ids[0];
    let last = ids[1024];
    assert!(matches!(storage.read(first), Err(PatternError::NotFound(id)) if id == first));
    assert!(storage.read(last).is_ok());
    let stats = storage.stats();
    assert_eq!(stats.hot_entries, 1024);
    assert_eq!(stats.evictions, 1);
    // Reading an evicted ID is expected, not a Bloom false positive.
    assert_eq!(stats.stale_reads, 1);
    assert_eq!(stats.bloom_false_positives, 0);
}

#[test]
fn scenario_b_pattern_from_observations() {
    let detector = PatternDetector::new(DetectorConfig::default(), "scenario-b");
    let observations = vec![
        Observation::new(true).latency(10.0).cost(1.0),
        Observation::new(false).latency(20.0).cost(2.0),
    ];
    let p = detector.create_pattern_from_observations(&observations).unwrap();
    assert_eq!(p.header.confidence, 50);
    assert_eq!(p.header.success_rate, 0.5);
    assert_eq!(p.body.metadata.metrics.avg_latency_ms, 15.0);
}

#[test]
fn scenario_c_trust_store_gates_validation() {
    let mut validator = SecurityValidator::new(&Default::default());
    let source = pattern_engine::source_hash("unknown-producer");
    let p = atomic("c", 80).with_source(source);

    let report = validator.validate_pattern(&p);
    assert!(!report.valid);
    assert_eq!(report.threats.len(), 1);
    assert_eq!(report.threats[0].kind, ThreatKind::PrivilegeEscalation);

    validator.trust_source(source);
    let report = validator.validate_pattern(&p);
    assert!(report.valid);
    assert!(report.threats.is_empty());
}

#[test]
fn scenario_d_query_returns_exact_match() {
    let storage = StorageManager::open(&StorageConfig::default()).unwrap();
    let id = storage.write(atomic("query", 75)).unwrap().id;
    storage.write(atomic("other", 90)).unwrap();

    let q = PatternQuery::new()
        .with_type(PatternType::Atomic)
        .min_confidence(50)
        .with_tag("query");
    let found = storage.query(&q).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), id);
}

#[test]
fn scenario_e_detector_needs_minimum_samples() {
    let mut detector = PatternDetector::new(DetectorConfig::default(), "scenario-e");
    detector.observe("k", Observation::new(true));
    detector.observe("k", Observation::new(true));
    assert!(detector.detect("k").is_empty());
}

// ─────────────────────── properties ───────────────────────

#[test]
fn write_then_read_round_trips() {
    let storage = StorageManager::open(&StorageConfig::default()).unwrap();
    for (i, t) in PatternType::ALL.iter().enumerate() {
        let mut p = Pattern::new(*t, vec![i as u8; i * 17])
            .with_confidence(i as u8 * 10)
            .with_complexity(i as u8 + 1)
            .with_success_rate(0.125 * i as f32)
            .with_source(0xABCD_0000 + i as u32)
            .with_tag("rt");
        p.header.expiration = 4_000_000_000 + i as u64;
        p.header.weight = 0.5;
        p.header.flags.insert(PatternFlags::COMPRESSED);
        p.body.links.dependencies = vec![1, 2, 3];
        let id = storage.write(p.clone()).unwrap().id;
        p.header.id = id;
        let back = storage.read(id).unwrap();
        assert!(same_record(&p, &back), "type {t:?} did not round-trip");
    }
}

#[test]
fn bloom_has_no_false_negatives() {
    let mut bloom = BloomFilter::new(1 << 16);
    for id in (1..5000u64).map(|i| i * 7919) {
        bloom.add(id);
    }
    assert!((1..5000u64).map(|i| i * 7919).all(|id| bloom.contains(id)));
}

#[test]
fn hot_tier_never_exceeds_capacity() {
    let config = StorageConfig {
        hot_capacity: 8,
        ..StorageConfig::default()
    };
    let storage = StorageManager::open(&config).unwrap();
    for i in 0..50 {
        let receipt = storage.write(atomic(&format!("c{i}"), 10)).unwrap();
        assert!(receipt.evicted.len() <= 1);
        assert!(storage.stats().hot_entries <= 8);
    }
    assert_eq!(storage.stats().evictions, 42);
}

#[test]
fn mutation_operators_keep_ranges() {
    let mut rng = StdRng::seed_from_u64(17);
    for start in [0u8, 50, 100] {
        let mut header = Pattern::new(PatternType::Adaptive, vec![]).header;
        header.confidence = start;
        header.complexity = (start / 10).max(1);
        for _ in 0..500 {
            for op in MutationOperator::ALL {
                op.apply(&mut header, &mut rng);
                assert!(header.confidence <= 100);
                assert!((1..=10).contains(&header.complexity));
                assert!((0.0..=1.0).contains(&header.weight));
            }
        }
    }
}

#[test]
fn repeated_query_is_idempotent() {
    let storage = StorageManager::open(&StorageConfig::default()).unwrap();
    for i in 0..20 {
        storage.write(atomic("idem", i * 5)).unwrap();
    }
    let q = PatternQuery::new().min_confidence(40).limit(10);
    let ids = |v: Vec<Pattern>| v.into_iter().map(|p| p.id()).collect::<Vec<_>>();
    let first = ids(storage.query(&q).unwrap());
    let second = ids(storage.query(&q).unwrap());
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn evolution_bumps_version_and_links_parent() {
    let mut config = engine_config();
    config.evolution.mutation_rate = 1.0;
    let engine = PatternEngine::open(config).unwrap();
    let p = atomic("evo", 60).with_source(engine.source_hash());
    let id = engine.submit_pattern(p).unwrap().id;
    let before = engine.read(id).unwrap().header.version;

    engine.record_feedback(Feedback::new(id, true, 0.4));
    let generation = engine.evolve().unwrap();
    assert_eq!(generation.evolved, vec![id]);

    let after = engine.read(id).unwrap();
    assert!(after.header.version > before);
    assert!(after.body.links.evolved_from.contains(&id));
    assert!(matches!(engine.evolve(), Err(PatternError::NoFeedback)));
    assert_eq!(engine.generation(), 1);
}

// ─────────────────────── engine flows ───────────────────────

#[test]
fn observations_to_published_patterns() {
    let engine = PatternEngine::open(engine_config()).unwrap();
    for i in 0..12 {
        engine.observe("deploy", Observation::new(i != 0).latency(5.0));
    }
    let report = engine.detect_and_publish("deploy").unwrap();
    assert!(!report.published.is_empty());

    let found = engine
        .query(&PatternQuery::new().with_tag("deploy"))
        .unwrap();
    assert_eq!(found.len(), report.published.len());
    assert_eq!(
        engine.snapshot_analytics().snapshot.patterns_detected,
        report.published.len() as u64
    );
}

#[test]
fn durable_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = engine_config();
    config.storage.cold_path = Some(dir.path().join("cold.json"));

    let id = {
        let engine = PatternEngine::open(config.clone()).unwrap();
        engine.storage().persist(atomic("durable", 88)).unwrap()
    };
    let engine = PatternEngine::open(config).unwrap();
    let p = engine.read(id).unwrap();
    assert_eq!(p.header.confidence, 88);
}

#[tokio::test]
async fn subscription_loop_delivers_matches() {
    let mut config = engine_config();
    config.subscription_tick_ms = 5;
    let engine = Arc::new(PatternEngine::open(config).unwrap());
    engine.storage().write(atomic("watched", 70)).unwrap();

    let hits = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&hits);
    let sub = engine.subscribe(
        PatternQuery::new().with_tag("watched"),
        Arc::new(move |_p: &Pattern| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let cancel = CancellationToken::new();
    let (evolution, subscriptions) = pattern_engine::spawn_background(&engine, &cancel);
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let delivered = subscriptions.await.unwrap();
    evolution.await.unwrap();

    assert!(delivered >= 1);
    assert_eq!(hits.load(Ordering::SeqCst), delivered);
    assert_eq!(engine.subscription_stats(sub).unwrap().deliveries, delivered);
}
