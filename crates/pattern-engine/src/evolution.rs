//! Genetic evolution over accumulated feedback.
//!
//! A cycle scores every pattern that received feedback, keeps the top K, and
//! mutates each survivor with probability `mutation_rate`. Mutated patterns
//! are written back under the same ID with a bumped version, the `EVOLVED`
//! flag, a self link in `evolved_from` and their feedback folded into
//! `metrics`. The feedback log is cleared only once the whole cycle has been
//! written back.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::EvolutionConfig;
use crate::storage::StorageManager;
use crate::types::{
    now_secs, Pattern, PatternError, PatternFlags, PatternHeader, PatternMetrics, PatternResult,
    MAX_COMPLEXITY, MAX_CONFIDENCE, MIN_COMPLEXITY,
};

/// Recency decays linearly to zero over this window.
const RECENCY_WINDOW_SECS: f64 = 24.0 * 3600.0;

/// One outcome report for an applied pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub pattern_id: u64,
    pub success: bool,
    /// Relative improvement, nominally 0.0..=1.0.
    pub improvement: f64,
    /// Observed latency of the run the pattern was applied to.
    #[serde(default)]
    pub latency_ms: f64,
    /// Cost saved by applying the pattern, in caller units.
    #[serde(default)]
    pub cost: f64,
    pub timestamp: u64,
}

impl Feedback {
    pub fn new(pattern_id: u64, success: bool, improvement: f64) -> Self {
        Self {
            pattern_id,
            success,
            improvement,
            latency_ms: 0.0,
            cost: 0.0,
            timestamp: now_secs(),
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
}

/// Fold feedback into a pattern's outcome counters. Averages are weighted by
/// the outcomes already counted.
pub fn fold_feedback(metrics: &mut PatternMetrics, feedback: &[Feedback]) {
    for f in feedback {
        let prior = (metrics.successes + metrics.failures) as f64;
        if f.success {
            metrics.successes += 1;
        } else {
            metrics.failures += 1;
        }
        let total = prior + 1.0;
        metrics.avg_improvement += (f.improvement - metrics.avg_improvement) / total;
        metrics.avg_latency_ms += (f.latency_ms - metrics.avg_latency_ms) / total;
        metrics.cost_savings += f.cost;
    }
}

/// A scored pattern within one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scored {
    pub pattern_id: u64,
    pub fitness: f64,
}

/// Record of one completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub number: u64,
    pub completed_at: u64,
    pub evaluated: usize,
    pub selected: Vec<Scored>,
    /// IDs written back after mutation.
    pub evolved: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOperator {
    Confidence,
    Weight,
    Complexity,
}

impl MutationOperator {
    pub const ALL: [MutationOperator; 3] = [
        MutationOperator::Confidence,
        MutationOperator::Weight,
        MutationOperator::Complexity,
    ];

    pub fn apply<R: Rng>(self, header: &mut PatternHeader, rng: &mut R) {
        let sign: i16 = if rng.gen_bool(0.5) { 1 } else { -1 };
        match self {
            Self::Confidence => {
                let delta = sign * rng.gen_range(1..=5);
                header.confidence =
                    (header.confidence as i16 + delta).clamp(0, MAX_CONFIDENCE as i16) as u8;
            }
            Self::Weight => {
                let delta = rng.gen_range(-0.1f32..=0.1);
                header.weight = (header.weight + delta).clamp(0.0, 1.0);
            }
            Self::Complexity => {
                header.complexity = (header.complexity as i16 + sign)
                    .clamp(MIN_COMPLEXITY as i16, MAX_COMPLEXITY as i16)
                    as u8;
            }
        }
    }
}

/// `0.4 sr + 0.3 imp + 0.2 (freq / 100) + 0.1 recency`.
pub fn fitness(feedback: &[Feedback], now: u64) -> f64 {
    if feedback.is_empty() {
        return 0.0;
    }
    let n = feedback.len() as f64;
    let success_rate = feedback.iter().filter(|f| f.success).count() as f64 / n;
    let improvement = feedback.iter().map(|f| f.improvement).sum::<f64>() / n;
    let frequency = n / 100.0;
    let latest = feedback.iter().map(|f| f.timestamp).max().unwrap_or(0);
    let age = now.saturating_sub(latest) as f64;
    let recency = (1.0 - age / RECENCY_WINDOW_SECS).max(0.0);
    0.4 * success_rate + 0.3 * improvement + 0.2 * frequency + 0.1 * recency
}

pub struct EvolutionEngine {
    config: EvolutionConfig,
    feedback: HashMap<u64, Vec<Feedback>>,
    generation: u64,
    history: Vec<Generation>,
    rng: StdRng,
}

impl EvolutionEngine {
    pub fn new(config: EvolutionConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            feedback: HashMap::new(),
            generation: 0,
            history: Vec::new(),
            rng,
        }
    }

    pub fn record_feedback(&mut self, feedback: Feedback) {
        self.feedback
            .entry(feedback.pattern_id)
            .or_default()
            .push(feedback);
    }

    pub fn pending_feedback(&self) -> usize {
        self.feedback.values().map(Vec::len).sum()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn history(&self) -> &[Generation] {
        &self.history
    }

    pub fn evolve(&mut self, storage: &StorageManager) -> PatternResult<Generation> {
        self.evolve_at(storage, now_secs())
    }

    /// Run one cycle. With no feedback nothing changes and
    /// [`PatternError::NoFeedback`] is returned.
    ///
    /// A failed write-back aborts the cycle and keeps the feedback for the
    /// next one; mutations already written stay.
    pub fn evolve_at(&mut self, storage: &StorageManager, now: u64) -> PatternResult<Generation> {
        if self.feedback.is_empty() {
            return Err(PatternError::NoFeedback);
        }

        let mut ranked: Vec<Scored> = self
            .feedback
            .iter()
            .map(|(&pattern_id, entries)| Scored {
                pattern_id,
                fitness: fitness(entries, now),
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.fitness
                .total_cmp(&a.fitness)
                .then(a.pattern_id.cmp(&b.pattern_id))
        });
        let evaluated = ranked.len();
        ranked.truncate(self.config.top_k.max(1));

        let mut evolved = Vec::new();
        for scored in &ranked {
            if !self.rng.gen_bool(self.config.mutation_rate.clamp(0.0, 1.0)) {
                continue;
            }
            let id = scored.pattern_id;
            let entries = self.feedback.get(&id).map(Vec::as_slice).unwrap_or(&[]);
            let rng = &mut self.rng;
            match storage.update(id, |pattern| mutate(pattern, entries, rng)) {
                Ok((op, _)) => {
                    tracing::debug!("mutated pattern {id} via {op:?}");
                    evolved.push(id);
                }
                Err(PatternError::NotFound(_)) => {
                    tracing::warn!("selected pattern {id} no longer stored, skipping mutation");
                }
                Err(PatternError::VersionExhausted(_)) => {
                    tracing::warn!("pattern {id} is at the version ceiling, skipping mutation");
                }
                Err(e) => {
                    tracing::warn!(
                        "generation {} aborted writing pattern {id}: {e}",
                        self.generation + 1
                    );
                    return Err(e);
                }
            }
        }

        self.feedback.clear();
        self.generation += 1;
        let generation = Generation {
            number: self.generation,
            completed_at: now,
            evaluated,
            selected: ranked,
            evolved,
        };
        tracing::info!(
            "generation {} complete: {} evaluated, {} selected, {} evolved",
            generation.number,
            generation.evaluated,
            generation.selected.len(),
            generation.evolved.len()
        );
        self.history.push(generation.clone());
        Ok(generation)
    }
}

/// Apply one random operator and the evolution bookkeeping. Fails without
/// touching the pattern when its version cannot be bumped.
fn mutate(
    pattern: &mut Pattern,
    feedback: &[Feedback],
    rng: &mut StdRng,
) -> PatternResult<MutationOperator> {
    let id = pattern.header.id;
    let version = pattern
        .header
        .version
        .checked_add(1)
        .ok_or(PatternError::VersionExhausted(id))?;
    let op = MutationOperator::ALL[rng.gen_range(0..MutationOperator::ALL.len())];
    op.apply(&mut pattern.header, rng);
    pattern.header.version = version;
    pattern.header.flags.insert(PatternFlags::EVOLVED);
    pattern.body.links.evolved_from.push(id);
    fold_feedback(&mut pattern.body.metadata.metrics, feedback);
    Ok(op)
}
