//! Per-type pattern interpretation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{ConditionOperator, Pattern, PatternFlags, PatternType};

/// Key/value context a pattern is applied against.
pub type ApplicationContext = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationOutcome {
    pub pattern_id: u64,
    pub applied: bool,
    /// Why the pattern did not apply.
    pub reason: Option<String>,
}

fn evaluate(pattern: &Pattern, context: &ApplicationContext, now: u64) -> Result<(), String> {
    let h = &pattern.header;
    match h.pattern_type {
        PatternType::Atomic => {
            pattern.check_invariants().map_err(|e| e.to_string())?;
            if !h.flags.is_active() {
                return Err("pattern is not active".to_string());
            }
        }
        PatternType::Conditional => {
            for condition in &pattern.body.metadata.conditions {
                if condition.operator != ConditionOperator::Equals {
                    tracing::debug!(
                        "pattern {}: {:?} on {:?} is not evaluated",
                        h.id,
                        condition.operator,
                        condition.field
                    );
                    continue;
                }
                match context.get(&condition.field) {
                    Some(v) if *v == condition.value => {}
                    Some(v) => {
                        return Err(format!(
                            "{}: expected {}, got {v}",
                            condition.field, condition.value
                        ))
                    }
                    None => return Err(format!("{}: missing from context", condition.field)),
                }
            }
        }
        PatternType::Security => {
            if !h.flags.contains(PatternFlags::TRUSTED) {
                return Err("security pattern is not trusted".to_string());
            }
        }
        PatternType::Temporal => {
            if h.is_expired(now) {
                return Err(format!("expired at {}", h.expiration));
            }
        }
        PatternType::Composite
        | PatternType::Sequential
        | PatternType::Probabilistic
        | PatternType::Adaptive => {
            if !h.flags.is_active() {
                return Err("pattern is not active".to_string());
            }
        }
    }
    Ok(())
}

/// Interpret `pattern` against `context`. Every call, applied or not, bumps
/// the access count and refreshes the header timestamp.
pub fn apply_pattern(pattern: &mut Pattern, context: &ApplicationContext, now: u64) -> ApplicationOutcome {
    let result = evaluate(pattern, context, now);

    pattern.header.access_count = pattern.header.access_count.saturating_add(1);
    pattern.header.timestamp = now;
    let metrics = &mut pattern.body.metadata.metrics;
    metrics.applications += 1;
    metrics.last_applied = Some(now);

    ApplicationOutcome {
        pattern_id: pattern.header.id,
        applied: result.is_ok(),
        reason: result.err(),
    }
}
