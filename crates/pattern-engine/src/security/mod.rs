//! Pattern validation and request-level security.
//!
//! [`SecurityValidator`] gates patterns against a trust store and a handful
//! of structural heuristics. [`SecurityEngine`] is the general request gate:
//! per-source rate limiting, input checks and anomaly scoring.

pub mod engine;
pub mod forest;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::codec::source_hash;
use crate::config::SecurityConfig;
use crate::types::{now_secs, Pattern, PatternError, PatternResult, MAX_COMPLEXITY};

pub use engine::{SecurityDecision, SecurityEngine, SecurityRequest};
pub use forest::IsolationForest;

/// What a tripped check suspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    /// Pattern from a source outside the trust store.
    PrivilegeEscalation,
    /// Pattern set to expire suspiciously soon.
    LogicBomb,
    /// Complexity at the upper bound.
    ResourceExhaustion,
    /// Header fails its integrity (magic) check.
    DataLeakage,
    RateLimitExceeded,
    MalformedInput,
    /// Feature vector the isolation forest scores as an outlier.
    Anomaly,
}

/// One tripped check with its severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threat {
    pub kind: ThreatKind,
    /// 0.0..=1.0
    pub severity: f64,
    pub description: String,
}

impl Threat {
    /// Severity is clamped to `0.0..=1.0`.
    pub fn new(kind: ThreatKind, severity: f64, description: impl Into<String>) -> Self {
        Self {
            kind,
            severity: severity.clamp(0.0, 1.0),
            description: description.into(),
        }
    }
}

/// Outcome of validating one pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub threats: Vec<Threat>,
}

impl ValidationReport {
    /// `Err(ValidationFailed)` carrying the threats unless valid.
    pub fn into_result(self) -> PatternResult<()> {
        if self.valid {
            Ok(())
        } else {
            Err(PatternError::ValidationFailed {
                threats: self.threats,
            })
        }
    }
}

/// Aggregate severity: 0.7 x max + 0.3 x mean. Zero with no threats.
pub fn threat_score(threats: &[Threat]) -> f64 {
    if threats.is_empty() {
        return 0.0;
    }
    let max = threats.iter().map(|t| t.severity).fold(0.0, f64::max);
    let avg = threats.iter().map(|t| t.severity).sum::<f64>() / threats.len() as f64;
    0.7 * max + 0.3 * avg
}

/// Trust store plus heuristic threat checks for incoming patterns.
pub struct SecurityValidator {
    trusted: HashSet<u32>,
    suspicious_expiry_secs: u64,
}

impl SecurityValidator {
    /// Seed the trust store from the configured source names.
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            trusted: config.trusted_sources.iter().map(|s| source_hash(s)).collect(),
            suspicious_expiry_secs: config.suspicious_expiry_secs,
        }
    }

    /// Add a source hash to the trust store.
    pub fn trust_source(&mut self, hash: u32) {
        if self.trusted.insert(hash) {
            tracing::info!("trusted source 0x{hash:08X}");
        }
    }

    /// Remove a source hash. Returns whether it was trusted.
    pub fn revoke_source(&mut self, hash: u32) -> bool {
        let removed = self.trusted.remove(&hash);
        if removed {
            tracing::info!("revoked trust for source 0x{hash:08X}");
        }
        removed
    }

    pub fn is_trusted(&self, hash: u32) -> bool {
        self.trusted.contains(&hash)
    }

    pub fn trusted_count(&self) -> usize {
        self.trusted.len()
    }

    /// Run every check against `pattern` at the current time.
    pub fn validate_pattern(&self, pattern: &Pattern) -> ValidationReport {
        self.validate_pattern_at(pattern, now_secs())
    }

    /// Valid only when no check trips.
    pub fn validate_pattern_at(&self, pattern: &Pattern, now: u64) -> ValidationReport {
        let h = &pattern.header;
        let mut threats = Vec::new();

        if !self.is_trusted(h.source_hash) {
            threats.push(Threat::new(
                ThreatKind::PrivilegeEscalation,
                0.9,
                format!("source 0x{:08X} is not in the trust store", h.source_hash),
            ));
        }
        if h.expiration != 0 && h.expiration < now.saturating_add(self.suspicious_expiry_secs) {
            threats.push(Threat::new(
                ThreatKind::LogicBomb,
                0.8,
                format!(
                    "expires at {} (within {}s of now)",
                    h.expiration, self.suspicious_expiry_secs
                ),
            ));
        }
        if h.complexity >= MAX_COMPLEXITY {
            threats.push(Threat::new(
                ThreatKind::ResourceExhaustion,
                0.6,
                format!("complexity {} at ceiling", h.complexity),
            ));
        }
        if !h.has_valid_magic() {
            threats.push(Threat::new(
                ThreatKind::DataLeakage,
                1.0,
                format!("integrity check failed: magic 0x{:016X}", h.magic),
            ));
        }

        if !threats.is_empty() {
            tracing::warn!(
                "pattern {} failed validation with {} threat(s)",
                h.id,
                threats.len()
            );
        }
        ValidationReport {
            valid: threats.is_empty(),
            threats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PatternType;

    const SOURCE: u32 = 0xC0FFEE;

    fn validator() -> SecurityValidator {
        SecurityValidator::new(&SecurityConfig::default())
    }

    fn pattern() -> Pattern {
        Pattern::new(PatternType::Security, b"rule".to_vec()).with_source(SOURCE)
    }

    #[test]
    fn test_untrusted_then_trusted() {
        let mut v = validator();
        let report = v.validate_pattern(&pattern());
        assert!(!report.valid);
        assert_eq!(report.threats.len(), 1);
        assert_eq!(report.threats[0].kind, ThreatKind::PrivilegeEscalation);

        v.trust_source(SOURCE);
        let report = v.validate_pattern(&pattern());
        assert!(report.valid);
        assert!(report.threats.is_empty());

        assert!(v.revoke_source(SOURCE));
        assert!(!v.validate_pattern(&pattern()).valid);
    }

    #[test]
    fn test_configured_sources_are_trusted() {
        let cfg = SecurityConfig {
            trusted_sources: vec!["scheduler".into()],
            ..SecurityConfig::default()
        };
        let v = SecurityValidator::new(&cfg);
        assert!(v.is_trusted(source_hash("scheduler")));
        assert_eq!(v.trusted_count(), 1);
    }

    #[test]
    fn test_heuristics() {
        let mut v = validator();
        v.trust_source(SOURCE);
        let now = 1_000_000;

        let mut p = pattern();
        p.header.expiration = now + 60;
        let report = v.validate_pattern_at(&p, now);
        assert_eq!(report.threats[0].kind, ThreatKind::LogicBomb);

        p.header.expiration = now + 3600;
        assert!(v.validate_pattern_at(&p, now).valid);

        let p = pattern().with_complexity(10);
        let report = v.validate_pattern_at(&p, now);
        assert_eq!(report.threats[0].kind, ThreatKind::ResourceExhaustion);

        let mut p = pattern();
        p.header.magic = 0;
        let err = v.validate_pattern_at(&p, now).into_result().unwrap_err();
        match err {
            PatternError::ValidationFailed { threats } => {
                assert_eq!(threats[0].kind, ThreatKind::DataLeakage)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_threat_score() {
        assert_eq!(threat_score(&[]), 0.0);
        let threats = vec![
            Threat::new(ThreatKind::LogicBomb, 1.0, ""),
            Threat::new(ThreatKind::MalformedInput, 0.5, ""),
        ];
        assert!((threat_score(&threats) - (0.7 + 0.3 * 0.75)).abs() < 1e-9);
    }
}
