//! Core data types for learned patterns.

use serde::{Deserialize, Serialize};

use crate::security::Threat;

/// Magic constant at offset 0 of every pattern header: "PATTERN1".
pub const PATTERN_MAGIC: u64 = u64::from_le_bytes(*b"PATTERN1");

/// Fixed size of an encoded pattern header.
pub const HEADER_SIZE: usize = 64;

/// Largest payload a pattern body may carry.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Reserved: IDs are assigned by incrementing, so the top value has no
/// successor and is never accepted.
pub const RESERVED_ID: u64 = u64::MAX;

pub const MIN_COMPLEXITY: u8 = 1;
pub const MAX_COMPLEXITY: u8 = 10;
pub const MAX_CONFIDENCE: u8 = 100;

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// The behavioral shape a pattern describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum PatternType {
    Atomic = 0,
    Composite = 1,
    Conditional = 2,
    Temporal = 3,
    Sequential = 4,
    Probabilistic = 5,
    Adaptive = 6,
    Security = 7,
}

impl PatternType {
    pub const ALL: [PatternType; 8] = [
        PatternType::Atomic,
        PatternType::Composite,
        PatternType::Conditional,
        PatternType::Temporal,
        PatternType::Sequential,
        PatternType::Probabilistic,
        PatternType::Adaptive,
        PatternType::Security,
    ];

    /// Wire value stored at header offset 16.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Inverse of [`as_u16`](Self::as_u16). `None` for unknown values.
    pub fn from_u16(raw: u16) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// Lowercase name used in logs, tags and CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Atomic => "atomic",
            Self::Composite => "composite",
            Self::Conditional => "conditional",
            Self::Temporal => "temporal",
            Self::Sequential => "sequential",
            Self::Probabilistic => "probabilistic",
            Self::Adaptive => "adaptive",
            Self::Security => "security",
        }
    }
}

/// Header flag bitset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternFlags(pub u16);

impl PatternFlags {
    pub const ACTIVE: u16 = 1 << 0;
    pub const TRUSTED: u16 = 1 << 1;
    pub const VALIDATED: u16 = 1 << 2;
    pub const EVOLVED: u16 = 1 << 3;
    pub const COMPOSITE: u16 = 1 << 4;
    pub const TEMPORAL: u16 = 1 << 5;
    pub const ENCRYPTED: u16 = 1 << 6;
    pub const COMPRESSED: u16 = 1 << 7;

    /// True if every bit of `flag` is set.
    pub fn contains(self, flag: u16) -> bool {
        self.0 & flag == flag
    }

    pub fn insert(&mut self, flag: u16) {
        self.0 |= flag;
    }

    pub fn remove(&mut self, flag: u16) {
        self.0 &= !flag;
    }

    pub fn is_active(self) -> bool {
        self.contains(Self::ACTIVE)
    }

    pub fn is_trusted(self) -> bool {
        self.contains(Self::TRUSTED)
    }
}

/// Fixed-size portion of a pattern. Encoded to exactly [`HEADER_SIZE`] bytes
/// by [`crate::codec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternHeader {
    pub magic: u64,
    /// 0 means "not yet assigned".
    pub id: u64,
    pub version: u16,
    pub pattern_type: PatternType,
    /// 1..=10
    pub complexity: u8,
    /// 0..=100
    pub confidence: u8,
    pub source_hash: u32,
    pub timestamp: u64,
    /// 0 means "never expires".
    pub expiration: u64,
    /// 0.0..=1.0
    pub weight: f32,
    pub access_count: u32,
    /// 0.0..=1.0
    pub success_rate: f32,
    pub flags: PatternFlags,
    pub payload_size: u16,
    /// Offset of the payload inside the hot-tier arena.
    pub data_pointer: u32,
}

impl PatternHeader {
    /// Create a fresh, unassigned header of the given type.
    pub fn new(pattern_type: PatternType) -> Self {
        Self {
            magic: PATTERN_MAGIC,
            id: 0,
            version: 1,
            pattern_type,
            complexity: MIN_COMPLEXITY,
            confidence: 0,
            source_hash: 0,
            timestamp: now_secs(),
            expiration: 0,
            weight: 1.0,
            access_count: 0,
            success_rate: 0.0,
            flags: PatternFlags(PatternFlags::ACTIVE),
            payload_size: 0,
            data_pointer: 0,
        }
    }

    /// True if the header starts with [`PATTERN_MAGIC`].
    pub fn has_valid_magic(&self) -> bool {
        self.magic == PATTERN_MAGIC
    }

    /// A zero expiration never expires.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration != 0 && self.expiration <= now
    }
}

/// How the payload bytes are to be interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    #[default]
    Binary,
    Json,
    Text,
}

/// Comparison operators a condition may declare. Only `Equals` is evaluated
/// by the application engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
}

/// A guard evaluated against an application context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: serde_json::Value,
}

impl Condition {
    /// An `Equals` guard on a context field.
    pub fn equals(field: &str, value: serde_json::Value) -> Self {
        Self {
            field: field.to_string(),
            operator: ConditionOperator::Equals,
            value,
        }
    }
}

/// A declared resource limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub resource: String,
    pub limit: f64,
}

/// Outcome counters for a pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternMetrics {
    pub applications: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_improvement: f64,
    pub avg_latency_ms: f64,
    pub cost_savings: f64,
    pub last_applied: Option<u64>,
}

/// Descriptive data attached to a pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternMetadata {
    pub tags: Vec<String>,
    pub conditions: Vec<Condition>,
    pub constraints: Vec<Constraint>,
    pub metrics: PatternMetrics,
}

/// Relationships to other patterns, by ID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternLinks {
    pub dependencies: Vec<u64>,
    pub alternatives: Vec<u64>,
    pub contradicts: Vec<u64>,
    pub evolved_from: Vec<u64>,
}

/// Variable-size portion of a pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternBody {
    pub encoding: PayloadEncoding,
    pub payload: Vec<u8>,
    pub metadata: PatternMetadata,
    pub links: PatternLinks,
}

/// A versioned, confidence-scored behavioral rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub header: PatternHeader,
    pub body: PatternBody,
}

impl Pattern {
    /// Create an active, unassigned pattern with the given payload.
    pub fn new(pattern_type: PatternType, payload: Vec<u8>) -> Self {
        let mut header = PatternHeader::new(pattern_type);
        header.payload_size = payload.len().min(u16::MAX as usize) as u16;
        Self {
            header,
            body: PatternBody {
                payload,
                ..PatternBody::default()
            },
        }
    }

    /// Engine-assigned ID; 0 until stored.
    pub fn id(&self) -> u64 {
        self.header.id
    }

    pub fn pattern_type(&self) -> PatternType {
        self.header.pattern_type
    }

    /// Set the confidence score (0..=100).
    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.header.confidence = confidence;
        self
    }

    /// Set the complexity rating (1..=10).
    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.header.complexity = complexity;
        self
    }

    /// Set the observed success rate (0.0..=1.0).
    pub fn with_success_rate(mut self, success_rate: f32) -> Self {
        self.header.success_rate = success_rate;
        self
    }

    /// Set the producer's source hash, checked against the trust store.
    pub fn with_source(mut self, source_hash: u32) -> Self {
        self.header.source_hash = source_hash;
        self
    }

    /// Append a tag. Tags are indexed and queryable.
    pub fn with_tag(mut self, tag: &str) -> Self {
        self.body.metadata.tags.push(tag.to_string());
        self
    }

    /// Append a guard evaluated when the pattern is applied.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.body.metadata.conditions.push(condition);
        self
    }

    /// Declare how the payload bytes should be interpreted.
    pub fn with_encoding(mut self, encoding: PayloadEncoding) -> Self {
        self.body.encoding = encoding;
        self
    }

    /// Check the record-level invariants: magic, reserved ID, payload
    /// bound, confidence, complexity and weight ranges.
    pub fn check_invariants(&self) -> PatternResult<()> {
        let h = &self.header;
        if !h.has_valid_magic() {
            return Err(PatternError::InvalidPattern(format!(
                "invalid magic 0x{:016X}",
                h.magic
            )));
        }
        if h.id == RESERVED_ID {
            return Err(PatternError::InvalidPattern(format!(
                "id {RESERVED_ID} is reserved"
            )));
        }
        if self.body.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PatternError::InvalidPattern(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD_SIZE}",
                self.body.payload.len()
            )));
        }
        if h.confidence > MAX_CONFIDENCE {
            return Err(PatternError::InvalidPattern(format!(
                "confidence {} outside 0..=100",
                h.confidence
            )));
        }
        if !(MIN_COMPLEXITY..=MAX_COMPLEXITY).contains(&h.complexity) {
            return Err(PatternError::InvalidPattern(format!(
                "complexity {} outside 1..=10",
                h.complexity
            )));
        }
        if !(0.0..=1.0).contains(&h.weight) {
            return Err(PatternError::InvalidPattern(format!(
                "weight {} outside 0..=1",
                h.weight
            )));
        }
        Ok(())
    }
}

/// Errors that can occur in the pattern engine.
#[derive(thiserror::Error, Debug)]
pub enum PatternError {
    #[error("Pattern not found: {0}")]
    NotFound(u64),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Validation failed with {} threat(s)", .threats.len())]
    ValidationFailed { threats: Vec<Threat> },

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Region access out of bounds: offset {offset} + {len} > {region_len}")]
    Region {
        offset: usize,
        len: usize,
        region_len: usize,
    },

    #[error("No feedback accumulated since the last generation")]
    NoFeedback,

    #[error("Pattern {0} is at the version ceiling")]
    VersionExhausted(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type PatternResult<T> = Result<T, PatternError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_roundtrip_through_u16() {
        for t in PatternType::ALL {
            assert_eq!(PatternType::from_u16(t.as_u16()), Some(t));
        }
        assert_eq!(PatternType::from_u16(8), None);
    }

    #[test]
    fn test_flags() {
        let mut flags = PatternFlags::default();
        assert!(!flags.is_active());
        flags.insert(PatternFlags::ACTIVE | PatternFlags::TRUSTED);
        assert!(flags.is_active());
        assert!(flags.is_trusted());
        flags.remove(PatternFlags::TRUSTED);
        assert!(!flags.is_trusted());
        assert!(flags.is_active());
    }

    #[test]
    fn test_new_pattern_is_valid() {
        let p = Pattern::new(PatternType::Atomic, vec![1, 2, 3]).with_confidence(80);
        assert!(p.check_invariants().is_ok());
        assert_eq!(p.header.payload_size, 3);
        assert!(p.header.flags.is_active());
    }

    #[test]
    fn test_invariant_violations() {
        let p = Pattern::new(PatternType::Atomic, vec![0; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(p.check_invariants(), Err(PatternError::InvalidPattern(_))));

        let p = Pattern::new(PatternType::Atomic, vec![]).with_confidence(101);
        assert!(p.check_invariants().is_err());

        let p = Pattern::new(PatternType::Atomic, vec![]).with_complexity(0);
        assert!(p.check_invariants().is_err());

        let mut p = Pattern::new(PatternType::Atomic, vec![]);
        p.header.magic = 7;
        assert!(p.check_invariants().is_err());

        let mut p = Pattern::new(PatternType::Atomic, vec![]);
        p.header.id = RESERVED_ID;
        assert!(matches!(p.check_invariants(), Err(PatternError::InvalidPattern(_))));
    }

    #[test]
    fn test_expiry() {
        let mut h = PatternHeader::new(PatternType::Temporal);
        assert!(!h.is_expired(u64::MAX));
        h.expiration = 100;
        assert!(h.is_expired(100));
        assert!(!h.is_expired(99));
    }
}
