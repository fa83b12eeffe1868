//! Tier 3: unbounded durable store.
//!
//! The whole tier is rewritten as one JSON document on every write
//! (`{ "format_version": 1, "patterns": { "<id>": <pattern>, .. } }`), via a
//! temp file and rename. Fine for low churn; it does not scale to high write
//! volume.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{Pattern, PatternError, PatternResult};

/// Current durable format version.
const FORMAT_VERSION: u16 = 1;

#[derive(Serialize)]
struct SerializedTier<'a> {
    format_version: u16,
    patterns: &'a BTreeMap<u64, Pattern>,
}

#[derive(Deserialize)]
struct DeserializedTier {
    format_version: u16,
    patterns: BTreeMap<u64, Pattern>,
}

pub struct ColdTier {
    /// `None` keeps the tier in memory only.
    path: Option<PathBuf>,
    patterns: BTreeMap<u64, Pattern>,
}

impl ColdTier {
    /// Open the tier, loading any existing document at `path`.
    pub fn open(path: Option<&Path>) -> PatternResult<Self> {
        let patterns = match path {
            Some(p) if p.exists() => Self::load(p)?,
            _ => BTreeMap::new(),
        };
        if let Some(p) = path {
            tracing::debug!(
                "cold tier opened: {} patterns from {}",
                patterns.len(),
                p.display()
            );
        }
        Ok(Self {
            path: path.map(Path::to_path_buf),
            patterns,
        })
    }

    /// Read a durable document without opening a tier.
    pub fn load(path: &Path) -> PatternResult<BTreeMap<u64, Pattern>> {
        let data = std::fs::read(path)?;
        let doc: DeserializedTier = serde_json::from_slice(&data)
            .map_err(|e| PatternError::SerializationFailed(format!("{}: {e}", path.display())))?;
        if doc.format_version != FORMAT_VERSION {
            return Err(PatternError::SerializationFailed(format!(
                "unsupported durable format version {}",
                doc.format_version
            )));
        }
        Ok(doc.patterns)
    }

    fn persist(&self) -> PatternResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let doc = SerializedTier {
            format_version: FORMAT_VERSION,
            patterns: &self.patterns,
        };
        let bytes = serde_json::to_vec(&doc)
            .map_err(|e| PatternError::SerializationFailed(e.to_string()))?;
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, &bytes)?;
            std::fs::rename(&tmp, path)
        };
        write().map_err(|e| {
            PatternError::SerializationFailed(format!("{}: {e}", path.display()))
        })
    }

    /// Insert and synchronously persist. On persistence failure the in-memory
    /// state is rolled back and the error surfaced.
    pub fn put(&mut self, pattern: Pattern) -> PatternResult<()> {
        let id = pattern.header.id;
        let previous = self.patterns.insert(id, pattern);
        if let Err(e) = self.persist() {
            match previous {
                Some(p) => self.patterns.insert(id, p),
                None => self.patterns.remove(&id),
            };
            return Err(e);
        }
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<&Pattern> {
        self.patterns.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.patterns.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.patterns.keys().copied()
    }

    pub fn max_id(&self) -> u64 {
        self.patterns.keys().next_back().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
