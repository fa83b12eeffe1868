//! Tier 2: bounded in-process map. Writes of new IDs past capacity are
//! rejected; there is no eviction.

use std::collections::HashMap;

use crate::types::{Pattern, PatternError, PatternResult};

pub struct WarmTier {
    entries: HashMap<u64, Pattern>,
    capacity: usize,
}

impl WarmTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
        }
    }

    pub fn get(&self, id: u64) -> Option<&Pattern> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn put(&mut self, pattern: Pattern) -> PatternResult<()> {
        let id = pattern.header.id;
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&id) {
            return Err(PatternError::CapacityExceeded(format!(
                "warm tier full at {} entries",
                self.capacity
            )));
        }
        self.entries.insert(id, pattern);
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Option<Pattern> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
