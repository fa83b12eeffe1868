//! Query subscriptions.
//!
//! Each tick re-runs every subscription's query and invokes its callback once
//! per match. Callbacks run without the manager lock held, so they may
//! subscribe or unsubscribe.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::query::PatternQuery;
use crate::storage::StorageManager;
use crate::types::{now_secs, Pattern, PatternResult};

pub type SubscriptionCallback = Arc<dyn Fn(&Pattern) + Send + Sync>;

struct Subscription {
    query: PatternQuery,
    callback: SubscriptionCallback,
    stats: SubscriptionStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    /// Ticks this subscription has been evaluated on.
    pub evaluations: u64,
    /// Callback invocations.
    pub deliveries: u64,
    pub last_delivery: Option<u64>,
}

#[derive(Default)]
pub struct SubscriptionManager {
    next_id: u64,
    subscriptions: BTreeMap<u64, Subscription>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, query: PatternQuery, callback: SubscriptionCallback) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.subscriptions.insert(
            id,
            Subscription {
                query,
                callback,
                stats: SubscriptionStats::default(),
            },
        );
        tracing::debug!("subscription {id} registered");
        id
    }

    pub fn unsubscribe(&mut self, id: u64) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn stats(&self, id: u64) -> Option<SubscriptionStats> {
        self.subscriptions.get(&id).map(|s| s.stats.clone())
    }

    fn snapshot(&self) -> Vec<(u64, PatternQuery, SubscriptionCallback)> {
        self.subscriptions
            .iter()
            .map(|(&id, s)| (id, s.query.clone(), Arc::clone(&s.callback)))
            .collect()
    }

    fn record(&mut self, id: u64, delivered: u64, now: u64) {
        if let Some(sub) = self.subscriptions.get_mut(&id) {
            sub.stats.evaluations += 1;
            sub.stats.deliveries += delivered;
            if delivered > 0 {
                sub.stats.last_delivery = Some(now);
            }
        }
    }
}

/// Run one delivery pass. Returns the number of callback invocations.
pub fn deliver(
    manager: &RwLock<SubscriptionManager>,
    storage: &StorageManager,
) -> PatternResult<u64> {
    let snapshot = manager.read().snapshot();
    let now = now_secs();
    let mut total = 0;
    for (id, query, callback) in snapshot {
        let matches = storage.query(&query)?;
        for pattern in &matches {
            callback(pattern);
        }
        let delivered = matches.len() as u64;
        manager.write().record(id, delivered, now);
        total += delivered;
    }
    Ok(total)
}
