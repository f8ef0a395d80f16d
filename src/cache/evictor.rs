//! Eviction policy: decides which entries leave the store to make room.
//!
//! Entries carry an access token that is bumped on insert, on served hits
//! and on warm-up requests. The default policy evicts the entries with the
//! oldest token first; the alternative evicts the largest entries first.

use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

use crate::cache::key::CacheKey;
use crate::cache::store::StoreEntry;

/// Which entries to drop first when the store is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Oldest access token first.
    #[default]
    LeastRecentlyWarmed,
    /// Largest value first, oldest token breaking ties.
    LargestFirst,
}

/// An eviction candidate with its computed priority.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: CacheKey,
    pub size: u64,
    /// Higher = evicted earlier.
    pub priority: (u64, u64),
}

impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.key == other.key
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Key order keeps selection deterministic on equal priorities.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.key.cmp(&self.key))
    }
}

/// The eviction policy engine.
#[derive(Debug, Clone)]
pub struct Evictor {
    policy: EvictionPolicy,
}

impl Evictor {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Priority of one entry given the store's current token.
    pub fn compute_priority(&self, entry: &StoreEntry, current_token: u64) -> (u64, u64) {
        let age = current_token.saturating_sub(entry.access_token);
        match self.policy {
            EvictionPolicy::LeastRecentlyWarmed => (age, entry.value.size()),
            EvictionPolicy::LargestFirst => (entry.value.size(), age),
        }
    }

    /// Pick entries to drop until at least `bytes_needed` bytes and
    /// `items_needed` entries are freed.
    ///
    /// Returns candidates in eviction order. If the store cannot free
    /// enough, every entry is returned.
    pub fn select_victims<'a>(
        &self,
        entries: impl Iterator<Item = (&'a CacheKey, &'a StoreEntry)>,
        current_token: u64,
        bytes_needed: u64,
        items_needed: usize,
    ) -> Vec<EvictionCandidate> {
        if bytes_needed == 0 && items_needed == 0 {
            return Vec::new();
        }

        let mut heap: BinaryHeap<EvictionCandidate> = entries
            .map(|(key, entry)| EvictionCandidate {
                key: *key,
                size: entry.value.size(),
                priority: self.compute_priority(entry, current_token),
            })
            .collect();

        let mut victims = Vec::new();
        let mut freed = 0u64;
        while freed < bytes_needed || victims.len() < items_needed {
            match heap.pop() {
                Some(candidate) => {
                    freed += candidate.size;
                    victims.push(candidate);
                }
                None => break,
            }
        }
        victims
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::DIGEST_SIZE;
    use crate::cache::value::CacheValue;

    fn entry(size: usize, token: u64) -> StoreEntry {
        let mut value = CacheValue::new();
        value.add("blob", vec![0u8; size]);
        StoreEntry::new(value, token)
    }

    fn key(id: u8) -> CacheKey {
        CacheKey::new([id; DIGEST_SIZE], [0u8; DIGEST_SIZE])
    }

    #[test]
    fn test_oldest_token_evicted_first() {
        let evictor = Evictor::new(EvictionPolicy::LeastRecentlyWarmed);
        let entries = [(key(1), entry(10, 5)), (key(2), entry(10, 1)), (key(3), entry(10, 9))];

        let victims = evictor.select_victims(entries.iter().map(|(k, e)| (k, e)), 10, 15, 0);
        assert_eq!(victims.len(), 2);
        assert_eq!(victims[0].key, key(2));
        assert_eq!(victims[1].key, key(1));
    }

    #[test]
    fn test_largest_first_policy() {
        let evictor = Evictor::new(EvictionPolicy::LargestFirst);
        let entries = [(key(1), entry(10, 0)), (key(2), entry(50, 9))];

        let victims = evictor.select_victims(entries.iter().map(|(k, e)| (k, e)), 10, 1, 0);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].key, key(2));
    }

    #[test]
    fn test_item_count_pressure() {
        let evictor = Evictor::new(EvictionPolicy::default());
        let entries = [(key(1), entry(1, 3)), (key(2), entry(1, 2))];

        let victims = evictor.select_victims(entries.iter().map(|(k, e)| (k, e)), 4, 0, 1);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].key, key(2));
    }

    #[test]
    fn test_nothing_needed_selects_nothing() {
        let evictor = Evictor::new(EvictionPolicy::default());
        let entries = [(key(1), entry(1, 0))];
        assert!(evictor
            .select_victims(entries.iter().map(|(k, e)| (k, e)), 1, 0, 0)
            .is_empty());
    }
}
