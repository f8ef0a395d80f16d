//! In-memory keyed artifact storage with capacity accounting.
//!
//! The store tracks:
//! - One entry per key, each with an access token
//! - Used bytes against a byte capacity, and an item-count limit
//! - Whether anything changed since the last persisted snapshot

use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::evictor::{EvictionPolicy, Evictor};
use crate::cache::key::CacheKey;
use crate::cache::value::{CacheValue, ValueError};
use crate::config::StorageConfig;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Item of {size} bytes exceeds store capacity of {capacity} bytes")]
    TooLarge { size: u64, capacity: u64 },

    #[error("Refusing to store an empty or inconsistent value")]
    InvalidValue,

    #[error("Bad store file signature")]
    BadSignature,

    #[error("Unsupported store file version {0}")]
    UnsupportedVersion(u32),

    #[error("Corrupt store file: {0}")]
    Corrupt(String),

    #[error("Value error: {0}")]
    Value(#[from] ValueError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A stored value plus its access token.
#[derive(Debug, Clone)]
pub struct StoreEntry {
    pub value: CacheValue,

    /// Store-wide monotonic counter value at the last access.
    pub access_token: u64,

    /// Serialized copy handed to readers, built on first read.
    served: Option<Bytes>,
}

impl StoreEntry {
    pub fn new(value: CacheValue, access_token: u64) -> Self {
        Self {
            value,
            access_token,
            served: None,
        }
    }
}

/// A point-in-time copy of the store contents, used for persistence.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub entries: Vec<(CacheKey, StoreEntry)>,
}

/// The artifact store.
pub struct Store {
    entries: HashMap<CacheKey, StoreEntry>,
    capacity_bytes: u64,
    /// 0 = unlimited.
    max_items: usize,
    used_bytes: u64,
    next_token: u64,
    evictor: Evictor,
    dirty: bool,
}

impl Store {
    /// Create an empty store with the configured limits.
    pub fn new(config: &StorageConfig) -> Self {
        Self::with_limits(config.capacity_bytes, config.max_items, config.eviction)
    }

    pub fn with_limits(capacity_bytes: u64, max_items: usize, policy: EvictionPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            capacity_bytes,
            max_items,
            used_bytes: 0,
            next_token: 0,
            evictor: Evictor::new(policy),
            dirty: false,
        }
    }

    /// Look up an entry. Does not touch the access token.
    pub fn get(&self, key: &CacheKey) -> Option<&StoreEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or overwrite a value, evicting older entries if needed.
    ///
    /// Returns the keys evicted to make room.
    pub fn insert(&mut self, key: CacheKey, value: CacheValue) -> Result<Vec<CacheKey>, StoreError> {
        let size = value.size();
        if size > self.capacity_bytes {
            return Err(StoreError::TooLarge {
                size,
                capacity: self.capacity_bytes,
            });
        }
        if !value.is_valid() {
            return Err(StoreError::InvalidValue);
        }

        self.remove_entry(&key);
        let evicted = self.make_room(size);

        let token = self.bump_token();
        self.used_bytes += size;
        self.entries.insert(key, StoreEntry::new(value, token));
        self.dirty = true;

        debug!(%key, size, used = self.used_bytes, "Stored item");
        Ok(evicted)
    }

    fn make_room(&mut self, incoming: u64) -> Vec<CacheKey> {
        let bytes_needed = (self.used_bytes + incoming).saturating_sub(self.capacity_bytes);
        let items_needed = if self.max_items == 0 {
            0
        } else {
            (self.entries.len() + 1).saturating_sub(self.max_items)
        };

        let victims = self.evictor.select_victims(
            self.entries.iter(),
            self.next_token,
            bytes_needed,
            items_needed,
        );

        let mut evicted = Vec::with_capacity(victims.len());
        for victim in victims {
            if self.remove_entry(&victim.key) {
                evicted.push(victim.key);
            }
        }

        if !evicted.is_empty() {
            info!(
                evicted = evicted.len(),
                policy = ?self.evictor.policy(),
                used = self.used_bytes,
                "Eviction round complete"
            );
        }
        evicted
    }

    fn remove_entry(&mut self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.used_bytes = self.used_bytes.saturating_sub(entry.value.size());
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Remove a key. Returns whether anything was removed.
    pub fn remove(&mut self, key: &CacheKey) -> bool {
        self.remove_entry(key)
    }

    /// Drop every entry. Capacity is unchanged.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.dirty = true;
        }
        self.entries.clear();
        self.used_bytes = 0;
    }

    /// Serialized form of an entry as handed to readers, with
    /// `receiving_node` appended to its receiving chain.
    ///
    /// The bytes live with the entry, so overwriting, removing or clearing
    /// the entry discards them. Returns `Ok(None)` for unknown keys.
    pub fn served_bytes(
        &mut self,
        key: &CacheKey,
        receiving_node: &str,
    ) -> Result<Option<Bytes>, StoreError> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        if let Some(served) = &entry.served {
            return Ok(Some(served.clone()));
        }

        let mut value = entry.value.clone();
        value.description_mut().append_receiving_node(receiving_node);
        let served = value.serialize()?;
        entry.served = Some(served.clone());
        Ok(Some(served))
    }

    /// Mark an entry as recently used. Returns false for unknown keys.
    pub fn update_access_token(&mut self, key: &CacheKey) -> bool {
        let token = self.next_token;
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.access_token = token;
                self.next_token += 1;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    fn bump_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.keys()
    }

    /// Whether the store changed since the last [`Store::mark_clean`].
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Force the next save, e.g. after a failed write.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Copy the current contents for persistence.
    pub fn snapshot(&self) -> StoreSnapshot {
        let mut entries: Vec<(CacheKey, StoreEntry)> = self
            .entries
            .iter()
            .map(|(key, entry)| (*key, entry.clone()))
            .collect();
        entries.sort_by_key(|(_, entry)| entry.access_token);
        StoreSnapshot { entries }
    }

    /// Load a snapshot into an empty store, oldest entries first.
    ///
    /// Entries that no longer fit the configured limits are evicted or
    /// skipped as if they had been inserted in order. Returns how many
    /// entries the store holds afterwards.
    pub fn restore(&mut self, snapshot: StoreSnapshot) -> usize {
        let mut entries = snapshot.entries;
        entries.sort_by_key(|(_, entry)| entry.access_token);

        for (key, entry) in entries {
            if let Err(e) = self.insert(key, entry.value) {
                debug!(%key, "Skipping persisted item: {e}");
            }
        }
        self.dirty = false;
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::DIGEST_SIZE;

    fn key(id: u8) -> CacheKey {
        CacheKey::new([id; DIGEST_SIZE], [id; DIGEST_SIZE])
    }

    fn value(size: usize) -> CacheValue {
        let mut value = CacheValue::new();
        value.add("out.bin", vec![1u8; size]);
        value
    }

    #[test]
    fn test_insert_and_get() {
        let mut store = Store::with_limits(1000, 0, EvictionPolicy::default());
        store.insert(key(1), value(100)).unwrap();

        let entry = store.get(&key(1)).unwrap();
        assert_eq!(entry.value, value(100));
        assert_eq!(store.used_bytes(), 100);
        assert!(store.is_dirty());
    }

    #[test]
    fn test_overwrite_replaces_accounting() {
        let mut store = Store::with_limits(1000, 0, EvictionPolicy::default());
        store.insert(key(1), value(100)).unwrap();
        store.insert(key(1), value(40)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.used_bytes(), 40);
    }

    #[test]
    fn test_oversized_value_rejected() {
        let mut store = Store::with_limits(50, 0, EvictionPolicy::default());
        let err = store.insert(key(1), value(51)).unwrap_err();
        assert!(matches!(err, StoreError::TooLarge { size: 51, capacity: 50 }));
        assert!(store.get(&key(1)).is_none());
        assert_eq!(store.used_bytes(), 0);
    }

    #[test]
    fn test_invalid_value_rejected() {
        let mut store = Store::with_limits(50, 0, EvictionPolicy::default());
        assert!(matches!(
            store.insert(key(1), CacheValue::new()),
            Err(StoreError::InvalidValue)
        ));
    }

    #[test]
    fn test_eviction_prefers_unwarmed_entries() {
        let mut store = Store::with_limits(300, 0, EvictionPolicy::LeastRecentlyWarmed);
        store.insert(key(1), value(100)).unwrap();
        store.insert(key(2), value(100)).unwrap();
        store.insert(key(3), value(100)).unwrap();

        // Warming key 1 makes key 2 the oldest.
        assert!(store.update_access_token(&key(1)));

        let evicted = store.insert(key(4), value(100)).unwrap();
        assert_eq!(evicted, vec![key(2)]);
        assert!(store.contains(&key(1)));
        assert!(store.used_bytes() <= store.capacity_bytes());
    }

    #[test]
    fn test_item_limit() {
        let mut store = Store::with_limits(10_000, 2, EvictionPolicy::default());
        store.insert(key(1), value(1)).unwrap();
        store.insert(key(2), value(1)).unwrap();
        let evicted = store.insert(key(3), value(1)).unwrap();
        assert_eq!(evicted, vec![key(1)]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut store = Store::with_limits(1000, 0, EvictionPolicy::default());
        store.insert(key(1), value(10)).unwrap();
        store.insert(key(2), value(10)).unwrap();

        assert!(store.remove(&key(1)));
        assert!(!store.remove(&key(1)));

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.used_bytes(), 0);
        assert_eq!(store.capacity_bytes(), 1000);
        assert!(!store.update_access_token(&key(2)));
    }

    #[test]
    fn test_served_bytes_follow_entry() {
        let mut store = Store::with_limits(1000, 0, EvictionPolicy::default());
        assert!(store.served_bytes(&key(1), "node").unwrap().is_none());

        store.insert(key(1), value(10)).unwrap();
        let served = store.served_bytes(&key(1), "node").unwrap().unwrap();
        let read = CacheValue::deserialize(&served).unwrap();
        assert_eq!(read.description().receiving_chain, "node");
        // The stored value keeps its own provenance.
        assert!(store.get(&key(1)).unwrap().value.description().receiving_chain.is_empty());
        assert_eq!(store.served_bytes(&key(1), "node").unwrap(), Some(served));

        // Overwriting replaces the served copy.
        store.insert(key(1), value(20)).unwrap();
        let served = store.served_bytes(&key(1), "node").unwrap().unwrap();
        assert_eq!(CacheValue::deserialize(&served).unwrap().size(), 20);

        store.remove(&key(1));
        assert!(store.served_bytes(&key(1), "node").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_restore_keeps_order() {
        let mut store = Store::with_limits(1000, 0, EvictionPolicy::default());
        store.insert(key(1), value(10)).unwrap();
        store.insert(key(2), value(10)).unwrap();
        store.update_access_token(&key(1));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.entries.last().map(|(k, _)| *k), Some(key(1)));

        let mut restored = Store::with_limits(1000, 1, EvictionPolicy::default());
        restored.restore(snapshot);
        // Only the most recently used entry survives the smaller limit.
        assert_eq!(restored.len(), 1);
        assert!(restored.contains(&key(1)));
        assert!(!restored.is_dirty());
    }
}
