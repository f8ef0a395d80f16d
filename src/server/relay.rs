//! Relay queue: stored values waiting to be pushed to upstream.
//!
//! Keys are queued once (duplicates are ignored while queued or in flight)
//! and started on the orchestrator tick, up to a concurrency limit.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::cache::key::CacheKey;
use crate::server::tasks::RemoteRelayTask;

pub struct RelayQueue {
    queue: VecDeque<CacheKey>,
    in_flight: HashMap<CacheKey, RemoteRelayTask>,
    max_in_flight: usize,
}

impl RelayQueue {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Queue a key. Returns false if it is already queued or in flight.
    pub fn schedule(&mut self, key: CacheKey) -> bool {
        if self.in_flight.contains_key(&key) || self.queue.contains(&key) {
            return false;
        }
        debug!(%key, "Scheduled relay");
        self.queue.push_back(key);
        true
    }

    /// Dequeue the next key if there is room for another relay.
    pub fn next(&mut self) -> Option<CacheKey> {
        if self.in_flight.len() >= self.max_in_flight {
            return None;
        }
        self.queue.pop_front()
    }

    /// Track a relay that has been announced upstream.
    pub fn start(&mut self, key: CacheKey, task: RemoteRelayTask) {
        self.in_flight.insert(key, task);
    }

    pub fn get_mut(&mut self, key: &CacheKey) -> Option<&mut RemoteRelayTask> {
        self.in_flight.get_mut(key)
    }

    /// Finish a relay. Returns false if the key was not in flight.
    pub fn complete(&mut self, key: &CacheKey) -> bool {
        self.in_flight.remove(key).is_some()
    }

    /// Drop every in-flight relay, keeping the queue for later.
    pub fn cancel_in_flight(&mut self) -> usize {
        let cancelled = self.in_flight.len();
        self.in_flight.clear();
        cancelled
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::DIGEST_SIZE;
    use bytes::Bytes;

    fn key(id: u8) -> CacheKey {
        CacheKey::new([id; DIGEST_SIZE], [0; DIGEST_SIZE])
    }

    #[test]
    fn test_deduplicates() {
        let mut relay = RelayQueue::new(4);
        assert!(relay.schedule(key(1)));
        assert!(!relay.schedule(key(1)));

        let next = relay.next().unwrap();
        relay.start(next, RemoteRelayTask::new(Bytes::from_static(b"x")));
        assert!(!relay.schedule(key(1)));
        assert_eq!(relay.pending_count(), 0);
        assert_eq!(relay.in_flight_count(), 1);
    }

    #[test]
    fn test_respects_in_flight_limit() {
        let mut relay = RelayQueue::new(1);
        relay.schedule(key(1));
        relay.schedule(key(2));

        let first = relay.next().unwrap();
        relay.start(first, RemoteRelayTask::new(Bytes::from_static(b"x")));
        assert!(relay.next().is_none());

        assert!(relay.complete(&first));
        assert!(!relay.complete(&first));
        assert_eq!(relay.next(), Some(key(2)));
    }

    #[test]
    fn test_cancel_keeps_queue() {
        let mut relay = RelayQueue::new(1);
        relay.schedule(key(1));
        relay.schedule(key(2));
        let first = relay.next().unwrap();
        relay.start(first, RemoteRelayTask::new(Bytes::from_static(b"x")));

        assert_eq!(relay.cancel_in_flight(), 1);
        assert_eq!(relay.in_flight_count(), 0);
        assert_eq!(relay.pending_count(), 1);
        assert!(!relay.complete(&first));
    }
}
