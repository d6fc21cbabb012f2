//! Sticky-session routing table.

use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;

use crate::worker::WorkerId;

#[derive(Debug, Clone, Copy)]
struct SessionEntry {
    worker: WorkerId,
    last_access: Instant,
}

/// Session key → worker id, LRU-bounded. Owned by the supervisor thread;
/// entries are weak by construction (worker ids, resolved through the
/// worker table) so no reference cycles exist.
pub(crate) struct SessionRouter {
    map: LruCache<String, SessionEntry>,
}

impl SessionRouter {
    pub(crate) fn new(capacity: usize) -> Self {
        // Config validation rejects zero; clamp regardless.
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            map: LruCache::new(capacity),
        }
    }

    /// Look up the worker a session is pinned to, refreshing its recency.
    pub(crate) fn map(&mut self, key: &str) -> Option<WorkerId> {
        let now = Instant::now();
        self.map.get_mut(key).map(|entry| {
            entry.last_access = now;
            entry.worker
        })
    }

    /// Pin (or re-pin) a session. Inserting past capacity evicts the least
    /// recently used session.
    pub(crate) fn bind(&mut self, key: &str, worker: WorkerId) {
        let entry = SessionEntry {
            worker,
            last_access: Instant::now(),
        };
        if let Some(existing) = self.map.get_mut(key) {
            *existing = entry;
        } else {
            self.map.put(key.to_string(), entry);
        }
    }

    /// Drop every session pinned to a dead worker.
    pub(crate) fn worker_died(&mut self, worker: WorkerId) {
        let doomed: Vec<String> = self
            .map
            .iter()
            .filter(|(_, entry)| entry.worker == worker)
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            self.map.pop(&key);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_map() {
        let mut router = SessionRouter::new(4);
        router.bind("s1", WorkerId(7));
        assert_eq!(router.map("s1"), Some(WorkerId(7)));
        assert_eq!(router.map("s2"), None);
    }

    #[test]
    fn rebind_moves_session() {
        let mut router = SessionRouter::new(4);
        router.bind("s1", WorkerId(1));
        router.bind("s1", WorkerId(2));
        assert_eq!(router.map("s1"), Some(WorkerId(2)));
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn worker_death_evicts_its_sessions() {
        let mut router = SessionRouter::new(4);
        router.bind("a", WorkerId(1));
        router.bind("b", WorkerId(2));
        router.bind("c", WorkerId(1));
        router.worker_died(WorkerId(1));
        assert_eq!(router.map("a"), None);
        assert_eq!(router.map("b"), Some(WorkerId(2)));
        assert_eq!(router.map("c"), None);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mut router = SessionRouter::new(2);
        router.bind("a", WorkerId(1));
        router.bind("b", WorkerId(2));
        // Touch "a" so "b" is the LRU victim.
        router.map("a");
        router.bind("c", WorkerId(3));
        assert_eq!(router.map("b"), None);
        assert_eq!(router.map("a"), Some(WorkerId(1)));
        assert_eq!(router.map("c"), Some(WorkerId(3)));
    }
}
