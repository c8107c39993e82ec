//! Fingerprint-keyed result cache.
//!
//! Maps a task submission's fingerprint to the encoded result payload that
//! answered it. Total stored cost is bounded; eviction is approximate LRU on
//! an ordered map (front = least recent, hits move to the back).

use indexmap::IndexMap;

struct CacheEntry {
    payload: Vec<u8>,
    cost: u64,
}

pub struct ResultCache {
    entries: IndexMap<u64, CacheEntry>,
    total_cost: u64,
    max_cost: u64,
}

impl ResultCache {
    pub fn new(max_cost: u64) -> ResultCache {
        ResultCache {
            entries: IndexMap::new(),
            total_cost: 0,
            max_cost,
        }
    }

    /// Returns the stored payload and refreshes its recency.
    pub fn lookup(&mut self, fingerprint: u64) -> Option<&[u8]> {
        let index = self.entries.get_index_of(&fingerprint)?;
        let last = self.entries.len() - 1;
        self.entries.move_index(index, last);
        self.entries
            .get(&fingerprint)
            .map(|entry| entry.payload.as_slice())
    }

    /// Stores a result payload, evicting least-recent entries until the
    /// budget holds. An entry bigger than the whole budget is not stored.
    pub fn insert(&mut self, fingerprint: u64, payload: Vec<u8>, cost: u64) {
        if cost > self.max_cost {
            return;
        }
        if let Some(old) = self.entries.shift_remove(&fingerprint) {
            self.total_cost -= old.cost;
        }

        self.total_cost += cost;
        self.entries.insert(fingerprint, CacheEntry { payload, cost });

        while self.total_cost > self.max_cost {
            let (_, evicted) = self
                .entries
                .shift_remove_index(0)
                .expect("nonzero cost implies entries");
            self.total_cost -= evicted.cost;
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn total_cost(&self) -> u64 {
        self.total_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(size: usize, fill: u8) -> Vec<u8> {
        vec![fill; size]
    }

    fn insert(cache: &mut ResultCache, fingerprint: u64, size: usize) {
        cache.insert(fingerprint, payload(size, fingerprint as u8), size as u64);
    }

    #[test]
    fn test_lookup_hit_and_miss() {
        let mut cache = ResultCache::new(100);
        insert(&mut cache, 1, 10);

        assert_eq!(cache.lookup(1), Some(&payload(10, 1)[..]));
        assert_eq!(cache.lookup(2), None);
    }

    #[test]
    fn test_eviction_is_least_recent_first() {
        let mut cache = ResultCache::new(30);
        insert(&mut cache, 1, 10);
        insert(&mut cache, 2, 10);
        insert(&mut cache, 3, 10);

        // Refresh 1 so 2 becomes the eviction candidate.
        assert!(cache.lookup(1).is_some());
        insert(&mut cache, 4, 10);

        assert!(cache.lookup(2).is_none());
        assert!(cache.lookup(1).is_some());
        assert!(cache.lookup(3).is_some());
        assert!(cache.lookup(4).is_some());
    }

    #[test]
    fn test_budget_never_exceeded() {
        let mut cache = ResultCache::new(25);
        for fingerprint in 0..50 {
            insert(&mut cache, fingerprint, 10);
            assert!(cache.total_cost() <= 25);
            assert!(cache.len() <= 2);
        }
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let mut cache = ResultCache::new(10);
        insert(&mut cache, 1, 11);
        assert_eq!(cache.len(), 0);
        assert!(cache.lookup(1).is_none());
    }

    #[test]
    fn test_reinsert_replaces_cost() {
        let mut cache = ResultCache::new(100);
        insert(&mut cache, 1, 60);
        insert(&mut cache, 1, 20);
        assert_eq!(cache.total_cost(), 20);
        assert_eq!(cache.len(), 1);
    }
}
