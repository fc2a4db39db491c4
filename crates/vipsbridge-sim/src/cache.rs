//! Operation cache
//!
//! Built operations are remembered by a signature of their class and input
//! values. A later build with the same signature hands back the cached
//! instance instead of recomputing. Eviction is plain first-in first-out;
//! the binding only ever sees the limits, never the policy.

use std::collections::VecDeque;

const DEFAULT_MAX: i32 = 100;
const DEFAULT_MAX_MEM: u64 = 100 * 1024 * 1024;
const DEFAULT_MAX_FILES: i32 = 100;

struct CacheEntry {
    key: String,
    op: usize,
    deps: Vec<usize>,
}

pub(crate) struct OperationCache {
    entries: VecDeque<CacheEntry>,
    pub max: i32,
    pub max_mem: u64,
    pub max_files: i32,
    pub trace: bool,
    pub hits: u64,
    pub misses: u64,
}

impl OperationCache {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            max: DEFAULT_MAX,
            max_mem: DEFAULT_MAX_MEM,
            max_files: DEFAULT_MAX_FILES,
            trace: false,
            hits: 0,
            misses: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Find a cached operation; the caller takes its own references
    pub fn lookup(&mut self, key: &str) -> Option<usize> {
        match self.entries.iter().find(|e| e.key == key) {
            Some(entry) => {
                self.hits += 1;
                Some(entry.op)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Remember an operation. The cache owns one reference on `op`; any
    /// operations pushed out are returned for the caller to unref.
    pub fn insert(&mut self, key: String, op: usize, deps: Vec<usize>) -> Vec<usize> {
        self.entries.push_back(CacheEntry { key, op, deps });
        self.trim()
    }

    pub fn set_max(&mut self, max: i32) -> Vec<usize> {
        self.max = max;
        self.trim()
    }

    /// Forget every operation that read from `image`
    pub fn drop_referencing(&mut self, image: usize) -> Vec<usize> {
        let mut dropped = Vec::new();
        self.entries.retain(|e| {
            if e.deps.contains(&image) {
                dropped.push(e.op);
                false
            } else {
                true
            }
        });
        dropped
    }

    fn trim(&mut self) -> Vec<usize> {
        let limit = self.max.max(0) as usize;
        let mut evicted = Vec::new();
        while self.entries.len() > limit {
            if let Some(entry) = self.entries.pop_front() {
                evicted.push(entry.op);
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss() {
        let mut cache = OperationCache::new();
        assert_eq!(cache.lookup("add(1,2)"), None);
        assert!(cache.insert("add(1,2)".to_string(), 0x40, vec![1, 2]).is_empty());
        assert_eq!(cache.lookup("add(1,2)"), Some(0x40));
        assert_eq!((cache.hits, cache.misses), (1, 1));
    }

    #[test]
    fn test_trim_evicts_oldest() {
        let mut cache = OperationCache::new();
        cache.insert("a".to_string(), 1, vec![]);
        cache.insert("b".to_string(), 2, vec![]);
        assert_eq!(cache.set_max(1), vec![1]);
        assert_eq!(cache.set_max(0), vec![2]);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_drop_referencing() {
        let mut cache = OperationCache::new();
        cache.insert("a".to_string(), 1, vec![10]);
        cache.insert("b".to_string(), 2, vec![11]);
        assert_eq!(cache.drop_referencing(10), vec![1]);
        assert_eq!(cache.len(), 1);
    }
}
