//! Bounded LRU cache over recently accessed thread records.
//!
//! All methods serialize behind one mutex, so observations and mutations are
//! single-threaded regardless of how many sync or query tasks share the
//! cache. Coherence contract: callers invalidate an entry before mutating
//! the underlying thread and re-insert the freshly read record afterwards;
//! bulk mirror operations clear the whole cache.

use std::collections::HashMap;
use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::models::MailThread;

pub const DEFAULT_CAPACITY: usize = 500;

/// Point-in-time cache counters.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

struct CacheInner {
    capacity: usize,
    map: HashMap<String, MailThread>,
    /// Access order, least recently used at the front.
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
}

impl CacheInner {
    fn touch(&mut self, id: &str) {
        if let Some(position) = self.order.iter().position(|entry| entry == id) {
            self.order.remove(position);
        }
        self.order.push_back(id.to_string());
    }

    fn evict_over_capacity(&mut self) {
        while self.map.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.map.remove(&oldest);
        }
    }
}

/// Thread-record cache keyed by thread id.
pub struct ThreadCache {
    inner: Mutex<CacheInner>,
}

impl ThreadCache {
    /// Cache with the default capacity of 500 entries.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Capacity is floored at one entry.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                capacity: capacity.max(1),
                map: HashMap::new(),
                order: VecDeque::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn get(&self, id: &str) -> Option<MailThread> {
        let mut inner = self.inner.lock();
        match inner.map.get(id).cloned() {
            Some(thread) => {
                inner.hits += 1;
                inner.touch(id);
                Some(thread)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, thread: MailThread) {
        let mut inner = self.inner.lock();
        let id = thread.id.clone();
        inner.map.insert(id.clone(), thread);
        inner.touch(&id);
        inner.evict_over_capacity();
    }

    pub fn invalidate(&self, id: &str) {
        let mut inner = self.inner.lock();
        if inner.map.remove(id).is_some() {
            if let Some(position) = inner.order.iter().position(|entry| entry == id) {
                inner.order.remove(position);
            }
        }
    }

    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().map.contains_key(id)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            size: inner.map.len(),
            max_size: inner.capacity,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(id: &str) -> MailThread {
        MailThread {
            id: id.to_string(),
            subject: None,
            participant_count: 1,
            message_count: 1,
            first_message_date: None,
            last_message_date: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn get_put_and_stats() {
        let cache = ThreadCache::with_capacity(10);
        assert!(cache.get("a").is_none());
        cache.put(thread("a"));
        assert!(cache.contains("a"));
        assert_eq!(cache.get("a").unwrap().id, "a");

        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.max_size, 10);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ThreadCache::with_capacity(2);
        cache.put(thread("a"));
        cache.put(thread("b"));
        // Touch `a` so `b` becomes the eviction candidate.
        cache.get("a");
        cache.put(thread("c"));

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn capacity_floor_is_one() {
        let cache = ThreadCache::with_capacity(0);
        cache.put(thread("a"));
        cache.put(thread("b"));
        let stats = cache.stats();
        assert_eq!(stats.max_size, 1);
        assert_eq!(stats.size, 1);
        assert!(cache.contains("b"));
    }

    #[test]
    fn invalidation() {
        let cache = ThreadCache::new();
        cache.put(thread("a"));
        cache.put(thread("b"));
        cache.invalidate("a");
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        cache.invalidate_all();
        assert_eq!(cache.stats().size, 0);
    }
}
