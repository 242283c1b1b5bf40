//! In-process cache of derived views
//!
//! Normalized usage and priced ranges are expensive to rebuild and only
//! change when a raw event is stored or a configuration is installed, so
//! every entry is keyed by the raw-event watermark and the config version
//! it was derived from.
//!
//! # Key Patterns
//!
//! - `ViewKey { max_event_id, config_version: 0 }` - normalized usage
//! - `ViewKey { max_event_id, config_version }` plus a `TimeRange` - priced range

use billing_core::models::TimeRange;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Default number of entries kept per cache
pub const DEFAULT_CAPACITY: usize = 64;

/// Inputs a derived view was computed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewKey {
    pub max_event_id: i64,
    pub config_version: i64,
}

impl ViewKey {
    pub fn new(max_event_id: i64, config_version: i64) -> Self {
        Self {
            max_event_id,
            config_version,
        }
    }

    /// Key for views that do not depend on pricing
    pub fn usage(max_event_id: i64) -> Self {
        Self::new(max_event_id, 0)
    }

    /// Key for a priced range
    pub fn priced(self, range: TimeRange) -> PricedKey {
        PricedKey { view: self, range }
    }
}

/// Key of a priced range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PricedKey {
    pub view: ViewKey,
    pub range: TimeRange,
}

struct Entries<K, V> {
    values: HashMap<K, Arc<V>>,
    order: VecDeque<K>,
}

/// Bounded least-recently-inserted cache of shared values
pub struct ViewCache<K, V> {
    entries: Mutex<Entries<K, V>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> ViewCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache holding at most `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Entries {
                values: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached value for `key`, if any
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let value = self.entries.lock().values.get(key).cloned();
        match value {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    /// Store a value, evicting the oldest entry when full
    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let mut entries = self.entries.lock();
        if entries.values.insert(key.clone(), Arc::clone(&value)).is_none() {
            entries.order.push_back(key);
        }
        while entries.order.len() > self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.values.remove(&oldest);
            }
        }
        value
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        debug!("Invalidating {} cached views", entries.values.len());
        entries.values.clear();
        entries.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since creation
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss() {
        let cache: ViewCache<ViewKey, Vec<i32>> = ViewCache::new(4);
        let key = ViewKey::new(10, 1);

        assert!(cache.get(&key).is_none());
        cache.insert(key, vec![1, 2]);
        assert_eq!(*cache.get(&key).unwrap(), vec![1, 2]);
        assert!(cache.get(&ViewKey::new(11, 1)).is_none());
        assert_eq!(cache.stats(), (1, 2));
    }

    #[test]
    fn test_evicts_oldest() {
        let cache: ViewCache<i64, i64> = ViewCache::new(2);
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.insert(3, 3);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&1).is_none());
        assert!(cache.get(&3).is_some());
    }

    #[test]
    fn test_reinsert_does_not_grow() {
        let cache: ViewCache<i64, i64> = ViewCache::new(2);
        cache.insert(1, 1);
        cache.insert(1, 2);
        cache.insert(2, 2);

        assert_eq!(cache.len(), 2);
        assert_eq!(*cache.get(&1).unwrap(), 2);
    }

    #[test]
    fn test_clear() {
        let cache: ViewCache<i64, i64> = ViewCache::new(2);
        cache.insert(1, 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
