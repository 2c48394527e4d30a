//! URL-keyed cache of initialization fragments.
//!
//! Init fragments repeat across representation switches and ad/content
//! transitions; re-downloading them on every switch wastes a round trip at
//! the worst possible moment. Entries are evicted oldest-first once the
//! cache is full.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use bytes::Bytes;

const DEFAULT_MAX_ENTRIES: usize = 5;

struct InitCacheInner {
    entries: HashMap<String, (Bytes, String)>,
    insertion_order: VecDeque<String>,
}

pub struct InitSegmentCache {
    inner: Mutex<InitCacheInner>,
    max_entries: usize,
}

impl Default for InitSegmentCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl InitSegmentCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(InitCacheInner {
                entries: HashMap::new(),
                insertion_order: VecDeque::new(),
            }),
            max_entries: max_entries.max(1),
        }
    }

    /// Store an init fragment under its request URL, along with the
    /// effective URL it resolved to.
    pub fn insert(&self, url: &str, data: Bytes, effective_url: String) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.entries.contains_key(url) {
            return;
        }
        while inner.insertion_order.len() >= self.max_entries {
            if let Some(oldest) = inner.insertion_order.pop_front() {
                inner.entries.remove(&oldest);
                tracing::debug!(url = %oldest, "evicting init fragment");
            }
        }
        inner.insertion_order.push_back(url.to_string());
        inner.entries.insert(url.to_string(), (data, effective_url));
    }

    /// Look up a cached init fragment; returns the data and effective URL.
    pub fn retrieve(&self, url: &str) -> Option<(Bytes, String)> {
        let inner = self.inner.lock().ok()?;
        inner.entries.get(url).cloned()
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.insertion_order.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_when_full() {
        let cache = InitSegmentCache::new(2);
        cache.insert("a", Bytes::from_static(b"1"), "a".into());
        cache.insert("b", Bytes::from_static(b"2"), "b".into());
        cache.insert("c", Bytes::from_static(b"3"), "c".into());
        assert!(cache.retrieve("a").is_none());
        assert_eq!(cache.retrieve("b").map(|(d, _)| d), Some(Bytes::from_static(b"2")));
        assert_eq!(cache.retrieve("c").map(|(d, _)| d), Some(Bytes::from_static(b"3")));
    }

    #[test]
    fn duplicate_insert_keeps_first_entry() {
        let cache = InitSegmentCache::new(2);
        cache.insert("a", Bytes::from_static(b"1"), "a".into());
        cache.insert("a", Bytes::from_static(b"other"), "a".into());
        assert_eq!(cache.retrieve("a").map(|(d, _)| d), Some(Bytes::from_static(b"1")));
    }
}
