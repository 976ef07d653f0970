//! Bounded, TTL-expiring key/value store.
//!
//! Shared by the idempotency guard and the read-through caches of the search
//! and finance generators. Expiry is checked lazily on read; an opportunistic
//! sweep runs on write, at most once per `sweep_interval`. When the store is
//! at capacity the entry with the oldest `stored_at` is evicted, with
//! insertion order breaking ties.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::clock::Clock;

#[derive(Clone, Debug)]
struct CacheEntry<V> {
    value: V,
    stored_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    sequence: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryInfo {
    pub key: String,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct TtlCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    ttl: Duration,
    max_entries: usize,
    sweep_interval: Duration,
    last_sweep: Option<DateTime<Utc>>,
    next_sequence: u64,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration, max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
            sweep_interval: Duration::seconds(30),
            last_sweep: None,
            next_sequence: 0,
            clock,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn get(&mut self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) => now > entry.expires_at,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        let now = self.clock.now();
        self.maybe_sweep(now);

        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.insert(
            key,
            CacheEntry { value, stored_at: now, expires_at: now + self.ttl, sequence },
        );
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<CacheEntryInfo> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by_key(|(_, entry)| (entry.stored_at, entry.sequence));
        entries
            .into_iter()
            .map(|(key, entry)| CacheEntryInfo {
                key: key.clone(),
                stored_at: entry.stored_at,
                expires_at: entry.expires_at,
            })
            .collect()
    }

    fn maybe_sweep(&mut self, now: DateTime<Utc>) {
        let due = self.last_sweep.map(|last| now - last >= self.sweep_interval).unwrap_or(true);
        if !due {
            return;
        }
        self.last_sweep = Some(now);
        self.entries.retain(|_, entry| now <= entry.expires_at);
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| (entry.stored_at, entry.sequence))
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::TtlCache;
    use crate::clock::ManualClock;

    fn cache(clock: &ManualClock, ttl_ms: i64, max: usize) -> TtlCache<u32> {
        TtlCache::new(Duration::milliseconds(ttl_ms), max, Arc::new(clock.clone()))
    }

    #[test]
    fn entries_expire_by_wall_clock() {
        let clock = ManualClock::default();
        let mut cache = cache(&clock, 1_000, 10);
        cache.insert("a", 1);

        clock.advance_ms(1_000);
        assert_eq!(cache.get("a"), Some(1), "expiry is strictly after the ttl");

        clock.advance_ms(1);
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty(), "expired entry is dropped on read");
    }

    #[test]
    fn evicts_oldest_entry_at_capacity() {
        let clock = ManualClock::default();
        let mut cache = cache(&clock, 60_000, 2);
        cache.insert("first", 1);
        clock.advance_ms(5);
        cache.insert("second", 2);
        clock.advance_ms(5);
        cache.insert("third", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("first"), None);
        assert_eq!(cache.get("second"), Some(2));
        assert_eq!(cache.get("third"), Some(3));
    }

    #[test]
    fn same_timestamp_eviction_follows_insertion_order() {
        let clock = ManualClock::default();
        let mut cache = cache(&clock, 60_000, 2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);

        let keys: Vec<_> = cache.snapshot().into_iter().map(|info| info.key).collect();
        assert_eq!(keys, vec!["b".to_owned(), "c".to_owned()]);
    }

    #[test]
    fn overwriting_existing_key_does_not_evict() {
        let clock = ManualClock::default();
        let mut cache = cache(&clock, 60_000, 2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 10);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn sweep_runs_at_most_once_per_interval() {
        let clock = ManualClock::default();
        let mut cache = cache(&clock, 100, 10).with_sweep_interval(Duration::seconds(10));
        cache.insert("stale", 1);
        clock.advance_ms(500);

        cache.insert("fresh", 2);
        assert_eq!(cache.len(), 2, "sweep interval has not elapsed yet");

        clock.advance_ms(10_000);
        cache.insert("newer", 3);
        assert_eq!(cache.len(), 1, "sweep drops every expired entry");
    }
}
