use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::cache::{CacheEntryInfo, TtlCache};
use crate::clock::Clock;

/// Result of an idempotent lookup: `reused` is true when `value` came from the cache.
#[derive(Clone, Debug, PartialEq)]
pub struct Reuse<T> {
    pub reused: bool,
    pub value: T,
}

/// Idempotency-key -> response cache with a TTL and an entry ceiling.
///
/// Factories for the same key are serialised through a per-key async lock, so
/// concurrent callers sharing a key run the factory once and the rest reuse
/// its stored value.
#[derive(Debug)]
pub struct IdempotencyCache<T> {
    store: Mutex<TtlCache<T>>,
    in_flight: InFlight,
}

impl<T: Clone> IdempotencyCache<T> {
    pub fn new(ttl: Duration, max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Mutex::new(TtlCache::new(ttl, max_entries, clock)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner).get(key)
    }

    pub fn set(&self, key: &str, value: T) {
        self.store.lock().unwrap_or_else(PoisonError::into_inner).insert(key, value);
    }

    pub async fn get_or_set<F, Fut>(&self, key: &str, factory: F) -> Reuse<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let result = self
            .try_get_or_set(key, || async { Ok::<T, Infallible>(factory().await) })
            .await;
        match result {
            Ok(reuse) => reuse,
            Err(never) => match never {},
        }
    }

    /// Like [`Self::get_or_set`] but the factory may fail; failures are not
    /// cached, so a later call with the same key runs the factory again.
    pub async fn try_get_or_set<F, Fut, E>(&self, key: &str, factory: F) -> Result<Reuse<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key) {
            debug!(
                event_name = "guard.idempotency.hit",
                idempotency_key = key,
                "reusing cached response"
            );
            return Ok(Reuse { reused: true, value });
        }

        // Released on drop, so a cancelled caller still clears its entry.
        let gate = GateRelease { in_flight: &self.in_flight, key, gate: self.gate(key) };
        let _held = gate.gate.lock().await;
        match self.get(key) {
            Some(value) => {
                debug!(
                    event_name = "guard.idempotency.hit",
                    idempotency_key = key,
                    "reusing response stored by a concurrent request"
                );
                Ok(Reuse { reused: true, value })
            }
            None => factory().await.map(|value| {
                self.set(key, value.clone());
                Reuse { reused: false, value }
            }),
        }
    }

    pub fn snapshot(&self) -> Vec<CacheEntryInfo> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner).snapshot()
    }

    pub fn len(&self) -> usize {
        self.store.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn gate(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.entry(key.to_owned()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

type InFlight = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// One caller's claim on a per-key gate.
struct GateRelease<'a> {
    in_flight: &'a InFlight,
    key: &'a str,
    gate: Arc<AsyncMutex<()>>,
}

impl Drop for GateRelease<'_> {
    // The map and this caller hold the only references once nobody else waits.
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&self.gate) <= 2 {
            in_flight.remove(self.key);
        }
    }
}
