use std::{
    hash::Hash,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use dashmap::DashMap;

const SWEEP_EVERY: u64 = 64;

#[derive(Debug)]
struct Slot<V> {
    value: V,
    deadline: Instant,
}

/// Concurrent map whose entries expire after a per-entry TTL.
///
/// Expired entries are dropped lazily when touched, plus a full sweep every
/// `SWEEP_EVERY` writes.
#[derive(Debug)]
pub struct ExpiringCache<K: Eq + Hash, V> {
    map: DashMap<K, Slot<V>>,
    writes: AtomicU64,
}

impl<K: Eq + Hash, V> Default for ExpiringCache<K, V> {
    fn default() -> Self {
        Self {
            map: DashMap::new(),
            writes: AtomicU64::new(0),
        }
    }
}

impl<K: Eq + Hash + Clone, V> ExpiringCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn maybe_sweep(&self) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep();
        }
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        self.map.retain(|_, slot| slot.deadline > now);
    }

    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        self.maybe_sweep();
        self.map.insert(
            key,
            Slot {
                value,
                deadline: Instant::now() + ttl,
            },
        );
    }

    /// Applies `f` to the live value (a fresh default when absent or expired) and pushes
    /// the deadline to `now + ttl`.
    pub fn upsert<R>(&self, key: K, ttl: Duration, f: impl FnOnce(&mut V) -> R) -> R
    where
        V: Default,
    {
        self.maybe_sweep();
        let now = Instant::now();
        let mut slot = self.map.entry(key).or_insert_with(|| Slot {
            value: V::default(),
            deadline: now + ttl,
        });
        if slot.deadline <= now {
            slot.value = V::default();
        }
        slot.deadline = now + ttl;
        f(&mut slot.value)
    }

    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let now = Instant::now();
        let live = self
            .map
            .get(key)
            .map(|slot| (slot.deadline > now).then(|| slot.value.clone()));
        match live {
            None => None,
            Some(Some(v)) => Some(v),
            Some(None) => {
                self.map.remove_if(key, |_, slot| slot.deadline <= now);
                None
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        let live = self.map.get(key).map(|slot| slot.deadline > now);
        match live {
            Some(true) => true,
            Some(false) => {
                self.map.remove_if(key, |_, slot| slot.deadline <= now);
                false
            }
            None => false,
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(_, slot)| slot.value)
    }

    /// Entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
